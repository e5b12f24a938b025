//! Image and text parts carried through flow inputs and outputs.
//!
//! Two wire layouts exist. The `basic` layout encodes an image as a single-key
//! dict such as `{"data:image/png;path": "a.png"}`; the `openai-vision` layout
//! uses typed dicts (`{"type": "image_url", "image_url": {"url": ...}}`) and
//! also recognizes text parts.

use crate::error::MultimediaError;
use crate::value::{Value, ValueType};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

static MIME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:image/(.*);(path|base64|url)$").expect("valid regex"));
static BASE64_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:image/(.*);base64").expect("valid regex"));
static BASE64_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9+/]{4})*(([A-Za-z0-9+/]{2})*(==|[A-Za-z0-9+/]=)?)?$").expect("valid regex")
});

/// In-memory image bytes with their MIME type.
#[derive(Clone, PartialEq)]
pub struct Image {
    bytes: Arc<Vec<u8>>,
    mime_type: String,
    source_url: Option<String>,
}

impl Image {
    pub fn new(bytes: Vec<u8>, mime_type: Option<String>) -> Self {
        let mime_type = mime_type.unwrap_or_else(|| sniff_mime_type(&bytes).to_string());
        Self {
            bytes: Arc::new(bytes),
            mime_type,
            source_url: None,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// File extension implied by the MIME type, `None` for wildcard types.
    pub fn extension(&self) -> Option<&str> {
        match self.mime_type.rsplit('/').next() {
            Some("*") | None => None,
            Some(ext) => Some(ext),
        }
    }

    pub fn to_base64(&self, with_type: bool) -> String {
        let encoded = BASE64.encode(self.bytes.as_slice());
        if with_type {
            format!("data:{};base64,{}", self.mime_type, encoded)
        } else {
            encoded
        }
    }

    /// `{"data:<mime>;base64": <b64>}`
    pub fn to_base64_dict(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert(
            format!("data:{};base64", self.mime_type),
            Value::String(self.to_base64(false)),
        );
        Value::Object(map)
    }

    fn short_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.bytes.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..8].to_string()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({})", self.short_hash())
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .field("source_url", &self.source_url)
            .finish()
    }
}

/// Text content part of a vision-style message.
#[derive(Debug, Clone, PartialEq)]
pub struct Text {
    pub text: String,
    pub annotations: Option<Box<Value>>,
}

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            annotations: None,
        }
    }

    pub fn to_dict(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert("type".to_string(), Value::from("text"));
        match &self.annotations {
            Some(annotations) => {
                let mut inner = IndexMap::new();
                inner.insert("value".to_string(), Value::from(self.text.as_str()));
                inner.insert("annotations".to_string(), (**annotations).clone());
                map.insert("text".to_string(), Value::Object(inner));
            }
            None => {
                map.insert("text".to_string(), Value::from(self.text.as_str()));
            }
        }
        Value::Object(map)
    }

    fn from_dict(dict: &IndexMap<String, Value>) -> Self {
        match dict.get("text") {
            Some(Value::Object(inner)) => Self {
                text: inner.get("value").map(|v| v.to_string()).unwrap_or_default(),
                annotations: inner.get("annotations").cloned().map(Box::new),
            },
            Some(v) => Self::new(v.to_string()),
            None => Self::new(""),
        }
    }
}

fn sniff_mime_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.starts_with(b"BM") {
        "image/bmp"
    } else if bytes.len() > 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/*"
    }
}

pub fn is_url(value: &str) -> bool {
    match url::Url::parse(value) {
        Ok(parsed) => parsed.has_host() && !parsed.scheme().is_empty(),
        Err(_) => false,
    }
}

pub fn is_base64(value: &str) -> bool {
    let parts: Vec<&str> = value.split(',').collect();
    match parts.as_slice() {
        [prefix, body] => BASE64_PREFIX.is_match(prefix) && BASE64_BODY.is_match(body),
        [body] => BASE64_BODY.is_match(body),
        _ => false,
    }
}

/// Split `data:image/<fmt>;<resource>` into its format and resource parts.
fn multimedia_info(key: &str) -> Option<(String, String)> {
    MIME_PATTERN
        .captures(key)
        .map(|c| (c[1].to_string(), c[2].to_string()))
}

fn image_from_base64(value: &str, mime_type: Option<String>) -> Result<Image, MultimediaError> {
    let (prefix, body) = match value.split_once(',') {
        Some((prefix, body)) => (Some(prefix), body),
        None => (None, value),
    };
    let bytes = BASE64
        .decode(body)
        .map_err(|e| MultimediaError::invalid_image(format!("Invalid base64 image: {}", e)))?;
    let mime_type = mime_type.or_else(|| {
        prefix
            .and_then(|p| BASE64_PREFIX.captures(p))
            .map(|c| format!("image/{}", &c[1]))
    });
    Ok(Image::new(bytes, mime_type))
}

fn image_from_file(path: &Path, mime_type: Option<String>) -> Result<Image, MultimediaError> {
    let bytes = std::fs::read(path).map_err(|e| {
        MultimediaError::invalid_image(format!("Failed to read image file '{}': {}", path.display(), e))
    })?;
    Ok(Image::new(bytes, mime_type))
}

async fn image_from_url(url: &str, mime_type: Option<String>) -> Result<Image, MultimediaError> {
    let response = reqwest::get(url).await.map_err(|e| {
        MultimediaError::invalid_image(format!(
            "Failed to fetch image from URL: {}. Error message: {}.",
            url, e
        ))
    })?;
    let status = response.status();
    if status.as_u16() != 200 {
        let text = response.text().await.unwrap_or_default();
        return Err(MultimediaError::invalid_image(format!(
            "Failed to fetch image from URL: {}. Error code: {}. Error message: {}.",
            url,
            status.as_u16(),
            text
        )));
    }
    let bytes = response.bytes().await.map_err(|e| {
        MultimediaError::invalid_image(format!(
            "Failed to fetch image from URL: {}. Error message: {}.",
            url, e
        ))
    })?;
    Ok(Image::new(bytes.to_vec(), mime_type).with_source_url(url))
}

/// Wire layout used for multimedia data in flow inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    #[default]
    Basic,
    OpenaiVision,
}

impl MessageFormat {
    pub fn parse(value: Option<&str>) -> Result<Self, MultimediaError> {
        match value.map(|v| v.to_lowercase()) {
            None => Ok(MessageFormat::Basic),
            Some(v) if v.is_empty() || v == "basic" => Ok(MessageFormat::Basic),
            Some(v) if v == "openai-vision" => Ok(MessageFormat::OpenaiVision),
            Some(_) => Err(MultimediaError::InvalidMessageFormatType {
                message_format: value.unwrap_or_default().to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Basic => "basic",
            MessageFormat::OpenaiVision => "openai-vision",
        }
    }
}

/// Converts between multimedia wire dicts and in-memory [`Image`]/[`Text`] values.
#[derive(Debug, Clone, Default)]
pub struct MultimediaProcessor {
    format: MessageFormat,
    working_dir: Option<PathBuf>,
}

impl MultimediaProcessor {
    pub fn new(format: MessageFormat) -> Self {
        Self {
            format,
            working_dir: None,
        }
    }

    /// Build from a `message_format` string, failing on unknown formats.
    pub fn create(message_format: Option<&str>) -> Result<Self, MultimediaError> {
        Ok(Self::new(MessageFormat::parse(message_format)?))
    }

    /// Relative image paths are resolved against this directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn format(&self) -> MessageFormat {
        self.format
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        match &self.working_dir {
            Some(dir) if p.is_relative() => dir.join(p),
            _ => p,
        }
    }

    pub fn is_multimedia_dict(&self, dict: &IndexMap<String, Value>) -> bool {
        match self.format {
            MessageFormat::Basic => {
                dict.len() == 1 && dict.keys().all(|k| MIME_PATTERN.is_match(k))
            }
            MessageFormat::OpenaiVision => {
                if dict.len() != 2 {
                    return false;
                }
                let Some(image_type) = dict.get("type").and_then(Value::as_str) else {
                    return false;
                };
                let Some(inner) = dict.get(image_type).and_then(Value::as_object) else {
                    return false;
                };
                (image_type == "image_url" && inner.contains_key("url"))
                    || (image_type == "image_file" && inner.contains_key("path"))
            }
        }
    }

    pub fn is_text_dict(&self, dict: &IndexMap<String, Value>) -> bool {
        if self.format != MessageFormat::OpenaiVision || dict.len() != 2 {
            return false;
        }
        if dict.get("type").and_then(Value::as_str) != Some("text") {
            return false;
        }
        match dict.get("text") {
            Some(Value::String(_)) => true,
            Some(Value::Object(inner)) => matches!(inner.get("value"), Some(Value::String(_))),
            _ => false,
        }
    }

    async fn image_from_dict(&self, dict: &IndexMap<String, Value>) -> Result<Image, MultimediaError> {
        match self.format {
            MessageFormat::Basic => {
                let (key, value) = dict
                    .iter()
                    .next()
                    .ok_or_else(|| MultimediaError::invalid_image("The image input should not be empty."))?;
                let (format, resource) = multimedia_info(key).ok_or_else(|| {
                    MultimediaError::invalid_image(format!(
                        "Unsupported image resource: {}. Supported Resources are [path, base64, url].",
                        key
                    ))
                })?;
                let mime_type = Some(format!("image/{}", format));
                let data = value.to_string();
                match resource.as_str() {
                    "path" => image_from_file(&self.resolve(&data), mime_type),
                    "base64" => {
                        if is_base64(&data) {
                            image_from_base64(&data, mime_type)
                        } else {
                            Err(MultimediaError::invalid_image(format!("Invalid base64 image: {}.", data)))
                        }
                    }
                    _ => image_from_url(&data, mime_type).await,
                }
            }
            MessageFormat::OpenaiVision => {
                let image_type = dict.get("type").and_then(Value::as_str).unwrap_or_default();
                match image_type {
                    "image_url" => {
                        let url = dict
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        if is_base64(&url) {
                            image_from_base64(&url, None)
                        } else if is_url(&url) {
                            image_from_url(&url, None).await
                        } else {
                            Err(MultimediaError::invalid_image(format!(
                                "Invalid image url: {}. Should be a valid url or base64 string.",
                                url
                            )))
                        }
                    }
                    "image_file" => {
                        let path = dict
                            .get("image_file")
                            .and_then(|v| v.get("path"))
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        image_from_file(&self.resolve(&path), None)
                    }
                    other => Err(MultimediaError::invalid_image(format!(
                        "Unsupported image type: {}. Supported types are [image_url, image_file].",
                        other
                    ))),
                }
            }
        }
    }

    /// Build an [`Image`] from an input value: an image, a multimedia dict,
    /// or a string holding base64 data, a URL or a file path.
    pub async fn create_image(&self, value: &Value) -> Result<Image, MultimediaError> {
        match value {
            Value::Image(image) => Ok(image.clone()),
            Value::Object(dict) => {
                if self.is_multimedia_dict(dict) {
                    self.image_from_dict(dict).await
                } else {
                    Err(MultimediaError::invalid_image(
                        "Invalid image input format. The image input should be a dictionary like: \
                         {data:image/<image_type>;[path|base64|url]: <image_data>}.",
                    ))
                }
            }
            Value::String(s) if s.is_empty() => {
                Err(MultimediaError::invalid_image("The image input should not be empty."))
            }
            Value::String(s) => {
                if is_base64(s) {
                    image_from_base64(s, None)
                } else if is_url(s) {
                    image_from_url(s, None).await
                } else {
                    image_from_file(&self.resolve(s), None)
                }
            }
            other => Err(MultimediaError::invalid_image(format!(
                "Unsupported image input type: {}. The image inputs should be a string or a dictionary.",
                other.type_name()
            ))),
        }
    }

    /// Replace every multimedia dict nested in `value` with its loaded form.
    pub fn load_recursively<'a>(&'a self, value: Value) -> BoxFuture<'a, Result<Value, MultimediaError>> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    let mut loaded = Vec::with_capacity(items.len());
                    for item in items {
                        loaded.push(self.load_recursively(item).await?);
                    }
                    Ok(Value::Array(loaded))
                }
                Value::Object(dict) => {
                    if self.is_multimedia_dict(&dict) {
                        return Ok(Value::Image(self.image_from_dict(&dict).await?));
                    }
                    if self.is_text_dict(&dict) {
                        return Ok(Value::Text(Text::from_dict(&dict)));
                    }
                    let mut loaded = IndexMap::with_capacity(dict.len());
                    for (k, v) in dict {
                        loaded.insert(k, self.load_recursively(v).await?);
                    }
                    Ok(Value::Object(loaded))
                }
                other => Ok(other),
            }
        })
    }

    /// Load images for a line's inputs according to their declared types.
    ///
    /// Image-typed inputs are converted directly (element-wise when the value
    /// is a list, as for aggregation inputs); list and object inputs are
    /// scanned for nested multimedia dicts.
    pub async fn load_multimedia_data(
        &self,
        input_types: &IndexMap<String, ValueType>,
        line_inputs: IndexMap<String, Value>,
    ) -> Result<IndexMap<String, Value>, MultimediaError> {
        let mut updated = line_inputs;
        for (key, value_type) in input_types {
            let Some(current) = updated.get(key).cloned() else {
                continue;
            };
            let loaded = match value_type {
                ValueType::Image => match current {
                    Value::Array(items) => {
                        let mut images = Vec::with_capacity(items.len());
                        for item in &items {
                            images.push(Value::Image(self.create_image(item).await.map_err(|e| load_error(key, e))?));
                        }
                        Value::Array(images)
                    }
                    other => Value::Image(self.create_image(&other).await.map_err(|e| load_error(key, e))?),
                },
                ValueType::List | ValueType::Object => {
                    self.load_recursively(current).await.map_err(|e| load_error(key, e))?
                }
                _ => continue,
            };
            updated.insert(key.clone(), loaded);
        }
        Ok(updated)
    }

    /// Rewrite relative image paths inside `value` against `input_dir`
    /// (or its parent when it points at a file).
    pub fn resolve_paths(&self, input_dir: &Path, value: Value) -> Value {
        let base = if input_dir.is_file() {
            input_dir.parent().unwrap_or(input_dir).to_path_buf()
        } else {
            input_dir.to_path_buf()
        };
        self.resolve_paths_in(&base, value)
    }

    fn resolve_paths_in(&self, base: &Path, value: Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.resolve_paths_in(base, v)).collect()),
            Value::Object(mut dict) => {
                if self.is_multimedia_dict(&dict) {
                    match self.format {
                        MessageFormat::Basic => {
                            for (key, v) in dict.iter_mut() {
                                if matches!(multimedia_info(key), Some((_, ref r)) if r == "path") {
                                    *v = Value::String(base.join(v.to_string()).to_string_lossy().into_owned());
                                }
                            }
                        }
                        MessageFormat::OpenaiVision => {
                            if let Some(Value::Object(inner)) = dict.get_mut("image_file") {
                                if let Some(path) = inner.get_mut("path") {
                                    *path = Value::String(base.join(path.to_string()).to_string_lossy().into_owned());
                                }
                            }
                        }
                    }
                    return Value::Object(dict);
                }
                Value::Object(dict.into_iter().map(|(k, v)| (k, self.resolve_paths_in(base, v))).collect())
            }
            other => other,
        }
    }

    fn file_reference(&self, image: &Image, path: &str) -> Value {
        match self.format {
            MessageFormat::Basic => {
                let mut map = IndexMap::new();
                map.insert(format!("data:{};path", image.mime_type), Value::from(path));
                Value::Object(map)
            }
            MessageFormat::OpenaiVision => typed_ref("image_file", "path", path),
        }
    }

    fn url_reference(&self, image: &Image, url: &str) -> Value {
        match self.format {
            MessageFormat::Basic => {
                let mut map = IndexMap::new();
                map.insert(format!("data:{};url", image.mime_type), Value::from(url));
                Value::Object(map)
            }
            MessageFormat::OpenaiVision => typed_ref("image_url", "url", url),
        }
    }

    /// Write every image in `value` under `base_dir` (optionally inside
    /// `sub_dir`) and replace it with a file reference. Images that came
    /// from a URL are replaced with a URL reference instead.
    pub fn persist(
        &self,
        value: &Value,
        base_dir: &Path,
        sub_dir: Option<&Path>,
        use_absolute_path: bool,
    ) -> Result<Value, MultimediaError> {
        match value {
            Value::Image(image) => {
                if let Some(url) = image.source_url() {
                    return Ok(self.url_reference(image, url));
                }
                let stem = uuid::Uuid::new_v4().to_string();
                let file_name = match image.extension() {
                    Some(ext) => format!("{}.{}", stem, ext),
                    None => stem,
                };
                let folder = match sub_dir {
                    Some(sub) => base_dir.join(sub),
                    None => base_dir.to_path_buf(),
                };
                let mut image_path = match sub_dir {
                    Some(sub) => sub.join(&file_name).to_string_lossy().replace('\\', "/"),
                    None => file_name.clone(),
                };
                if use_absolute_path {
                    image_path = base_dir.join(&image_path).to_string_lossy().replace('\\', "/");
                }
                let target = folder.join(&file_name);
                std::fs::create_dir_all(&folder)
                    .and_then(|_| std::fs::write(&target, image.bytes()))
                    .map_err(|e| MultimediaError::Persist {
                        path: target.display().to_string(),
                        error: e.to_string(),
                    })?;
                Ok(self.file_reference(image, &image_path))
            }
            Value::Text(text) => Ok(text.to_dict()),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.persist(v, base_dir, sub_dir, use_absolute_path))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(dict) => Ok(Value::Object(
                dict.iter()
                    .map(|(k, v)| Ok((k.clone(), self.persist(v, base_dir, sub_dir, use_absolute_path)?)))
                    .collect::<Result<_, MultimediaError>>()?,
            )),
            other => Ok(other.clone()),
        }
    }

    /// Replace images with inline base64 dicts in this processor's layout.
    pub fn to_base64_dict(&self, value: &Value) -> Value {
        match value {
            Value::Image(image) => match self.format {
                MessageFormat::Basic => image.to_base64_dict(),
                MessageFormat::OpenaiVision => typed_ref("image_url", "url", &image.to_base64(true)),
            },
            Value::Array(items) => Value::Array(items.iter().map(|v| self.to_base64_dict(v)).collect()),
            Value::Object(dict) => {
                Value::Object(dict.iter().map(|(k, v)| (k.clone(), self.to_base64_dict(v))).collect())
            }
            other => other.clone(),
        }
    }
}

/// Replace images with their short display string, e.g. `Image(1a2b3c4d)`.
pub fn convert_multimedia_data_to_string(value: &Value) -> Value {
    match value {
        Value::Image(image) => Value::String(image.to_string()),
        Value::Array(items) => Value::Array(items.iter().map(convert_multimedia_data_to_string).collect()),
        Value::Object(dict) => Value::Object(
            dict.iter()
                .map(|(k, v)| (k.clone(), convert_multimedia_data_to_string(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn typed_ref(kind: &str, field: &str, data: &str) -> Value {
    let mut inner = IndexMap::new();
    inner.insert(field.to_string(), Value::from(data));
    let mut map = IndexMap::new();
    map.insert("type".to_string(), Value::from(kind));
    map.insert(kind.to_string(), Value::Object(inner));
    Value::Object(map)
}

fn load_error(key: &str, error: MultimediaError) -> MultimediaError {
    MultimediaError::LoadMultimediaData {
        key: key.to_string(),
        error_type_and_message: format!("({}) {}", error.error_code(), error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PNG_1PX: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn test_base64_and_url_detection() {
        assert!(is_base64(PNG_1PX));
        assert!(is_base64(&format!("data:image/png;base64,{}", PNG_1PX)));
        assert!(!is_base64("logo.jpg"));
        assert!(is_url("https://example.com/a.png"));
        assert!(!is_url("images/a.png"));
    }

    #[test]
    fn test_multimedia_dict_shapes() {
        let basic = MultimediaProcessor::new(MessageFormat::Basic);
        let vision = MultimediaProcessor::new(MessageFormat::OpenaiVision);

        let basic_dict = Value::from(json!({"data:image/png;path": "a.png"}));
        let vision_dict = Value::from(json!({"type": "image_file", "image_file": {"path": "a.png"}}));
        let text_dict = Value::from(json!({"type": "text", "text": {"value": "hi"}}));

        assert!(basic.is_multimedia_dict(basic_dict.as_object().unwrap()));
        assert!(!basic.is_multimedia_dict(vision_dict.as_object().unwrap()));
        assert!(vision.is_multimedia_dict(vision_dict.as_object().unwrap()));
        assert!(vision.is_text_dict(text_dict.as_object().unwrap()));
        assert!(!basic.is_text_dict(text_dict.as_object().unwrap()));
    }

    #[test]
    fn test_invalid_message_format() {
        let err = MultimediaProcessor::create(Some("markdown")).unwrap_err();
        assert_eq!(err.error_code(), "InvalidMessageFormatType");
        assert_eq!(
            MultimediaProcessor::create(Some("OpenAI-Vision")).unwrap().format(),
            MessageFormat::OpenaiVision
        );
    }

    #[tokio::test]
    async fn test_create_image_errors() {
        let p = MultimediaProcessor::default();
        let err = p.create_image(&Value::from("")).await.unwrap_err();
        assert_eq!(err.to_string(), "The image input should not be empty.");

        let err = p.create_image(&Value::from(json!({"a": 1}))).await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid image input format."));

        let err = p
            .create_image(&Value::from(json!({"data:image/png;base64": "not base64!"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid base64 image: not base64!.");
    }

    #[tokio::test]
    async fn test_load_and_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = MultimediaProcessor::default();

        let mut types = IndexMap::new();
        types.insert("image".to_string(), ValueType::Image);
        let mut inputs = IndexMap::new();
        inputs.insert(
            "image".to_string(),
            Value::from(json!({ "data:image/png;base64": PNG_1PX })),
        );

        let loaded = p.load_multimedia_data(&types, inputs).await.unwrap();
        let image = match &loaded["image"] {
            Value::Image(image) => image.clone(),
            other => panic!("expected image, got {:?}", other),
        };
        assert_eq!(image.mime_type(), "image/png");
        assert!(convert_multimedia_data_to_string(&loaded["image"])
            .to_string()
            .starts_with("Image("));

        let persisted = p
            .persist(&loaded["image"], dir.path(), Some(Path::new("images")), false)
            .unwrap();
        let path = persisted.as_object().unwrap()["data:image/png;path"].to_string();
        assert!(path.starts_with("images/") && path.ends_with(".png"));
        assert!(dir.path().join(&path).exists());
    }

    #[tokio::test]
    async fn test_text_part_keeps_annotations() {
        let vision = MultimediaProcessor::new(MessageFormat::OpenaiVision);
        let part = json!({"type": "text", "text": {"value": "see figure", "annotations": [{"kind": "ref"}]}});

        let loaded = vision.load_recursively(Value::from(json!([part.clone()]))).await.unwrap();
        let text = match &loaded.as_array().unwrap()[0] {
            Value::Text(text) => text.clone(),
            other => panic!("expected text, got {:?}", other),
        };
        assert_eq!(text.text, "see figure");
        assert_eq!(text.annotations.as_deref(), Some(&Value::from(json!([{"kind": "ref"}]))));
        assert_eq!(text.to_dict(), Value::from(part));
        assert_eq!(Text::new("plain").to_dict(), Value::from(json!({"type": "text", "text": "plain"})));
    }

    #[tokio::test]
    async fn test_load_error_names_input() {
        let p = MultimediaProcessor::default();
        let mut types = IndexMap::new();
        types.insert("img".to_string(), ValueType::Image);
        let mut inputs = IndexMap::new();
        inputs.insert("img".to_string(), Value::Int(3));

        let err = p.load_multimedia_data(&types, inputs).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to load image for input 'img':"));
    }
}
