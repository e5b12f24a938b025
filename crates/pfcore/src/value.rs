use crate::multimedia::{Image, Text};
use crate::stream::GeneratorOutput;
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Dynamic value flowing between flow inputs, node inputs and node outputs.
///
/// Plain JSON data maps onto the scalar/array/object variants. Images and
/// text parts are loaded into their in-memory forms by the multimedia
/// processor, and streaming node outputs are carried as a live
/// [`GeneratorOutput`].
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Image(Image),
    Text(Text),
    Stream(GeneratorOutput),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|m| m.get(key))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Value::Stream(_))
    }

    /// Type name used in diagnostics, mirroring the JSON kind of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::Array(_) => "list",
            Value::Object(_) => "dict",
            Value::Image(_) => "Image",
            Value::Text(_) => "Text",
            Value::Stream(_) => "generator",
        }
    }

    /// Convert into plain JSON. Images become base64 reference dicts and
    /// streams become the list of items recorded so far.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Image(image) => image.to_base64_dict().to_json(),
            Value::Text(text) => text.to_dict().to_json(),
            Value::Stream(gen) => {
                serde_json::Value::Array(gen.recorded().iter().map(Value::to_json).collect())
            }
        }
    }

    pub fn object() -> Self {
        Value::Object(IndexMap::new())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Image(a), Value::Image(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Stream(a), Value::Stream(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Image(image) => write!(f, "{}", image),
            Value::Text(text) => write!(f, "{}", text.text),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(obj) => {
                let mut map = serializer.serialize_map(Some(obj.len()))?;
                for (k, v) in obj {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Image(image) => image.to_base64_dict().serialize(serializer),
            Value::Text(text) => text.to_dict().serialize(serializer),
            Value::Stream(gen) => {
                let items = gen.recorded();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from(json))
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        match j {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<Image> for Value {
    fn from(image: Image) -> Self {
        Value::Image(image)
    }
}

impl From<GeneratorOutput> for Value {
    fn from(gen: GeneratorOutput) -> Self {
        Value::Stream(gen)
    }
}

/// Declared type of a flow input or tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Double,
    Bool,
    String,
    Secret,
    PromptTemplate,
    List,
    Object,
    FilePath,
    Image,
    AssistantDefinition,
}

/// Why a value could not be parsed into a [`ValueType`]
#[derive(Debug, Clone, PartialEq)]
pub enum ParseValueError {
    /// The value was a string interpreted as JSON and failed to decode
    Json(String),
    /// The value has the wrong shape for the type
    Type(String),
}

impl fmt::Display for ParseValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseValueError::Json(msg) => write!(f, "(JSONDecodeError) {}", msg),
            ParseValueError::Type(msg) => write!(f, "(ValueError) {}", msg),
        }
    }
}

impl ValueType {
    pub const ALL: [ValueType; 11] = [
        ValueType::Int,
        ValueType::Double,
        ValueType::Bool,
        ValueType::String,
        ValueType::Secret,
        ValueType::PromptTemplate,
        ValueType::List,
        ValueType::Object,
        ValueType::FilePath,
        ValueType::Image,
        ValueType::AssistantDefinition,
    ];

    /// Look up a type by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Double => "double",
            ValueType::Bool => "bool",
            ValueType::String => "string",
            ValueType::Secret => "secret",
            ValueType::PromptTemplate => "prompt_template",
            ValueType::List => "list",
            ValueType::Object => "object",
            ValueType::FilePath => "file_path",
            ValueType::Image => "image",
            ValueType::AssistantDefinition => "assistant_definition",
        }
    }

    /// Coerce a value into this type. Types without a conversion rule pass through.
    pub fn parse(&self, v: &Value) -> Result<Value, ParseValueError> {
        match self {
            ValueType::Int => match v {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Float(n) => Ok(Value::Int(n.trunc() as i64)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| ParseValueError::Type(format!("invalid literal for int(): '{}'", s))),
                other => Err(ParseValueError::Type(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            },
            ValueType::Double => match v {
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Float(n) => Ok(Value::Float(*n)),
                Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| ParseValueError::Type(format!("could not convert string to float: '{}'", s))),
                other => Err(ParseValueError::Type(format!(
                    "float() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            },
            ValueType::Bool => match v {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                other => Err(ParseValueError::Type(format!("Invalid boolean value '{}'", other))),
            },
            ValueType::String => Ok(Value::String(v.to_string())),
            ValueType::List => {
                let parsed = match v {
                    Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                        .map(Value::from)
                        .map_err(|e| ParseValueError::Json(e.to_string()))?,
                    other => other.clone(),
                };
                match parsed {
                    Value::Array(_) => Ok(parsed),
                    other => Err(ParseValueError::Type(format!("Invalid list value '{}'", other))),
                }
            }
            ValueType::Object => match v {
                Value::String(s) => Ok(serde_json::from_str::<serde_json::Value>(s)
                    .map(Value::from)
                    .unwrap_or_else(|_| v.clone())),
                other => Ok(other.clone()),
            },
            _ => Ok(v.clone()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_preserves_key_order() {
        let v = Value::from(json!({"b": 1, "a": [true, null, 1.5]}));
        let keys: Vec<_> = v.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"b":1,"a":[true,null,1.5]}"#);
    }

    #[test]
    fn test_parse_bool_and_numbers() {
        assert_eq!(ValueType::Bool.parse(&"TRUE".into()).unwrap(), Value::Bool(true));
        assert!(ValueType::Bool.parse(&"yes".into()).is_err());
        assert_eq!(ValueType::Int.parse(&"42".into()).unwrap(), Value::Int(42));
        assert_eq!(ValueType::Double.parse(&Value::Int(2)).unwrap(), Value::Float(2.0));
        assert_eq!(ValueType::String.parse(&Value::Int(7)).unwrap(), Value::from("7"));
    }

    #[test]
    fn test_parse_list_and_object() {
        assert_eq!(
            ValueType::List.parse(&"[1, 2]".into()).unwrap(),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
        assert!(matches!(
            ValueType::List.parse(&"[1, 2".into()),
            Err(ParseValueError::Json(_))
        ));
        assert!(matches!(
            ValueType::List.parse(&"{}".into()),
            Err(ParseValueError::Type(_))
        ));
        assert_eq!(ValueType::Object.parse(&"not json".into()).unwrap(), Value::from("not json"));
    }
}
