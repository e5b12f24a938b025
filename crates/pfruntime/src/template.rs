//! Prompt template helpers built on minijinja
//!
//! Templates are rendered with `trim_blocks` and `keep_trailing_newline`
//! enabled. Images passed to a template render as their short display
//! string, e.g. `Image(1a2b3c4d)`.

use async_trait::async_trait;
use indexmap::IndexMap;
use minijinja::Environment;
use once_cell::sync::Lazy;
use pfcore::multimedia::convert_multimedia_data_to_string;
use pfcore::{Callable, ResolutionError, ToolContext, ToolError, Value, ValueType};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

/// Parameter name the prompt tool reserves for the template text.
pub const TEMPLATE_PARAM: &str = "template";

static IMAGE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[(\s*image\s*)\]\(\{\{\s*([^{}]+?)\s*\}\}\)").expect("valid regex"));

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_keep_trailing_newline(true);
    env
}

/// Render `template` with `kwargs`.
pub fn render_template_jinja2(template: &str, kwargs: &IndexMap<String, Value>) -> Result<String, ToolError> {
    let env = environment();
    let tmpl = env
        .template_from_str(template)
        .map_err(|e| ToolError::Template(format!("{:?}: {}", e.kind(), e)))?;
    let ctx = convert_multimedia_data_to_string(&Value::Object(kwargs.clone()));
    tmpl.render(ctx.to_json())
        .map_err(|e| ToolError::Template(format!("{:?}: {}", e.kind(), e)))
}

/// Variables a template reads, in order of first appearance, with their
/// inferred type. `![image]({{name}})` placeholders mark `name` as an image.
pub fn inputs_for_prompt_template(template: &str) -> Result<IndexMap<String, ValueType>, ToolError> {
    let env = environment();
    let tmpl = env
        .template_from_str(template)
        .map_err(|e| ToolError::Template(format!("{:?}: {}", e.kind(), e)))?;
    let mut names: Vec<String> = tmpl.undeclared_variables(false).into_iter().collect();
    names.sort_by_key(|name| (template.find(name.as_str()).unwrap_or(usize::MAX), name.clone()));

    let mut inputs: IndexMap<String, ValueType> = names.into_iter().map(|n| (n, ValueType::String)).collect();
    for captures in IMAGE_PLACEHOLDER.captures_iter(template) {
        inputs.insert(captures[2].trim().to_string(), ValueType::Image);
    }
    Ok(inputs)
}

/// Read a node's template file relative to the working directory.
pub fn load_source_content(working_dir: &Path, source_path: Option<&str>, node_name: &str) -> Result<String, ResolutionError> {
    let invalid = || ResolutionError::InvalidSourcePath {
        source_path: source_path.unwrap_or("None").to_string(),
        node_name: node_name.to_string(),
    };
    let path = working_dir.join(source_path.ok_or_else(invalid)?);
    if !path.is_file() {
        return Err(invalid());
    }
    std::fs::read_to_string(&path).map_err(|e| ResolutionError::TemplateLoad {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}

/// Callable behind `prompt` nodes: renders a fixed template.
pub struct PromptTemplateTool {
    template: String,
}

impl PromptTemplateTool {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl Callable for PromptTemplateTool {
    async fn call(&self, _ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
        render_template_jinja2(&self.template, &args).map(Value::String)
    }

    fn describe(&self) -> String {
        "render_template_jinja2".to_string()
    }
}

/// Wraps a callable so every call receives the node's prompt template
/// under `param`.
pub struct BoundPrompt {
    inner: Arc<dyn Callable>,
    param: String,
    template: String,
}

impl BoundPrompt {
    pub fn new(inner: Arc<dyn Callable>, param: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            inner,
            param: param.into(),
            template: template.into(),
        }
    }
}

#[async_trait]
impl Callable for BoundPrompt {
    async fn call(&self, ctx: &ToolContext, mut args: IndexMap<String, Value>) -> Result<Value, ToolError> {
        args.insert(self.param.clone(), Value::String(self.template.clone()));
        self.inner.call(ctx, args).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_keeps_trailing_newline() {
        let mut kwargs = IndexMap::new();
        kwargs.insert("name".to_string(), Value::from("world"));
        let rendered = render_template_jinja2("Hello {{name}}!\n", &kwargs).unwrap();
        assert_eq!(rendered, "Hello world!\n");
    }

    #[test]
    fn test_render_error_is_template_error() {
        let err = render_template_jinja2("{% if %}", &IndexMap::new()).unwrap_err();
        assert_eq!(err.error_code(), "JinjaTemplateError");
    }

    #[test]
    fn test_inputs_in_order_with_image() {
        let inputs =
            inputs_for_prompt_template("Describe ![image]({{ picture }}) for {{user}} in {{language}}").unwrap();
        assert_eq!(inputs.keys().collect::<Vec<_>>(), vec!["picture", "user", "language"]);
        assert_eq!(inputs["picture"], ValueType::Image);
        assert_eq!(inputs["user"], ValueType::String);
    }

    #[tokio::test]
    async fn test_bound_prompt_injects_template() {
        let inner: Arc<dyn Callable> = Arc::new(pfcore::FnTool::new("echo_prompt", |args| {
            Ok(ToolContext::require(&args, "prompt")?.clone())
        }));
        let bound = BoundPrompt::new(inner, "prompt", "{{question}}");
        let out = bound.call(&ToolContext::default(), IndexMap::new()).await.unwrap();
        assert_eq!(out, Value::from("{{question}}"));
    }
}
