use indexmap::IndexMap;
use pfcore::{Callable, FnTool, InputDefinition, Tool, ToolContext, ToolError, ToolType, Value, ValueType};
use pfruntime::template::render_template_jinja2;
use pfruntime::{RegisteredTool, ToolFactory};
use std::sync::Arc;

pub const RENDER_TEMPLATE_TOOL_ID: &str = "promptflow.tools.template_rendering.render_template_jinja2";

fn render_template(args: IndexMap<String, Value>) -> Result<Value, ToolError> {
    let template = ToolContext::require_str(&args, "template")?;
    let kwargs: IndexMap<String, Value> = args
        .iter()
        .filter(|(k, _)| k.as_str() != "template")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(Value::String(render_template_jinja2(template, &kwargs)?))
}

pub struct RenderTemplateFactory;

impl ToolFactory for RenderTemplateFactory {
    fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
        Ok(Arc::new(FnTool::new("render_template_jinja2", render_template)))
    }
}

/// Render a jinja2 template given as an input, with every other input as a variable
pub fn render_template_tool() -> RegisteredTool {
    RegisteredTool::new(
        Tool::new("render_template_jinja2", ToolType::Python)
            .with_input("template", InputDefinition::of(ValueType::String))
            .with_function("render_template_jinja2"),
        Arc::new(RenderTemplateFactory),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_remaining_inputs() {
        let out = render_template(IndexMap::from([
            ("template".to_string(), Value::from("Hello {{ name }}!")),
            ("name".to_string(), Value::from("world")),
        ]))
        .unwrap();
        assert_eq!(out, Value::from("Hello world!"));
    }

    #[test]
    fn test_missing_template() {
        let err = render_template(IndexMap::new()).unwrap_err();
        assert_eq!(err.error_code(), "MissingInput");
    }
}
