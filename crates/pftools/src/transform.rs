use indexmap::IndexMap;
use pfcore::{Callable, FnTool, InputDefinition, Tool, ToolContext, ToolError, ToolType, Value, ValueType};
use pfruntime::{RegisteredTool, ToolFactory};
use std::sync::Arc;

pub const JSON_PARSE_TOOL_ID: &str = "promptflow.tools.transform.json_parse";
pub const JSON_STRINGIFY_TOOL_ID: &str = "promptflow.tools.transform.json_stringify";

/// Parse a JSON string into a value
fn json_parse(args: IndexMap<String, Value>) -> Result<Value, ToolError> {
    let input = ToolContext::require_str(&args, "json")?;
    let parsed: serde_json::Value =
        serde_json::from_str(input).map_err(|e| ToolError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
    Ok(Value::from(parsed))
}

/// Render a value as pretty-printed JSON
fn json_stringify(args: IndexMap<String, Value>) -> Result<Value, ToolError> {
    let value = ToolContext::require(&args, "value")?;
    let json_str = serde_json::to_string_pretty(&value.to_json())
        .map_err(|e| ToolError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;
    Ok(Value::String(json_str))
}

pub struct JsonParseFactory;

impl ToolFactory for JsonParseFactory {
    fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
        Ok(Arc::new(FnTool::new("json_parse", json_parse)))
    }
}

pub struct JsonStringifyFactory;

impl ToolFactory for JsonStringifyFactory {
    fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
        Ok(Arc::new(FnTool::new("json_stringify", json_stringify)))
    }
}

pub fn json_parse_tool() -> RegisteredTool {
    RegisteredTool::new(
        Tool::new("json_parse", ToolType::Python)
            .with_input("json", InputDefinition::of(ValueType::String))
            .with_function("json_parse"),
        Arc::new(JsonParseFactory),
    )
}

pub fn json_stringify_tool() -> RegisteredTool {
    RegisteredTool::new(
        Tool::new("json_stringify", ToolType::Python)
            .with_input("value", InputDefinition::of(ValueType::Object))
            .with_function("json_stringify"),
        Arc::new(JsonStringifyFactory),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_stringify() {
        let parsed = json_parse(IndexMap::from([(
            "json".to_string(),
            Value::from(r#"{"score": 4, "ok": true}"#),
        )]))
        .unwrap();
        assert_eq!(parsed.get("score"), Some(&Value::Int(4)));

        let text = json_stringify(IndexMap::from([("value".to_string(), parsed)])).unwrap();
        assert_eq!(text, Value::from("{\n  \"score\": 4,\n  \"ok\": true\n}"));
    }

    #[test]
    fn test_parse_error() {
        let err = json_parse(IndexMap::from([("json".to_string(), Value::from("{"))])).unwrap_err();
        assert!(err.to_string().starts_with("JSON parse error"));
    }
}
