use crate::error::ToolError;
use crate::value::{Value, ValueType};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Llm,
    Python,
    Csharp,
    Prompt,
    CustomLlm,
    #[serde(rename = "_action")]
    Action,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Llm => "llm",
            ToolType::Python => "python",
            ToolType::Csharp => "csharp",
            ToolType::Prompt => "prompt",
            ToolType::CustomLlm => "custom_llm",
            ToolType::Action => "_action",
        }
    }
}

/// One entry of a tool input's `type` list: a value type or a connection class name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamType {
    Value(ValueType),
    Connection(String),
}

impl ParamType {
    pub fn is_connection(&self) -> bool {
        matches!(self, ParamType::Connection(name) if is_connection_class_name(name))
    }

    pub fn name(&self) -> &str {
        match self {
            ParamType::Value(t) => t.as_str(),
            ParamType::Connection(name) => name,
        }
    }
}

/// Connection class names follow the `<Kind>Connection` convention.
pub fn is_connection_class_name(name: &str) -> bool {
    name.ends_with("Connection") && name.len() > "Connection".len()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(rename = "type", default)]
    pub types: Vec<ParamType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_type: Option<Vec<String>>,
}

impl InputDefinition {
    pub fn of(value_type: ValueType) -> Self {
        Self {
            types: vec![ParamType::Value(value_type)],
            ..Default::default()
        }
    }

    pub fn connection(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(|t| ParamType::Connection(t.to_string())).collect(),
            ..Default::default()
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// All declared types are connection classes.
    pub fn is_connection(&self) -> bool {
        !self.types.is_empty() && self.types.iter().all(ParamType::is_connection)
    }

    pub fn value_types(&self) -> Vec<ValueType> {
        self.types
            .iter()
            .filter_map(|t| match t {
                ParamType::Value(v) => Some(*v),
                ParamType::Connection(_) => None,
            })
            .collect()
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.iter().map(|t| t.name().to_string()).collect()
    }
}

/// Tool metadata: what a node's source resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    #[serde(default)]
    pub inputs: IndexMap<String, InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
}

impl Tool {
    pub fn new(name: impl Into<String>, tool_type: ToolType) -> Self {
        Self {
            name: name.into(),
            tool_type,
            inputs: IndexMap::new(),
            description: None,
            module: None,
            class_name: None,
            function: None,
            source: None,
            code: None,
            connection_type: None,
            deprecated_tools: None,
            package: None,
            package_version: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, definition: InputDefinition) -> Self {
        self.inputs.insert(name.into(), definition);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_deprecated_tools(mut self, ids: &[&str]) -> Self {
        self.deprecated_tools = Some(ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn connection_input_names(&self) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|(_, def)| def.is_connection())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub node_name: String,
    pub run_id: String,
    pub line_number: Option<usize>,
    api_calls: Arc<Mutex<Vec<Value>>>,
    metrics: Arc<Mutex<IndexMap<String, Value>>>,
}

impl ToolContext {
    pub fn new(node_name: impl Into<String>, run_id: impl Into<String>, line_number: Option<usize>) -> Self {
        Self {
            node_name: node_name.into(),
            run_id: run_id.into(),
            line_number,
            api_calls: Arc::new(Mutex::new(Vec::new())),
            metrics: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    /// Record a traced call; it ends up in the node's `api_calls`.
    pub fn record_api_call(&self, call: Value) {
        if let Ok(mut calls) = self.api_calls.lock() {
            calls.push(call);
        }
    }

    pub fn api_calls(&self) -> Vec<Value> {
        self.api_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Log a metric; aggregation nodes report batch metrics this way.
    pub fn log_metric(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.insert(key.into(), value.into());
        }
    }

    pub fn metrics(&self) -> IndexMap<String, Value> {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Fetch a required argument.
    pub fn require<'a>(args: &'a IndexMap<String, Value>, name: &str) -> Result<&'a Value, ToolError> {
        args.get(name).ok_or_else(|| ToolError::MissingInput(name.to_string()))
    }

    /// Fetch a required string argument.
    pub fn require_str<'a>(args: &'a IndexMap<String, Value>, name: &str) -> Result<&'a str, ToolError> {
        let value = Self::require(args, name)?;
        value.as_str().ok_or_else(|| ToolError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }
}

/// Core trait for anything a node can invoke.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError>;

    /// Optional: describe the callable in logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

type SyncFn = dyn Fn(IndexMap<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// Adapter turning a plain closure into a [`Callable`].
pub struct FnTool {
    name: String,
    func: Box<SyncFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(IndexMap<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Callable for FnTool {
    async fn call(&self, _ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
        (self.func)(args)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_definition_types() {
        let def: InputDefinition =
            serde_json::from_value(serde_json::json!({"type": ["AzureOpenAIConnection", "OpenAIConnection"]})).unwrap();
        assert!(def.is_connection());
        assert_eq!(def.type_names(), vec!["AzureOpenAIConnection", "OpenAIConnection"]);

        let def: InputDefinition = serde_json::from_value(serde_json::json!({"type": ["int"], "default": 2})).unwrap();
        assert!(!def.is_connection());
        assert_eq!(def.value_types(), vec![ValueType::Int]);
    }

    #[tokio::test]
    async fn test_fn_tool_and_context() {
        let tool = FnTool::new("echo", |args| Ok(ToolContext::require(&args, "text")?.clone()));
        let ctx = ToolContext::new("echo_node", "run_0", Some(0));
        let mut args = IndexMap::new();
        args.insert("text".to_string(), Value::from("hi"));
        assert_eq!(tool.call(&ctx, args).await.unwrap(), Value::from("hi"));

        let err = tool.call(&ctx, IndexMap::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::MissingInput(ref name) if name == "text"));
        assert_eq!(tool.describe(), "echo");
    }

    #[test]
    fn test_metrics_shared_between_clones() {
        let ctx = ToolContext::new("accuracy", "run_0", None);
        let clone = ctx.clone();
        clone.log_metric("accuracy", 0.5);
        assert_eq!(ctx.metrics().get("accuracy"), Some(&Value::from(0.5)));
    }
}
