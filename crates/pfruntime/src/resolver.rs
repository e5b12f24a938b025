use crate::script::ScriptTool;
use crate::template::{self, BoundPrompt, PromptTemplateTool, TEMPLATE_PARAM};
use crate::tools_manager::{RegisteredTool, ToolsManager};
use indexmap::IndexMap;
use pfcore::{
    is_connection_class_name, Callable, Connection, ConnectionProvider, InputAssignment, MultimediaError,
    MultimediaProcessor, Node, ParamType, ResolutionError, ResolveToolError, Tool, ToolSourceType, ToolType, Value,
    ValueType,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A node bound to the callable that executes it
#[derive(Clone)]
pub struct ResolvedTool {
    /// Copy of the node with literal inputs converted and init inputs removed
    pub node: Node,
    /// Tool definition; `None` for prompt nodes
    pub definition: Option<Tool>,
    pub callable: Arc<dyn Callable>,
    pub init_args: IndexMap<String, Value>,
}

impl std::fmt::Debug for ResolvedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedTool")
            .field("node", &self.node.name)
            .field("callable", &self.callable.describe())
            .finish()
    }
}

/// Turns node definitions into callables.
pub struct ToolResolver {
    working_dir: PathBuf,
    connections: Arc<dyn ConnectionProvider>,
    tools_manager: Arc<RwLock<ToolsManager>>,
    multimedia: MultimediaProcessor,
    flow_tools: Vec<Tool>,
}

fn error_type_and_message(code: &str, message: impl std::fmt::Display) -> String {
    format!("({}) {}", code, message)
}

const CUSTOM_CONNECTION: &str = "CustomConnection";

fn image_error(key: &str, e: MultimediaError) -> ResolutionError {
    ResolutionError::ImageInput {
        key: key.to_string(),
        error_type_and_message: error_type_and_message(e.error_code(), e),
    }
}

impl ToolResolver {
    /// Create a resolver and load the package tools named by `package_tool_keys`.
    pub fn new(
        working_dir: impl Into<PathBuf>,
        connections: Arc<dyn ConnectionProvider>,
        tools_manager: Arc<RwLock<ToolsManager>>,
        package_tool_keys: Option<&[String]>,
        multimedia: MultimediaProcessor,
    ) -> Self {
        let working_dir = working_dir.into();
        tools_manager
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .load_package_tools(package_tool_keys);
        Self {
            multimedia: multimedia.with_working_dir(&working_dir),
            working_dir,
            connections,
            tools_manager,
            flow_tools: Vec::new(),
        }
    }

    /// Tool definitions declared by the flow, consulted for script nodes.
    pub fn with_flow_tools(mut self, tools: Vec<Tool>) -> Self {
        self.flow_tools = tools;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Resolve a node into a [`ResolvedTool`]. Any failure is attributed to the node.
    pub async fn resolve_tool_by_node(
        &self,
        node: &Node,
        convert_input_types: bool,
    ) -> Result<ResolvedTool, ResolveToolError> {
        self.resolve(node, convert_input_types)
            .await
            .map_err(|e| ResolveToolError::new(&node.name, e))
    }

    async fn resolve(&self, node: &Node, convert_input_types: bool) -> Result<ResolvedTool, ResolutionError> {
        let source = node.source.as_ref().ok_or_else(|| ResolutionError::SourceNotDefined {
            node_name: node.name.clone(),
        })?;
        let not_implemented = || ResolutionError::NotImplemented {
            node_type: node.node_type.map(|t| t.as_str()).unwrap_or("None").to_string(),
            source_type: source.source_type.as_str().to_string(),
        };
        match (node.node_type, source.source_type) {
            (Some(ToolType::Python), ToolSourceType::Package) => self.resolve_package_node(node, convert_input_types).await,
            (Some(ToolType::Python), ToolSourceType::Code) => self.resolve_script_node(node, convert_input_types).await,
            (Some(ToolType::Prompt), _) => self.resolve_prompt_node(node).await,
            (Some(ToolType::Llm), _) => self.resolve_llm_node(node, convert_input_types).await,
            (Some(ToolType::CustomLlm), ToolSourceType::PackageWithPrompt) => {
                let resolved = self.resolve_package_node(node, convert_input_types).await?;
                self.integrate_prompt_in_package_node(resolved).await
            }
            _ => Err(not_implemented()),
        }
    }

    fn manager(&self) -> std::sync::RwLockReadGuard<'_, ToolsManager> {
        self.tools_manager.read().unwrap_or_else(|e| e.into_inner())
    }

    fn get_connection(&self, name: &str, node_name: &str) -> Result<Connection, ResolutionError> {
        self.connections
            .get(name)
            .ok_or_else(|| ResolutionError::GetConnection {
                connection: name.to_string(),
                node_name: node_name.to_string(),
                error: format!("Connection '{}' is not found.", name),
            })
    }

    /// Convert literal node inputs to the types the tool declares.
    ///
    /// Empty literals are dropped so tool defaults apply. Inputs the tool
    /// does not declare are passed through untouched.
    pub async fn convert_literal_input_types(
        &self,
        node_name: &str,
        inputs: &IndexMap<String, InputAssignment>,
        tool: &Tool,
    ) -> Result<IndexMap<String, InputAssignment>, ResolutionError> {
        let mut updated = IndexMap::new();
        for (key, assignment) in inputs {
            if assignment.is_empty() {
                continue;
            }
            let InputAssignment::Literal(value) = assignment else {
                updated.insert(key.clone(), assignment.clone());
                continue;
            };
            let Some(first) = tool.inputs.get(key).and_then(|def| def.types.first()) else {
                updated.insert(key.clone(), assignment.clone());
                continue;
            };
            let definition = &tool.inputs[key];
            let converted = match first {
                ParamType::Connection(name) if is_connection_class_name(name) => {
                    if matches!(value, Value::Object(_)) {
                        value.clone()
                    } else {
                        self.convert_connection(key, value, node_name, definition)?
                    }
                }
                ParamType::Connection(name) => {
                    return Err(ResolutionError::ValueTypeUnresolved {
                        key: key.clone(),
                        node_name: node_name.to_string(),
                        value_type: name.clone(),
                    })
                }
                ParamType::Value(ValueType::Image) => Value::Image(
                    self.multimedia
                        .create_image(value)
                        .await
                        .map_err(|e| image_error(key, e))?,
                ),
                ParamType::Value(ValueType::AssistantDefinition) => value.clone(),
                ParamType::Value(value_type) => {
                    let parsed = value_type.parse(value).map_err(|_| ResolutionError::InvalidInputValue {
                        key: key.clone(),
                        node_name: node_name.to_string(),
                        value: value.to_string(),
                        value_type: value_type.as_str().to_string(),
                    })?;
                    self.multimedia
                        .load_recursively(parsed)
                        .await
                        .map_err(|e| image_error(key, e))?
                }
            };
            updated.insert(key.clone(), InputAssignment::Literal(converted));
        }
        Ok(updated)
    }

    fn convert_connection(
        &self,
        key: &str,
        value: &Value,
        node_name: &str,
        definition: &pfcore::InputDefinition,
    ) -> Result<Value, ResolutionError> {
        let mut connection = self.get_connection(&value.to_string(), node_name)?;
        let custom_type = definition.custom_type.as_ref().and_then(|t| t.first());
        if let (CUSTOM_CONNECTION, Some(custom_type)) = (connection.connection_type.as_str(), custom_type) {
            connection.custom_type = Some(custom_type.clone());
            return Ok(connection.to_value());
        }
        let valid_types = definition.type_names();
        if !valid_types.iter().any(|t| t == &connection.connection_type) {
            return Err(ResolutionError::ConnectionTypeMismatch {
                key: key.to_string(),
                node_name: node_name.to_string(),
                actual_type: connection.connection_type,
                valid_types,
            });
        }
        Ok(connection.to_value())
    }

    /// Build the callable from its factory, consuming literal init inputs.
    fn instantiate(
        &self,
        registered: &RegisteredTool,
        node_inputs: &mut IndexMap<String, InputAssignment>,
    ) -> Result<(Arc<dyn Callable>, IndexMap<String, Value>), ResolutionError> {
        let tool_name = registered.tool.name.clone();
        let mut init_args = IndexMap::new();
        for name in registered.factory.init_inputs() {
            match node_inputs.get(&name) {
                Some(InputAssignment::Literal(v)) => {
                    init_args.insert(name, v.clone());
                }
                Some(other) => {
                    return Err(ResolutionError::InputTypeMismatch {
                        tool_name,
                        input_name: name,
                        input_value: other.to_string(),
                    })
                }
                None => {}
            }
        }
        let missing: Vec<String> = registered
            .factory
            .required_init_inputs()
            .into_iter()
            .filter(|n| !init_args.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(ResolutionError::MissingRequiredInputs {
                tool_name,
                missing_inputs: missing,
            });
        }
        let callable = registered
            .factory
            .create(&init_args)
            .map_err(|e| ResolutionError::ToolLoad {
                tool_name: tool_name.clone(),
                error_type_and_message: error_type_and_message(e.error_code(), &e),
            })?;
        for name in init_args.keys() {
            node_inputs.shift_remove(name);
        }
        Ok((callable, init_args))
    }

    async fn resolve_package_node(&self, node: &Node, convert_input_types: bool) -> Result<ResolvedTool, ResolutionError> {
        let tool_id = node
            .source
            .as_ref()
            .and_then(|s| s.tool.clone())
            .or_else(|| node.tool.clone())
            .ok_or_else(|| ResolutionError::SourceNotDefined {
                node_name: node.name.clone(),
            })?;
        let registered = self.manager().load_package_tool(&tool_id)?;
        let mut updated = node.clone();
        if convert_input_types {
            updated.inputs = self
                .convert_literal_input_types(&node.name, &node.inputs, &registered.tool)
                .await?;
        }
        let (callable, init_args) = self.instantiate(&registered, &mut updated.inputs)?;
        Ok(ResolvedTool {
            node: updated,
            definition: Some(registered.tool),
            callable,
            init_args,
        })
    }

    async fn resolve_script_node(&self, node: &Node, convert_input_types: bool) -> Result<ResolvedTool, ResolutionError> {
        let path = node
            .source
            .as_ref()
            .and_then(|s| s.path.clone())
            .ok_or_else(|| ResolutionError::InvalidSourcePath {
                source_path: "None".to_string(),
                node_name: node.name.clone(),
            })?;

        let builtin = self.manager().get_builtin(&path).cloned();
        let mut updated = node.clone();
        if let Some(registered) = builtin {
            if convert_input_types {
                updated.inputs = self
                    .convert_literal_input_types(&node.name, &node.inputs, &registered.tool)
                    .await?;
            }
            let (callable, init_args) = self.instantiate(&registered, &mut updated.inputs)?;
            return Ok(ResolvedTool {
                node: updated,
                definition: Some(registered.tool),
                callable,
                init_args,
            });
        }

        let script = self.working_dir.join(&path);
        if !script.is_file() {
            return Err(ResolutionError::InvalidSourcePath {
                source_path: path,
                node_name: node.name.clone(),
            });
        }
        let tool = self
            .flow_tools
            .iter()
            .find(|t| t.source.as_deref() == Some(path.as_str()))
            .cloned()
            .unwrap_or_else(|| ScriptTool::definition(&path, node.inputs.keys().cloned()));
        if convert_input_types {
            updated.inputs = self.convert_literal_input_types(&node.name, &node.inputs, &tool).await?;
        }
        Ok(ResolvedTool {
            node: updated,
            definition: Some(tool),
            callable: Arc::new(ScriptTool::new(script, &self.working_dir)),
            init_args: IndexMap::new(),
        })
    }

    fn load_template(&self, node: &Node) -> Result<(String, IndexMap<String, ValueType>), ResolutionError> {
        let path = node.source.as_ref().and_then(|s| s.path.as_deref());
        let content = template::load_source_content(&self.working_dir, path, &node.name)?;
        let inputs = template::inputs_for_prompt_template(&content).map_err(|e| ResolutionError::TemplateLoad {
            path: path.unwrap_or_default().to_string(),
            error: e.to_string(),
        })?;
        Ok((content, inputs))
    }

    async fn load_images_for_prompt_template(
        &self,
        template_inputs: &IndexMap<String, ValueType>,
        node_inputs: &mut IndexMap<String, InputAssignment>,
    ) -> Result<(), ResolutionError> {
        for (name, value_type) in template_inputs {
            if *value_type != ValueType::Image {
                continue;
            }
            if let Some(InputAssignment::Literal(value)) = node_inputs.get(name) {
                let image = self
                    .multimedia
                    .create_image(value)
                    .await
                    .map_err(|e| image_error(name, e))?;
                node_inputs.insert(name.clone(), InputAssignment::Literal(Value::Image(image)));
            }
        }
        Ok(())
    }

    async fn resolve_prompt_node(&self, node: &Node) -> Result<ResolvedTool, ResolutionError> {
        let (content, template_inputs) = self.load_template(node)?;
        let duplicated = duplicated_inputs(&template_inputs, [TEMPLATE_PARAM]);
        if !duplicated.is_empty() {
            return Err(ResolutionError::DuplicatePromptInputs {
                duplicated_inputs: duplicated,
                node_name: node.name.clone(),
            });
        }
        let mut updated = node.clone();
        self.load_images_for_prompt_template(&template_inputs, &mut updated.inputs)
            .await?;
        Ok(ResolvedTool {
            node: updated,
            definition: None,
            callable: Arc::new(PromptTemplateTool::new(content)),
            init_args: IndexMap::new(),
        })
    }

    async fn resolve_llm_node(&self, node: &Node, convert_input_types: bool) -> Result<ResolvedTool, ResolutionError> {
        let connection_name = node.connection.clone().unwrap_or_default();
        let connection = self.get_connection(&connection_name, &node.name)?;
        let provider = self.manager().provider_for_connection(&connection.connection_type)?;
        let api = node.api.clone().unwrap_or_default();
        let registered = self.manager().load_api(&provider, &api)?;

        let key = registered
            .tool
            .inputs
            .iter()
            .find(|(_, def)| matches!(def.types.first(), Some(t) if t.is_connection()))
            .map(|(key, def)| (key.clone(), def.type_names()));
        let Some((key, valid_types)) = key else {
            return Err(ResolutionError::InvalidConnectionType {
                conn_type: connection.connection_type,
            });
        };
        if !valid_types.contains(&connection.connection_type) {
            return Err(ResolutionError::ConnectionTypeMismatch {
                key,
                node_name: node.name.clone(),
                actual_type: connection.connection_type,
                valid_types,
            });
        }

        let mut updated = node.clone();
        updated.provider = Some(provider.clone());
        updated
            .inputs
            .insert(key, InputAssignment::Literal(connection.to_value()));
        if convert_input_types {
            updated.inputs = self
                .convert_literal_input_types(&node.name, &updated.inputs, &registered.tool)
                .await?;
        }

        let (content, template_inputs) = self.load_template(node)?;
        let duplicated = duplicated_inputs(&template_inputs, registered.tool.inputs.keys().map(String::as_str));
        if !duplicated.is_empty() {
            return Err(ResolutionError::DuplicateLlmInputs {
                duplicated_inputs: duplicated,
                node_name: node.name.clone(),
                provider,
                api,
            });
        }
        self.load_images_for_prompt_template(&template_inputs, &mut updated.inputs)
            .await?;

        let (callable, init_args) = self.instantiate(&registered, &mut updated.inputs)?;
        let callable: Arc<dyn Callable> = match registered.factory.prompt_param() {
            Some(param) => Arc::new(BoundPrompt::new(callable, param, content)),
            None => callable,
        };
        Ok(ResolvedTool {
            node: updated,
            definition: Some(registered.tool),
            callable,
            init_args,
        })
    }

    async fn integrate_prompt_in_package_node(&self, mut resolved: ResolvedTool) -> Result<ResolvedTool, ResolutionError> {
        let (content, template_inputs) = self.load_template(&resolved.node)?;
        let tool_name = resolved
            .definition
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_default();
        if let Some(definition) = &resolved.definition {
            let duplicated = duplicated_inputs(&template_inputs, definition.inputs.keys().map(String::as_str));
            if !duplicated.is_empty() {
                return Err(ResolutionError::DuplicateCustomLlmInputs {
                    duplicated_inputs: duplicated,
                    node_name: resolved.node.name.clone(),
                });
            }
        }
        self.load_images_for_prompt_template(&template_inputs, &mut resolved.node.inputs)
            .await?;

        let tool_id = resolved
            .node
            .source
            .as_ref()
            .and_then(|s| s.tool.clone())
            .unwrap_or_default();
        let param = self
            .manager()
            .load_package_tool(&tool_id)?
            .factory
            .prompt_param()
            .map(str::to_string)
            .ok_or(ResolutionError::InvalidCustomLlmTool { tool_name })?;
        resolved.callable = Arc::new(BoundPrompt::new(resolved.callable, param, content));
        Ok(resolved)
    }
}

/// Template variables that collide with tool parameters, sorted.
fn duplicated_inputs<'a>(
    template_inputs: &IndexMap<String, ValueType>,
    params: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut duplicated: Vec<String> = params
        .into_iter()
        .filter(|p| template_inputs.contains_key(*p))
        .map(str::to_string)
        .collect();
    duplicated.sort();
    duplicated.dedup();
    duplicated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools_manager::{ToolFactory, ToolPackage};
    use pfcore::{FnTool, InputDefinition, ToolContext, ToolError};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct ChatFactory;

    impl ToolFactory for ChatFactory {
        fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            Ok(Arc::new(FnTool::new("chat", |args| {
                let prompt = ToolContext::require_str(&args, "prompt")?;
                let conn = Connection::from_value(ToolContext::require(&args, "connection")?)
                    .ok_or_else(|| ToolError::MissingInput("connection".to_string()))?;
                Ok(Value::String(format!("{}:{}", conn.name, prompt)))
            })))
        }

        fn prompt_param(&self) -> Option<&str> {
            Some("prompt")
        }
    }

    struct CounterFactory;

    impl ToolFactory for CounterFactory {
        fn create(&self, init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            let start = init_args.get("start").and_then(Value::as_i64).unwrap_or_default();
            Ok(Arc::new(FnTool::new("counter", move |args| {
                let step = args.get("step").and_then(Value::as_i64).unwrap_or(1);
                Ok(Value::Int(start + step))
            })))
        }

        fn init_inputs(&self) -> Vec<String> {
            vec!["start".to_string()]
        }
    }

    struct TestPackage;

    impl ToolPackage for TestPackage {
        fn name(&self) -> &str {
            "test-tools"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn list_tools(&self) -> Result<IndexMap<String, RegisteredTool>, String> {
            let mut tools = IndexMap::new();
            tools.insert(
                "test_tools.counter".to_string(),
                RegisteredTool::new(
                    Tool::new("Counter", ToolType::Python)
                        .with_input("start", InputDefinition::of(ValueType::Int))
                        .with_input("step", InputDefinition::of(ValueType::Int)),
                    Arc::new(CounterFactory),
                ),
            );
            tools.insert(
                "test_tools.see".to_string(),
                RegisteredTool::new(
                    Tool::new("See", ToolType::Python)
                        .with_input("img", InputDefinition::of(ValueType::Image))
                        .with_input("conn", InputDefinition::connection(&["AzureOpenAIConnection"])),
                    Arc::new(EchoFactory),
                ),
            );
            tools.insert(
                "test_tools.strong".to_string(),
                RegisteredTool::new(
                    Tool::new("Strong", ToolType::Python).with_input(
                        "conn",
                        InputDefinition {
                            custom_type: Some(vec!["MyStrongConnection".to_string()]),
                            ..InputDefinition::connection(&["CustomConnection"])
                        },
                    ),
                    Arc::new(EchoFactory),
                ),
            );
            Ok(tools)
        }
    }

    struct EchoFactory;

    impl ToolFactory for EchoFactory {
        fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            Ok(Arc::new(FnTool::new("echo", |args| Ok(Value::Object(args)))))
        }
    }

    fn resolver(dir: &Path) -> ToolResolver {
        let mut manager = ToolsManager::new();
        manager.register_connection_api("OpenAIConnection", "openai");
        manager.register_api(
            "openai",
            "chat",
            RegisteredTool::new(
                Tool::new("openai.chat", ToolType::Llm)
                    .with_input("connection", InputDefinition::connection(&["OpenAIConnection"]))
                    .with_input("temperature", InputDefinition::of(ValueType::Double)),
                Arc::new(ChatFactory),
            ),
        );
        manager.register_package(Arc::new(TestPackage));
        let mut connections = HashMap::new();
        connections.insert("open_ai".to_string(), Connection::new("open_ai", "OpenAIConnection"));
        connections.insert("custom".to_string(), Connection::new("custom", "CustomConnection"));
        ToolResolver::new(
            dir,
            Arc::new(connections),
            Arc::new(RwLock::new(manager)),
            None,
            MultimediaProcessor::default(),
        )
    }

    #[tokio::test]
    async fn test_package_node_converts_literals_and_consumes_init_args() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("count", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.counter"), None)
            .with_input("start", "40")
            .with_input("step", "2");

        let resolved = resolver.resolve_tool_by_node(&node, true).await.unwrap();
        assert_eq!(resolved.init_args["start"], Value::Int(40));
        assert!(!resolved.node.inputs.contains_key("start"));
        assert_eq!(resolved.node.inputs["step"], InputAssignment::Literal(Value::Int(2)));

        let mut args = IndexMap::new();
        args.insert("step".to_string(), Value::Int(2));
        let out = resolved.callable.call(&ToolContext::default(), args).await.unwrap();
        assert_eq!(out, Value::Int(42));
    }

    #[tokio::test]
    async fn test_init_input_must_be_literal() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("count", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.counter"), None)
            .with_input("start", "${inputs.start}");

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.source.error_code(), "InputTypeMismatch");
    }

    #[tokio::test]
    async fn test_invalid_literal_value() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("count", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.counter"), None)
            .with_input("start", "1")
            .with_input("step", "two");

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.node_name, "count");
        assert_eq!(
            err.source.to_string(),
            "Input 'step' for node 'count' of value 'two' is not type int."
        );
    }

    #[tokio::test]
    async fn test_image_literal_that_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("see", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.see"), None)
            .with_input("img", "missing/cat.png");

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.source.error_code(), "NodeInputValidationError");
        assert!(err
            .source
            .to_string()
            .starts_with("Failed to load image for input 'img': (InvalidImageInput)"));
    }

    #[tokio::test]
    async fn test_connection_literal_of_unaccepted_type() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("see", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.see"), None)
            .with_input("conn", "open_ai");

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.source.error_code(), "NodeInputValidationError");
        assert_eq!(
            err.source.to_string(),
            "Input 'conn' for node 'see' of type \"OpenAIConnection\" is not supported, valid types ['AzureOpenAIConnection']."
        );
    }

    #[tokio::test]
    async fn test_custom_connection_takes_declared_strong_type() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("strong", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.strong"), None)
            .with_input("conn", "custom");

        let resolved = resolver.resolve_tool_by_node(&node, true).await.unwrap();
        let InputAssignment::Literal(value) = &resolved.node.inputs["conn"] else {
            panic!("expected a literal connection");
        };
        let conn = Connection::from_value(value).unwrap();
        assert_eq!(conn.name, "custom");
        assert_eq!(conn.custom_type.as_deref(), Some("MyStrongConnection"));
        assert_eq!(conn.effective_type(), "MyStrongConnection");

        let node = Node::new("strong", ToolType::Python)
            .with_source(ToolSourceType::Package, Some("test_tools.strong"), None)
            .with_input("conn", "open_ai");
        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert!(matches!(err.source, ResolutionError::ConnectionTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_llm_node_binds_prompt_and_connection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("joke.jinja2"), "Tell a joke about {{topic}}").unwrap();
        let resolver = resolver(dir.path());
        let mut node = Node::new("joke", ToolType::Llm)
            .with_source(ToolSourceType::Code, None, Some("joke.jinja2"))
            .with_connection("open_ai")
            .with_input("topic", "${inputs.topic}")
            .with_input("temperature", "0.5");
        node.api = Some("chat".to_string());

        let resolved = resolver.resolve_tool_by_node(&node, true).await.unwrap();
        assert_eq!(resolved.node.provider.as_deref(), Some("openai"));
        assert_eq!(resolved.node.inputs["temperature"], InputAssignment::Literal(Value::Float(0.5)));

        let mut args = IndexMap::new();
        if let InputAssignment::Literal(conn) = &resolved.node.inputs["connection"] {
            args.insert("connection".to_string(), conn.clone());
        }
        let out = resolved.callable.call(&ToolContext::default(), args).await.unwrap();
        assert_eq!(out, Value::from("open_ai:Tell a joke about {{topic}}"));
    }

    #[tokio::test]
    async fn test_llm_node_rejects_unsupported_connection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("p.jinja2"), "hi").unwrap();
        let resolver = resolver(dir.path());
        let mut node = Node::new("llm", ToolType::Llm)
            .with_source(ToolSourceType::Code, None, Some("p.jinja2"))
            .with_connection("custom");
        node.api = Some("chat".to_string());

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.source.error_code(), "InvalidConnectionType");
    }

    #[tokio::test]
    async fn test_llm_template_collides_with_api_params() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("p.jinja2"), "{{temperature}}").unwrap();
        let resolver = resolver(dir.path());
        let mut node = Node::new("llm", ToolType::Llm)
            .with_source(ToolSourceType::Code, None, Some("p.jinja2"))
            .with_connection("open_ai");
        node.api = Some("chat".to_string());

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.source.error_code(), "NodeInputValidationError");
        assert!(err.to_string().contains("duplicated with the parameters of openai.chat"));
    }

    #[tokio::test]
    async fn test_prompt_node_reserved_param() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("p.jinja2"), "{{template}}").unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("prompt", ToolType::Prompt).with_source(ToolSourceType::Code, None, Some("p.jinja2"));

        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert!(matches!(err.source, ResolutionError::DuplicatePromptInputs { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_combination_and_missing_source() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let node = Node::new("custom", ToolType::CustomLlm).with_source(ToolSourceType::Code, None, Some("x.py"));
        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(
            err.source.to_string(),
            "Tool type 'custom_llm' with source type 'code' is not supported yet."
        );

        let node = Node::new("script", ToolType::Python).with_source(ToolSourceType::Code, None, Some("missing.py"));
        let err = resolver.resolve_tool_by_node(&node, true).await.unwrap_err();
        assert_eq!(err.source.error_code(), "InvalidSource");
    }
}
