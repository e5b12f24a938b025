use indexmap::IndexMap;
use pfcore::{Callable, ResolutionError, Tool, ToolError, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Factory trait for creating callable instances
pub trait ToolFactory: Send + Sync {
    /// Create a callable bound to the given literal initialization inputs
    fn create(&self, init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError>;

    /// Optional: names of inputs consumed at construction rather than per call
    fn init_inputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Optional: the subset of `init_inputs` that must be provided
    fn required_init_inputs(&self) -> Vec<String> {
        self.init_inputs()
    }

    /// Optional: name of the parameter that receives the prompt template text
    fn prompt_param(&self) -> Option<&str> {
        None
    }
}

/// A tool definition paired with the factory that builds its callable
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Tool,
    pub factory: Arc<dyn ToolFactory>,
}

impl RegisteredTool {
    pub fn new(tool: Tool, factory: Arc<dyn ToolFactory>) -> Self {
        Self { tool, factory }
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool").field("tool", &self.tool.name).finish()
    }
}

/// A distributable group of tools, discovered once per process
pub trait ToolPackage: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Tools keyed by their identifier, e.g. `promptflow.tools.openai.chat`
    fn list_tools(&self) -> Result<IndexMap<String, RegisteredTool>, String>;
}

/// Registry of builtins, LLM apis, connection types and tool packages
#[derive(Default)]
pub struct ToolsManager {
    builtins: HashMap<String, RegisteredTool>,
    apis: HashMap<String, RegisteredTool>,
    connections: HashSet<String>,
    connection_type_to_api_mapping: HashMap<String, String>,
    packages: Vec<Arc<dyn ToolPackage>>,
    package_tools: IndexMap<String, RegisteredTool>,
    deprecated_tools: HashMap<String, String>,
}

impl ToolsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin tool under a key (a tool name or a script path)
    pub fn register_builtin(&mut self, key: impl Into<String>, tool: RegisteredTool) {
        let key = key.into();
        tracing::info!("Registering builtin tool: {}", key);
        self.builtins.insert(key, tool);
    }

    /// Register an LLM api as `<provider>.<api>`
    pub fn register_api(&mut self, provider: &str, api: &str, tool: RegisteredTool) {
        let key = format!("{}.{}", provider, api);
        tracing::info!("Registering api: {}", key);
        self.apis.insert(key, tool);
    }

    pub fn register_connections(&mut self, connection_types: &[&str]) {
        self.connections
            .extend(connection_types.iter().map(|c| c.to_string()));
    }

    /// Route LLM nodes using `connection_type` to the apis of `provider`
    pub fn register_connection_api(&mut self, connection_type: &str, provider: &str) {
        tracing::debug!("Add connection type {} to api {} mapping", connection_type, provider);
        self.connections.insert(connection_type.to_string());
        self.connection_type_to_api_mapping
            .insert(connection_type.to_string(), provider.to_string());
    }

    pub fn register_package(&mut self, package: Arc<dyn ToolPackage>) {
        tracing::info!("Registering tool package: {} {}", package.name(), package.version());
        self.packages.push(package);
    }

    /// Drop every registration
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn get_builtin(&self, key: &str) -> Option<&RegisteredTool> {
        self.builtins.get(key)
    }

    pub fn is_connection_type(&self, name: &str) -> bool {
        self.connections.contains(name)
    }

    pub fn connection_type_to_api_mapping(&self) -> &HashMap<String, String> {
        &self.connection_type_to_api_mapping
    }

    /// Provider name serving LLM nodes that use `connection_type`
    pub fn provider_for_connection(&self, connection_type: &str) -> Result<String, ResolutionError> {
        if self.connection_type_to_api_mapping.is_empty() {
            return Err(ResolutionError::EmptyLlmApiMapping);
        }
        self.connection_type_to_api_mapping
            .get(connection_type)
            .cloned()
            .ok_or_else(|| ResolutionError::InvalidConnectionType {
                conn_type: connection_type.to_string(),
            })
    }

    pub fn load_api(&self, provider: &str, api: &str) -> Result<RegisteredTool, ResolutionError> {
        self.apis
            .get(&format!("{}.{}", provider, api))
            .cloned()
            .ok_or_else(|| ResolutionError::ApiNotFound {
                provider: provider.to_string(),
                api: api.to_string(),
            })
    }

    /// Walk every registered package and gather its tools.
    ///
    /// With `keys`, only tools whose id is in `keys` or whose deprecated ids
    /// intersect `keys` are kept. A package that fails to list its tools is
    /// logged and skipped.
    pub fn collect_package_tools(&self, keys: Option<&[String]>) -> IndexMap<String, RegisteredTool> {
        let keys: Option<HashSet<&str>> = keys.map(|k| k.iter().map(String::as_str).collect());
        let mut all_tools = IndexMap::new();
        for package in &self.packages {
            let tools = match package.list_tools() {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!("Failed to load tools from package {}: {}", package.name(), e);
                    continue;
                }
            };
            for (id, mut registered) in tools {
                if let Some(keys) = &keys {
                    if !keys.contains(id.as_str()) {
                        let deprecated = registered.tool.deprecated_tools.as_deref().unwrap_or_default();
                        if !deprecated.iter().any(|d| keys.contains(d.as_str())) {
                            continue;
                        }
                    }
                }
                registered.tool.package = Some(package.name().to_string());
                registered.tool.package_version = Some(package.version().to_string());
                all_tools.insert(id, registered);
            }
        }
        all_tools
    }

    /// Cache package tools for later lookups by id.
    pub fn load_package_tools(&mut self, keys: Option<&[String]>) {
        self.package_tools = self.collect_package_tools(keys);
        self.deprecated_tools = self
            .package_tools
            .iter()
            .flat_map(|(id, t)| {
                t.tool
                    .deprecated_tools
                    .iter()
                    .flatten()
                    .map(move |old| (old.clone(), id.clone()))
            })
            .collect();
    }

    /// Find a package tool by id, falling back to deprecated ids.
    pub fn load_package_tool(&self, tool_id: &str) -> Result<RegisteredTool, ResolutionError> {
        if let Some(tool) = self.package_tools.get(tool_id) {
            return Ok(tool.clone());
        }
        if let Some(new_id) = self.deprecated_tools.get(tool_id) {
            tracing::warn!("Tool ID '{}' is deprecated. Please use '{}' instead.", tool_id, new_id);
            if let Some(tool) = self.package_tools.get(new_id) {
                return Ok(tool.clone());
            }
        }
        Err(ResolutionError::PackageToolNotFound {
            tool_id: tool_id.to_string(),
            available: self.package_tools.keys().cloned().collect(),
        })
    }

    /// All tool definitions known to this manager, keyed by id
    pub fn list_tools(&self) -> IndexMap<String, Tool> {
        let mut tools: IndexMap<String, Tool> = IndexMap::new();
        for (id, t) in self.collect_package_tools(None) {
            tools.insert(id, t.tool);
        }
        let mut builtin_keys: Vec<_> = self.builtins.keys().collect();
        builtin_keys.sort();
        for key in builtin_keys {
            tools.insert(key.clone(), self.builtins[key].tool.clone());
        }
        let mut api_keys: Vec<_> = self.apis.keys().collect();
        api_keys.sort();
        for key in api_keys {
            tools.insert(key.clone(), self.apis[key].tool.clone());
        }
        tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfcore::{FnTool, ToolType};

    struct EchoFactory;

    impl ToolFactory for EchoFactory {
        fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            Ok(Arc::new(FnTool::new("echo", |args| {
                Ok(args.get("text").cloned().unwrap_or_default())
            })))
        }
    }

    struct Package {
        fail: bool,
    }

    impl ToolPackage for Package {
        fn name(&self) -> &str {
            if self.fail {
                "broken-tools"
            } else {
                "my-tools"
            }
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn list_tools(&self) -> Result<IndexMap<String, RegisteredTool>, String> {
            if self.fail {
                return Err("boom".to_string());
            }
            let mut tools = IndexMap::new();
            tools.insert(
                "my_tools.echo".to_string(),
                RegisteredTool::new(
                    Tool::new("Echo", ToolType::Python).with_deprecated_tools(&["old_tools.echo"]),
                    Arc::new(EchoFactory),
                ),
            );
            tools.insert(
                "my_tools.other".to_string(),
                RegisteredTool::new(Tool::new("Other", ToolType::Python), Arc::new(EchoFactory)),
            );
            Ok(tools)
        }
    }

    fn manager() -> ToolsManager {
        let mut manager = ToolsManager::new();
        manager.register_package(Arc::new(Package { fail: true }));
        manager.register_package(Arc::new(Package { fail: false }));
        manager
    }

    #[test]
    fn test_collect_skips_failing_package_and_filters_keys() {
        let manager = manager();
        let all = manager.collect_package_tools(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all["my_tools.echo"].tool.package.as_deref(), Some("my-tools"));
        assert_eq!(all["my_tools.echo"].tool.package_version.as_deref(), Some("0.1.0"));

        let keys = vec!["old_tools.echo".to_string()];
        let filtered = manager.collect_package_tools(Some(&keys));
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["my_tools.echo"]);
    }

    #[test]
    fn test_load_package_tool_by_deprecated_id() {
        let mut manager = manager();
        manager.load_package_tools(None);
        assert_eq!(manager.load_package_tool("old_tools.echo").unwrap().tool.name, "Echo");

        let err = manager.load_package_tool("nope").unwrap_err();
        assert_eq!(err.error_code(), "PackageToolNotFoundError");
        assert!(err.to_string().contains("'my_tools.echo', 'my_tools.other'"));
    }

    #[test]
    fn test_provider_mapping_and_reset() {
        let mut manager = ToolsManager::new();
        assert!(matches!(
            manager.provider_for_connection("OpenAIConnection"),
            Err(ResolutionError::EmptyLlmApiMapping)
        ));
        manager.register_connection_api("OpenAIConnection", "OpenAI");
        assert_eq!(manager.provider_for_connection("OpenAIConnection").unwrap(), "OpenAI");
        assert!(matches!(
            manager.provider_for_connection("CustomConnection"),
            Err(ResolutionError::InvalidConnectionType { .. })
        ));

        manager.reset();
        assert!(manager.connection_type_to_api_mapping().is_empty());
    }
}
