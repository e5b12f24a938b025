//! Standard tool library
//!
//! The `promptflow-tools` package: OpenAI and Azure OpenAI LLM apis,
//! jinja2 rendering, url fetching and JSON helpers.

mod http;
mod openai;
mod template;
mod transform;

pub use http::{fetch_url_tool, FetchUrlTool, FETCH_URL_TOOL_ID};
pub use openai::{
    llm_tool, parse_chat, LlmApi, OpenAiTool, AZURE_OPENAI_CONNECTION, AZURE_OPENAI_PROVIDER, OPENAI_CONNECTION,
    OPENAI_PROVIDER,
};
pub use template::{render_template_tool, RENDER_TEMPLATE_TOOL_ID};
pub use transform::{json_parse_tool, json_stringify_tool, JSON_PARSE_TOOL_ID, JSON_STRINGIFY_TOOL_ID};

use indexmap::IndexMap;
use pfruntime::{RegisteredTool, ToolPackage, ToolsManager};
use std::sync::Arc;

pub const PACKAGE_NAME: &str = "promptflow-tools";

/// The tools shipped with this crate, keyed by tool id
pub struct PromptflowTools;

impl ToolPackage for PromptflowTools {
    fn name(&self) -> &str {
        PACKAGE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn list_tools(&self) -> Result<IndexMap<String, RegisteredTool>, String> {
        let mut tools = IndexMap::new();
        for (module, connection_type) in [("openai", OPENAI_CONNECTION), ("azure_open_ai", AZURE_OPENAI_CONNECTION)] {
            for api in [LlmApi::Chat, LlmApi::Completion] {
                tools.insert(
                    format!("promptflow.tools.{}.{}", module, api.as_str()),
                    llm_tool(api, connection_type),
                );
            }
        }
        tools.insert(RENDER_TEMPLATE_TOOL_ID.to_string(), render_template_tool());
        tools.insert(FETCH_URL_TOOL_ID.to_string(), fetch_url_tool());
        tools.insert(JSON_PARSE_TOOL_ID.to_string(), json_parse_tool());
        tools.insert(JSON_STRINGIFY_TOOL_ID.to_string(), json_stringify_tool());
        Ok(tools)
    }
}

/// Register all standard tools, LLM apis and connection types with a manager
pub fn register_all(manager: &mut ToolsManager) {
    manager.register_connection_api(OPENAI_CONNECTION, OPENAI_PROVIDER);
    manager.register_connection_api(AZURE_OPENAI_CONNECTION, AZURE_OPENAI_PROVIDER);
    for api in [LlmApi::Chat, LlmApi::Completion] {
        manager.register_api(OPENAI_PROVIDER, api.as_str(), llm_tool(api, OPENAI_CONNECTION));
        manager.register_api(AZURE_OPENAI_PROVIDER, api.as_str(), llm_tool(api, AZURE_OPENAI_CONNECTION));
    }
    manager.register_package(Arc::new(PromptflowTools));
    manager.load_package_tools(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let mut manager = ToolsManager::new();
        register_all(&mut manager);

        assert_eq!(manager.provider_for_connection(AZURE_OPENAI_CONNECTION).unwrap(), "azure_open_ai");
        assert!(manager.load_api("openai", "completion").is_ok());
        let fetch = manager.load_package_tool(FETCH_URL_TOOL_ID).unwrap();
        assert_eq!(fetch.tool.package.as_deref(), Some(PACKAGE_NAME));
        assert!(manager.list_tools().contains_key("promptflow.tools.azure_open_ai.chat"));
    }
}
