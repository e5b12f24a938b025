//! Chat and completion apis of OpenAI and Azure OpenAI
//!
//! The node's prompt template is rendered with every argument that is not
//! an api parameter. Chat prompts are split into messages on role lines
//! such as `system:` or `# user:`. With `stream` set, the server-sent
//! events are returned as a [`Value::Stream`] of text deltas.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::future::ready;
use futures::stream::StreamExt;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use pfcore::{
    Callable, Connection, GeneratorOutput, InputDefinition, Tool, ToolContext, ToolError, ToolType, Value, ValueType,
};
use pfruntime::template::render_template_jinja2;
use pfruntime::{RegisteredTool, ToolFactory};
use regex::Regex;
use serde_json::{json, Map};
use std::sync::Arc;

pub const OPENAI_CONNECTION: &str = "OpenAIConnection";
pub const AZURE_OPENAI_CONNECTION: &str = "AzureOpenAIConnection";
pub const OPENAI_PROVIDER: &str = "openai";
pub const AZURE_OPENAI_PROVIDER: &str = "azure_open_ai";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";
const PROMPT_PARAM: &str = "prompt";
const VALID_ROLES: [&str; 4] = ["system", "user", "assistant", "function"];

static ROLE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*#?\s*(system|user|assistant|function)\s*:\s*\n").expect("valid regex"));

/// Which endpoint a tool calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmApi {
    Chat,
    Completion,
}

impl LlmApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmApi::Chat => "chat",
            LlmApi::Completion => "completion",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            LlmApi::Chat => "chat/completions",
            LlmApi::Completion => "completions",
        }
    }

    /// Numeric and flag parameters forwarded to the api as-is
    fn params(&self) -> &'static [&'static str] {
        match self {
            LlmApi::Chat => &[
                "temperature",
                "top_p",
                "n",
                "stop",
                "max_tokens",
                "presence_penalty",
                "frequency_penalty",
                "logit_bias",
                "user",
            ],
            LlmApi::Completion => &[
                "suffix",
                "max_tokens",
                "temperature",
                "top_p",
                "n",
                "logprobs",
                "echo",
                "stop",
                "presence_penalty",
                "frequency_penalty",
                "best_of",
                "logit_bias",
                "user",
            ],
        }
    }
}

/// Split a rendered chat prompt into api messages.
pub fn parse_chat(chat_str: &str) -> Result<Vec<serde_json::Value>, ToolError> {
    let mut messages = Vec::new();
    let mut role: Option<String> = None;
    let mut last_end = 0;
    for captures in ROLE_SEPARATOR.captures_iter(chat_str) {
        let Some(separator) = captures.get(0) else {
            continue;
        };
        push_chunk(&mut messages, role.take(), &chat_str[last_end..separator.start()])?;
        role = Some(captures[1].to_lowercase());
        last_end = separator.end();
    }
    push_chunk(&mut messages, role, &chat_str[last_end..])?;
    Ok(messages)
}

fn push_chunk(messages: &mut Vec<serde_json::Value>, role: Option<String>, chunk: &str) -> Result<(), ToolError> {
    match role {
        Some(role) => {
            messages.push(json!({"role": role, "content": chunk.trim()}));
            Ok(())
        }
        None if chunk.trim().is_empty() => Ok(()),
        None => {
            let valid_roles = VALID_ROLES
                .iter()
                .map(|r| format!("'{}:\\n'", r))
                .collect::<Vec<_>>()
                .join(",");
            Err(ToolError::ExecutionFailed(format!(
                "The Chat API requires a specific format for prompt definition, and the prompt should include \
                 separate lines as role delimiters: {}. Current parsed role '{}' does not meet the requirement. \
                 If you intend to use the Completion API, please select the appropriate API type and deployment name.",
                valid_roles,
                chunk.trim().to_lowercase()
            )))
        }
    }
}

pub fn to_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(Value::Int(i)) => *i != 0,
        _ => false,
    }
}

/// Calls one api of OpenAI or Azure OpenAI, chosen by the connection type
pub struct OpenAiTool {
    client: reqwest::Client,
    api: LlmApi,
}

impl OpenAiTool {
    pub fn new(api: LlmApi) -> Self {
        Self {
            client: reqwest::Client::new(),
            api,
        }
    }

    fn request(
        &self,
        connection: &Connection,
        args: &IndexMap<String, Value>,
    ) -> Result<(reqwest::RequestBuilder, Map<String, serde_json::Value>), ToolError> {
        let api_key = connection.get("api_key").unwrap_or_default();
        let mut body = Map::new();
        let request = match connection.connection_type.as_str() {
            AZURE_OPENAI_CONNECTION => {
                let api_base = connection
                    .get("api_base")
                    .ok_or_else(|| ToolError::Configuration("AzureOpenAIConnection requires api_base".to_string()))?;
                let deployment = ToolContext::require_str(args, "deployment_name")?;
                let api_version = connection.get("api_version").unwrap_or(DEFAULT_AZURE_API_VERSION);
                let url = format!(
                    "{}/openai/deployments/{}/{}?api-version={}",
                    api_base.trim_end_matches('/'),
                    deployment,
                    self.api.path(),
                    api_version
                );
                self.client.post(url).header("api-key", api_key)
            }
            _ => {
                let base_url = connection.get("base_url").unwrap_or(DEFAULT_OPENAI_BASE_URL);
                let url = format!("{}/{}", base_url.trim_end_matches('/'), self.api.path());
                let default_model = match self.api {
                    LlmApi::Chat => "gpt-3.5-turbo",
                    LlmApi::Completion => "gpt-3.5-turbo-instruct",
                };
                let model = args.get("model").and_then(Value::as_str).unwrap_or(default_model);
                body.insert("model".to_string(), json!(model));
                let mut request = self.client.post(url).bearer_auth(api_key);
                if let Some(organization) = connection.get("organization").filter(|o| !o.is_empty()) {
                    request = request.header("OpenAI-Organization", organization);
                }
                request
            }
        };
        Ok((request, body))
    }
}

#[async_trait]
impl Callable for OpenAiTool {
    async fn call(&self, ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
        let connection =
            Connection::from_value(ToolContext::require(&args, "connection")?).ok_or_else(|| {
                ToolError::InvalidInputType {
                    field: "connection".to_string(),
                    expected: "connection".to_string(),
                    actual: "other".to_string(),
                }
            })?;
        let template = ToolContext::require_str(&args, PROMPT_PARAM)?;
        let params = self.api.params();
        let reserved = ["connection", PROMPT_PARAM, "model", "deployment_name", "stream"];
        let kwargs: IndexMap<String, Value> = args
            .iter()
            .filter(|(k, _)| !reserved.contains(&k.as_str()) && !params.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rendered = render_template_jinja2(template, &kwargs)?;
        let stream = to_bool(args.get("stream"));

        let (request, mut body) = self.request(&connection, &args)?;
        match self.api {
            LlmApi::Chat => {
                body.insert("messages".to_string(), serde_json::Value::Array(parse_chat(&rendered)?));
            }
            LlmApi::Completion => {
                body.insert("prompt".to_string(), json!(rendered));
            }
        }
        for name in params {
            match args.get(*name) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) if s.is_empty() || s.eq_ignore_ascii_case("inf") => {}
                Some(Value::Array(items)) if items.is_empty() => {}
                Some(value) => {
                    body.insert(name.to_string(), value.to_json());
                }
            }
        }
        body.insert("stream".to_string(), json!(stream));
        let body = serde_json::Value::Object(body);

        tracing::info!("Calling {} {} for node {}", connection.connection_type, self.api.as_str(), ctx.node_name);
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("OpenAI API request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(ToolError::Llm {
                status: status.as_u16(),
                message,
            });
        }

        let name = format!("openai.{}", self.api.as_str());
        if stream {
            ctx.record_api_call(Value::from(json!({"name": name, "type": "LLM", "inputs": body})));
            let api = self.api;
            let chunks = response
                .bytes_stream()
                .eventsource()
                .take_while(|event| ready(!matches!(event, Ok(e) if e.data.trim() == "[DONE]")))
                .filter_map(move |event| {
                    let chunk = match event {
                        Ok(event) => serde_json::from_str::<serde_json::Value>(&event.data)
                            .ok()
                            .and_then(|c| delta_text(api, &c)),
                        Err(e) => {
                            tracing::warn!("Dropping unreadable stream event: {}", e);
                            None
                        }
                    };
                    ready(chunk)
                });
            return Ok(Value::Stream(GeneratorOutput::new(chunks)));
        }

        let completion: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Invalid OpenAI API response: {}", e)))?;
        ctx.record_api_call(Value::from(
            json!({"name": name, "type": "LLM", "inputs": body, "output": completion.clone()}),
        ));
        let choice = &completion["choices"][0];
        let text = match self.api {
            LlmApi::Chat => choice["message"]["content"].as_str(),
            LlmApi::Completion => choice["text"].as_str(),
        };
        Ok(Value::from(text.unwrap_or_default()))
    }

    fn describe(&self) -> String {
        format!("openai.{}", self.api.as_str())
    }
}

fn delta_text(api: LlmApi, chunk: &serde_json::Value) -> Option<Value> {
    let choice = chunk["choices"].as_array()?.first()?;
    let text = match api {
        LlmApi::Chat => choice["delta"]["content"].as_str(),
        LlmApi::Completion => choice["text"].as_str(),
    };
    Some(Value::from(text.unwrap_or_default()))
}

pub struct OpenAiToolFactory {
    api: LlmApi,
}

impl OpenAiToolFactory {
    pub fn new(api: LlmApi) -> Self {
        Self { api }
    }
}

impl ToolFactory for OpenAiToolFactory {
    fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
        Ok(Arc::new(OpenAiTool::new(self.api)))
    }

    fn prompt_param(&self) -> Option<&str> {
        Some(PROMPT_PARAM)
    }
}

/// Tool definition of `api` for connections of `connection_type`.
pub fn llm_tool(api: LlmApi, connection_type: &str) -> RegisteredTool {
    let mut tool = Tool::new(api.as_str(), ToolType::Llm)
        .with_input("connection", InputDefinition::connection(&[connection_type]));
    tool = if connection_type == AZURE_OPENAI_CONNECTION {
        tool.with_input("deployment_name", InputDefinition::of(ValueType::String))
    } else {
        tool.with_input("model", InputDefinition::of(ValueType::String))
    };
    tool = tool
        .with_input("temperature", InputDefinition::of(ValueType::Double).with_default(1.0))
        .with_input("top_p", InputDefinition::of(ValueType::Double).with_default(1.0))
        .with_input("n", InputDefinition::of(ValueType::Int).with_default(1i64))
        .with_input("stream", InputDefinition::of(ValueType::Bool).with_default(false))
        .with_input("stop", InputDefinition::of(ValueType::List))
        .with_input("max_tokens", InputDefinition::of(ValueType::Int))
        .with_input("presence_penalty", InputDefinition::of(ValueType::Double).with_default(0.0))
        .with_input("frequency_penalty", InputDefinition::of(ValueType::Double).with_default(0.0))
        .with_input("logit_bias", InputDefinition::of(ValueType::Object))
        .with_input("user", InputDefinition::of(ValueType::String));
    if api == LlmApi::Completion {
        tool = tool
            .with_input("suffix", InputDefinition::of(ValueType::String))
            .with_input("logprobs", InputDefinition::of(ValueType::Int))
            .with_input("echo", InputDefinition::of(ValueType::Bool).with_default(false))
            .with_input("best_of", InputDefinition::of(ValueType::Int).with_default(1i64));
    }
    tool.connection_type = Some(vec![connection_type.to_string()]);
    RegisteredTool::new(tool.with_function(api.as_str()), Arc::new(OpenAiToolFactory::new(api)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn args(connection: Connection, prompt: &str) -> IndexMap<String, Value> {
        IndexMap::from([
            ("connection".to_string(), connection.to_value()),
            ("prompt".to_string(), Value::from(prompt)),
        ])
    }

    #[test]
    fn test_parse_chat_roles() {
        let messages = parse_chat("# system:\nYou are helpful.\n\nuser:\nHi there\n").unwrap();
        assert_eq!(
            messages,
            vec![
                json!({"role": "system", "content": "You are helpful."}),
                json!({"role": "user", "content": "Hi there"}),
            ]
        );
    }

    #[test]
    fn test_parse_chat_requires_role() {
        let err = parse_chat("Tell me a joke").unwrap_err();
        assert!(err.to_string().contains("Current parsed role 'tell me a joke'"));
    }

    #[tokio::test]
    async fn test_openai_chat() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-3.5-turbo",
                "messages": [
                    {"role": "system", "content": "Summarize."},
                    {"role": "user", "content": "Rust is fast"}
                ],
                "temperature": 0.2,
                "stream": false
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "choices": [{"message": {"role": "assistant", "content": "Fast."}}],
                    "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let connection = Connection::new("open_ai", OPENAI_CONNECTION)
            .with_config("base_url", server.url())
            .with_secret("api_key", "sk-test");
        let mut args = args(connection, "system:\nSummarize.\nuser:\n{{text}}");
        args.insert("text".to_string(), Value::from("Rust is fast"));
        args.insert("temperature".to_string(), Value::Float(0.2));

        let ctx = ToolContext::new("summarize", "run_0", Some(0));
        let out = OpenAiTool::new(LlmApi::Chat).call(&ctx, args).await.unwrap();
        mock.assert_async().await;
        assert_eq!(out, Value::from("Fast."));
        let calls = ctx.api_calls();
        assert_eq!(calls[0].get("output").and_then(|o| o.get("usage")).and_then(|u| u.get("total_tokens")), Some(&Value::Int(9)));
    }

    #[tokio::test]
    async fn test_azure_completion_uses_api_key_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Regex(r"^/openai/deployments/text/completions".to_string()))
            .match_query(Matcher::UrlEncoded("api-version".to_string(), DEFAULT_AZURE_API_VERSION.to_string()))
            .match_header("api-key", "azure-key")
            .match_body(Matcher::PartialJson(json!({"prompt": "Say hi to Ann"})))
            .with_status(200)
            .with_body(json!({"choices": [{"text": "Hi Ann"}]}).to_string())
            .create_async()
            .await;

        let connection = Connection::new("azure", AZURE_OPENAI_CONNECTION)
            .with_config("api_base", server.url())
            .with_secret("api_key", "azure-key");
        let mut args = args(connection, "Say hi to {{name}}");
        args.insert("name".to_string(), Value::from("Ann"));
        args.insert("deployment_name".to_string(), Value::from("text"));

        let out = OpenAiTool::new(LlmApi::Completion)
            .call(&ToolContext::default(), args)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(out, Value::from("Hi Ann"));
    }

    #[tokio::test]
    async fn test_api_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(json!({"error": {"message": "Rate limit reached"}}).to_string())
            .create_async()
            .await;

        let connection = Connection::new("open_ai", OPENAI_CONNECTION).with_config("base_url", server.url());
        let err = OpenAiTool::new(LlmApi::Chat)
            .call(&ToolContext::default(), args(connection, "user:\nhi"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "OpenAI API hits 429: Rate limit reached");
    }

    #[tokio::test]
    async fn test_streamed_chat() {
        let chunk = |text: &str| json!({"choices": [{"delta": {"content": text}}]}).to_string();
        let body = format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n\n", chunk("Hel"), chunk("lo"));
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let connection = Connection::new("open_ai", OPENAI_CONNECTION).with_config("base_url", server.url());
        let mut args = args(connection, "user:\nhi");
        args.insert("stream".to_string(), Value::Bool(true));
        let out = OpenAiTool::new(LlmApi::Chat)
            .call(&ToolContext::default(), args)
            .await
            .unwrap();
        let Value::Stream(stream) = out else {
            panic!("expected a stream");
        };
        assert_eq!(stream.join().await, "Hello");
    }
}
