use async_trait::async_trait;
use indexmap::IndexMap;
use pfcore::{Callable, InputDefinition, Tool, ToolContext, ToolError, ToolType, Value, ValueType};
use pfruntime::{RegisteredTool, ToolFactory};
use std::sync::Arc;

pub const FETCH_URL_TOOL_ID: &str = "promptflow.tools.http.fetch_url";

/// Fetch a url and return the response body as text
pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl FetchUrlTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for FetchUrlTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Callable for FetchUrlTool {
    async fn call(&self, ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
        let url = ToolContext::require_str(&args, "url")?;
        let parsed = url::Url::parse(url).map_err(|e| ToolError::InvalidInputType {
            field: "url".to_string(),
            expected: "absolute url".to_string(),
            actual: e.to_string(),
        })?;
        let method = args.get("method").and_then(Value::as_str).unwrap_or("GET");

        tracing::info!("{} {}", method, parsed);

        let request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(parsed),
            "POST" => {
                let mut req = self.client.post(parsed);
                match args.get("body") {
                    Some(Value::String(text)) => req = req.body(text.clone()),
                    Some(Value::Null) | None => {}
                    Some(body) => req = req.json(&body.to_json()),
                }
                req
            }
            _ => return Err(ToolError::Configuration(format!("Unsupported method: {}", method))),
        };

        // Add headers if provided
        let request = match args.get("headers").and_then(Value::as_object) {
            Some(headers) => headers.iter().fold(request, |req, (key, value)| match value.as_str() {
                Some(v) => req.header(key.as_str(), v),
                None => req,
            }),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        tracing::info!("Response status: {}", status.as_u16());
        ctx.log_metric("status", status.as_u16() as i64);
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "Get url failed with status code {}: {}",
                status.as_u16(),
                url
            )));
        }
        Ok(Value::String(body))
    }

    fn describe(&self) -> String {
        "fetch_url".to_string()
    }
}

pub struct FetchUrlFactory;

impl ToolFactory for FetchUrlFactory {
    fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
        Ok(Arc::new(FetchUrlTool::new()))
    }
}

pub fn fetch_url_tool() -> RegisteredTool {
    let mut tool = Tool::new("fetch_url", ToolType::Python)
        .with_input("url", InputDefinition::of(ValueType::String))
        .with_input("method", InputDefinition::of(ValueType::String).with_default("GET"))
        .with_input("headers", InputDefinition::of(ValueType::Object).with_default(Value::Null))
        .with_input("body", InputDefinition::of(ValueType::Object).with_default(Value::Null))
        .with_function("fetch_url");
    tool.description = Some("Fetch a url and return the response body".to_string());
    RegisteredTool::new(tool, Arc::new(FetchUrlFactory))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(url: String) -> IndexMap<String, Value> {
        IndexMap::from([("url".to_string(), Value::from(url))])
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("<p>hello</p>")
            .create_async()
            .await;

        let ctx = ToolContext::new("fetch_url", "run_0", Some(0));
        let out = FetchUrlTool::new()
            .call(&ctx, args(format!("{}/page", server.url())))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(out, Value::from("<p>hello</p>"));
        assert_eq!(ctx.metrics()["status"], Value::from(200i64));
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/missing").with_status(404).create_async().await;

        let err = FetchUrlTool::new()
            .call(&ToolContext::default(), args(format!("{}/missing", server.url())))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Get url failed with status code 404"));
    }

    #[tokio::test]
    async fn test_relative_url_is_rejected() {
        let err = FetchUrlTool::new()
            .call(&ToolContext::default(), args("not a url".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "InvalidInputType");
    }
}
