//! Execution through a remote executor service
//!
//! [`ApiBasedExecutorProxy`] talks to a service exposing `GET /health`,
//! `POST /execution` and `POST /aggregation` (see the `pfserver` binary).
//! A streaming line is read as server-sent events, one serialized
//! [`LineResult`] per event, and the chat output is handed back as a
//! [`Value::Stream`] that pulls the remaining events lazily.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use pfcore::{
    AggregationResult, ErrorResponse, Flow, FlowError, FlowRunInfo, GeneratorOutput, LineResult, ProxyError, Value,
};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::config::RuntimeConfig;
use crate::process::terminate_child;

pub const EXECUTION_PATH: &str = "/execution";
pub const AGGREGATION_PATH: &str = "/aggregation";
pub const HEALTH_PATH: &str = "/health";

const EXECUTOR_UNHEALTHY_MESSAGE: &str = "The executor service is currently not in a healthy state";

/// Body of `POST /execution`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub line_number: Option<usize>,
    pub inputs: IndexMap<String, Value>,
}

/// Body of `POST /aggregation`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub batch_inputs: IndexMap<String, Value>,
    pub aggregation_inputs: IndexMap<String, Value>,
}

/// Something that executes lines and aggregations outside this process.
#[async_trait]
pub trait ExecutorProxy: Send + Sync {
    async fn exec_line_async(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: Option<&str>,
    ) -> Result<LineResult, FlowError>;

    async fn exec_aggregation_async(
        &self,
        batch_inputs: IndexMap<String, Value>,
        aggregation_inputs: IndexMap<String, Value>,
        run_id: Option<&str>,
    ) -> Result<AggregationResult, FlowError>;

    async fn destroy(&self) -> Result<(), FlowError>;
}

/// Keeps the active generator count raised while a streamed output is alive
struct ActiveGenerator(Arc<AtomicUsize>);

impl ActiveGenerator {
    fn activate(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ActiveGenerator {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proxy for an executor service reachable over HTTP.
pub struct ApiBasedExecutorProxy {
    api_endpoint: String,
    client: reqwest::Client,
    line_timeout: Duration,
    chat_output_name: Option<String>,
    enable_stream_output: bool,
    active_generators: Arc<AtomicUsize>,
    health_check_attempts: u32,
    health_check_interval: Duration,
    service: Mutex<Option<Child>>,
    terminate_timeout: Duration,
}

impl ApiBasedExecutorProxy {
    pub fn new(api_endpoint: impl Into<String>) -> Self {
        let config = RuntimeConfig::default();
        Self {
            api_endpoint: api_endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            line_timeout: config.line_timeout,
            chat_output_name: None,
            enable_stream_output: false,
            active_generators: Arc::new(AtomicUsize::new(0)),
            health_check_attempts: config.health_check_attempts,
            health_check_interval: config.health_check_interval,
            service: Mutex::new(None),
            terminate_timeout: config.terminate_timeout,
        }
    }

    /// Start `<server_bin> --flow <flow_file> --working-dir <dir> --error-file <file>`
    /// on a free local port and wait until it reports healthy.
    pub async fn launch(
        server_bin: &Path,
        flow: &Flow,
        flow_file: &Path,
        working_dir: &Path,
        error_file: &Path,
        config: &RuntimeConfig,
    ) -> Result<Self, FlowError> {
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let address = format!("127.0.0.1:{}", port);
        tracing::info!("Starting executor service {} on {}", server_bin.display(), address);
        let child = Command::new(server_bin)
            .arg("--flow")
            .arg(flow_file)
            .arg("--working-dir")
            .arg(working_dir)
            .arg("--error-file")
            .arg(error_file)
            .env("BIND_ADDRESS", &address)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProxyError::ExecutorStartup(format!("Failed to start the executor service: {}", e)))?;

        let proxy = Self::new(format!("http://{}", address))
            .with_flow(flow)
            .with_line_timeout(config.line_timeout)
            .with_health_check(config.health_check_attempts, config.health_check_interval);
        *proxy.service.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        proxy.ensure_executor_startup(error_file).await?;
        Ok(proxy)
    }

    /// Stream the flow's chat output when the flow declares one.
    pub fn with_flow(mut self, flow: &Flow) -> Self {
        self.chat_output_name = flow.chat_output_name().map(str::to_string);
        self
    }

    pub fn with_stream_output(mut self, enable: bool) -> Self {
        self.enable_stream_output = enable;
        self
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    pub fn with_health_check(mut self, attempts: u32, interval: Duration) -> Self {
        self.health_check_attempts = attempts;
        self.health_check_interval = interval;
        self
    }

    pub fn api_endpoint(&self) -> &str {
        &self.api_endpoint
    }

    pub fn active_generator_count(&self) -> usize {
        self.active_generators.load(Ordering::SeqCst)
    }

    fn all_generators_exhausted(&self) -> bool {
        self.active_generator_count() == 0
    }

    /// Execute one line. With stream output enabled the chat output of the
    /// result is a stream fed by the remaining server-sent events.
    pub async fn exec_line(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: Option<&str>,
    ) -> Result<LineResult, FlowError> {
        if !self.enable_stream_output {
            return self.exec_line_async(inputs, index, run_id).await;
        }

        let start_time = Utc::now();
        let request = ExecutionRequest {
            run_id: run_id.map(str::to_string),
            line_number: index,
            inputs: inputs.clone(),
        };
        let response = self
            .client
            .post(format!("{}{}", self.api_endpoint, EXECUTION_PATH))
            .header(ACCEPT, "text/event-stream")
            .timeout(self.line_timeout)
            .json(&request)
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let error = process_error_response(response).await;
                return Ok(failed_line(start_time, inputs, index, run_id, error));
            }
            Err(e) => {
                let error = self.request_error(&e, index).to_error_dict();
                return Ok(failed_line(start_time, inputs, index, run_id, error));
            }
        };

        let mut events = response.bytes_stream().eventsource();
        let mut line_result = match events.next().await {
            Some(Ok(event)) => serde_json::from_str::<LineResult>(&event.data)?,
            Some(Err(e)) => {
                return Err(ProxyError::unexpected(format!("Failed to read the line result stream: {}", e)).into())
            }
            None => {
                return Err(ProxyError::unexpected("The executor service returned an empty line result stream.").into())
            }
        };

        let Some(chat_output) = self
            .chat_output_name
            .clone()
            .filter(|name| line_result.output.contains_key(name))
        else {
            return Ok(line_result);
        };
        let first_chunk = line_result.output[&chat_output].clone();
        let guard = ActiveGenerator::activate(self.active_generators.clone());
        let name = chat_output.clone();
        let rest = events.filter_map(move |event| {
            let chunk = match event {
                Ok(event) => serde_json::from_str::<LineResult>(&event.data)
                    .ok()
                    .and_then(|mut result| result.output.shift_remove(&name)),
                Err(e) => {
                    tracing::warn!("Dropping unreadable stream event: {}", e);
                    None
                }
            };
            futures::future::ready(chunk)
        });
        let chunks = stream::once(futures::future::ready(first_chunk)).chain(rest).map(move |chunk| {
            let _active = &guard;
            chunk
        });
        let generator = GeneratorOutput::new(chunks);

        line_result
            .output
            .insert(chat_output.clone(), Value::Stream(generator.clone()));
        line_result
            .run_info
            .output
            .get_or_insert_with(IndexMap::new)
            .insert(chat_output, Value::Stream(generator));
        Ok(line_result)
    }

    /// Poll `/health` until it answers 200 or the attempts run out.
    pub async fn ensure_executor_health(&self) -> Result<(), ProxyError> {
        for _ in 0..self.health_check_attempts {
            if !self.is_executor_active() {
                tracing::error!("The executor service is not active. Please check the logs for more details.");
                break;
            }
            if self.check_health().await {
                return Ok(());
            }
            tokio::time::sleep(self.health_check_interval).await;
        }
        Err(ProxyError::ExecutorServiceUnhealthy)
    }

    /// Health gate used right after start; a startup error recorded by the
    /// service in `error_file` takes precedence over the health failure.
    pub async fn ensure_executor_startup(&self, error_file: &Path) -> Result<(), FlowError> {
        let Err(unhealthy) = self.ensure_executor_health().await else {
            return Ok(());
        };
        let error = check_startup_error_from_file(error_file).unwrap_or(unhealthy);
        tracing::error!("Failed to start up the executor due to an error: {}", error);
        if let Err(e) = self.destroy().await {
            tracing::warn!("Failed to destroy the executor service: {}", e);
        }
        Err(error.into())
    }

    fn is_executor_active(&self) -> bool {
        let mut service = self.service.lock().unwrap_or_else(|e| e.into_inner());
        match service.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn check_health(&self) -> bool {
        match self
            .client
            .get(format!("{}{}", self.api_endpoint, HEALTH_PATH))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                tracing::warn!("{}. Response: {} - {}", EXECUTOR_UNHEALTHY_MESSAGE, status, text);
                false
            }
            Err(e) => {
                tracing::warn!("{}. Error: {}", EXECUTOR_UNHEALTHY_MESSAGE, e);
                false
            }
        }
    }

    fn request_error(&self, e: &reqwest::Error, index: Option<usize>) -> FlowError {
        if e.is_timeout() {
            return ProxyError::LineExecutionTimeout {
                line_number: index.unwrap_or_default(),
                timeout: self.line_timeout.as_secs(),
            }
            .into();
        }
        ProxyError::unexpected(format!(
            "Unexpected error occurred while executing one line in the batch run. Error: {}.",
            e
        ))
        .into()
    }
}

#[async_trait]
impl ExecutorProxy for ApiBasedExecutorProxy {
    async fn exec_line_async(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: Option<&str>,
    ) -> Result<LineResult, FlowError> {
        if self.enable_stream_output {
            return Err(ProxyError::NotSupported {
                message: "Stream output is not supported in async mode for now".to_string(),
            }
            .into());
        }

        let start_time = Utc::now();
        let request = ExecutionRequest {
            run_id: run_id.map(str::to_string),
            line_number: index,
            inputs: inputs.clone(),
        };
        let response = self
            .client
            .post(format!("{}{}", self.api_endpoint, EXECUTION_PATH))
            .timeout(self.line_timeout)
            .json(&request)
            .send()
            .await;
        let error = match response {
            Ok(response) if response.status().is_success() => match response.json::<LineResult>().await {
                Ok(result) => return Ok(result),
                Err(e) => self.request_error(&e, index).to_error_dict(),
            },
            Ok(response) => process_error_response(response).await,
            Err(e) => self.request_error(&e, index).to_error_dict(),
        };
        Ok(failed_line(start_time, inputs, index, run_id, error))
    }

    async fn exec_aggregation_async(
        &self,
        batch_inputs: IndexMap<String, Value>,
        aggregation_inputs: IndexMap<String, Value>,
        run_id: Option<&str>,
    ) -> Result<AggregationResult, FlowError> {
        let request = AggregationRequest {
            run_id: run_id.map(str::to_string),
            batch_inputs,
            aggregation_inputs,
        };
        let response = self
            .client
            .post(format!("{}{}", self.api_endpoint, AGGREGATION_PATH))
            .timeout(self.line_timeout)
            .json(&request)
            .send()
            .await;
        let message = match response {
            Ok(response) if response.status().is_success() => match response.json::<AggregationResult>().await {
                Ok(result) => return Ok(result),
                Err(e) => e.to_string(),
            },
            Ok(response) => {
                let error = process_error_response(response).await;
                error["message"].as_str().unwrap_or_default().to_string()
            }
            Err(e) if e.is_timeout() => {
                return Err(ProxyError::AggregationNodeExecutionTimeout {
                    timeout: self.line_timeout.as_secs(),
                }
                .into())
            }
            Err(e) => e.to_string(),
        };
        Err(ProxyError::unexpected(format!(
            "Unexpected error occurred while executing aggregation nodes in the batch run. Error: {}",
            message
        ))
        .into())
    }

    /// Stop the owned executor service, if any. Refused while a streamed
    /// output is still being consumed.
    async fn destroy(&self) -> Result<(), FlowError> {
        if !self.all_generators_exhausted() {
            return Err(ProxyError::unexpected(format!(
                "Cannot destroy the executor service while {} streamed outputs are still active.",
                self.active_generator_count()
            ))
            .into());
        }
        let child = self.service.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            tracing::info!("Stopping executor service at {}", self.api_endpoint);
            terminate_child(&mut child, self.terminate_timeout).await?;
        }
        Ok(())
    }
}

fn failed_line(
    start_time: DateTime<Utc>,
    inputs: IndexMap<String, Value>,
    index: Option<usize>,
    run_id: Option<&str>,
    error: serde_json::Value,
) -> LineResult {
    let run_id = run_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    LineResult {
        output: IndexMap::new(),
        aggregation_inputs: IndexMap::new(),
        run_info: FlowRunInfo::create_with_error(start_time, inputs, index, &run_id, error),
        node_run_infos: IndexMap::new(),
    }
}

/// Error dict of a non-200 response: the service's own `error` entry when
/// the body carries one, an unexpected error naming the status otherwise.
async fn process_error_response(response: reqwest::Response) -> serde_json::Value {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = format!(
        "Unexpected error when executing a line, status code: {}, error: {}",
        status, text
    );
    tracing::error!("{}", message);
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(mut body) if body.get("error").is_some_and(|e| e.is_object()) => body["error"].take(),
        _ => FlowError::from(ProxyError::unexpected(message)).to_error_dict(),
    }
}

fn check_startup_error_from_file(error_file: &Path) -> Option<ProxyError> {
    let content = std::fs::read_to_string(error_file).ok()?;
    let dict: serde_json::Value = serde_json::from_str(&content).ok()?;
    if !dict.as_object().is_some_and(|d| !d.is_empty()) {
        return None;
    }
    let response = ErrorResponse::from_dict(&dict);
    tracing::error!(
        "Error when starting the executor service: [{}] {}",
        response.debug_type,
        response.message
    );
    Some(ProxyError::ExecutorStartup(response.message))
}

/// Default location of the startup error file inside a run's log folder.
pub fn startup_error_file(log_dir: &Path) -> PathBuf {
    log_dir.join("executor_startup_error.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfcore::{FlowOutputDefinition, Status};
    use serde_json::json;

    fn line_result_json(answer: &str, index: usize) -> serde_json::Value {
        let mut run_info = FlowRunInfo::start(format!("run_{}", index), "run", "flow", Some(index));
        run_info.status = Status::Completed;
        json!({
            "output": {"answer": answer},
            "aggregation_inputs": {},
            "run_info": serde_json::to_value(&run_info).unwrap(),
            "node_run_infos": {},
        })
    }

    fn inputs() -> IndexMap<String, Value> {
        IndexMap::from([("question".to_string(), Value::from("hi"))])
    }

    #[tokio::test]
    async fn test_exec_line_async_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/execution")
            .match_body(mockito::Matcher::PartialJson(json!({"run_id": "run", "line_number": 0})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(line_result_json("hello", 0).to_string())
            .create_async()
            .await;

        let proxy = ApiBasedExecutorProxy::new(server.url());
        let result = proxy.exec_line_async(inputs(), Some(0), Some("run")).await.unwrap();
        mock.assert_async().await;
        assert_eq!(result.output["answer"], Value::from("hello"));
        assert_eq!(result.run_info.status, Status::Completed);
    }

    #[tokio::test]
    async fn test_structured_error_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/execution")
            .with_status(500)
            .with_body(json!({"error": {"code": "UserError", "message": "bad line"}}).to_string())
            .create_async()
            .await;

        let proxy = ApiBasedExecutorProxy::new(server.url());
        let result = proxy.exec_line_async(inputs(), Some(2), Some("run")).await.unwrap();
        assert_eq!(result.run_info.status, Status::Failed);
        assert_eq!(result.run_info.run_id, "run_2");
        assert_eq!(result.run_info.error.unwrap()["message"], "bad line");
    }

    #[tokio::test]
    async fn test_unstructured_error_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/execution")
            .with_status(502)
            .with_body("gateway down")
            .create_async()
            .await;

        let proxy = ApiBasedExecutorProxy::new(server.url());
        let result = proxy.exec_line_async(inputs(), Some(0), Some("run")).await.unwrap();
        let error = result.run_info.error.unwrap();
        assert_eq!(error["code"], "SystemError");
        assert_eq!(
            error["message"],
            "Unexpected error when executing a line, status code: 502, error: gateway down"
        );
    }

    #[tokio::test]
    async fn test_async_refuses_streaming() {
        let proxy = ApiBasedExecutorProxy::new("http://127.0.0.1:9").with_stream_output(true);
        let err = proxy.exec_line_async(inputs(), Some(0), None).await.unwrap_err();
        assert_eq!(err.error_code(), "NotSupported");
    }

    #[tokio::test]
    async fn test_aggregation_error_is_unexpected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/aggregation")
            .with_status(500)
            .with_body(json!({"error": {"code": "SystemError", "message": "boom"}}).to_string())
            .create_async()
            .await;

        let proxy = ApiBasedExecutorProxy::new(server.url());
        let err = proxy
            .exec_aggregation_async(IndexMap::new(), IndexMap::new(), Some("run"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexpected error occurred while executing aggregation nodes in the batch run. Error: boom"
        );
    }

    #[tokio::test]
    async fn test_unhealthy_prefers_startup_error_file() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(503).create_async().await;
        let dir = tempfile::TempDir::new().unwrap();
        let proxy = ApiBasedExecutorProxy::new(server.url()).with_health_check(2, Duration::from_millis(10));

        let err = proxy.ensure_executor_health().await.unwrap_err();
        assert_eq!(err, ProxyError::ExecutorServiceUnhealthy);

        let error_file = startup_error_file(dir.path());
        std::fs::write(
            &error_file,
            json!({"code": "UserError", "message": "flow.dag.yaml is invalid"}).to_string(),
        )
        .unwrap();
        let err = proxy.ensure_executor_startup(&error_file).await.unwrap_err();
        assert_eq!(err.to_string(), "flow.dag.yaml is invalid");
    }

    #[tokio::test]
    async fn test_streamed_chat_output_blocks_destroy() {
        let events: String = ["Hel", "lo"]
            .iter()
            .enumerate()
            .map(|(i, chunk)| format!("data: {}\n\n", line_result_json(chunk, i)))
            .collect();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/execution")
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(events)
            .create_async()
            .await;

        let mut flow = Flow::new("chat");
        let mut output = FlowOutputDefinition::new("${chat.output}");
        output.is_chat_output = true;
        flow.outputs.insert("answer".to_string(), output);
        let proxy = ApiBasedExecutorProxy::new(server.url())
            .with_flow(&flow)
            .with_stream_output(true);

        let result = proxy.exec_line(inputs(), Some(0), Some("run")).await.unwrap();
        assert_eq!(proxy.active_generator_count(), 1);
        assert!(proxy.destroy().await.is_err());

        let Value::Stream(answer) = &result.output["answer"] else {
            panic!("chat output should stream");
        };
        assert_eq!(answer.join().await, "Hello");
        assert_eq!(proxy.active_generator_count(), 0);
        assert!(proxy.destroy().await.is_ok());
    }
}
