//! Executor service for one flow
//!
//! Serves `GET /health`, `POST /execution` and `POST /aggregation` over a
//! single [`FlowExecutor`]. A line request that accepts
//! `text/event-stream` gets one `data:` event per chunk of the flow's chat
//! output, each carrying the whole line result.

use actix_web::http::header;
use actix_web::{error, get, post, web, HttpRequest, HttpResponse, Responder};
use futures::stream::{self, Stream, StreamExt};
use pfcore::{ErrorCategory, FlowError, GeneratorOutput, LineResult, Value};
use pfruntime::executor::LineOptions;
use pfruntime::proxy::{AggregationRequest, ExecutionRequest};
use pfruntime::FlowExecutor;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Application state shared across handlers
pub struct AppState {
    executor: Arc<FlowExecutor>,
}

impl AppState {
    pub fn new(executor: FlowExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }
}

/// Register the service routes and a JSON extractor that reports bad
/// bodies in the service's error format.
pub fn configure(cfg: &mut web::ServiceConfig) {
    let json_config = web::JsonConfig::default().error_handler(|err, _req| {
        let message = err.to_string();
        let response = HttpResponse::BadRequest().json(json!({
            "error": {"code": "UserError", "message": message, "innerError": {"code": "InvalidRequestBody"}}
        }));
        error::InternalError::from_response(err, response).into()
    });
    cfg.app_data(json_config)
        .service(health_check)
        .service(execution)
        .service(aggregation);
}

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[post("/execution")]
async fn execution(req: HttpRequest, data: web::Data<AppState>, body: web::Json<ExecutionRequest>) -> HttpResponse {
    let request = body.into_inner();
    let stream = accepts_event_stream(&req);
    let options = LineOptions {
        allow_generator_output: stream,
        ..Default::default()
    };
    info!("Executing line {:?} of run {:?}", request.line_number, request.run_id);
    let result = data
        .executor
        .exec_line_with_options(request.inputs, request.line_number, request.run_id.as_deref(), options)
        .await;
    match result {
        Ok(result) if stream => {
            let chat_output = data.executor.flow().chat_output_name().map(str::to_string);
            HttpResponse::Ok()
                .content_type("text/event-stream")
                .streaming(line_events(result, chat_output))
        }
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(&e),
    }
}

#[post("/aggregation")]
async fn aggregation(data: web::Data<AppState>, body: web::Json<AggregationRequest>) -> HttpResponse {
    let request = body.into_inner();
    info!("Executing aggregation of run {:?}", request.run_id);
    match data
        .executor
        .exec_aggregation(request.batch_inputs, request.aggregation_inputs, request.run_id.as_deref())
        .await
    {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(&e),
    }
}

fn accepts_event_stream(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// `{"error": <error dict>}` with 400 for user errors and 500 otherwise
pub fn error_response(e: &FlowError) -> HttpResponse {
    error!("Request failed: {}", e);
    let body = json!({"error": e.to_error_dict()});
    match e.category() {
        ErrorCategory::UserError => HttpResponse::BadRequest().json(body),
        ErrorCategory::SystemError => HttpResponse::InternalServerError().json(body),
    }
}

fn sse_event(result: &LineResult) -> Result<web::Bytes, serde_json::Error> {
    let data = serde_json::to_string(result)?;
    Ok(web::Bytes::from(format!("data: {}\n\n", data)))
}

/// One event per chunk of the streamed chat output, or a single event when
/// nothing streams.
fn line_events(
    result: LineResult,
    chat_output: Option<String>,
) -> impl Stream<Item = Result<web::Bytes, serde_json::Error>> + 'static {
    let streamed = chat_output.and_then(|name| match result.output.get(&name) {
        Some(Value::Stream(generator)) => Some((name, generator.clone())),
        _ => None,
    });
    let Some((name, generator)) = streamed else {
        return stream::once(futures::future::ready(sse_event(&result))).left_stream();
    };
    stream::unfold(Some((result, generator, name, true)), chunk_event).right_stream()
}

type ChunkState = Option<(LineResult, GeneratorOutput, String, bool)>;

async fn chunk_event(state: ChunkState) -> Option<(Result<web::Bytes, serde_json::Error>, ChunkState)> {
    let (mut result, generator, name, first) = state?;
    match generator.next().await {
        Some(chunk) => {
            result.output.insert(name.clone(), chunk);
            let event = sse_event(&result);
            Some((event, Some((result, generator, name, false))))
        }
        None if first => {
            result.output.insert(name, Value::from(""));
            Some((sse_event(&result), None))
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use indexmap::IndexMap;
    use pfcore::{Callable, Connection, FnTool, Tool, ToolError, ToolType};
    use pfruntime::{ExecutorOptions, RegisteredTool, ToolFactory, ToolsManager};
    use std::collections::HashMap;
    use std::sync::RwLock;
    use tempfile::TempDir;

    const FLOW: &str = r#"
inputs:
  question:
    type: string
outputs:
  answer:
    type: string
    reference: ${shout.output}
nodes:
- name: shout
  type: python
  source:
    type: code
    path: shout.py
  inputs:
    text: ${inputs.question}
"#;

    struct Shout;

    impl ToolFactory for Shout {
        fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            Ok(Arc::new(FnTool::new("shout", |args| {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                if text.is_empty() {
                    return Err(ToolError::ExecutionFailed("nothing to shout".to_string()));
                }
                Ok(Value::from(text.to_uppercase()))
            })))
        }
    }

    async fn state() -> (TempDir, web::Data<AppState>) {
        let dir = TempDir::new().unwrap();
        let flow_file = dir.path().join("flow.dag.yaml");
        std::fs::write(&flow_file, FLOW).unwrap();
        let mut manager = ToolsManager::new();
        manager.register_builtin("shout.py", RegisteredTool::new(Tool::new("shout", ToolType::Python), Arc::new(Shout)));
        let options = ExecutorOptions::default()
            .with_raise_ex(false)
            .with_tools_manager(Arc::new(RwLock::new(manager)));
        let executor = FlowExecutor::create(&flow_file, Arc::new(HashMap::<String, Connection>::new()), None, options)
            .await
            .unwrap();
        (dir, web::Data::new(AppState::new(executor)))
    }

    #[actix_web::test]
    async fn test_health() {
        let (_dir, data) = state().await;
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_execution_returns_line_result() {
        let (_dir, data) = state().await;
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/execution")
            .set_json(json!({"run_id": "run", "line_number": 0, "inputs": {"question": "hi"}}))
            .to_request();
        let result: LineResult = test::call_and_read_body_json(&app, req).await;
        assert_eq!(result.output["answer"], Value::from("HI"));
        assert_eq!(result.run_info.index, Some(0));
    }

    #[actix_web::test]
    async fn test_event_stream_without_streamed_output() {
        let (_dir, data) = state().await;
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/execution")
            .insert_header((header::ACCEPT, "text/event-stream"))
            .set_json(json!({"inputs": {"question": "hi"}}))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("data: "));
        assert_eq!(text.matches("data: ").count(), 1);
        let result: LineResult = serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(result.output["answer"], Value::from("HI"));
    }

    #[actix_web::test]
    async fn test_invalid_body_is_wrapped() {
        let (_dir, data) = state().await;
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/execution")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "UserError");
    }

    #[actix_web::test]
    async fn test_aggregation_without_aggregation_nodes() {
        let (_dir, data) = state().await;
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let req = test::TestRequest::post()
            .uri("/aggregation")
            .set_json(json!({"batch_inputs": {"question": ["a"]}, "aggregation_inputs": {}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["output"], json!({}));
    }

    #[actix_web::test]
    async fn test_line_events_stream_chunks() {
        let (_dir, data) = state().await;
        let result = data
            .executor
            .exec_line_async(IndexMap::from([("question".to_string(), Value::from("a"))]), None, None)
            .await
            .unwrap();
        let mut streamed = result;
        streamed.output.insert(
            "answer".to_string(),
            Value::Stream(GeneratorOutput::from_items(vec!["Hel".into(), "lo".into()])),
        );

        let events: Vec<_> = line_events(streamed, Some("answer".to_string())).collect().await;
        let chunks: Vec<Value> = events
            .into_iter()
            .map(|e| {
                let bytes = e.unwrap();
                let text = std::str::from_utf8(&bytes).unwrap().trim().trim_start_matches("data: ").to_string();
                serde_json::from_str::<LineResult>(&text).unwrap().output["answer"].clone()
            })
            .collect();
        assert_eq!(chunks, vec![Value::from("Hel"), Value::from("lo")]);
    }
}
