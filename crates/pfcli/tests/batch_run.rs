use indexmap::IndexMap;
use pfcore::{Connection, MultimediaProcessor, Status, Value};
use pfruntime::{BatchEngine, ExecutorOptions, LocalStorageOperations, RuntimeConfig, ToolsManager};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tempfile::TempDir;

const FLOW: &str = r#"
inputs:
  url:
    type: string
outputs:
  summary:
    type: string
    reference: ${summarize.output}
nodes:
- name: fetch_url
  type: python
  source:
    type: package
    tool: promptflow.tools.http.fetch_url
  inputs:
    url: ${inputs.url}
- name: summarize
  type: llm
  source:
    type: code
    path: summarize.jinja2
  connection: open_ai
  api: chat
  inputs:
    model: gpt-3.5-turbo
    text: ${fetch_url.output}
"#;

const PROMPT: &str = "system:\nSummarize the page in one word.\nuser:\n{{text}}\n";

#[tokio::test]
async fn test_fetch_and_summarize_on_worker_processes() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/alpha").with_body("alpha page").create_async().await;
    server.mock("GET", "/missing").with_status(404).create_async().await;
    server.mock("GET", "/gamma").with_body("gamma page").create_async().await;
    let llm = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "choices": [{"message": {"role": "assistant", "content": "Page."}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
            })
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("flow.dag.yaml"), FLOW).unwrap();
    std::fs::write(dir.path().join("summarize.jinja2"), PROMPT).unwrap();
    let data = dir.path().join("data.jsonl");
    let rows: Vec<String> = ["alpha", "missing", "gamma"]
        .iter()
        .map(|page| json!({"link": format!("{}/{}", server.url(), page)}).to_string())
        .collect();
    std::fs::write(&data, rows.join("\n")).unwrap();

    let connections = HashMap::from([(
        "open_ai".to_string(),
        Connection::new("open_ai", "OpenAIConnection")
            .with_config("base_url", server.url())
            .with_secret("api_key", "sk-test"),
    )]);
    let mut manager = ToolsManager::new();
    pftools::register_all(&mut manager);
    let config = RuntimeConfig::default()
        .with_worker_count(2)
        .with_worker_bin(env!("CARGO_BIN_EXE_pf"));
    let engine = BatchEngine::new(dir.path().join("flow.dag.yaml"), None, connections, config)
        .with_executor_options(ExecutorOptions::default().with_tools_manager(Arc::new(RwLock::new(manager))));

    let input_dirs = IndexMap::from([("data".to_string(), data)]);
    let mapping = IndexMap::from([("url".to_string(), Value::from("${data.link}"))]);
    let output_dir = dir.path().join("run");
    let result = engine
        .run(&input_dirs, &mapping, &output_dir, Some("fetch_and_summarize"))
        .await
        .unwrap();

    llm.assert_async().await;
    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.total_lines, 3);
    assert_eq!(result.completed_lines, 2);
    assert_eq!(result.failed_lines, 1);
    assert_eq!(result.system_metrics.total_tokens, 24);

    let failure = &result.error_summary.error_list[0];
    assert_eq!(failure.line_number, 1);
    let message = failure.error["message"].as_str().unwrap();
    assert!(message.starts_with("Execution failure in 'fetch_url'"), "{}", message);
    assert!(message.contains("404"));

    let storage =
        LocalStorageOperations::new(&output_dir, "fetch_and_summarize", MultimediaProcessor::default()).unwrap();
    assert_eq!(
        storage.load_outputs().unwrap(),
        vec![
            json!({"summary": "Page.", "line_number": 0}),
            json!({"summary": "Page.", "line_number": 2}),
        ]
    );
}
