//! Batch line execution on worker processes.
//!
//! The pool listens on a loopback TCP port; every worker connects back,
//! introduces itself with `Hello`, receives the serialized flow and
//! connections in `Init`, then executes lines one at a time. Workers are
//! started either directly (`spawn`) or through a supervisor process
//! (`fork`).

mod manager;
mod pool;
mod protocol;
mod supervisor;
mod worker;

pub use manager::{
    worker_log_file, ControlSignal, ProcessInfo, ProcessManager, ProcessManagerConfig, SpawnProcessManager,
    SupervisedProcessManager, SupervisorEvent, WorkerRegistry,
};
pub(crate) use manager::terminate_child;
pub use pool::LineExecutionProcessPool;
pub use protocol::{WorkerChannel, WorkerRequest, WorkerResponse};
pub use supervisor::Supervisor;
pub use worker::run_worker;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DummyRunStorage;
    use crate::tools_manager::{RegisteredTool, ToolFactory, ToolsManager};
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use pfcore::{
        Callable, Flow, FlowInputDefinition, FnTool, Node, ProcessError, Status, Tool, ToolError, ToolSourceType,
        ToolType, Value, ValueType,
    };
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, RwLock};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Echo;

    impl ToolFactory for Echo {
        fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            Ok(Arc::new(FnTool::new("echo", |args| {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                if text == "bad" {
                    return Err(ToolError::ExecutionFailed("bad input".to_string()));
                }
                Ok(Value::from(format!("echo {}", text)))
            })))
        }
    }

    fn tools_manager() -> Arc<RwLock<ToolsManager>> {
        let mut manager = ToolsManager::new();
        manager.register_builtin("echo.py", RegisteredTool::new(Tool::new("echo", ToolType::Python), Arc::new(Echo)));
        Arc::new(RwLock::new(manager))
    }

    /// Runs each worker as a task of the test runtime
    struct InProcessManager {
        registry: Arc<WorkerRegistry>,
        config: ProcessManagerConfig,
        workers: Mutex<HashMap<usize, JoinHandle<()>>>,
    }

    #[async_trait]
    impl ProcessManager for InProcessManager {
        fn registry(&self) -> &Arc<WorkerRegistry> {
            &self.registry
        }

        fn config(&self) -> &ProcessManagerConfig {
            &self.config
        }

        async fn new_process(&self, index: usize) -> Result<(), ProcessError> {
            let address = self.registry.address().to_string();
            let task = tokio::spawn(async move {
                let _ = run_worker(index, &address, tools_manager()).await;
            });
            self.workers.lock().unwrap().insert(index, task);
            Ok(())
        }

        async fn end_process(&self, index: usize) -> Result<(), ProcessError> {
            if let Some(task) = self.workers.lock().unwrap().remove(&index) {
                task.abort();
            }
            Ok(())
        }

        fn ensure_healthy(&self) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ProcessError> {
            for (_, task) in self.workers.lock().unwrap().drain() {
                task.abort();
            }
            Ok(())
        }
    }

    fn flow() -> Flow {
        let mut flow = Flow::new("echo_flow");
        flow.add_input("text", FlowInputDefinition::new(ValueType::String));
        flow.add_node(
            Node::new("echo", ToolType::Python)
                .with_source(ToolSourceType::Code, None, Some("echo.py"))
                .with_input("text", "${inputs.text}"),
        );
        flow.add_output("answer", "${echo.output}");
        flow
    }

    #[tokio::test]
    async fn test_pool_runs_lines_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = Arc::new(InProcessManager {
            registry: WorkerRegistry::bind().await.unwrap(),
            config: ProcessManagerConfig {
                worker_bin: PathBuf::from("unused"),
                log_dir: dir.path().to_path_buf(),
                process_info_timeout: Duration::from_secs(10),
                terminate_timeout: Duration::from_secs(1),
            },
            workers: Mutex::new(HashMap::new()),
        });
        let init = WorkerRequest::Init {
            flow: Box::new(flow()),
            connections: HashMap::new(),
            working_dir: dir.path().to_path_buf(),
            line_timeout_secs: 10,
        };
        let pool = LineExecutionProcessPool::with_manager(
            manager,
            2,
            Duration::from_secs(10),
            init,
            Arc::new(DummyRunStorage),
        )
        .await
        .unwrap();

        let lines: Vec<IndexMap<String, Value>> = ["a", "bad", "c"]
            .iter()
            .enumerate()
            .map(|(i, text)| {
                IndexMap::from([
                    ("text".to_string(), Value::from(*text)),
                    ("line_number".to_string(), Value::from(i)),
                ])
            })
            .collect();
        let results = pool.run(lines, "batch").await.unwrap();
        pool.close().await.unwrap();

        let indexes: Vec<_> = results.iter().map(|r| r.run_info.index).collect();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(results[0].output["answer"], Value::from("echo a"));
        assert_eq!(results[1].run_info.status, Status::Failed);
        assert_eq!(results[1].run_info.run_id, "batch_1");
        assert_eq!(results[2].output["answer"], Value::from("echo c"));
        assert_eq!(results[2].node_run_infos["echo"].status, Status::Completed);
    }
}
