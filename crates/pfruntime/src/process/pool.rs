use super::manager::{ProcessManager, ProcessManagerConfig, SpawnProcessManager, SupervisedProcessManager, WorkerRegistry};
use super::protocol::{WorkerChannel, WorkerRequest, WorkerResponse};
use crate::config::{BatchMethod, RuntimeConfig};
use crate::input_mapping::LINE_NUMBER_KEY;
use crate::storage::RunStorage;
use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use pfcore::{
    Connection, ExecutionError, Flow, FlowError, FlowRunInfo, LineResult, ProcessError, Value,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extra time granted over the line timeout before a worker counts as stuck
const LINE_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

struct PendingLine {
    line_number: usize,
    inputs: IndexMap<String, Value>,
}

/// Tell an idle worker to exit. Returns whether the request was delivered;
/// a worker that is already gone is reaped by its manager.
async fn release_worker(mut channel: WorkerChannel, index: usize) -> bool {
    match channel.send(&WorkerRequest::Shutdown).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Process {} did not take the shutdown request: {}", index, e);
            false
        }
    }
}

/// State shared by the slot monitors of one `run`
struct SlotContext {
    manager: Arc<dyn ProcessManager>,
    init: Arc<WorkerRequest>,
    queue: Mutex<VecDeque<PendingLine>>,
    run_id: String,
    line_timeout: Duration,
    storage: Arc<dyn RunStorage>,
    total: usize,
    finished: AtomicUsize,
}

impl SlotContext {
    fn next_line(&self) -> Option<PendingLine> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Claim the worker of `index` and initialize its executor.
    async fn connect(&self, index: usize) -> Result<WorkerChannel, ProcessError> {
        let info = self.manager.get_process_info(index).await?;
        let mut channel = self
            .manager
            .registry()
            .take_channel(index)
            .ok_or(ProcessError::WorkerUnavailable { index })?;
        channel.send(self.init.as_ref()).await?;
        match channel.recv::<WorkerResponse>().await? {
            Some(WorkerResponse::Ready) => {
                tracing::info!("Process {} (pid {}) is ready.", index, info.process_id);
                Ok(channel)
            }
            Some(WorkerResponse::InitFailed { error }) => Err(ProcessError::Protocol(format!(
                "process {} failed to create the flow executor: {}",
                index,
                error.get("message").and_then(|m| m.as_str()).unwrap_or_default()
            ))),
            other => Err(ProcessError::Protocol(format!(
                "process {} sent {:?} instead of ready",
                index, other
            ))),
        }
    }

    /// Run lines on slot `index` until the queue is empty, restarting the
    /// worker after a crash or timeout.
    async fn monitor(self: Arc<Self>, index: usize) -> Result<Vec<LineResult>, ProcessError> {
        let mut results = Vec::new();
        'process: loop {
            let mut channel = self.connect(index).await?;
            while let Some(line) = self.next_line() {
                let start_time = Utc::now();
                let line_number = line.line_number;
                let failure = match self.exec_line(&mut channel, line.inputs.clone(), line_number).await {
                    Ok(result) => {
                        self.persist(&result);
                        results.push(result);
                        self.report_progress();
                        continue;
                    }
                    Err(failure) => failure,
                };

                tracing::warn!("Process {} failed on line {}: {}", index, line_number, failure);
                let result = failed_line(start_time, line.inputs, line_number, &self.run_id, &failure.into());
                self.persist(&result);
                results.push(result);
                self.report_progress();

                drop(channel);
                self.manager.restart_process(index).await?;
                continue 'process;
            }
            release_worker(channel, index).await;
            return Ok(results);
        }
    }

    async fn exec_line(
        &self,
        channel: &mut WorkerChannel,
        inputs: IndexMap<String, Value>,
        line_number: usize,
    ) -> Result<LineResult, ExecutionError> {
        let crashed = || ExecutionError::ProcessCrash { line_number };
        let request = WorkerRequest::ExecLine {
            run_id: self.run_id.clone(),
            line_number,
            inputs,
        };
        channel.send(&request).await.map_err(|_| crashed())?;
        let response = tokio::time::timeout(self.line_timeout + LINE_TIMEOUT_GRACE, channel.recv::<WorkerResponse>()).await;
        match response {
            Ok(Ok(Some(WorkerResponse::LineResult { result }))) => Ok(*result),
            Ok(_) => Err(crashed()),
            Err(_) => Err(ExecutionError::LineExecutionTimeout {
                line_number,
                timeout: self.line_timeout.as_secs(),
            }),
        }
    }

    fn persist(&self, result: &LineResult) {
        for node_run in result.node_run_infos.values() {
            if let Err(e) = self.storage.persist_node_run(node_run) {
                tracing::warn!("Failed to persist node run {}: {}", node_run.run_id, e);
            }
        }
        if let Err(e) = self.storage.persist_flow_run(&result.run_info) {
            tracing::warn!("Failed to persist line run {}: {}", result.run_info.run_id, e);
        }
    }

    fn report_progress(&self) {
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("Finished {} / {} lines.", finished, self.total);
    }
}

fn failed_line(
    start_time: chrono::DateTime<Utc>,
    inputs: IndexMap<String, Value>,
    line_number: usize,
    run_id: &str,
    error: &FlowError,
) -> LineResult {
    LineResult {
        output: IndexMap::new(),
        aggregation_inputs: IndexMap::new(),
        run_info: FlowRunInfo::create_with_error(start_time, inputs, Some(line_number), run_id, error.to_error_dict()),
        node_run_infos: IndexMap::new(),
    }
}

/// Executes batch lines on a fixed number of worker processes.
///
/// Each slot owns one worker at a time. A line that crashes its worker or
/// exceeds the line timeout is recorded as failed and the slot's worker is
/// restarted before the next line.
pub struct LineExecutionProcessPool {
    manager: Arc<dyn ProcessManager>,
    worker_count: usize,
    line_timeout: Duration,
    init: Arc<WorkerRequest>,
    storage: Arc<dyn RunStorage>,
}

impl LineExecutionProcessPool {
    /// Start `config.worker_count` workers for `flow`.
    pub async fn start(
        config: &RuntimeConfig,
        flow: &Flow,
        connections: HashMap<String, Connection>,
        working_dir: &Path,
        log_dir: &Path,
        storage: Arc<dyn RunStorage>,
    ) -> Result<Self, FlowError> {
        let registry = WorkerRegistry::bind().await?;
        let manager_config = ProcessManagerConfig::from_runtime(config, log_dir)?;
        let manager: Arc<dyn ProcessManager> = match config.batch_method {
            BatchMethod::Spawn => Arc::new(SpawnProcessManager::new(manager_config, registry)),
            BatchMethod::Fork => Arc::new(SupervisedProcessManager::start(manager_config, registry).await?),
        };
        let init = WorkerRequest::Init {
            flow: Box::new(flow.clone()),
            connections,
            working_dir: working_dir.to_path_buf(),
            line_timeout_secs: config.line_timeout.as_secs(),
        };
        Self::with_manager(manager, config.worker_count, config.line_timeout, init, storage).await
    }

    pub async fn with_manager(
        manager: Arc<dyn ProcessManager>,
        worker_count: usize,
        line_timeout: Duration,
        init: WorkerRequest,
        storage: Arc<dyn RunStorage>,
    ) -> Result<Self, FlowError> {
        let worker_count = worker_count.max(1);
        tracing::info!("Starting {} worker processes.", worker_count);
        for index in 0..worker_count {
            manager.new_process(index).await?;
        }
        Ok(Self {
            manager,
            worker_count,
            line_timeout,
            init: Arc::new(init),
            storage,
        })
    }

    pub fn manager(&self) -> &Arc<dyn ProcessManager> {
        &self.manager
    }

    /// Execute every line and return the results ordered by line number.
    ///
    /// Each input dict may carry its `line_number`; otherwise its position
    /// is used.
    pub async fn run(&self, lines: Vec<IndexMap<String, Value>>, run_id: &str) -> Result<Vec<LineResult>, FlowError> {
        let queue: VecDeque<PendingLine> = lines
            .into_iter()
            .enumerate()
            .map(|(position, mut inputs)| {
                let line_number = inputs
                    .shift_remove(LINE_NUMBER_KEY)
                    .and_then(|v| v.as_i64())
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(position);
                PendingLine { line_number, inputs }
            })
            .collect();
        let total = queue.len();
        let context = Arc::new(SlotContext {
            manager: self.manager.clone(),
            init: self.init.clone(),
            queue: Mutex::new(queue),
            run_id: run_id.to_string(),
            line_timeout: self.line_timeout,
            storage: self.storage.clone(),
            total,
            finished: AtomicUsize::new(0),
        });

        let slots = self.worker_count.min(total.max(1));
        let monitors = (0..slots).map(|index| tokio::spawn(context.clone().monitor(index)));
        let mut results = Vec::with_capacity(total);
        for joined in join_all(monitors).await {
            let slot_results = joined.map_err(|_| ExecutionError::Canceled)??;
            results.extend(slot_results);
        }
        results.sort_by_key(|r| r.run_info.index);
        Ok(results)
    }

    /// End every worker.
    pub async fn close(&self) -> Result<(), FlowError> {
        self.manager.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_release_worker_sends_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let worker = tokio::spawn(async move {
            let mut channel = WorkerChannel::connect(&address).await.unwrap();
            channel.recv::<WorkerRequest>().await.unwrap()
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(release_worker(WorkerChannel::new(stream), 0).await);
        assert!(matches!(worker.await.unwrap(), Some(WorkerRequest::Shutdown)));
    }
}
