use crate::config::RuntimeConfig;
use crate::executor::{ExecutorOptions, FlowExecutor};
use crate::input_mapping::{BatchInputsProcessor, LINE_NUMBER_KEY};
use crate::process::LineExecutionProcessPool;
use crate::proxy::ExecutorProxy;
use crate::storage::{LocalStorageOperations, RunStorage};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use pfcore::{
    AggregationResult, BatchResult, Connection, ConnectionStore, FlowError, LineResult, MultimediaProcessor, Status,
    Value,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Runs a flow over every line of its input data and records the run.
///
/// Lines execute on worker processes, or on a remote executor service when
/// a proxy is set. Aggregation nodes run once afterwards, in this process,
/// over the lines that completed.
pub struct BatchEngine {
    flow_file: PathBuf,
    working_dir: PathBuf,
    connections: HashMap<String, Connection>,
    config: RuntimeConfig,
    options: ExecutorOptions,
    proxy: Option<Arc<dyn ExecutorProxy>>,
    max_lines_count: Option<usize>,
}

impl BatchEngine {
    pub fn new(
        flow_file: impl Into<PathBuf>,
        working_dir: Option<&Path>,
        connections: HashMap<String, Connection>,
        config: RuntimeConfig,
    ) -> Self {
        let flow_file = flow_file.into();
        let working_dir = working_dir
            .map(Path::to_path_buf)
            .or_else(|| flow_file.parent().map(Path::to_path_buf))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            flow_file,
            working_dir,
            connections,
            config,
            options: ExecutorOptions::default(),
            proxy: None,
            max_lines_count: None,
        }
    }

    /// Variant selection, node overrides and tools for the in-process executor.
    pub fn with_executor_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ExecutorProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_max_lines_count(mut self, max: usize) -> Self {
        self.max_lines_count = Some(max);
        self
    }

    /// Execute the batch and persist it under `output_dir`.
    ///
    /// `input_dirs` names each input source, e.g. `data` or `run.outputs`;
    /// `inputs_mapping` maps flow inputs to `${source.column}` references.
    /// Failing lines do not fail the batch; an error that stops the whole
    /// run is written to the run's error file and returned.
    pub async fn run(
        &self,
        input_dirs: &IndexMap<String, PathBuf>,
        inputs_mapping: &IndexMap<String, Value>,
        output_dir: &Path,
        run_id: Option<&str>,
    ) -> Result<BatchResult, FlowError> {
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let storage = Arc::new(LocalStorageOperations::new(
            output_dir,
            run_id.clone(),
            MultimediaProcessor::default(),
        )?);
        tracing::info!("Start batch run {} of {}", run_id, self.flow_file.display());

        match self.run_inner(input_dirs, inputs_mapping, &storage, &run_id).await {
            Ok(result) => {
                storage.persist_result(&result, None)?;
                tracing::info!(
                    "Batch run {} finished: {} completed, {} failed of {} lines.",
                    run_id,
                    result.completed_lines,
                    result.failed_lines,
                    result.total_lines
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!("Batch run {} failed: {}", run_id, e);
                if let Err(dump) = storage.dump_exception(Some(&e), None) {
                    tracing::warn!("Failed to write the error file of run {}: {}", run_id, dump);
                }
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        input_dirs: &IndexMap<String, PathBuf>,
        inputs_mapping: &IndexMap<String, Value>,
        storage: &Arc<LocalStorageOperations>,
        run_id: &str,
    ) -> Result<BatchResult, FlowError> {
        let start_time = Utc::now();
        let connections = Arc::new(ConnectionStore::from_connections(self.connections.values().cloned()));
        let executor = FlowExecutor::create(
            &self.flow_file,
            connections,
            Some(&self.working_dir),
            self.options
                .clone()
                .with_raise_ex(false)
                .with_storage(storage.clone()),
        )
        .await?;

        let multimedia = MultimediaProcessor::create(Some(executor.flow().message_format.as_str()))?
            .with_working_dir(&self.working_dir);
        let mut processor = BatchInputsProcessor::new(&self.working_dir, executor.flow().inputs.clone(), multimedia);
        if let Some(max) = self.max_lines_count {
            processor = processor.with_max_lines_count(max);
        }
        let lines = processor.process_batch_inputs(input_dirs, inputs_mapping)?;
        tracing::info!("Resolved {} lines for run {}", lines.len(), run_id);

        let line_results = match &self.proxy {
            Some(proxy) => self.exec_lines_by_proxy(proxy.as_ref(), lines, storage, run_id).await?,
            None => self.exec_lines_by_pool(&executor, lines, storage, run_id).await?,
        };

        let aggr_result = self.exec_aggregation(&executor, &line_results, storage, run_id).await?;
        let end_time = Utc::now();
        Ok(BatchResult::create(start_time, end_time, &line_results, &aggr_result, None))
    }

    async fn exec_lines_by_pool(
        &self,
        executor: &FlowExecutor,
        lines: Vec<IndexMap<String, Value>>,
        storage: &Arc<LocalStorageOperations>,
        run_id: &str,
    ) -> Result<Vec<LineResult>, FlowError> {
        let pool = LineExecutionProcessPool::start(
            &self.config,
            executor.flow(),
            self.connections.clone(),
            &self.working_dir,
            storage.output_dir(),
            storage.clone(),
        )
        .await?;
        let results = pool.run(lines, run_id).await;
        if let Err(e) = pool.close().await {
            tracing::warn!("Failed to close the process pool of run {}: {}", run_id, e);
        }
        results
    }

    async fn exec_lines_by_proxy(
        &self,
        proxy: &dyn ExecutorProxy,
        lines: Vec<IndexMap<String, Value>>,
        storage: &Arc<LocalStorageOperations>,
        run_id: &str,
    ) -> Result<Vec<LineResult>, FlowError> {
        let total = lines.len();
        let pending = lines.into_iter().enumerate().map(|(position, mut inputs)| {
            let line_number = inputs
                .shift_remove(LINE_NUMBER_KEY)
                .and_then(|v| v.as_i64())
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(position);
            proxy.exec_line_async(inputs, Some(line_number), Some(run_id))
        });
        let mut executing = stream::iter(pending).buffer_unordered(self.config.worker_count.max(1));
        let mut results = Vec::with_capacity(total);
        while let Some(result) = executing.next().await {
            let result = result?;
            persist_line(storage.as_ref(), &result);
            results.push(result);
            tracing::info!("Finished {} / {} lines.", results.len(), total);
        }
        results.sort_by_key(|r| r.run_info.index);
        Ok(results)
    }

    async fn exec_aggregation(
        &self,
        executor: &FlowExecutor,
        line_results: &[LineResult],
        storage: &Arc<LocalStorageOperations>,
        run_id: &str,
    ) -> Result<AggregationResult, FlowError> {
        if !executor.has_aggregation_node() {
            return Ok(AggregationResult::default());
        }
        let succeeded: Vec<&LineResult> = line_results
            .iter()
            .filter(|r| r.run_info.status == Status::Completed)
            .collect();
        if succeeded.is_empty() {
            tracing::warn!("No line of run {} completed, skip aggregation.", run_id);
            return Ok(AggregationResult::default());
        }
        let batch_inputs = transpose(succeeded.iter().map(|r| &r.run_info.inputs));
        let aggregation_inputs = transpose(succeeded.iter().map(|r| &r.aggregation_inputs));
        tracing::info!(
            "Executing aggregation nodes {:?} over {} lines.",
            executor.aggregation_nodes(),
            succeeded.len()
        );

        match &self.proxy {
            Some(proxy) => {
                let result = proxy
                    .exec_aggregation_async(batch_inputs, aggregation_inputs, Some(run_id))
                    .await?;
                for node_run in result.node_run_infos.values() {
                    if let Err(e) = storage.persist_node_run(node_run) {
                        tracing::warn!("Failed to persist node run {}: {}", node_run.run_id, e);
                    }
                }
                Ok(result)
            }
            None => {
                executor
                    .exec_aggregation(batch_inputs, aggregation_inputs, Some(run_id))
                    .await
            }
        }
    }
}

fn persist_line(storage: &dyn RunStorage, result: &LineResult) {
    for node_run in result.node_run_infos.values() {
        if let Err(e) = storage.persist_node_run(node_run) {
            tracing::warn!("Failed to persist node run {}: {}", node_run.run_id, e);
        }
    }
    if let Err(e) = storage.persist_flow_run(&result.run_info) {
        tracing::warn!("Failed to persist line run {}: {}", result.run_info.run_id, e);
    }
}

/// Turn per-line dicts into one list per key, in line order.
fn transpose<'a>(rows: impl Iterator<Item = &'a IndexMap<String, Value>>) -> IndexMap<String, Value> {
    let mut columns: IndexMap<String, Vec<Value>> = IndexMap::new();
    for row in rows {
        for (key, value) in row {
            if key == LINE_NUMBER_KEY {
                continue;
            }
            columns.entry(key.clone()).or_default().push(value.clone());
        }
    }
    columns.into_iter().map(|(k, v)| (k, Value::Array(v))).collect()
}
