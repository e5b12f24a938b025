use crate::storage::RunStorage;
use chrono::Utc;
use indexmap::IndexMap;
use pfcore::{ExecutionError, FlowError, FlowRunInfo, RunInfo, Status, StorageError, Value};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};

const TOKEN_KEYS: [&str; 3] = ["prompt_tokens", "completion_tokens", "total_tokens"];

#[derive(Default)]
struct Runs {
    flow_runs: IndexMap<String, FlowRunInfo>,
    node_runs: IndexMap<String, RunInfo>,
}

/// Tracks the flow and node runs of one execution and writes them through
/// a [`RunStorage`] once they end.
pub struct RunTracker {
    storage: Arc<dyn RunStorage>,
    runs: Mutex<Runs>,
}

impl RunTracker {
    pub fn new(storage: Arc<dyn RunStorage>) -> Self {
        Self {
            storage,
            runs: Mutex::new(Runs::default()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, Runs> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_flow_run(
        &self,
        flow_id: &str,
        root_run_id: &str,
        run_id: &str,
        parent_run_id: &str,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
    ) -> FlowRunInfo {
        let mut info = FlowRunInfo::start(run_id.to_string(), parent_run_id, flow_id, index);
        info.root_run_id = root_run_id.to_string();
        info.inputs = inputs;
        self.runs().flow_runs.insert(run_id.to_string(), info.clone());
        info
    }

    pub fn start_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
    ) -> RunInfo {
        let info = RunInfo::start(node, flow_run_id, run_id.to_string(), parent_run_id, index);
        self.runs().node_runs.insert(run_id.to_string(), info.clone());
        info
    }

    /// Record a node that was skipped without running.
    ///
    /// `output` is the node's skip return value when it has one.
    pub fn bypass_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
        output: Option<Value>,
    ) -> RunInfo {
        let mut info = RunInfo::start(node, flow_run_id, run_id.to_string(), parent_run_id, index);
        info.status = Status::Bypassed;
        info.end_time = Some(info.start_time);
        if let Some(output) = output {
            info.result = Some(output.clone());
            info.output = output;
        }
        self.runs().node_runs.insert(run_id.to_string(), info.clone());
        info
    }

    pub fn set_inputs(&self, run_id: &str, inputs: IndexMap<String, Value>) {
        let mut runs = self.runs();
        if let Some(info) = runs.node_runs.get_mut(run_id) {
            info.inputs = inputs;
        } else if let Some(info) = runs.flow_runs.get_mut(run_id) {
            info.inputs = inputs;
        }
    }

    /// Close a node run with its result. Runs already canceled stay canceled.
    pub fn end_node_run(
        &self,
        run_id: &str,
        result: Result<&Value, &FlowError>,
        api_calls: Vec<Value>,
        metrics: Option<IndexMap<String, Value>>,
    ) -> Option<RunInfo> {
        let mut runs = self.runs();
        let info = runs.node_runs.get_mut(run_id)?;
        if info.status == Status::Canceled {
            return Some(info.clone());
        }
        match result {
            Ok(output) => {
                info.status = Status::Completed;
                info.output = output.clone();
                info.result = Some(output.clone());
            }
            Err(e) => {
                info.status = Status::Failed;
                info.error = Some(e.to_error_dict());
            }
        }
        let end = Utc::now();
        info.end_time = Some(end);

        let mut system_metrics = IndexMap::new();
        let duration = (end - info.start_time).num_milliseconds() as f64 / 1000.0;
        system_metrics.insert("duration".to_string(), Value::from(duration));
        for (key, total) in sum_token_usage(&api_calls) {
            system_metrics.insert(key.to_string(), Value::from(total));
        }
        info.system_metrics = Some(system_metrics);
        if !api_calls.is_empty() {
            info.api_calls = Some(api_calls);
        }
        if metrics.as_ref().is_some_and(|m| !m.is_empty()) {
            info.metrics = metrics;
        }
        Some(info.clone())
    }

    pub fn end_flow_run(&self, run_id: &str, result: Result<&IndexMap<String, Value>, &FlowError>) -> Option<FlowRunInfo> {
        let mut runs = self.runs();
        let info = runs.flow_runs.get_mut(run_id)?;
        match result {
            Ok(output) => {
                info.status = Status::Completed;
                info.output = Some(output.clone());
                info.result = Some(Value::Object(output.clone()));
            }
            Err(e) => {
                info.status = Status::Failed;
                info.error = Some(e.to_error_dict());
            }
        }
        info.end_time = Some(Utc::now());
        Some(info.clone())
    }

    /// Mark every child node run of `parent_run_id` that is still running as canceled.
    pub fn cancel_node_runs(&self, parent_run_id: &str, reason: &ExecutionError) {
        let error = FlowError::from(ExecutionError::Canceled).to_error_dict();
        let mut runs = self.runs();
        for info in runs
            .node_runs
            .values_mut()
            .filter(|i| i.parent_run_id == parent_run_id && i.status == Status::Running)
        {
            tracing::info!("Cancel node run {} of node {}: {}", info.run_id, info.node, reason);
            info.status = Status::Canceled;
            info.error = Some(error.clone());
            info.end_time = Some(Utc::now());
        }
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunInfo> {
        self.runs().node_runs.get(run_id).cloned()
    }

    pub fn get_flow_run(&self, run_id: &str) -> Option<FlowRunInfo> {
        self.runs().flow_runs.get(run_id).cloned()
    }

    pub fn collect_child_node_runs(&self, parent_run_id: &str) -> Vec<RunInfo> {
        self.runs()
            .node_runs
            .values()
            .filter(|i| i.parent_run_id == parent_run_id)
            .cloned()
            .collect()
    }

    pub fn collect_node_runs(&self, flow_run_id: Option<&str>) -> Vec<RunInfo> {
        self.runs()
            .node_runs
            .values()
            .filter(|i| flow_run_id.map_or(true, |id| i.flow_run_id == id))
            .cloned()
            .collect()
    }

    pub fn flow_run_list(&self) -> Vec<FlowRunInfo> {
        self.runs().flow_runs.values().cloned().collect()
    }

    /// Roll token usage of the child node runs up to the flow run and attach
    /// a flow level trace whose children are the node traces.
    pub fn update_flow_run_info_with_node_runs(&self, run_id: &str) {
        let children = self.collect_child_node_runs(run_id);
        let mut runs = self.runs();
        let Some(info) = runs.flow_runs.get_mut(run_id) else {
            return;
        };

        let mut totals: IndexMap<&str, i64> = TOKEN_KEYS.iter().map(|k| (*k, 0)).collect();
        let mut child_calls = Vec::new();
        for child in &children {
            if let Some(metrics) = &child.system_metrics {
                for key in TOKEN_KEYS {
                    if let Some(n) = metrics.get(key).and_then(Value::as_i64) {
                        *totals.entry(key).or_default() += n;
                    }
                }
            }
            child_calls.extend(child.api_calls.iter().flatten().cloned());
        }

        let end_time = info.end_time.unwrap_or_else(Utc::now);
        let mut system_metrics: IndexMap<String, Value> =
            totals.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect();
        let duration = (end_time - info.start_time).num_milliseconds() as f64 / 1000.0;
        system_metrics.insert("duration".to_string(), Value::from(duration));

        let trace = json!({
            "name": "flow",
            "node_name": "flow",
            "type": "Flow",
            "start_time": info.start_time.timestamp_millis() as f64 / 1000.0,
            "end_time": end_time.timestamp_millis() as f64 / 1000.0,
            "children": child_calls.iter().map(Value::to_json).collect::<Vec<_>>(),
            "system_metrics": Value::Object(system_metrics.clone()).to_json(),
            "inputs": Value::Object(info.inputs.clone()).to_json(),
            "output": info.output.clone().map(|o| Value::Object(o).to_json()),
            "error": info.error,
        });
        info.system_metrics = Some(system_metrics);
        info.api_calls = Some(vec![Value::from(trace)]);
    }

    pub fn persist_node_run(&self, run_info: &RunInfo) -> Result<(), StorageError> {
        self.storage.persist_node_run(run_info)
    }

    pub fn persist_flow_run(&self, run_info: &FlowRunInfo) -> Result<(), StorageError> {
        self.storage.persist_flow_run(run_info)
    }

    /// Re-persist node runs whose output was a stream, now that the stream
    /// has been consumed and its items recorded.
    pub fn update_and_persist_generator_node_runs(&self, parent_run_id: &str) -> Result<(), StorageError> {
        for info in self
            .collect_child_node_runs(parent_run_id)
            .iter()
            .filter(|i| i.output.is_stream())
        {
            self.storage.persist_node_run(info)?;
        }
        Ok(())
    }

    /// Node and line counts, keyed `__pf__.nodes.<node>.<status>` and
    /// `__pf__.lines.<status>`.
    pub fn get_status_summary(&self, run_id: &str) -> IndexMap<String, usize> {
        let runs = self.runs();
        let mut summary = IndexMap::new();
        for info in runs.node_runs.values().filter(|i| i.flow_run_id == run_id) {
            let key = format!("__pf__.nodes.{}.{}", info.node, info.status.as_str().to_lowercase());
            *summary.entry(key).or_insert(0) += 1;
        }
        let lines = runs
            .flow_runs
            .values()
            .filter(|i| i.parent_run_id == run_id && i.index.is_some());
        let (mut completed, mut failed) = (0, 0);
        for info in lines {
            match info.status {
                Status::Completed => completed += 1,
                Status::Failed => failed += 1,
                _ => {}
            }
        }
        summary.insert("__pf__.lines.completed".to_string(), completed);
        summary.insert("__pf__.lines.failed".to_string(), failed);
        summary
    }
}

/// Sum `usage` token counts reported in traced calls and their children.
fn sum_token_usage(api_calls: &[Value]) -> IndexMap<&'static str, i64> {
    fn walk(call: &Value, totals: &mut IndexMap<&'static str, i64>) {
        if let Some(usage) = call.get("output").and_then(|o| o.get("usage")) {
            for key in TOKEN_KEYS {
                if let Some(n) = usage.get(key).and_then(Value::as_i64) {
                    *totals.entry(key).or_default() += n;
                }
            }
        }
        for child in call.get("children").and_then(Value::as_array).into_iter().flatten() {
            walk(child, totals);
        }
    }
    let mut totals = IndexMap::new();
    for call in api_calls {
        walk(call, &mut totals);
    }
    totals
}
