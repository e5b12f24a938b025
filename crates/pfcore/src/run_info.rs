//! Run records and results produced by line, aggregation and batch execution.

use crate::error::ErrorCategory;
use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Running,
    Preparing,
    Completed,
    Bypassed,
    Failed,
    Canceled,
    CancelRequested,
}

impl Status {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Bypassed | Status::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotStarted => "NotStarted",
            Status::Running => "Running",
            Status::Preparing => "Preparing",
            Status::Completed => "Completed",
            Status::Bypassed => "Bypassed",
            Status::Failed => "Failed",
            Status::Canceled => "Canceled",
            Status::CancelRequested => "CancelRequested",
        }
    }
}

/// Record of one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub node: String,
    pub flow_run_id: String,
    pub run_id: String,
    pub status: Status,
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_run_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<IndexMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metrics: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default = "basic_format")]
    pub message_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
}

fn basic_format() -> String {
    "basic".to_string()
}

impl RunInfo {
    pub fn start(node: &str, flow_run_id: &str, run_id: String, parent_run_id: &str, index: Option<usize>) -> Self {
        Self {
            node: node.to_string(),
            flow_run_id: flow_run_id.to_string(),
            run_id,
            status: Status::Running,
            inputs: IndexMap::new(),
            output: Value::Null,
            metrics: None,
            error: None,
            parent_run_id: parent_run_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: None,
            cached_run_id: None,
            logs: None,
            system_metrics: None,
            result: None,
            message_format: basic_format(),
            variant_id: None,
        }
    }

    /// Duration in seconds, once ended.
    pub fn duration(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}

/// Record of one line (or aggregation) run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunInfo {
    pub run_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    #[serde(default)]
    pub output: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<IndexMap<String, Value>>,
    #[serde(default)]
    pub parent_run_id: String,
    #[serde(default)]
    pub root_run_id: String,
    #[serde(default)]
    pub source_run_id: String,
    pub flow_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<Value>>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<IndexMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_metrics: Option<IndexMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub upload_metrics: bool,
    #[serde(default = "basic_format")]
    pub message_format: String,
}

impl FlowRunInfo {
    pub fn start(run_id: String, parent_run_id: &str, flow_id: &str, index: Option<usize>) -> Self {
        Self {
            run_id,
            status: Status::Running,
            error: None,
            inputs: IndexMap::new(),
            output: None,
            metrics: None,
            parent_run_id: parent_run_id.to_string(),
            root_run_id: parent_run_id.to_string(),
            source_run_id: parent_run_id.to_string(),
            flow_id: flow_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: None,
            name: String::new(),
            description: String::new(),
            tags: None,
            system_metrics: None,
            result: None,
            upload_metrics: false,
            message_format: basic_format(),
        }
    }

    /// Failed line record for a line that never reached an executor.
    pub fn create_with_error(
        start_time: DateTime<Utc>,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: &str,
        error: serde_json::Value,
    ) -> Self {
        let line_run_id = match index {
            Some(i) => format!("{}_{}", run_id, i),
            None => run_id.to_string(),
        };
        let mut info = Self::start(line_run_id, run_id, "default_flow_id", index);
        info.status = Status::Failed;
        info.error = Some(error);
        info.inputs = inputs;
        info.start_time = start_time;
        info.end_time = Some(Utc::now());
        info
    }
}

/// Result of executing one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineResult {
    pub output: IndexMap<String, Value>,
    #[serde(default)]
    pub aggregation_inputs: IndexMap<String, Value>,
    pub run_info: FlowRunInfo,
    #[serde(default)]
    pub node_run_infos: IndexMap<String, RunInfo>,
}

/// Result of executing the aggregation nodes once per batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationResult {
    pub output: IndexMap<String, Value>,
    pub metrics: IndexMap<String, Value>,
    pub node_run_infos: IndexMap<String, RunInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineError {
    pub line_number: usize,
    pub error: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub failed_user_error_lines: usize,
    pub failed_system_error_lines: usize,
    pub error_list: Vec<LineError>,
    pub aggr_error_dict: IndexMap<String, serde_json::Value>,
    pub batch_error_dict: Option<serde_json::Value>,
}

impl ErrorSummary {
    pub fn create(
        line_results: &[LineResult],
        aggr_result: &AggregationResult,
        batch_error: Option<serde_json::Value>,
    ) -> Self {
        let mut summary = ErrorSummary {
            batch_error_dict: batch_error,
            ..Default::default()
        };
        for line in line_results.iter().filter(|l| l.run_info.status == Status::Failed) {
            let error = line.run_info.error.clone().unwrap_or(serde_json::Value::Null);
            if error.get("code").and_then(|c| c.as_str()) == Some(ErrorCategory::UserError.as_str()) {
                summary.failed_user_error_lines += 1;
            } else {
                summary.failed_system_error_lines += 1;
            }
            summary.error_list.push(LineError {
                line_number: line.run_info.index.unwrap_or_default(),
                error,
            });
        }
        summary.error_list.sort_by_key(|e| e.line_number);
        summary.aggr_error_dict = aggr_result
            .node_run_infos
            .iter()
            .filter(|(_, info)| info.status == Status::Failed)
            .map(|(name, info)| (name.clone(), info.error.clone().unwrap_or(serde_json::Value::Null)))
            .collect();
        summary
    }
}

const TOKEN_KEYS: [&str; 3] = ["prompt_tokens", "completion_tokens", "total_tokens"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration: f64,
}

impl SystemMetrics {
    pub fn create(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        line_results: &[LineResult],
        aggr_result: &AggregationResult,
    ) -> Self {
        let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
        let flow_calls = line_results
            .iter()
            .map(|l| (&l.run_info.system_metrics, &l.run_info.api_calls));
        let aggr_calls = aggr_result
            .node_run_infos
            .values()
            .map(|n| (&n.system_metrics, &n.api_calls));
        for (system_metrics, api_calls) in flow_calls.chain(aggr_calls) {
            let from_metrics: Vec<(&str, u64)> = TOKEN_KEYS
                .iter()
                .filter_map(|k| {
                    system_metrics
                        .as_ref()
                        .and_then(|m| m.get(*k))
                        .and_then(Value::as_i64)
                        .map(|v| (*k, v as u64))
                })
                .collect();
            if !from_metrics.is_empty() {
                for (k, v) in from_metrics {
                    *totals.entry(k).or_default() += v;
                }
                continue;
            }
            for call in api_calls.iter().flatten() {
                collect_usage(call, &mut totals);
            }
        }
        Self {
            total_tokens: totals.get("total_tokens").copied().unwrap_or_default(),
            prompt_tokens: totals.get("prompt_tokens").copied().unwrap_or_default(),
            completion_tokens: totals.get("completion_tokens").copied().unwrap_or_default(),
            duration: (end_time - start_time).num_milliseconds() as f64 / 1000.0,
        }
    }
}

/// Sum `usage` blocks found in a traced call and its children.
fn collect_usage(call: &Value, totals: &mut BTreeMap<&'static str, u64>) {
    if let Some(usage) = call.get("output").and_then(|o| o.get("usage")) {
        for key in TOKEN_KEYS {
            if let Some(n) = usage.get(key).and_then(Value::as_i64) {
                *totals.entry(key).or_default() += n as u64;
            }
        }
    }
    if let Some(children) = call.get("children").and_then(Value::as_array) {
        for child in children {
            collect_usage(child, totals);
        }
    }
}

/// Summary of a whole batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: Status,
    pub total_lines: usize,
    pub completed_lines: usize,
    pub failed_lines: usize,
    pub node_status: IndexMap<String, usize>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub metrics: IndexMap<String, Value>,
    pub system_metrics: SystemMetrics,
    pub error_summary: ErrorSummary,
}

impl BatchResult {
    pub fn create(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        line_results: &[LineResult],
        aggr_result: &AggregationResult,
        batch_error: Option<serde_json::Value>,
    ) -> Self {
        let total_lines = line_results.len();
        let completed_lines = line_results
            .iter()
            .filter(|l| l.run_info.status == Status::Completed)
            .count();
        let status = if batch_error.is_some() {
            Status::Failed
        } else {
            Status::Completed
        };
        Self {
            status,
            total_lines,
            completed_lines,
            failed_lines: total_lines - completed_lines,
            node_status: Self::node_status(line_results, aggr_result),
            start_time,
            end_time,
            metrics: aggr_result.metrics.clone(),
            system_metrics: SystemMetrics::create(start_time, end_time, line_results, aggr_result),
            error_summary: ErrorSummary::create(line_results, aggr_result, batch_error),
        }
    }

    /// Count of node runs keyed `<node>.<status>`, e.g. `fetch_url.completed`.
    fn node_status(line_results: &[LineResult], aggr_result: &AggregationResult) -> IndexMap<String, usize> {
        let mut status = IndexMap::new();
        let infos = line_results
            .iter()
            .flat_map(|l| l.node_run_infos.values())
            .chain(aggr_result.node_run_infos.values());
        for info in infos {
            let key = format!("{}.{}", info.node, info.status.as_str().to_lowercase());
            *status.entry(key).or_insert(0) += 1;
        }
        status
    }
}
