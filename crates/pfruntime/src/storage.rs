//! Run record persistence
//!
//! [`RunStorage`] is the seam the executor writes node and line records
//! through. [`LocalStorageOperations`] lays a batch run out on disk:
//!
//! ```text
//! <run dir>/
//!   logs.txt
//!   meta.json
//!   inputs.jsonl, outputs.jsonl, metrics.json, error.json
//!   flow_artifacts/000000000_000000000.jsonl
//!   node_artifacts/<node>/000000000.jsonl
//! ```

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use pfcore::{
    BatchResult, ErrorCategory, FlowError, FlowRunInfo, MultimediaProcessor, RunInfo, StorageError, Value,
};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "logs.txt";
pub const META_FILE: &str = "meta.json";
pub const INPUTS_FILE: &str = "inputs.jsonl";
pub const OUTPUTS_FILE: &str = "outputs.jsonl";
pub const METRICS_FILE: &str = "metrics.json";
pub const EXCEPTION_FILE: &str = "error.json";
pub const FLOW_ARTIFACTS_DIR: &str = "flow_artifacts";
pub const NODE_ARTIFACTS_DIR: &str = "node_artifacts";

const LINE_NUMBER: &str = "line_number";
// Code of the error dict wrapping line failures when the run raised nothing itself
const BULK_RUN_EXCEPTION: &str = "BulkRunException";

/// Sink for node and line run records
pub trait RunStorage: Send + Sync {
    fn persist_node_run(&self, run_info: &RunInfo) -> Result<(), StorageError>;

    fn persist_flow_run(&self, run_info: &FlowRunInfo) -> Result<(), StorageError>;
}

/// Storage that drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyRunStorage;

impl RunStorage for DummyRunStorage {
    fn persist_node_run(&self, _run_info: &RunInfo) -> Result<(), StorageError> {
        Ok(())
    }

    fn persist_flow_run(&self, _run_info: &FlowRunInfo) -> Result<(), StorageError> {
        Ok(())
    }
}

fn write_error(path: &Path, e: impl std::fmt::Display) -> StorageError {
    StorageError::Write {
        path: path.display().to_string(),
        error: e.to_string(),
    }
}

fn read_error(path: &Path, e: impl std::fmt::Display) -> StorageError {
    StorageError::Read {
        path: path.display().to_string(),
        error: e.to_string(),
    }
}

fn dump_json(path: &Path, value: &serde_json::Value) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
    }
    let content = serde_json::to_string(value).map_err(|e| write_error(path, e))?;
    fs::write(path, content).map_err(|e| write_error(path, e))
}

fn dump_jsonl(path: &Path, records: &[serde_json::Value]) -> Result<(), StorageError> {
    let mut file = fs::File::create(path).map_err(|e| write_error(path, e))?;
    for record in records {
        let line = serde_json::to_string(record).map_err(|e| write_error(path, e))?;
        writeln!(file, "{}", line).map_err(|e| write_error(path, e))?;
    }
    Ok(())
}

fn load_jsonl(path: &Path) -> Result<Vec<serde_json::Value>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|e| read_error(path, e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| read_error(path, e)))
        .collect()
}

fn iso(time: &DateTime<Utc>) -> String {
    time.to_rfc3339()
}

/// On-disk layout of one batch run
pub struct LocalStorageOperations {
    run_name: String,
    output_dir: PathBuf,
    lock_dir: PathBuf,
    processor: MultimediaProcessor,
}

impl LocalStorageOperations {
    /// Create the run directory skeleton and write `meta.json`.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        run_name: impl Into<String>,
        processor: MultimediaProcessor,
    ) -> Result<Self, StorageError> {
        let output_dir = output_dir.into();
        let storage = Self {
            run_name: run_name.into(),
            lock_dir: output_dir.clone(),
            output_dir,
            processor,
        };
        for dir in [
            storage.output_dir.clone(),
            storage.flow_artifacts_dir(),
            storage.node_artifacts_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| write_error(&dir, e))?;
        }
        dump_json(&storage.output_dir.join(META_FILE), &json!({"batch_size": 1}))?;
        Ok(storage)
    }

    /// Keep lock files somewhere other than the run directory.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join(LOG_FILE)
    }

    fn flow_artifacts_dir(&self) -> PathBuf {
        self.output_dir.join(FLOW_ARTIFACTS_DIR)
    }

    fn node_artifacts_dir(&self) -> PathBuf {
        self.output_dir.join(NODE_ARTIFACTS_DIR)
    }

    fn persist_multimedia(&self, value: &Value, folder: &Path) -> Result<Value, StorageError> {
        self.processor
            .persist(value, folder, None, true)
            .map_err(|e| write_error(folder, e))
    }

    fn node_run_record(&self, run_info: &RunInfo, folder: &Path) -> Result<serde_json::Value, StorageError> {
        let mut info = run_info.clone();
        info.inputs = match self.persist_multimedia(&Value::Object(info.inputs), folder)? {
            Value::Object(map) => map,
            _ => IndexMap::new(),
        };
        info.output = self.persist_multimedia(&info.output, folder)?;
        if let Some(calls) = info.api_calls.take() {
            let persisted = calls
                .iter()
                .map(|c| self.persist_multimedia(c, folder))
                .collect::<Result<Vec<_>, _>>()?;
            info.api_calls = Some(persisted);
        }
        info.result = None;
        let run_info_json = serde_json::to_value(&info).map_err(|e| write_error(folder, e))?;
        Ok(json!({
            "NodeName": run_info.node,
            "line_number": run_info.index.unwrap_or(0),
            "run_info": run_info_json,
            "start_time": iso(&run_info.start_time),
            "end_time": run_info.end_time.as_ref().map(iso),
            "status": run_info.status.as_str(),
        }))
    }

    fn write_line_file(&self, path: &Path, record: &serde_json::Value) -> Result<(), StorageError> {
        dump_jsonl(path, std::slice::from_ref(record))
    }

    /// Gather `inputs.jsonl` and `outputs.jsonl` from the line records.
    pub fn dump_inputs_and_outputs(&self) -> Result<(), StorageError> {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for record in self.load_flow_run_records()? {
            let line_number = record.get(LINE_NUMBER).cloned().unwrap_or(json!(0));
            let run_info = &record["run_info"];
            let mut line_inputs = run_info
                .get("inputs")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            line_inputs.insert(LINE_NUMBER.to_string(), line_number.clone());
            inputs.push(serde_json::Value::Object(line_inputs));

            if let Some(output) = run_info.get("output").and_then(|v| v.as_object()) {
                let mut line_output = output.clone();
                line_output.insert(LINE_NUMBER.to_string(), line_number);
                outputs.push(serde_json::Value::Object(line_output));
            }
        }
        dump_jsonl(&self.output_dir.join(INPUTS_FILE), &inputs)?;
        dump_jsonl(&self.output_dir.join(OUTPUTS_FILE), &outputs)
    }

    pub fn dump_metrics(&self, metrics: &IndexMap<String, Value>) -> Result<(), StorageError> {
        let value = serde_json::to_value(metrics).map_err(|e| write_error(&self.output_dir, e))?;
        dump_json(&self.output_dir.join(METRICS_FILE), &value)
    }

    /// Write `error.json` for a run that had line, aggregation or run level
    /// failures. Nothing is written when there is nothing to report.
    pub fn dump_exception(
        &self,
        exception: Option<&FlowError>,
        batch_result: Option<&BatchResult>,
    ) -> Result<(), StorageError> {
        let mut errors: Vec<serde_json::Value> = Vec::new();
        let (mut failed_lines, mut total_lines) = (0, 0);
        if let Some(result) = batch_result {
            failed_lines = result.failed_lines;
            total_lines = result.total_lines;
            errors.extend(result.error_summary.error_list.iter().map(|e| {
                json!({"line_number": e.line_number, "error": e.error})
            }));
            errors.extend(
                result
                    .error_summary
                    .aggr_error_dict
                    .iter()
                    .map(|(node, error)| json!({"error": error, "aggregation_node_name": node})),
            );
        }

        let message = match errors.first() {
            Some(first) => first["error"]["message"].as_str().map(str::to_string),
            None => exception
                .filter(|e| e.category() == ErrorCategory::UserError)
                .map(|e| e.to_string()),
        };
        let Some(message) = message else {
            return Ok(());
        };

        let mut dict = match exception {
            Some(e) => e.to_error_dict(),
            None => json!({
                "code": ErrorCategory::UserError.as_str(),
                "innerError": {"code": BULK_RUN_EXCEPTION, "innerError": null},
            }),
        };
        dict["message"] = json!(message);
        dict["failed_lines"] = json!(failed_lines);
        dict["total_lines"] = json!(total_lines);
        dict["errors"] = json!({"errors": errors});
        dump_json(&self.output_dir.join(EXCEPTION_FILE), &dict)
    }

    /// Persist everything a finished batch run leaves behind.
    pub fn persist_result(&self, result: &BatchResult, exception: Option<&FlowError>) -> Result<(), StorageError> {
        self.dump_inputs_and_outputs()?;
        self.dump_metrics(&result.metrics)?;
        self.dump_exception(exception, Some(result))
    }

    fn sorted_jsonl_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(dir).map_err(|e| read_error(dir, e))? {
            let path = entry.map_err(|e| read_error(dir, e))?.path();
            if path.is_dir() {
                files.extend(Self::sorted_jsonl_files(&path)?);
            } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn load_flow_run_records(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        let mut records = Vec::new();
        for file in Self::sorted_jsonl_files(&self.flow_artifacts_dir())? {
            records.extend(load_jsonl(&file)?);
        }
        records.sort_by_key(|r| r.get(LINE_NUMBER).and_then(|n| n.as_u64()).unwrap_or(0));
        Ok(records)
    }

    /// Line and node run infos, as `{"flow_runs": [...], "node_runs": [...]}`.
    pub fn load_detail(&self) -> Result<serde_json::Value, StorageError> {
        let flow_runs: Vec<_> = self
            .load_flow_run_records()?
            .into_iter()
            .map(|r| r["run_info"].clone())
            .collect();
        let mut node_runs = Vec::new();
        for file in Self::sorted_jsonl_files(&self.node_artifacts_dir())? {
            node_runs.extend(load_jsonl(&file)?.into_iter().map(|r| r["run_info"].clone()));
        }
        Ok(json!({"flow_runs": flow_runs, "node_runs": node_runs}))
    }

    pub fn load_inputs(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        load_jsonl(&self.output_dir.join(INPUTS_FILE))
    }

    pub fn load_outputs(&self) -> Result<Vec<serde_json::Value>, StorageError> {
        load_jsonl(&self.output_dir.join(OUTPUTS_FILE))
    }

    fn load_json(&self, name: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let path = self.output_dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| read_error(&path, e))?;
        serde_json::from_str(&content).map(Some).map_err(|e| read_error(&path, e))
    }

    pub fn load_metrics(&self) -> Result<serde_json::Value, StorageError> {
        Ok(self.load_json(METRICS_FILE)?.unwrap_or_else(|| json!({})))
    }

    pub fn load_exception(&self) -> Result<Option<serde_json::Value>, StorageError> {
        self.load_json(EXCEPTION_FILE)
    }
}

impl RunStorage for LocalStorageOperations {
    fn persist_node_run(&self, run_info: &RunInfo) -> Result<(), StorageError> {
        let folder = self.node_artifacts_dir().join(&run_info.node);
        fs::create_dir_all(&folder).map_err(|e| write_error(&folder, e))?;
        let line_number = run_info.index.unwrap_or(0);
        let record = self.node_run_record(run_info, &folder)?;
        let path = folder.join(format!("{:09}.jsonl", line_number));

        // Aggregation and single-line runs share file 0.
        if line_number != 0 {
            return self.write_line_file(&path, &record);
        }
        let lock_path = self
            .lock_dir
            .join(format!("{}.{}.lock", self.run_name, run_info.node));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StorageError::Lock {
                path: lock_path.display().to_string(),
                error: e.to_string(),
            })?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock.write().map_err(|e| StorageError::Lock {
            path: lock_path.display().to_string(),
            error: e.to_string(),
        })?;
        self.write_line_file(&path, &record)
    }

    fn persist_flow_run(&self, run_info: &FlowRunInfo) -> Result<(), StorageError> {
        if !run_info.status.is_terminated() {
            tracing::info!("Line run is not terminated, skip persisting line run record.");
            return Ok(());
        }
        let folder = self.flow_artifacts_dir();
        let line_number = run_info.index.unwrap_or(0);

        let mut info = run_info.clone();
        info.inputs = match self.persist_multimedia(&Value::Object(info.inputs), &folder)? {
            Value::Object(map) => map,
            _ => IndexMap::new(),
        };
        if let Some(output) = info.output.take() {
            info.output = match self.persist_multimedia(&Value::Object(output), &folder)? {
                Value::Object(map) => Some(map),
                _ => None,
            };
        }
        if let Some(calls) = info.api_calls.take() {
            let persisted = calls
                .iter()
                .map(|c| self.persist_multimedia(c, &folder))
                .collect::<Result<Vec<_>, _>>()?;
            info.api_calls = Some(persisted);
        }
        info.result = None;

        let run_info_json = serde_json::to_value(&info).map_err(|e| write_error(&folder, e))?;
        let record = json!({
            "line_number": line_number,
            "run_info": run_info_json,
            "start_time": iso(&run_info.start_time),
            "end_time": run_info.end_time.as_ref().map(iso),
            "name": run_info.name,
            "description": run_info.description,
            "status": run_info.status.as_str(),
            "tags": run_info.tags,
        });
        let path = folder.join(format!("{:09}_{:09}.jsonl", line_number, line_number));
        self.write_line_file(&path, &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfcore::{AggregationResult, ErrorResponse, Image, LineResult, Status};
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> LocalStorageOperations {
        LocalStorageOperations::new(dir.path().join("run"), "run", MultimediaProcessor::default()).unwrap()
    }

    fn line(index: usize, status: Status) -> FlowRunInfo {
        let mut info = FlowRunInfo::start(format!("run_{}", index), "run", "flow", Some(index));
        info.status = status;
        info.inputs.insert("question".to_string(), Value::from(format!("q{}", index)));
        let mut output = IndexMap::new();
        output.insert("answer".to_string(), Value::from(format!("a{}", index)));
        info.output = Some(output);
        info.end_time = Some(Utc::now());
        info
    }

    #[test]
    fn test_layout_and_meta() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let meta = fs::read_to_string(storage.output_dir().join(META_FILE)).unwrap();
        assert_eq!(meta, r#"{"batch_size":1}"#);
        assert!(storage.output_dir().join(FLOW_ARTIFACTS_DIR).is_dir());
        assert!(storage.output_dir().join(NODE_ARTIFACTS_DIR).is_dir());
    }

    #[test]
    fn test_running_line_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.persist_flow_run(&line(0, Status::Running)).unwrap();
        assert!(storage.load_detail().unwrap()["flow_runs"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_inputs_and_outputs_carry_line_number() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.persist_flow_run(&line(1, Status::Completed)).unwrap();
        storage.persist_flow_run(&line(0, Status::Completed)).unwrap();
        storage.dump_inputs_and_outputs().unwrap();

        let inputs = storage.load_inputs().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0], json!({"question": "q0", "line_number": 0}));
        let outputs = storage.load_outputs().unwrap();
        assert_eq!(outputs[1], json!({"answer": "a1", "line_number": 1}));
    }

    #[test]
    fn test_node_run_images_become_file_references() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let mut info = RunInfo::start("describe", "run_0", "run_0_describe_0".to_string(), "run_0", Some(0));
        info.status = Status::Completed;
        info.output = Value::Image(Image::new(vec![1, 2, 3], Some("image/png".to_string())));
        info.result = Some(Value::from("dropped"));
        storage.persist_node_run(&info).unwrap();

        let record = &load_jsonl(&storage.output_dir().join("node_artifacts/describe/000000000.jsonl")).unwrap()[0];
        assert_eq!(record["NodeName"], "describe");
        assert_eq!(record["status"], "Completed");
        let output = record["run_info"]["output"].as_object().unwrap();
        let path = output["data:image/png;path"].as_str().unwrap();
        assert!(Path::new(path).is_file());
        assert!(record["run_info"].get("result").is_none());
    }

    #[test]
    fn test_exception_from_first_line_error() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let mut failed = LineResult {
            output: IndexMap::new(),
            aggregation_inputs: IndexMap::new(),
            run_info: line(3, Status::Failed),
            node_run_infos: IndexMap::new(),
        };
        failed.run_info.error = Some(json!({"code": "UserError", "message": "bad input"}));
        let now = Utc::now();
        let result = BatchResult::create(now, now, &[failed], &AggregationResult::default(), None);
        storage.dump_exception(None, Some(&result)).unwrap();

        let error = storage.load_exception().unwrap().unwrap();
        assert_eq!(error["message"], "bad input");
        assert_eq!(error["failed_lines"], 1);
        assert_eq!(error["errors"]["errors"][0]["line_number"], 3);
        assert_eq!(error["code"], "UserError");
        assert_eq!(error["innerError"]["code"], "BulkRunException");
        assert_eq!(ErrorResponse::from_dict(&error).codes, ["UserError", "BulkRunException"]);
    }

    #[test]
    fn test_no_exception_written_for_clean_run() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let now = Utc::now();
        let result = BatchResult::create(now, now, &[], &AggregationResult::default(), None);
        storage.dump_exception(None, Some(&result)).unwrap();
        assert!(storage.load_exception().unwrap().is_none());
    }
}
