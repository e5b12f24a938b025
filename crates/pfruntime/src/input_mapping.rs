use indexmap::IndexMap;
use pfcore::{FlowInputDefinition, InputMappingError, MultimediaProcessor, Value};
use std::path::{Path, PathBuf};

/// Key carrying a row's position in the merged batch input
pub const LINE_NUMBER_KEY: &str = "line_number";

const DEFAULT_DATA_SOURCE: &str = "data";

/// Group rows of every named source by line number.
///
/// Sources whose rows carry a `line_number` are matched on it; the others
/// are matched positionally and must all have the same length. Lines that
/// are missing from any source are dropped.
pub fn merge_input_dicts_by_line(
    input_dict: &IndexMap<String, Vec<Value>>,
) -> Result<Vec<IndexMap<String, Value>>, InputMappingError> {
    for (input_key, rows) in input_dict {
        if rows.is_empty() {
            return Err(InputMappingError::EmptyInput {
                input_key: input_key.clone(),
            });
        }
    }

    // Check if line numbers are aligned
    let lengths: IndexMap<String, usize> = input_dict
        .iter()
        .filter(|(_, rows)| !rows.iter().any(|row| row.get(LINE_NUMBER_KEY).is_some()))
        .map(|(key, rows)| (key.clone(), rows.len()))
        .collect();
    let mut distinct: Vec<usize> = lengths.values().copied().collect();
    distinct.dedup();
    if distinct.len() > 1 {
        return Err(InputMappingError::UnalignedLineNumbers { lengths });
    }

    let mut lines: IndexMap<i64, IndexMap<String, Value>> = IndexMap::new();
    for (input_key, rows) in input_dict {
        if lengths.contains_key(input_key) {
            for (index, row) in rows.iter().enumerate() {
                lines
                    .entry(index as i64)
                    .or_default()
                    .insert(input_key.clone(), row.clone());
            }
            continue;
        }
        for row in rows {
            if let Some(index) = row.get(LINE_NUMBER_KEY).and_then(Value::as_i64) {
                lines.entry(index).or_default().insert(input_key.clone(), row.clone());
            }
        }
    }

    Ok(lines
        .into_iter()
        .filter(|(_, sources)| sources.len() == input_dict.len())
        .map(|(line, mut sources)| {
            sources.insert(LINE_NUMBER_KEY.to_string(), Value::Int(line));
            sources
        })
        .collect())
}

/// Build one line's flow inputs from its merged sources.
///
/// Mapping values of the form `${source.column}` are read from the merged
/// line; any other value is used literally. All unresolved references are
/// reported together.
pub fn apply_inputs_mapping(
    inputs: &IndexMap<String, Value>,
    inputs_mapping: &IndexMap<String, Value>,
) -> Result<IndexMap<String, Value>, InputMappingError> {
    let mut result = IndexMap::new();
    let mut not_found = Vec::new();
    for (map_to_key, map_value) in inputs_mapping {
        let Some(reference) = reference_of(map_value) else {
            result.insert(map_to_key.clone(), map_value.clone());
            continue;
        };
        match lookup(inputs, reference) {
            Some(value) => {
                result.insert(map_to_key.clone(), value.clone());
            }
            None => not_found.push(format!("{}:{}", map_to_key, map_value)),
        }
    }
    if !not_found.is_empty() {
        return Err(InputMappingError::ApplyInputMapping {
            invalid_relations: not_found.join(", "),
        });
    }
    if let (Some(line), false) = (inputs.get(LINE_NUMBER_KEY), result.contains_key(LINE_NUMBER_KEY)) {
        result.insert(LINE_NUMBER_KEY.to_string(), line.clone());
    }
    Ok(result)
}

/// Add `${data.<name>}` for every flow input without a default that the
/// explicit mapping does not cover.
pub fn complete_inputs_mapping_by_default_value(
    flow_inputs: &IndexMap<String, FlowInputDefinition>,
    inputs_mapping: &IndexMap<String, Value>,
) -> IndexMap<String, Value> {
    let mut result: IndexMap<String, Value> = flow_inputs
        .iter()
        .filter(|(_, definition)| definition.default.is_none())
        .map(|(key, _)| {
            (
                key.clone(),
                Value::String(format!("${{{}.{}}}", DEFAULT_DATA_SOURCE, key)),
            )
        })
        .collect();
    result.extend(inputs_mapping.iter().map(|(k, v)| (k.clone(), v.clone())));
    result
}

fn reference_of(value: &Value) -> Option<&str> {
    value
        .as_str()?
        .strip_prefix("${")?
        .strip_suffix('}')
}

/// Resolve `source.column` with the shortest matching source name, so that
/// both `data.question` and `run.outputs.answer` resolve.
fn lookup<'a>(inputs: &'a IndexMap<String, Value>, reference: &str) -> Option<&'a Value> {
    let parts: Vec<&str> = reference.split('.').collect();
    for split in 1..parts.len() {
        let source = parts[..split].join(".");
        let column = parts[split..].join(".");
        if let Some(row) = inputs.get(&source).and_then(Value::as_object) {
            if let Some(value) = row.get(&column) {
                return Some(value);
            }
        }
    }
    None
}

/// Load the rows of a `.jsonl` or `.json` file. A JSON file holding one
/// object yields a single row.
pub fn load_data(path: &Path, max_rows: Option<usize>) -> Result<Vec<Value>, InputMappingError> {
    let invalid = |error: String| InputMappingError::InvalidInputData {
        path: path.display().to_string(),
        error,
    };
    let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let is_jsonl = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("jsonl"))
        .unwrap_or(false);

    let mut rows = Vec::new();
    if is_jsonl {
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let row: serde_json::Value = serde_json::from_str(line).map_err(|e| invalid(e.to_string()))?;
            rows.push(Value::from(row));
        }
    } else {
        match serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))? {
            serde_json::Value::Array(items) => rows.extend(items.into_iter().map(Value::from)),
            other => rows.push(Value::from(other)),
        }
    }
    if let Some(max) = max_rows {
        rows.truncate(max);
    }
    Ok(rows)
}

/// Turns batch input files into validated per-line flow inputs
pub struct BatchInputsProcessor {
    working_dir: PathBuf,
    flow_inputs: IndexMap<String, FlowInputDefinition>,
    max_lines_count: Option<usize>,
    multimedia: MultimediaProcessor,
}

impl BatchInputsProcessor {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        flow_inputs: IndexMap<String, FlowInputDefinition>,
        multimedia: MultimediaProcessor,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            flow_inputs,
            max_lines_count: None,
            multimedia,
        }
    }

    pub fn with_max_lines_count(mut self, max: usize) -> Self {
        self.max_lines_count = Some(max);
        self
    }

    /// Load every input source and map it into one input dict per line.
    pub fn process_batch_inputs(
        &self,
        input_dirs: &IndexMap<String, PathBuf>,
        inputs_mapping: &IndexMap<String, Value>,
    ) -> Result<Vec<IndexMap<String, Value>>, InputMappingError> {
        let input_dicts = self.resolve_input_data(input_dirs)?;
        if input_dicts.values().all(Vec::is_empty) {
            let input_dirs = input_dirs
                .iter()
                .map(|(key, path)| format!("{}: {}", key, path.display()))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(InputMappingError::EmptyInputsData { input_dirs });
        }
        self.apply_inputs_mapping_for_all_lines(&input_dicts, inputs_mapping)
    }

    pub fn apply_inputs_mapping_for_all_lines(
        &self,
        input_dicts: &IndexMap<String, Vec<Value>>,
        inputs_mapping: &IndexMap<String, Value>,
    ) -> Result<Vec<IndexMap<String, Value>>, InputMappingError> {
        if inputs_mapping.is_empty() {
            tracing::warn!("Starting run without column mapping may lead to unexpected results.");
        }
        let inputs_mapping = complete_inputs_mapping_by_default_value(&self.flow_inputs, inputs_mapping);
        let merged = merge_input_dicts_by_line(input_dicts)?;
        if merged.is_empty() {
            return Err(InputMappingError::NoCompleteLine);
        }
        merged
            .iter()
            .map(|line| apply_inputs_mapping(line, &inputs_mapping))
            .collect()
    }

    fn resolve_input_data(
        &self,
        input_dirs: &IndexMap<String, PathBuf>,
    ) -> Result<IndexMap<String, Vec<Value>>, InputMappingError> {
        let mut result = IndexMap::new();
        for (input_key, input_dir) in input_dirs {
            let input_dir = if input_dir.is_absolute() {
                input_dir.clone()
            } else {
                self.working_dir.join(input_dir)
            };
            result.insert(input_key.clone(), self.resolve_data_from_input_path(&input_dir)?);
        }
        Ok(result)
    }

    fn resolve_data_from_input_path(&self, input_path: &Path) -> Result<Vec<Value>, InputMappingError> {
        let files = if input_path.is_file() {
            vec![input_path.to_path_buf()]
        } else {
            let mut files = Vec::new();
            collect_data_files(input_path, &mut files);
            files
        };

        let mut result = Vec::new();
        for file in files {
            let rows = load_data(&file, self.max_lines_count)?;
            result.extend(rows.into_iter().map(|row| self.multimedia.resolve_paths(&file, row)));
            if self.max_lines_count.is_some_and(|max| result.len() >= max) {
                break;
            }
        }
        if let Some(max) = self.max_lines_count {
            if result.len() >= max {
                tracing::warn!(
                    "The data provided exceeds the maximum lines limit. Currently, only the first {} lines are processed.",
                    max
                );
                result.truncate(max);
            }
        }
        Ok(result)
    }
}

fn collect_data_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_data_files(&path, files);
            continue;
        }
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jsonl") || e.eq_ignore_ascii_case("json"));
        if supported {
            files.push(path);
        } else {
            tracing::debug!("Skip unsupported input file {}", path.display());
        }
    }
}
