use crate::dag::{parse_node_property, parse_value, DagManager};
use crate::resolver::{ResolvedTool, ToolResolver};
use crate::run_tracker::RunTracker;
use crate::scheduler::{FlowNodesScheduler, LineContext};
use crate::storage::{DummyRunStorage, RunStorage};
use crate::tools_manager::ToolsManager;
use crate::validator::FlowValidator;
use indexmap::{IndexMap, IndexSet};
use pfcore::{
    AggregationResult, ConnectionProvider, ExecutionError, Flow, FlowError, InputAssignment, LineResult,
    MultimediaProcessor, Node, RunInfo, ToolSourceType, ValidationError, Value,
};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default number of nodes of one line that may run at once
pub const DEFAULT_NODE_CONCURRENCY: usize = 16;

/// Default per-line timeout
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(600);

const LINE_NUMBER_KEY: &str = "line_number";

/// Options for [`FlowExecutor::create`]
#[derive(Clone)]
pub struct ExecutorOptions {
    /// Return errors from `exec_line` instead of recording them in a failed line
    pub raise_ex: bool,
    /// Run one node with a named variant instead of its default
    pub variant: Option<(String, String)>,
    /// Input overrides keyed `<node>.<input>`
    pub node_override: IndexMap<String, Value>,
    pub line_timeout: Duration,
    pub node_concurrency: usize,
    pub storage: Arc<dyn RunStorage>,
    pub tools_manager: Arc<RwLock<ToolsManager>>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            raise_ex: true,
            variant: None,
            node_override: IndexMap::new(),
            line_timeout: DEFAULT_LINE_TIMEOUT,
            node_concurrency: DEFAULT_NODE_CONCURRENCY,
            storage: Arc::new(DummyRunStorage),
            tools_manager: Arc::new(RwLock::new(ToolsManager::new())),
        }
    }
}

impl ExecutorOptions {
    pub fn with_raise_ex(mut self, raise_ex: bool) -> Self {
        self.raise_ex = raise_ex;
        self
    }

    pub fn with_variant(mut self, node: impl Into<String>, variant_id: impl Into<String>) -> Self {
        self.variant = Some((node.into(), variant_id.into()));
        self
    }

    pub fn with_node_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.node_override.insert(key.into(), value.into());
        self
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    pub fn with_node_concurrency(mut self, n: usize) -> Self {
        self.node_concurrency = n.max(1);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_tools_manager(mut self, tools_manager: Arc<RwLock<ToolsManager>>) -> Self {
        self.tools_manager = tools_manager;
        self
    }
}

/// Per-call options for [`FlowExecutor::exec_line_with_options`]
#[derive(Debug, Clone)]
pub struct LineOptions {
    pub validate_inputs: bool,
    /// Keep streaming outputs as [`Value::Stream`] instead of joining them
    pub allow_generator_output: bool,
    /// Overrides the executor's line timeout
    pub line_timeout: Option<Duration>,
}

impl Default for LineOptions {
    fn default() -> Self {
        Self {
            validate_inputs: true,
            allow_generator_output: false,
            line_timeout: None,
        }
    }
}

/// Executes lines and aggregations of one validated, resolved flow.
///
/// An executor is immutable once created; concurrent `exec_line_async`
/// calls are scheduled independently and share only the run tracker.
pub struct FlowExecutor {
    flow: Flow,
    tools: Arc<IndexMap<String, ResolvedTool>>,
    run_tracker: Arc<RunTracker>,
    multimedia: MultimediaProcessor,
    working_dir: PathBuf,
    raise_ex: bool,
    line_timeout: Duration,
    node_concurrency: usize,
}

impl FlowExecutor {
    /// Load a flow file and build an executor for it.
    pub async fn create(
        flow_file: &Path,
        connections: Arc<dyn ConnectionProvider>,
        working_dir: Option<&Path>,
        options: ExecutorOptions,
    ) -> Result<Self, FlowError> {
        let (flow, working_dir) = match working_dir {
            Some(dir) => (Flow::load(flow_file, Some(dir))?, dir.to_path_buf()),
            None => {
                let dir = flow_file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (Flow::load(flow_file, None)?, dir)
            }
        };
        Self::create_from_flow(flow, connections, &working_dir, options).await
    }

    /// Build an executor from an already loaded flow.
    pub async fn create_from_flow(
        mut flow: Flow,
        connections: Arc<dyn ConnectionProvider>,
        working_dir: &Path,
        options: ExecutorOptions,
    ) -> Result<Self, FlowError> {
        tracing::info!("Creating flow executor for flow {} in {}", flow.name, working_dir.display());
        if let Some((node, variant_id)) = &options.variant {
            flow.apply_node_variant(node, variant_id)?;
        }
        apply_node_overrides(&mut flow, &options.node_override);

        let mut flow = FlowValidator::validate(&flow)?.into_owned();
        let multimedia = MultimediaProcessor::create(Some(flow.message_format.as_str()))?.with_working_dir(working_dir);

        let package_tool_keys: Vec<String> = flow
            .nodes
            .iter()
            .filter(|n| n.source_type() == Some(ToolSourceType::Package))
            .filter_map(|n| n.source.as_ref().and_then(|s| s.tool.clone()))
            .collect();
        let resolver = ToolResolver::new(
            working_dir,
            connections,
            options.tools_manager.clone(),
            Some(&package_tool_keys),
            multimedia.clone(),
        )
        .with_flow_tools(flow.tools.clone());

        let mut tools = IndexMap::new();
        for node in &flow.nodes {
            let resolved = resolver.resolve_tool_by_node(node, true).await?;
            tracing::debug!("Resolved node {} to {}", node.name, resolved.callable.describe());
            tools.insert(node.name.clone(), resolved);
        }
        flow.nodes = tools.values().map(|t| t.node.clone()).collect();

        Ok(Self {
            flow,
            tools: Arc::new(tools),
            run_tracker: Arc::new(RunTracker::new(options.storage)),
            multimedia,
            working_dir: working_dir.to_path_buf(),
            raise_ex: options.raise_ex,
            line_timeout: options.line_timeout,
            node_concurrency: options.node_concurrency.max(1),
        })
    }

    /// The validated flow with resolved nodes
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn run_tracker(&self) -> &Arc<RunTracker> {
        &self.run_tracker
    }

    pub fn has_aggregation_node(&self) -> bool {
        self.flow.has_aggregation_node()
    }

    pub fn aggregation_nodes(&self) -> Vec<&str> {
        self.flow
            .nodes
            .iter()
            .filter(|n| n.aggregation)
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn get_status_summary(&self, run_id: &str) -> IndexMap<String, usize> {
        self.run_tracker.get_status_summary(run_id)
    }

    /// Execute one line, blocking the calling thread.
    pub fn exec_line(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: Option<&str>,
    ) -> Result<LineResult, FlowError> {
        block_on(self.exec_line_async(inputs, index, run_id))?
    }

    pub async fn exec_line_async(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: Option<&str>,
    ) -> Result<LineResult, FlowError> {
        self.exec_line_with_options(inputs, index, run_id, LineOptions::default())
            .await
    }

    /// Execute one line and return only its outputs.
    pub async fn exec(&self, inputs: IndexMap<String, Value>) -> Result<IndexMap<String, Value>, FlowError> {
        let result = self.exec_line_async(inputs, None, None).await?;
        Ok(result.output)
    }

    pub async fn exec_line_with_options(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: Option<&str>,
        options: LineOptions,
    ) -> Result<LineResult, FlowError> {
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let line_run_id = match index {
            Some(i) => format!("{}_{}", run_id, i),
            None => run_id.clone(),
        };
        let inputs = FlowValidator::apply_default_value_for_input(&self.flow.inputs, &inputs);
        self.run_tracker
            .start_flow_run(&self.flow.id, &run_id, &line_run_id, &run_id, inputs.clone(), index);
        tracing::info!("Start executing line {:?}, line run id: {}", index, line_run_id);

        let result = self
            .exec_line_inner(inputs, index, &run_id, &line_run_id, &options)
            .await;
        let (output, aggregation_inputs, error) = match result {
            Ok((output, aggregation_inputs)) => (output, aggregation_inputs, None),
            Err(e) => {
                tracing::error!("Line {:?} of run {} failed: {}", index, run_id, e);
                self.run_tracker.end_flow_run(&line_run_id, Err(&e));
                (IndexMap::new(), IndexMap::new(), Some(e))
            }
        };

        self.run_tracker.update_flow_run_info_with_node_runs(&line_run_id);
        let run_info = self
            .run_tracker
            .get_flow_run(&line_run_id)
            .ok_or_else(|| ExecutionError::NotSupported {
                message: format!("Line run {} is not tracked.", line_run_id),
            })?;
        self.run_tracker.persist_flow_run(&run_info)?;

        if let Some(e) = error {
            if self.raise_ex {
                return Err(e);
            }
        }
        let node_run_infos = self
            .run_tracker
            .collect_child_node_runs(&line_run_id)
            .into_iter()
            .map(|info| (info.node.clone(), info))
            .collect();
        Ok(LineResult {
            output,
            aggregation_inputs,
            run_info,
            node_run_infos,
        })
    }

    async fn exec_line_inner(
        &self,
        inputs: IndexMap<String, Value>,
        index: Option<usize>,
        run_id: &str,
        line_run_id: &str,
        options: &LineOptions,
    ) -> Result<(IndexMap<String, Value>, IndexMap<String, Value>), FlowError> {
        let inputs = if options.validate_inputs {
            FlowValidator::ensure_flow_inputs_type(&self.flow, &inputs, index)?
        } else {
            inputs
        };
        let inputs = self
            .multimedia
            .load_multimedia_data(&self.flow.input_types(), inputs)
            .await?;
        self.run_tracker.set_inputs(line_run_id, inputs.clone());

        let stream_nodes = if options.allow_generator_output {
            self.streaming_nodes()
        } else {
            HashSet::new()
        };
        let context = LineContext {
            tracker: self.run_tracker.clone(),
            run_id: run_id.to_string(),
            parent_run_id: line_run_id.to_string(),
            line_number: index,
            stream_nodes: Arc::new(stream_nodes),
        };
        let nodes: Vec<Node> = self.flow.nodes.iter().filter(|n| !n.aggregation).cloned().collect();
        let scheduler = FlowNodesScheduler::new(self.tools.clone(), self.node_concurrency, context);

        let timeout = options.line_timeout.unwrap_or(self.line_timeout);
        let (nodes_outputs, bypassed) = match tokio::time::timeout(timeout, scheduler.execute(nodes, inputs.clone())).await
        {
            Ok(result) => result?,
            Err(_) => {
                let err = ExecutionError::LineExecutionTimeout {
                    line_number: index.unwrap_or(0),
                    timeout: timeout.as_secs(),
                };
                self.run_tracker.cancel_node_runs(line_run_id, &err);
                return Err(err.into());
            }
        };

        let mut output = self.extract_outputs(&nodes_outputs, &bypassed, &inputs)?;
        if !options.allow_generator_output {
            for value in output.values_mut() {
                if let Value::Stream(stream) = value {
                    *value = Value::String(stream.join().await);
                }
            }
            self.run_tracker.update_and_persist_generator_node_runs(line_run_id)?;
        }
        let aggregation_inputs = extract_aggregation_inputs(&self.flow, &nodes_outputs)?;
        self.run_tracker.end_flow_run(line_run_id, Ok(&output));
        Ok((output, aggregation_inputs))
    }

    /// LLM nodes whose output goes straight to a flow output.
    fn streaming_nodes(&self) -> HashSet<String> {
        self.flow
            .nodes
            .iter()
            .filter(|n| {
                self.flow.is_llm_node(n)
                    && self.flow.is_referenced_by_flow_output(n)
                    && !self.flow.is_referenced_by_other_node(n)
            })
            .map(|n| n.name.clone())
            .collect()
    }

    fn extract_outputs(
        &self,
        nodes_outputs: &IndexMap<String, Value>,
        bypassed_nodes: &IndexSet<String>,
        flow_inputs: &IndexMap<String, Value>,
    ) -> Result<IndexMap<String, Value>, ExecutionError> {
        let mut outputs = IndexMap::new();
        for (name, definition) in &self.flow.outputs {
            let (node_name, property) = match &definition.reference {
                InputAssignment::NodeReference { node, property, .. } => (node, property),
                reference => {
                    outputs.insert(name.clone(), parse_value(reference, nodes_outputs, flow_inputs)?);
                    continue;
                }
            };
            let node = self
                .flow
                .get_node(node_name)
                .ok_or_else(|| ExecutionError::OutputReferenceNotExist {
                    output_name: name.clone(),
                    node_name: node_name.clone(),
                })?;
            if node.aggregation {
                continue;
            }
            let node_result = nodes_outputs
                .get(node_name)
                .ok_or_else(|| ExecutionError::NodeOutputNotFound {
                    output_name: name.clone(),
                    node_name: node_name.clone(),
                })?;
            if bypassed_nodes.contains(node_name) {
                tracing::warn!(
                    "The node referenced by output:'{}' is bypassed, which is not recommended.",
                    node_name
                );
                outputs.insert(name.clone(), Value::Null);
                continue;
            }
            outputs.insert(
                name.clone(),
                parse_node_property(node_name, node_result, property.as_deref())?,
            );
        }
        Ok(outputs)
    }

    /// Run the aggregation nodes once over a whole batch.
    ///
    /// `inputs` holds one list per flow input and `aggregation_inputs` one
    /// list per aggregation reference, e.g. `${grade.output}`. Node failures
    /// are recorded in the returned node runs unless the executor raises.
    pub async fn exec_aggregation(
        &self,
        inputs: IndexMap<String, Value>,
        aggregation_inputs: IndexMap<String, Value>,
        run_id: Option<&str>,
    ) -> Result<AggregationResult, FlowError> {
        if !self.flow.has_aggregation_node() {
            return Ok(AggregationResult::default());
        }
        FlowValidator::validate_aggregation_inputs(&inputs, &aggregation_inputs)?;
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::info!("Executing aggregation nodes of run {}", run_id);

        let mut aggregated: IndexMap<String, Vec<Value>> = inputs
            .into_iter()
            .map(|(k, v)| match v {
                Value::Array(items) => (k, items),
                other => (k, vec![other]),
            })
            .collect();
        let line_count = aggregated
            .values()
            .next()
            .map(Vec::len)
            .or_else(|| aggregation_inputs.values().next().and_then(Value::as_array).map(Vec::len))
            .unwrap_or(1);
        for (key, definition) in &self.flow.inputs {
            if let (false, Some(default)) = (aggregated.contains_key(key), &definition.default) {
                aggregated.insert(key.clone(), vec![default.clone(); line_count]);
            }
        }
        for (key, values) in FlowValidator::resolve_aggregated_flow_inputs_type(&self.flow, &aggregated)? {
            aggregated.insert(key, values);
        }
        let flow_inputs: IndexMap<String, Value> = aggregated
            .into_iter()
            .map(|(k, v)| (k, Value::Array(v)))
            .collect();
        let flow_inputs = self
            .multimedia
            .load_multimedia_data(&self.flow.input_types(), flow_inputs)
            .await?;
        let mut loaded_aggregation_inputs = IndexMap::with_capacity(aggregation_inputs.len());
        for (key, value) in aggregation_inputs {
            loaded_aggregation_inputs.insert(key, self.multimedia.load_recursively(value).await?);
        }

        let nodes: Vec<Node> = self
            .flow
            .nodes
            .iter()
            .filter(|n| n.aggregation)
            .map(|n| with_aggregation_inputs(n, &loaded_aggregation_inputs))
            .collect();
        let context = LineContext {
            tracker: self.run_tracker.clone(),
            run_id: run_id.clone(),
            parent_run_id: run_id.clone(),
            line_number: None,
            stream_nodes: Arc::new(HashSet::new()),
        };
        let scheduler = FlowNodesScheduler::new(self.tools.clone(), self.node_concurrency, context);
        if let Err(e) = scheduler.execute(nodes, flow_inputs).await {
            tracing::error!("Aggregation of run {} failed: {}", run_id, e);
            if self.raise_ex {
                return Err(e);
            }
        }

        let node_run_infos: IndexMap<String, RunInfo> = self
            .run_tracker
            .collect_child_node_runs(&run_id)
            .into_iter()
            .map(|info| (info.node.clone(), info))
            .collect();
        let metrics = node_run_infos
            .values()
            .filter_map(|info| info.metrics.clone())
            .flatten()
            .collect();
        Ok(AggregationResult {
            output: IndexMap::new(),
            metrics,
            node_run_infos,
        })
    }
}

/// Replace node references the batch already collected with literals.
fn with_aggregation_inputs(node: &Node, aggregation_inputs: &IndexMap<String, Value>) -> Node {
    let mut node = node.clone();
    for assignment in node.inputs.values_mut() {
        replace_collected_reference(assignment, aggregation_inputs);
    }
    if let Some(activate) = node.activate.as_mut() {
        replace_collected_reference(&mut activate.when, aggregation_inputs);
    }
    if let Some(skip) = node.skip.as_mut() {
        replace_collected_reference(&mut skip.when, aggregation_inputs);
        replace_collected_reference(&mut skip.return_value, aggregation_inputs);
    }
    node
}

fn replace_collected_reference(assignment: &mut InputAssignment, aggregation_inputs: &IndexMap<String, Value>) {
    if !matches!(assignment, InputAssignment::NodeReference { .. }) {
        return;
    }
    if let Some(value) = aggregation_inputs.get(&assignment.to_string()) {
        *assignment = InputAssignment::Literal(value.clone());
    }
}

/// Values of the normal-node references read by aggregation nodes, keyed by
/// the reference text (e.g. `${grade.output}`).
pub fn extract_aggregation_inputs(
    flow: &Flow,
    nodes_outputs: &IndexMap<String, Value>,
) -> Result<IndexMap<String, Value>, ExecutionError> {
    let mut aggregation_inputs = IndexMap::new();
    let no_inputs = IndexMap::new();
    for node in flow.nodes.iter().filter(|n| n.aggregation) {
        for assignment in node.all_assignments() {
            let Some(dependency) = assignment.referenced_node() else {
                continue;
            };
            if !flow.is_normal_node(dependency) {
                continue;
            }
            let value = parse_value(assignment, nodes_outputs, &no_inputs)?;
            aggregation_inputs.insert(assignment.to_string(), value);
        }
    }
    Ok(aggregation_inputs)
}

fn apply_node_overrides(flow: &mut Flow, overrides: &IndexMap<String, Value>) {
    for (key, value) in overrides {
        let Some((node_name, input)) = key.split_once('.') else {
            tracing::warn!("Ignore node override '{}': expected '<node>.<input>'", key);
            continue;
        };
        match flow.nodes.iter_mut().find(|n| n.name == node_name) {
            Some(node) => {
                node.inputs.insert(input.to_string(), InputAssignment::parse(value));
            }
            None => tracing::warn!("Ignore node override '{}': node '{}' not found", key, node_name),
        }
    }
}

/// Drive `fut` to completion from synchronous code, inside or outside a
/// tokio runtime.
fn block_on<F>(fut: F) -> Result<F::Output, FlowError>
where
    F: Future + Send,
    F::Output: Send,
{
    let build = || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    };
    if tokio::runtime::Handle::try_current().is_err() {
        return Ok(build()?.block_on(fut));
    }
    let joined = std::thread::scope(|scope| scope.spawn(|| build().map(|rt| rt.block_on(fut))).join());
    match joined {
        Ok(output) => output.map_err(FlowError::from),
        Err(_) => Err(ExecutionError::NotSupported {
            message: "The line execution thread panicked.".to_string(),
        }
        .into()),
    }
}

/// Execute a single node of a flow with the given flow inputs and
/// dependency outputs, as `pf test --node` does.
#[allow(clippy::too_many_arguments)]
pub async fn load_and_exec_node(
    flow_file: &Path,
    node_name: &str,
    flow_inputs: IndexMap<String, Value>,
    dependency_nodes_outputs: IndexMap<String, Value>,
    connections: Arc<dyn ConnectionProvider>,
    working_dir: Option<&Path>,
    options: ExecutorOptions,
) -> Result<RunInfo, FlowError> {
    let working_dir = working_dir
        .map(Path::to_path_buf)
        .or_else(|| flow_file.parent().map(Path::to_path_buf))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut flow = Flow::load(flow_file, None)?;
    if let Some((node, variant_id)) = &options.variant {
        flow.apply_node_variant(node, variant_id)?;
    }
    let node = flow
        .get_node(node_name)
        .cloned()
        .ok_or_else(|| ValidationError::SingleNodeValidation {
            message: format!("Node name '{}' not found in flow.", node_name),
        })?;
    if node.source.is_none() || node.node_type.is_none() {
        return Err(ValidationError::SingleNodeValidation {
            message: format!("Property source and type are required for node '{}'.", node_name),
        }
        .into());
    }

    // Aggregation nodes read lists
    let wrap = |values: IndexMap<String, Value>| -> IndexMap<String, Value> {
        if !node.aggregation {
            return values;
        }
        values.into_iter().map(|(k, v)| (k, Value::Array(vec![v]))).collect()
    };
    let flow_inputs = if node.aggregation {
        wrap(flow_inputs)
    } else {
        let referenced: HashSet<&str> = node
            .all_assignments()
            .into_iter()
            .filter_map(|a| match a {
                InputAssignment::FlowInput { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        let inputs: IndexMap<String, Value> = flow_inputs
            .into_iter()
            .filter(|(k, _)| referenced.contains(k.as_str()))
            .collect();
        FlowValidator::resolve_flow_inputs_type(&flow, &inputs, None)?
    };
    let dependency_nodes_outputs = wrap(dependency_nodes_outputs);

    let multimedia = MultimediaProcessor::create(Some(flow.message_format.as_str()))?.with_working_dir(&working_dir);
    let package_tool_keys: Vec<String> = node
        .source
        .as_ref()
        .filter(|s| s.source_type == ToolSourceType::Package)
        .and_then(|s| s.tool.clone())
        .into_iter()
        .collect();
    let resolver = ToolResolver::new(
        &working_dir,
        connections,
        options.tools_manager.clone(),
        Some(&package_tool_keys),
        multimedia.clone(),
    )
    .with_flow_tools(flow.tools.clone());
    let resolved = resolver.resolve_tool_by_node(&node, true).await?;

    let flow_inputs = multimedia.load_multimedia_data(&flow.input_types(), flow_inputs).await?;
    let mut dag = DagManager::new(Vec::new(), flow_inputs);
    dag.complete_nodes(dependency_nodes_outputs);
    let inputs = dag.get_node_valid_inputs(&resolved.node, resolved.definition.as_ref())?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let tracker = Arc::new(RunTracker::new(options.storage.clone()));
    let context = LineContext {
        tracker: tracker.clone(),
        run_id: run_id.clone(),
        parent_run_id: run_id.clone(),
        line_number: None,
        stream_nodes: Arc::new(HashSet::new()),
    };
    let result = context
        .invoke_node(&node.name, node.aggregation, resolved.callable.clone(), inputs)
        .await;
    if let Err(e) = result {
        if options.raise_ex {
            return Err(e);
        }
    }
    tracker
        .collect_child_node_runs(&run_id)
        .into_iter()
        .next()
        .ok_or_else(|| {
            ExecutionError::NotSupported {
                message: format!("No run recorded for node '{}'.", node_name),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools_manager::{RegisteredTool, ToolFactory};
    use pfcore::{
        Callable, ConnectionStore, FlowInputDefinition, FnTool, InputDefinition, Tool, ToolContext, ToolError,
        ToolType, ValueType,
    };
    use pfcore::Status;
    use serde_json::json;

    struct FnFactory<F>(F);

    impl<F> ToolFactory for FnFactory<F>
    where
        F: Fn() -> Arc<dyn Callable> + Send + Sync,
    {
        fn create(&self, _init_args: &IndexMap<String, Value>) -> Result<Arc<dyn Callable>, ToolError> {
            Ok((self.0)())
        }
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl Callable for SlowTool {
        async fn call(&self, _ctx: &ToolContext, _args: IndexMap<String, Value>) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct NapTool;

    #[async_trait::async_trait]
    impl Callable for NapTool {
        async fn call(&self, _ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::from(ToolContext::require_str(&args, "text")?))
        }
    }

    struct MeanTool;

    #[async_trait::async_trait]
    impl Callable for MeanTool {
        async fn call(&self, ctx: &ToolContext, args: IndexMap<String, Value>) -> Result<Value, ToolError> {
            let scores = ToolContext::require(&args, "scores")?
                .as_array()
                .cloned()
                .unwrap_or_default();
            let total: f64 = scores.iter().filter_map(Value::as_f64).sum();
            let mean = total / scores.len().max(1) as f64;
            ctx.log_metric("mean", mean);
            Ok(Value::from(mean))
        }
    }

    fn register(manager: &mut ToolsManager, key: &str, make: impl Fn() -> Arc<dyn Callable> + Send + Sync + 'static) {
        let tool = Tool::new(key, ToolType::Python)
            .with_input("text", InputDefinition::of(ValueType::String))
            .with_input("suffix", InputDefinition::of(ValueType::String).with_default("!"));
        manager.register_builtin(key, RegisteredTool::new(tool, Arc::new(FnFactory(make))));
    }

    fn tools_manager() -> Arc<RwLock<ToolsManager>> {
        let mut manager = ToolsManager::new();
        register(&mut manager, "upper.py", || {
            Arc::new(FnTool::new("upper", |args| {
                let text = ToolContext::require_str(&args, "text")?;
                Ok(Value::from(text.to_uppercase()))
            }))
        });
        register(&mut manager, "concat.py", || {
            Arc::new(FnTool::new("concat", |args| {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                let suffix = args.get("suffix").and_then(Value::as_str).unwrap_or("!");
                Ok(Value::from(format!("{}{}", text, suffix)))
            }))
        });
        register(&mut manager, "fail.py", || {
            Arc::new(FnTool::new("fail", |_| Err(ToolError::ExecutionFailed("boom".to_string()))))
        });
        register(&mut manager, "slow.py", || Arc::new(SlowTool));
        register(&mut manager, "nap.py", || Arc::new(NapTool));
        register(&mut manager, "mean.py", || Arc::new(MeanTool));
        Arc::new(RwLock::new(manager))
    }

    fn script(name: &str, path: &str) -> Node {
        Node::new(name, ToolType::Python).with_source(ToolSourceType::Code, None, Some(path))
    }

    fn flow() -> Flow {
        let mut flow = Flow::new("test_flow");
        flow.add_input("text", FlowInputDefinition::new(ValueType::String));
        flow.add_node(script("upper", "upper.py").with_input("text", "${inputs.text}"));
        flow.add_node(script("shout", "concat.py").with_input("text", "${upper.output}"));
        flow.add_output("answer", "${shout.output}");
        flow
    }

    async fn executor(flow: Flow, options: ExecutorOptions) -> FlowExecutor {
        let options = options.with_tools_manager(tools_manager());
        FlowExecutor::create_from_flow(flow, Arc::new(ConnectionStore::new()), Path::new("."), options)
            .await
            .unwrap()
    }

    fn inputs(text: &str) -> IndexMap<String, Value> {
        IndexMap::from([("text".to_string(), Value::from(text))])
    }

    #[tokio::test]
    async fn test_exec_line_runs_nodes_in_order() {
        let executor = executor(flow(), ExecutorOptions::default()).await;
        let result = executor.exec_line_async(inputs("hi"), Some(0), Some("run")).await.unwrap();

        assert_eq!(result.output["answer"], Value::from("HI!"));
        assert_eq!(result.run_info.status, Status::Completed);
        assert_eq!(result.run_info.run_id, "run_0");
        assert_eq!(result.node_run_infos["upper"].run_id, "run_upper_0");
        assert_eq!(result.node_run_infos["shout"].parent_run_id, "run_0");
    }

    #[tokio::test]
    async fn test_node_failure_fails_line_without_raise() {
        let mut flow = flow();
        flow.nodes[1] = script("shout", "fail.py").with_input("text", "${upper.output}");
        let executor = executor(flow, ExecutorOptions::default().with_raise_ex(false)).await;

        let result = executor.exec_line_async(inputs("hi"), Some(2), Some("run")).await.unwrap();
        assert_eq!(result.run_info.status, Status::Failed);
        assert!(result.output.is_empty());
        let failed = &result.node_run_infos["shout"];
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(failed.error.as_ref().unwrap()["code"], "UserError");
        assert_eq!(result.node_run_infos["upper"].status, Status::Completed);
    }

    #[tokio::test]
    async fn test_node_failure_raises_by_default() {
        let mut flow = flow();
        flow.nodes[1] = script("shout", "fail.py").with_input("text", "${upper.output}");
        let executor = executor(flow, ExecutorOptions::default()).await;

        let err = executor.exec_line_async(inputs("hi"), None, None).await.unwrap_err();
        assert!(matches!(err, FlowError::Execution(ExecutionError::ToolExecution { ref node_name, .. }) if node_name == "shout"));
    }

    #[tokio::test]
    async fn test_missing_input_is_validation_error() {
        let executor = executor(flow(), ExecutorOptions::default()).await;
        let err = executor.exec(IndexMap::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(ValidationError::InputNotFound { .. })));
    }

    #[tokio::test]
    async fn test_activate_bypasses_node_and_output_is_null() {
        let mut flow = flow();
        flow.nodes[1] = script("shout", "concat.py")
            .with_input("text", "${upper.output}")
            .with_activate("${upper.output}", "NEVER");
        flow.add_node(script("after", "concat.py").with_input("text", "${shout.output}"));
        flow.add_output("after", "${after.output}");
        let executor = executor(flow, ExecutorOptions::default()).await;

        let result = executor.exec_line_async(inputs("hi"), Some(0), None).await.unwrap();
        assert_eq!(result.output["answer"], Value::Null);
        assert_eq!(result.output["after"], Value::Null);
        assert_eq!(result.node_run_infos["shout"].status, Status::Bypassed);
        assert_eq!(result.node_run_infos["after"].status, Status::Bypassed);
    }

    #[tokio::test]
    async fn test_skip_uses_return_value() {
        let mut flow = flow();
        flow.nodes[1] = script("shout", "concat.py")
            .with_input("text", "${upper.output}")
            .with_skip("${inputs.text}", "skip", "skipped");
        let executor = executor(flow, ExecutorOptions::default()).await;

        let result = executor.exec_line_async(inputs("skip"), Some(0), None).await.unwrap();
        assert_eq!(result.output["answer"], Value::from("skipped"));
        assert_eq!(result.node_run_infos["shout"].status, Status::Bypassed);
        assert_eq!(result.node_run_infos["shout"].output, Value::from("skipped"));
    }

    #[tokio::test]
    async fn test_line_timeout_cancels_running_nodes() {
        let mut flow = flow();
        flow.nodes[1] = script("shout", "slow.py").with_input("text", "${upper.output}");
        let options = ExecutorOptions::default()
            .with_raise_ex(false)
            .with_line_timeout(Duration::from_millis(200));
        let executor = executor(flow, options).await;

        let result = executor.exec_line_async(inputs("hi"), Some(1), Some("run")).await.unwrap();
        assert_eq!(result.run_info.status, Status::Failed);
        let error = result.run_info.error.as_ref().unwrap();
        assert_eq!(error["debugInfo"]["type"], "LineExecutionTimeoutError");
        assert_eq!(result.node_run_infos["shout"].status, Status::Canceled);
    }

    #[tokio::test]
    async fn test_concurrent_lines_share_executor() {
        let mut flow = flow();
        flow.nodes[1] = script("shout", "nap.py").with_input("text", "${upper.output}");
        let executor = executor(flow, ExecutorOptions::default()).await;

        let start = std::time::Instant::now();
        let timed = |text: &'static str, index: usize| {
            let executor = &executor;
            async move {
                let result = executor.exec_line_async(inputs(text), Some(index), Some("run")).await;
                (result, start.elapsed())
            }
        };
        let ((a, a_elapsed), (b, b_elapsed)) = tokio::join!(timed("a", 0), timed("b", 1));

        assert_eq!(a.unwrap().output["answer"], Value::from("A"));
        assert_eq!(b.unwrap().output["answer"], Value::from("B"));
        assert!(a_elapsed >= Duration::from_millis(300));
        assert!(a_elapsed < Duration::from_millis(550), "first line took {:?}", a_elapsed);
        assert!(b_elapsed < Duration::from_millis(550), "second line took {:?}", b_elapsed);
        let skew = if a_elapsed > b_elapsed { a_elapsed - b_elapsed } else { b_elapsed - a_elapsed };
        assert!(skew < Duration::from_millis(150), "skew {:?}", skew);
    }

    #[tokio::test]
    async fn test_aggregation_collects_metrics() {
        let mut flow = flow();
        flow.add_node(
            script("mean", "mean.py")
                .with_input("scores", "${upper.output}")
                .aggregation(),
        );
        let executor = executor(flow, ExecutorOptions::default()).await;

        let line = executor.exec_line_async(inputs("1"), Some(0), Some("run")).await.unwrap();
        assert_eq!(line.aggregation_inputs["${upper.output}"], Value::from("1"));

        let batch_inputs = IndexMap::from([("text".to_string(), Value::from(json!(["1", "3"])))]);
        let aggregation_inputs = IndexMap::from([("${upper.output}".to_string(), Value::from(json!([1.0, 3.0])))]);
        let result = executor
            .exec_aggregation(batch_inputs, aggregation_inputs, Some("run"))
            .await
            .unwrap();
        assert_eq!(result.metrics["mean"], Value::from(2.0));
        assert_eq!(result.node_run_infos["mean"].run_id, "run_mean_reduce");
        assert_eq!(result.node_run_infos["mean"].status, Status::Completed);
    }

    #[tokio::test]
    async fn test_aggregation_length_mismatch() {
        let mut flow = flow();
        flow.add_node(script("mean", "mean.py").with_input("scores", "${upper.output}").aggregation());
        let executor = executor(flow, ExecutorOptions::default()).await;

        let batch_inputs = IndexMap::from([("text".to_string(), Value::from(json!(["1", "3"])))]);
        let aggregation_inputs = IndexMap::from([("${upper.output}".to_string(), Value::from(json!([1.0])))]);
        let err = executor
            .exec_aggregation(batch_inputs, aggregation_inputs, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Aggregation(_)));
    }

    #[test]
    fn test_exec_line_blocking() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = runtime.block_on(executor(flow(), ExecutorOptions::default()));
        let result = executor.exec_line(inputs("sync"), None, None).unwrap();
        assert_eq!(result.output["answer"], Value::from("SYNC!"));
    }

    #[test]
    fn test_node_override_replaces_input() {
        let mut flow = flow();
        let overrides = IndexMap::from([("shout.text".to_string(), Value::from("fixed"))]);
        apply_node_overrides(&mut flow, &overrides);
        assert_eq!(flow.nodes[1].inputs["text"], InputAssignment::literal("fixed"));
    }
}
