use crate::dag::DagManager;
use crate::resolver::ResolvedTool;
use crate::run_tracker::RunTracker;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use indexmap::{IndexMap, IndexSet};
use pfcore::{Callable, ExecutionError, FlowError, Node, ToolContext, ToolError, Value};
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Identity of the line (or aggregation) a node run belongs to
#[derive(Clone)]
pub(crate) struct LineContext {
    pub tracker: Arc<RunTracker>,
    /// Root run id of the batch or single execution
    pub run_id: String,
    /// Line run id; parent of every node run of the line
    pub parent_run_id: String,
    pub line_number: Option<usize>,
    /// LLM nodes asked to stream their output
    pub stream_nodes: Arc<HashSet<String>>,
}

impl LineContext {
    fn node_run_id(&self, node: &str, aggregation: bool) -> String {
        if aggregation {
            return format!("{}_{}_reduce", self.run_id, node);
        }
        match self.line_number {
            Some(line) => format!("{}_{}_{}", self.run_id, node, line),
            None => format!("{}_{}_{}", self.run_id, node, uuid::Uuid::new_v4()),
        }
    }

    /// Record a node that will not run; `output` is its skip return value.
    pub fn bypass_node(&self, node: &Node, output: Option<Value>) {
        let node_run_id = self.node_run_id(&node.name, node.aggregation);
        let info = self.tracker.bypass_node_run(
            &node.name,
            &self.run_id,
            &self.parent_run_id,
            &node_run_id,
            self.line_number,
            output,
        );
        if let Err(e) = self.tracker.persist_node_run(&info) {
            tracing::warn!("Failed to persist node run {}: {}", node_run_id, e);
        }
    }

    /// Run a node's callable and record the run.
    pub async fn invoke_node(
        &self,
        node: &str,
        aggregation: bool,
        callable: Arc<dyn Callable>,
        mut inputs: IndexMap<String, Value>,
    ) -> Result<Value, FlowError> {
        if self.stream_nodes.contains(node) {
            inputs.insert("stream".to_string(), Value::Bool(true));
        }
        let node_run_id = self.node_run_id(node, aggregation);
        tracing::info!("Executing node {}. node run id: {}", node, node_run_id);
        self.tracker
            .start_node_run(node, &self.run_id, &self.parent_run_id, &node_run_id, self.line_number);
        self.tracker.set_inputs(&node_run_id, inputs.clone());

        let ctx = ToolContext::new(node, &node_run_id, self.line_number);
        let start = Instant::now();
        let call = AssertUnwindSafe(callable.call(&ctx, inputs)).catch_unwind().await;
        let result = call
            .unwrap_or_else(|_| Err(ToolError::ExecutionFailed(format!("{} panicked", callable.describe()))))
            .map_err(|source| {
                FlowError::from(ExecutionError::ToolExecution {
                    node_name: node.to_string(),
                    source,
                })
            });

        let info = self
            .tracker
            .end_node_run(&node_run_id, result.as_ref(), ctx.api_calls(), Some(ctx.metrics()));
        if let Some(info) = info {
            if let Err(e) = self.tracker.persist_node_run(&info) {
                tracing::warn!("Failed to persist node run {}: {}", node_run_id, e);
            }
        }
        match &result {
            Ok(_) => tracing::info!("Node {} completes in {}ms.", node, start.elapsed().as_millis()),
            Err(e) => tracing::error!("Node {} fails: {}", node, e),
        }
        result
    }
}

type NodeTask = JoinHandle<(String, Result<Value, FlowError>)>;

/// Running node tasks; whatever is still running when this drops is aborted.
struct RunningNodes(FuturesUnordered<NodeTask>);

impl Drop for RunningNodes {
    fn drop(&mut self) {
        for task in self.0.iter() {
            task.abort();
        }
    }
}

/// Executes the nodes of one line as a DAG with bounded parallelism
pub(crate) struct FlowNodesScheduler {
    tools: Arc<IndexMap<String, ResolvedTool>>,
    node_concurrency: usize,
    context: LineContext,
}

impl FlowNodesScheduler {
    pub fn new(tools: Arc<IndexMap<String, ResolvedTool>>, node_concurrency: usize, context: LineContext) -> Self {
        Self {
            tools,
            node_concurrency: node_concurrency.max(1),
            context,
        }
    }

    /// Run `nodes` to completion. Returns every node's output (null for
    /// bypassed nodes) and the names of the bypassed nodes. The first node
    /// failure aborts the remaining tasks.
    pub async fn execute(
        &self,
        nodes: Vec<Node>,
        inputs: IndexMap<String, Value>,
    ) -> Result<(IndexMap<String, Value>, IndexSet<String>), FlowError> {
        let mut dag = DagManager::new(nodes, inputs);
        let mut running = RunningNodes(FuturesUnordered::new());
        let mut queued: VecDeque<Node> = VecDeque::new();

        loop {
            let mut progressed = false;
            loop {
                let bypassed = dag.pop_bypassable_nodes();
                if bypassed.is_empty() {
                    break;
                }
                for node in &bypassed {
                    self.context.bypass_node(node, None);
                }
                progressed = true;
            }
            queued.extend(dag.pop_ready_nodes());

            // Spawn tasks for ready nodes up to the concurrency limit
            while running.0.len() < self.node_concurrency {
                let Some(node) = queued.pop_front() else {
                    break;
                };
                if let Some(output) = self.skip_output(&node, &dag)? {
                    self.context.bypass_node(&node, Some(output.clone()));
                    dag.complete_nodes(IndexMap::from([(node.name.clone(), output)]));
                    progressed = true;
                    continue;
                }
                let tool = self
                    .tools
                    .get(&node.name)
                    .ok_or_else(|| ExecutionError::NotSupported {
                        message: format!("Node '{}' has no resolved tool.", node.name),
                    })?;
                let inputs = dag.get_node_valid_inputs(&node, tool.definition.as_ref())?;
                let callable = tool.callable.clone();
                let context = self.context.clone();
                running.0.push(tokio::spawn(async move {
                    let result = context
                        .invoke_node(&node.name, node.aggregation, callable, inputs)
                        .await;
                    (node.name, result)
                }));
            }

            if progressed {
                continue;
            }

            // Wait for the next task to complete
            let Some(joined) = running.0.next().await else {
                break;
            };
            let (name, result) = joined.map_err(|_| ExecutionError::Canceled)?;
            match result {
                Ok(output) => dag.complete_nodes(IndexMap::from([(name, output)])),
                Err(e) => {
                    drop(running);
                    self.context
                        .tracker
                        .cancel_node_runs(&self.context.parent_run_id, &ExecutionError::Canceled);
                    return Err(e);
                }
            }
        }

        dag.ensure_completed()?;
        let mut outputs = dag.completed_nodes_outputs().clone();
        for name in dag.bypassed_nodes() {
            outputs.insert(name.clone(), Value::Null);
        }
        Ok((outputs, dag.bypassed_nodes().clone()))
    }

    fn skip_output(&self, node: &Node, dag: &DagManager) -> Result<Option<Value>, ExecutionError> {
        let Some(skip) = &node.skip else {
            return Ok(None);
        };
        let value = dag.evaluate(&skip.when)?;
        if value != skip.is {
            return Ok(None);
        }
        tracing::info!(
            "The node '{}' is skipped because '{}' is equal to '{}'.",
            node.name,
            skip.when,
            skip.is
        );
        dag.evaluate(&skip.return_value).map(Some)
    }
}
