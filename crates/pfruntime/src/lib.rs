//! Flow execution runtime
//!
//! This crate turns a validated flow into running work: it resolves nodes
//! to callables, schedules a line's nodes as a DAG, runs batches on a pool
//! of worker processes or a remote executor service, and persists run
//! records to a local run directory.

pub mod batch;
pub mod config;
mod dag;
pub mod executor;
pub mod input_mapping;
pub mod process;
pub mod proxy;
pub mod resolver;
pub mod run_tracker;
mod scheduler;
pub mod script;
pub mod storage;
pub mod template;
pub mod tools_manager;
pub mod validator;

pub use batch::BatchEngine;
pub use config::{BatchMethod, RuntimeConfig};
pub use dag::{parse_node_property, parse_value, DagManager};
pub use executor::{load_and_exec_node, ExecutorOptions, FlowExecutor, LineOptions};
pub use input_mapping::{apply_inputs_mapping, merge_input_dicts_by_line, BatchInputsProcessor};
pub use process::{run_worker, LineExecutionProcessPool, Supervisor};
pub use proxy::{ApiBasedExecutorProxy, ExecutorProxy};
pub use resolver::{ResolvedTool, ToolResolver};
pub use run_tracker::RunTracker;
pub use storage::{DummyRunStorage, LocalStorageOperations, RunStorage};
pub use tools_manager::{RegisteredTool, ToolFactory, ToolPackage, ToolsManager};
pub use validator::FlowValidator;
