//! Core data model for the flow engine
//!
//! This crate provides the types every other component depends on: flow
//! definitions, tool metadata and the [`Callable`] seam, dynamic values
//! (including images and streams), run records, and the error taxonomy.
//! It performs no scheduling or process management of its own.

mod connection;
mod error;
mod flow;
pub mod multimedia;
mod run_info;
mod stream;
mod tool;
mod value;

pub use connection::{Connection, ConnectionProvider, ConnectionStore};
pub use error::{
    AggregationError, ErrorCategory, ErrorResponse, ErrorTarget, ExecutionError, FlowError, InputMappingError,
    MultimediaError, ProcessError, ProxyError, ResolutionError, ResolveToolError, StorageError, ToolError,
    ValidationError,
};
pub use flow::{
    ActivateCondition, Flow, FlowInputDefinition, FlowOutputDefinition, InputAssignment, Node, NodeVariant,
    NodeVariants, SkipCondition, ToolSource, ToolSourceType,
};
pub use multimedia::{Image, MessageFormat, MultimediaProcessor, Text};
pub use run_info::{
    AggregationResult, BatchResult, ErrorSummary, FlowRunInfo, LineError, LineResult, RunInfo, Status, SystemMetrics,
};
pub use stream::GeneratorOutput;
pub use tool::{is_connection_class_name, Callable, FnTool, InputDefinition, ParamType, Tool, ToolContext, ToolType};
pub use value::{ParseValueError, Value, ValueType};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
