use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Top-level error category reported in serialized error dicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    UserError,
    SystemError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserError => "UserError",
            ErrorCategory::SystemError => "SystemError",
        }
    }
}

/// Component an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTarget {
    Executor,
    FlowExecutor,
    Tool,
    Runtime,
    Batch,
    Unknown,
}

pub(crate) fn format_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("'{}'", s)).collect();
    format!("[{}]", quoted.join(", "))
}

pub(crate) fn format_set(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("'{}'", s)).collect();
    format!("{{{}}}", quoted.join(", "))
}

fn format_log(log: &str) -> String {
    if log.is_empty() {
        String::new()
    } else {
        format!(": {}", log)
    }
}

pub(crate) fn format_lengths(lengths: &IndexMap<String, usize>) -> String {
    let pairs: Vec<String> = lengths
        .iter()
        .map(|(k, v)| format!("'{}': {}", k, v))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ResolveTool(#[from] ResolveToolError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    InputMapping(#[from] InputMappingError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Multimedia(#[from] MultimediaError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn error_code(&self) -> &'static str {
        match self {
            FlowError::Validation(e) => e.error_code(),
            FlowError::ResolveTool(_) => "ResolveToolError",
            FlowError::Execution(e) => e.error_code(),
            FlowError::InputMapping(e) => e.error_code(),
            FlowError::Aggregation(e) => e.error_code(),
            FlowError::Process(e) => e.error_code(),
            FlowError::Multimedia(e) => e.error_code(),
            FlowError::Proxy(e) => e.error_code(),
            FlowError::Storage(e) => e.error_code(),
            FlowError::Io(_) => "OSError",
            FlowError::Serialization(_) => "JSONDecodeError",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FlowError::Validation(_) | FlowError::InputMapping(_) | FlowError::Aggregation(_) => {
                ErrorCategory::UserError
            }
            FlowError::ResolveTool(e) => e.source.category(),
            FlowError::Execution(e) => e.category(),
            FlowError::Multimedia(_) => ErrorCategory::UserError,
            FlowError::Proxy(e) => e.category(),
            FlowError::Process(_)
            | FlowError::Storage(_)
            | FlowError::Io(_)
            | FlowError::Serialization(_) => ErrorCategory::SystemError,
        }
    }

    pub fn target(&self) -> ErrorTarget {
        match self {
            FlowError::Validation(_) | FlowError::ResolveTool(_) => ErrorTarget::Executor,
            FlowError::Execution(ExecutionError::ToolExecution { .. }) => ErrorTarget::Tool,
            FlowError::Execution(_) | FlowError::Aggregation(_) => ErrorTarget::FlowExecutor,
            FlowError::InputMapping(_) | FlowError::Storage(_) => ErrorTarget::Batch,
            FlowError::Process(_) | FlowError::Proxy(_) => ErrorTarget::Runtime,
            FlowError::Multimedia(_) => ErrorTarget::Executor,
            FlowError::Io(_) | FlowError::Serialization(_) => ErrorTarget::Unknown,
        }
    }

    /// Codes from the category down to the most specific kind, e.g.
    /// `["UserError", "ToolExecutionError", "ExecutionFailed"]`.
    pub fn code_hierarchy(&self) -> Vec<String> {
        let mut codes = vec![self.category().as_str().to_string(), self.error_code().to_string()];
        match self {
            FlowError::ResolveTool(e) => codes.push(e.source.error_code().to_string()),
            FlowError::Execution(ExecutionError::ToolExecution { source, .. }) => {
                codes.push(source.error_code().to_string())
            }
            _ => {}
        }
        codes
    }

    /// Serialize into the error dict persisted in run records and returned by services.
    pub fn to_error_dict(&self) -> serde_json::Value {
        match self {
            FlowError::Proxy(ProxyError::Remote(resp)) => resp.to_dict(true),
            _ => ErrorResponse::from_error(self).to_dict(true),
        }
    }
}

/// Presenter that renders a [`FlowError`] into the persisted error dict layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub message_format: String,
    pub message_parameters: IndexMap<String, String>,
    pub reference_code: String,
    pub codes: Vec<String>,
    pub debug_type: String,
}

impl ErrorResponse {
    pub fn from_error(err: &FlowError) -> Self {
        let codes = err.code_hierarchy();
        let mut message_parameters = IndexMap::new();
        if let FlowError::ResolveTool(e) = err {
            message_parameters.insert("node_name".to_string(), e.node_name.clone());
        }
        if let FlowError::Execution(ExecutionError::ToolExecution { node_name, .. }) = err {
            message_parameters.insert("node_name".to_string(), node_name.clone());
        }
        Self {
            code: codes[0].clone(),
            message: err.to_string(),
            message_format: String::new(),
            message_parameters,
            reference_code: format!("{:?}", err.target()),
            codes,
            debug_type: err.error_code().to_string(),
        }
    }

    /// Build from a previously serialized error dict.
    pub fn from_dict(dict: &serde_json::Value) -> Self {
        let mut codes = Vec::new();
        let mut cursor = Some(dict);
        while let Some(node) = cursor {
            if let Some(code) = node.get("code").and_then(|c| c.as_str()) {
                codes.push(code.to_string());
            }
            cursor = node.get("innerError").filter(|v| !v.is_null());
        }
        let message = dict
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let debug_type = dict
            .pointer("/debugInfo/type")
            .and_then(|t| t.as_str())
            .map(String::from)
            .or_else(|| codes.last().cloned())
            .unwrap_or_default();
        Self {
            code: codes.first().cloned().unwrap_or_else(|| "SystemError".to_string()),
            message,
            message_format: dict
                .get("messageFormat")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
            message_parameters: dict
                .get("messageParameters")
                .and_then(|m| m.as_object())
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().map(String::from).unwrap_or_else(|| v.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
            reference_code: dict
                .get("referenceCode")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
            codes,
            debug_type,
        }
    }

    /// Innermost error code, e.g. `ToolExecutionError`.
    pub fn innermost_error_code(&self) -> &str {
        self.codes.last().map(String::as_str).unwrap_or("SystemError")
    }

    pub fn to_dict(&self, include_debug_info: bool) -> serde_json::Value {
        let mut inner = serde_json::Value::Null;
        for code in self.codes.iter().skip(1).rev() {
            inner = json!({ "code": code, "innerError": inner });
        }
        let mut dict = json!({
            "code": self.code,
            "message": self.message,
            "messageFormat": self.message_format,
            "messageParameters": self.message_parameters,
            "referenceCode": self.reference_code,
            "innerError": inner,
        });
        if include_debug_info {
            dict["debugInfo"] = json!({
                "type": self.debug_type,
                "message": self.message,
                "stackTrace": "",
                "innerException": serde_json::Value::Null,
            });
        }
        dict
    }
}

/// Graph-definition and flow input errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid node definitions found in the flow graph. Node with name '{node_name}' appears more than once in the node definitions in your flow, which is not allowed. To address this issue, please review your flow and either rename or remove nodes with identical names.")]
    DuplicateNodeName { node_name: String },

    #[error("Invalid node definitions found in the flow graph. Node '{node_name}' references flow input '{flow_input_name}' which is not defined in your flow. To resolve this issue, please review your flow, ensuring that you either add the missing flow inputs or adjust node reference to the correct flow input.")]
    InputReferenceNotFound {
        node_name: String,
        flow_input_name: String,
    },

    #[error("Invalid node definitions found in the flow graph. Node '{node_name}' references a non-existent node '{reference_node_name}' in your flow. Please review your flow to ensure that the node name is accurately specified.")]
    NodeReferenceNotFound {
        node_name: String,
        reference_node_name: String,
    },

    #[error("Invalid node definitions found in the flow graph. Non-aggregate node '{node_name}' cannot reference aggregate nodes {}. Please review and rectify the node reference.", format_set(.invalid_reference))]
    InvalidNodeReference {
        node_name: String,
        invalid_reference: Vec<String>,
    },

    #[error("Invalid node definitions found in the flow graph. Non-aggregation node '{invalid_reference}' cannot be referenced in the activate config of the aggregation node '{node_name}'. Please review and rectify the node reference.")]
    InvalidActivateReference {
        node_name: String,
        invalid_reference: String,
    },

    #[error("Invalid node definitions found in the flow graph. Node circular dependency has been detected among the nodes in your flow. Kindly review the reference relationships for the nodes {} and resolve the circular reference issue in the flow.", format_list(.remaining_nodes))]
    NodeCircularDependency { remaining_nodes: Vec<String> },

    #[error("The output '{output_name}' for flow is incorrect. The reference is not specified for the output '{output_name}' in the flow. To rectify this, ensure that you accurately specify the reference in the flow.")]
    EmptyOutputReference { output_name: String },

    #[error("The output '{output_name}' for flow is incorrect. The output '{output_name}' references non-existent flow input '{flow_input_name}' in your flow. Please carefully review your flow and correct the reference definition for the output in question.")]
    OutputFlowInputNotFound {
        output_name: String,
        flow_input_name: String,
    },

    #[error("The output '{output_name}' for flow is incorrect. The output '{output_name}' references non-existent node '{node_name}' in your flow. To resolve this issue, please carefully review your flow and correct the reference definition for the output in question.")]
    OutputNodeNotFound {
        output_name: String,
        node_name: String,
    },

    #[error("The input for flow is incorrect. The value for flow input '{input_name}' is not provided {line_info}. Please review your input data or remove this input in your flow if it's no longer needed.")]
    InputNotFound {
        input_name: String,
        line_info: String,
    },

    #[error("Failed to parse the flow input. The value for flow input {flow_input_info} was interpreted as JSON string since its type is '{value_type}'. However, the value '{input_value}' is invalid for JSON parsing. Error details: {error_type_and_message}. Please make sure your inputs are properly formatted.")]
    InputParseError {
        flow_input_info: String,
        value_type: String,
        input_value: String,
        error_type_and_message: String,
    },

    #[error("The input for flow is incorrect. The value for flow input {flow_input_info} does not match the expected type '{expected_type}'. Please change flow input type or adjust the input value in your input data.")]
    InputTypeError {
        flow_input_info: String,
        expected_type: String,
    },

    #[error("Node '{node_name}' does not have variant '{variant_id}'. Please check the node variants in your flow.")]
    NodeVariantNotFound {
        node_name: String,
        variant_id: String,
    },

    #[error("Failed to load flow from '{path}': {error}")]
    InvalidFlowFile { path: String, error: String },

    #[error("{message}")]
    SingleNodeValidation { message: String },
}

impl ValidationError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ValidationError::DuplicateNodeName { .. } => "DuplicateNodeName",
            ValidationError::InputReferenceNotFound { .. } => "InputReferenceNotFound",
            ValidationError::NodeReferenceNotFound { .. } => "NodeReferenceNotFound",
            ValidationError::InvalidNodeReference { .. }
            | ValidationError::InvalidActivateReference { .. } => "InvalidNodeReference",
            ValidationError::NodeCircularDependency { .. } => "NodeCircularDependency",
            ValidationError::EmptyOutputReference { .. } => "EmptyOutputReference",
            ValidationError::OutputFlowInputNotFound { .. }
            | ValidationError::OutputNodeNotFound { .. } => "OutputReferenceNotFound",
            ValidationError::InputNotFound { .. } => "InputNotFound",
            ValidationError::InputParseError { .. } => "InputParseError",
            ValidationError::InputTypeError { .. } => "InputTypeError",
            ValidationError::NodeVariantNotFound { .. } => "InvalidNodeVariant",
            ValidationError::InvalidFlowFile { .. } => "FailedToLoadFlow",
            ValidationError::SingleNodeValidation { .. } => "SingleNodeValidationError",
        }
    }
}

/// Errors raised by tool callables at execution time
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Tool initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Script '{script}' failed: {message}")]
    ScriptExecution { script: String, message: String },

    #[error("OpenAI API hits {status}: {message}")]
    Llm { status: u16, message: String },

    #[error("Failed to render jinja template: {0}. Please modify your prompt to fix the issue.")]
    Template(String),
}

impl ToolError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ToolError::MissingInput(_) => "MissingInput",
            ToolError::InvalidInputType { .. } => "InvalidInputType",
            ToolError::Configuration(_) => "ConfigurationError",
            ToolError::ExecutionFailed(_) => "ExecutionFailed",
            ToolError::InitializationFailed(_) => "InitializationFailed",
            ToolError::Timeout { .. } => "TimeoutError",
            ToolError::Cancelled => "CancelledError",
            ToolError::ScriptExecution { .. } => "ScriptExecutionError",
            ToolError::Llm { .. } => "LLMError",
            ToolError::Template(_) => "JinjaTemplateError",
        }
    }
}

/// Errors raised while resolving a node to a callable; always wrapped in [`ResolveToolError`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Tool type '{node_type}' with source type '{source_type}' is not supported yet.")]
    NotImplemented {
        node_type: String,
        source_type: String,
    },

    #[error("Node {node_name} does not have source defined.")]
    SourceNotDefined { node_name: String },

    #[error("Node source path '{source_path}' is invalid on node '{node_name}'.")]
    InvalidSourcePath {
        source_path: String,
        node_name: String,
    },

    #[error("Get connection '{connection}' for node '{node_name}' error: {error}")]
    GetConnection {
        connection: String,
        node_name: String,
        error: String,
    },

    #[error("Input '{key}' for node '{node_name}' of type {actual_type:?} is not supported, valid types {}.", format_list(.valid_types))]
    ConnectionTypeMismatch {
        key: String,
        node_name: String,
        actual_type: String,
        valid_types: Vec<String>,
    },

    #[error("Input '{key}' for node '{node_name}' of value '{value}' is not type {value_type}.")]
    InvalidInputValue {
        key: String,
        node_name: String,
        value: String,
        value_type: String,
    },

    #[error("Failed to load image for input '{key}': {error_type_and_message}")]
    ImageInput {
        key: String,
        error_type_and_message: String,
    },

    #[error("Input '{key}' for node '{node_name}' has unresolved value type {value_type}.")]
    ValueTypeUnresolved {
        key: String,
        node_name: String,
        value_type: String,
    },

    #[error("Invalid inputs {} in prompt template of node {node_name}. These inputs are duplicated with the parameters of {provider}.{api}.", format_list(.duplicated_inputs))]
    DuplicateLlmInputs {
        duplicated_inputs: Vec<String>,
        node_name: String,
        provider: String,
        api: String,
    },

    #[error("Invalid inputs {} in prompt template of node {node_name}. These inputs are duplicated with the reserved parameters of prompt tool.", format_list(.duplicated_inputs))]
    DuplicatePromptInputs {
        duplicated_inputs: Vec<String>,
        node_name: String,
    },

    #[error("Invalid inputs {} in prompt template of node {node_name}. These inputs are duplicated with the inputs of custom llm tool.", format_list(.duplicated_inputs))]
    DuplicateCustomLlmInputs {
        duplicated_inputs: Vec<String>,
        node_name: String,
    },

    #[error("Invalid Custom LLM tool {tool_name}: the tool is missing a prompt template argument.")]
    InvalidCustomLlmTool { tool_name: String },

    #[error("Connection type {conn_type} is not supported for LLM.")]
    InvalidConnectionType { conn_type: String },

    #[error("LLM api mapping is empty, please ensure the builtin tool package has been registered.")]
    EmptyLlmApiMapping,

    #[error("The API '{api}' is not found for provider '{provider}'.")]
    ApiNotFound { provider: String, api: String },

    #[error("Package tool '{tool_id}' is not found in the current environment. All available package tools are: {}.", format_list(.available))]
    PackageToolNotFound {
        tool_id: String,
        available: Vec<String>,
    },

    #[error("Invalid input for '{tool_name}': Initialization input '{input_name}' requires a literal value, but {input_value} was received.")]
    InputTypeMismatch {
        tool_name: String,
        input_name: String,
        input_value: String,
    },

    #[error("The following required inputs of '{tool_name}' are missing: {}.", format_list(.missing_inputs))]
    MissingRequiredInputs {
        tool_name: String,
        missing_inputs: Vec<String>,
    },

    #[error("Failed to load package tool '{tool_name}': {error_type_and_message}")]
    ToolLoad {
        tool_name: String,
        error_type_and_message: String,
    },

    #[error("Failed to load prompt template '{path}': {error}")]
    TemplateLoad { path: String, error: String },
}

impl ResolutionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ResolutionError::NotImplemented { .. } => "NotImplementedError",
            ResolutionError::SourceNotDefined { .. } | ResolutionError::InvalidSourcePath { .. } => {
                "InvalidSource"
            }
            ResolutionError::GetConnection { .. } => "GetConnectionError",
            ResolutionError::ConnectionTypeMismatch { .. }
            | ResolutionError::InvalidInputValue { .. }
            | ResolutionError::ImageInput { .. }
            | ResolutionError::DuplicateLlmInputs { .. }
            | ResolutionError::DuplicatePromptInputs { .. }
            | ResolutionError::DuplicateCustomLlmInputs { .. } => "NodeInputValidationError",
            ResolutionError::InvalidCustomLlmTool { .. } => "InvalidCustomLLMTool",
            ResolutionError::ValueTypeUnresolved { .. } => "ValueTypeUnresolved",
            ResolutionError::InvalidConnectionType { .. } => "InvalidConnectionType",
            ResolutionError::EmptyLlmApiMapping => "EmptyLLMApiMapping",
            ResolutionError::ApiNotFound { .. } => "APINotFound",
            ResolutionError::PackageToolNotFound { .. } => "PackageToolNotFoundError",
            ResolutionError::InputTypeMismatch { .. } => "InputTypeMismatch",
            ResolutionError::MissingRequiredInputs { .. } => "MissingRequiredInputs",
            ResolutionError::ToolLoad { .. } => "ToolLoadError",
            ResolutionError::TemplateLoad { .. } => "InvalidSource",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ResolutionError::EmptyLlmApiMapping => ErrorCategory::SystemError,
            _ => ErrorCategory::UserError,
        }
    }
}

/// A resolution failure attributed to the node that caused it
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Tool load failed in '{node_name}': ({}) {source}", .source.error_code())]
pub struct ResolveToolError {
    pub node_name: String,
    #[source]
    pub source: ResolutionError,
}

impl ResolveToolError {
    pub fn new(node_name: impl Into<String>, source: ResolutionError) -> Self {
        Self {
            node_name: node_name.into(),
            source,
        }
    }
}

/// Per-line execution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Execution failure in '{node_name}': ({}) {source}", .source.error_code())]
    ToolExecution {
        node_name: String,
        #[source]
        source: ToolError,
    },

    #[error("The output '{output_name}' for flow is incorrect. No outputs found for node '{node_name}'. Please review the problematic output and rectify the error.")]
    NodeOutputNotFound {
        output_name: String,
        node_name: String,
    },

    #[error("The output '{output_name}' for flow is incorrect. The node '{node_name}' referenced by the output '{output_name}' can not found in flow. Please rectify the error in your flow and try again.")]
    OutputReferenceNotExist {
        output_name: String,
        node_name: String,
    },

    #[error("Invalid property '{property}' when accessing the output of node '{node_name}'. Please check the property path in your flow.")]
    InvalidReferenceProperty { node_name: String, property: String },

    #[error("Line {line_number} execution timeout for exceeding {timeout} seconds")]
    LineExecutionTimeout { line_number: usize, timeout: u64 },

    #[error("Process crashed while executing line {line_number},")]
    ProcessCrash { line_number: usize },

    #[error("The line run was canceled.")]
    Canceled,

    #[error("{message}")]
    NotSupported { message: String },

    #[error("{0}")]
    Input(#[from] ValidationError),

    #[error("{0}")]
    Multimedia(#[from] MultimediaError),
}

impl ExecutionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ExecutionError::ToolExecution { .. } => "ToolExecutionError",
            ExecutionError::NodeOutputNotFound { .. } => "NodeOutputNotFound",
            ExecutionError::OutputReferenceNotExist { .. } => "OutputReferenceNotExist",
            ExecutionError::InvalidReferenceProperty { .. } => "InvalidReferenceProperty",
            ExecutionError::LineExecutionTimeout { .. } => "LineExecutionTimeoutError",
            ExecutionError::ProcessCrash { .. } => "ProcessCrashError",
            ExecutionError::Canceled => "CanceledError",
            ExecutionError::NotSupported { .. } => "NotSupported",
            ExecutionError::Input(e) => e.error_code(),
            ExecutionError::Multimedia(e) => e.error_code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecutionError::Canceled => ErrorCategory::SystemError,
            _ => ErrorCategory::UserError,
        }
    }
}

/// Errors raised while turning batch input data into per-line inputs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputMappingError {
    #[error("The input for batch run is incorrect. Input from key '{input_key}' is an empty list, which means we cannot generate a single line input for the flow run. Please rectify the input and try again.")]
    EmptyInput { input_key: String },

    #[error("The input for batch run is incorrect. Line numbers are not aligned. Some lists have dictionaries missing the 'line_number' key, and the lengths of these lists are different. List lengths are: {}. Please make sure these lists have the same length or add 'line_number' key to each dictionary.", format_lengths(.lengths))]
    UnalignedLineNumbers { lengths: IndexMap<String, usize> },

    #[error("The input for batch run is incorrect. Could not find one complete line on the provided input. Please ensure that you supply data on the same line to resolve this issue.")]
    NoCompleteLine,

    #[error("The input for batch run is incorrect. Couldn't find these mapping relations: {invalid_relations}. Please make sure your input mapping keys and values match your YAML input section and input data.")]
    ApplyInputMapping { invalid_relations: String },

    #[error("Couldn't find any inputs data at the given input paths. Please review the provided path and consider resubmitting.\n{input_dirs}")]
    EmptyInputsData { input_dirs: String },

    #[error("Failed to load input data from '{path}': {error}")]
    InvalidInputData { path: String, error: String },
}

impl InputMappingError {
    pub fn error_code(&self) -> &'static str {
        match self {
            InputMappingError::ApplyInputMapping { .. } => "ApplyInputMappingError",
            InputMappingError::EmptyInputsData { .. } => "EmptyInputsData",
            InputMappingError::InvalidInputData { .. } => "InvalidInputData",
            _ => "InputMappingError",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("The input for aggregation is incorrect. The input '{input_key}' appears in both aggregated flow input and aggregated reference input. Please remove one of them and try the operation again.")]
    DuplicateInput { input_key: String },

    #[error("The input for aggregation is incorrect. The value for aggregated flow input '{input_key}' should be a list, but received {value_type}. Please adjust the input value to match the expected format.")]
    FlowInputNotList {
        input_key: String,
        value_type: String,
    },

    #[error("The input for aggregation is incorrect. The value for aggregated reference input '{input_key}' should be a list, but received {value_type}. Please adjust the input value to match the expected format.")]
    ReferenceInputNotList {
        input_key: String,
        value_type: String,
    },

    #[error("The input for aggregation is incorrect. The length of all aggregated inputs should be the same. Current input lengths are: {}. Please adjust the input value in your input data.", format_lengths(.key_len))]
    LengthMismatch { key_len: IndexMap<String, usize> },

    #[error("Aggregation node '{node_name}' failed: {source}")]
    NodeFailed {
        node_name: String,
        #[source]
        source: ExecutionError,
    },

    #[error("{0}")]
    Input(#[from] ValidationError),
}

impl AggregationError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AggregationError::NodeFailed { source, .. } => source.error_code(),
            AggregationError::Input(e) => e.error_code(),
            _ => "InvalidAggregationInput",
        }
    }
}

/// Worker pool lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("Failed to get process info after {timeout} seconds")]
    ProcessInfoObtainedTimeout { timeout: u64 },

    #[error("Process has not terminated after {timeout} seconds")]
    ProcessTerminatedTimeout { timeout: u64 },

    #[error("Failed to start spawned fork process manager{}", format_log(.log))]
    SpawnedForkProcessManagerStartFailure { log: String },

    #[error("Failed to spawn worker process {index}: {error}")]
    SpawnFailed { index: usize, error: String },

    #[error("Worker process {index} is not available")]
    WorkerUnavailable { index: usize },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("The batch run was terminated after {timeout} seconds")]
    BatchExecutionTimeout { timeout: u64 },
}

impl ProcessError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ProcessError::ProcessInfoObtainedTimeout { .. } => "ProcessInfoObtainedTimeout",
            ProcessError::ProcessTerminatedTimeout { .. } => "ProcessTerminatedTimeout",
            ProcessError::SpawnedForkProcessManagerStartFailure { .. } => {
                "SpawnedForkProcessManagerStartFailure"
            }
            ProcessError::SpawnFailed { .. } => "ProcessSpawnError",
            ProcessError::WorkerUnavailable { .. } => "WorkerUnavailable",
            ProcessError::Protocol(_) => "WorkerProtocolError",
            ProcessError::BatchExecutionTimeout { .. } => "BatchExecutionTimeoutError",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MultimediaError {
    #[error("Invalid message format '{message_format}'. Supported message formats are ['basic', 'openai-vision'].")]
    InvalidMessageFormatType { message_format: String },

    #[error("{message}")]
    InvalidImageInput { message: String },

    #[error("Failed to load image for input '{key}': {error_type_and_message}")]
    LoadMultimediaData {
        key: String,
        error_type_and_message: String,
    },

    #[error("Failed to persist image '{path}': {error}")]
    Persist { path: String, error: String },
}

impl MultimediaError {
    pub fn error_code(&self) -> &'static str {
        match self {
            MultimediaError::InvalidMessageFormatType { .. } => "InvalidMessageFormatType",
            MultimediaError::InvalidImageInput { .. } => "InvalidImageInput",
            MultimediaError::LoadMultimediaData { .. } => "LoadMultimediaDataError",
            MultimediaError::Persist { .. } => "PersistMultimediaError",
        }
    }

    pub fn invalid_image(message: impl Into<String>) -> Self {
        MultimediaError::InvalidImageInput {
            message: message.into(),
        }
    }
}

/// Errors from the HTTP executor proxy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("The executor service is currently not in a healthy state. Please resubmit your flow and try again.")]
    ExecutorServiceUnhealthy,

    #[error("{0}")]
    ExecutorStartup(String),

    #[error("{message}")]
    Unexpected { message: String },

    #[error("Line {line_number} execution timeout for exceeding {timeout} seconds")]
    LineExecutionTimeout { line_number: usize, timeout: u64 },

    #[error("Aggregation node execution timeout for exceeding {timeout} seconds")]
    AggregationNodeExecutionTimeout { timeout: u64 },

    #[error("{message}")]
    NotSupported { message: String },

    /// Structured error returned by the executor service
    #[error("{}", .0.message)]
    Remote(ErrorResponse),
}

impl ProxyError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::ExecutorServiceUnhealthy => "ExecutorServiceUnhealthy",
            ProxyError::ExecutorStartup(_) => "ExecutorStartupError",
            ProxyError::Unexpected { .. } => "UnexpectedError",
            ProxyError::LineExecutionTimeout { .. } => "LineExecutionTimeoutError",
            ProxyError::AggregationNodeExecutionTimeout { .. } => {
                "AggregationNodeExecutionTimeoutError"
            }
            ProxyError::NotSupported { .. } => "NotSupported",
            ProxyError::Remote(_) => "ExecutorServiceError",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxyError::LineExecutionTimeout { .. }
            | ProxyError::AggregationNodeExecutionTimeout { .. }
            | ProxyError::NotSupported { .. } => ErrorCategory::UserError,
            ProxyError::Remote(resp) if resp.code == "UserError" => ErrorCategory::UserError,
            _ => ErrorCategory::SystemError,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        ProxyError::Unexpected {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Failed to write run record '{path}': {error}")]
    Write { path: String, error: String },

    #[error("Failed to read run record '{path}': {error}")]
    Read { path: String, error: String },

    #[error("Failed to acquire file lock '{path}': {error}")]
    Lock { path: String, error: String },
}

impl StorageError {
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Write { .. } => "StorageWriteError",
            StorageError::Read { .. } => "StorageReadError",
            StorageError::Lock { .. } => "FileLockError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_dependency_message_lists_nodes() {
        let err = ValidationError::NodeCircularDependency {
            remaining_nodes: vec!["A".to_string(), "B".to_string()],
        };
        assert!(err.to_string().contains("['A', 'B']"));
    }

    #[test]
    fn test_aggregation_length_message() {
        let mut key_len = IndexMap::new();
        key_len.insert("input1".to_string(), 2);
        key_len.insert("input_2".to_string(), 1);
        let err = AggregationError::LengthMismatch { key_len };
        assert!(err.to_string().contains("{'input1': 2, 'input_2': 1}"));
        assert_eq!(err.error_code(), "InvalidAggregationInput");
    }

    #[test]
    fn test_resolve_tool_error_keeps_inner_code() {
        let err: FlowError = ResolveToolError::new(
            "llm_node",
            ResolutionError::InvalidConnectionType {
                conn_type: "CustomConnection".to_string(),
            },
        )
        .into();
        assert_eq!(
            err.to_string(),
            "Tool load failed in 'llm_node': (InvalidConnectionType) Connection type CustomConnection is not supported for LLM."
        );
        assert_eq!(
            err.code_hierarchy(),
            vec!["UserError", "ResolveToolError", "InvalidConnectionType"]
        );
    }

    #[test]
    fn test_error_dict_round_trip() {
        let err: FlowError = ExecutionError::ToolExecution {
            node_name: "fetch_url".to_string(),
            source: ToolError::ExecutionFailed("boom".to_string()),
        }
        .into();
        let dict = err.to_error_dict();
        assert_eq!(dict["code"], "UserError");
        assert_eq!(dict["innerError"]["code"], "ToolExecutionError");
        assert_eq!(dict["innerError"]["innerError"]["code"], "ExecutionFailed");
        assert_eq!(dict["messageParameters"]["node_name"], "fetch_url");

        let parsed = ErrorResponse::from_dict(&dict);
        assert_eq!(parsed.innermost_error_code(), "ExecutionFailed");
        assert_eq!(parsed.message, "Execution failure in 'fetch_url': (ExecutionFailed) boom");
    }
}
