use crate::error::ValidationError;
use crate::tool::{Tool, ToolType};
use crate::value::{Value, ValueType};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

const FLOW_INPUT_PREFIX: &str = "flow.";
const FLOW_INPUT_PREFIXES: [&str; 2] = [FLOW_INPUT_PREFIX, "inputs."];

fn default_flow_id() -> String {
    "default_flow_id".to_string()
}

fn default_flow_name() -> String {
    "default_flow".to_string()
}

fn default_message_format() -> String {
    "basic".to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Where a node input's value comes from.
///
/// Parsed from the flow definition: `${inputs.x}` and `${flow.x}` name a flow
/// input, `${node}`, `${node.section}` and `${node.section.path.to.value}`
/// name another node's output, everything else is a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum InputAssignment {
    Literal(Value),
    FlowInput {
        name: String,
    },
    NodeReference {
        node: String,
        section: String,
        property: Option<String>,
    },
}

impl InputAssignment {
    pub fn parse(value: &Value) -> Self {
        if let Value::String(s) = value {
            if s.starts_with('$') && s.len() > 2 {
                let inner = &s[1..];
                if inner.starts_with('{') && inner.ends_with('}') {
                    return Self::parse_reference(&inner[1..inner.len() - 1]);
                }
            }
        }
        InputAssignment::Literal(value.clone())
    }

    fn parse_reference(data: &str) -> Self {
        for prefix in FLOW_INPUT_PREFIXES {
            if let Some(name) = data.strip_prefix(prefix) {
                return InputAssignment::FlowInput {
                    name: name.to_string(),
                };
            }
        }
        match data.split_once('.') {
            None => InputAssignment::NodeReference {
                node: data.to_string(),
                section: "output".to_string(),
                property: None,
            },
            Some((node, port)) => match port.split_once('.') {
                None => InputAssignment::NodeReference {
                    node: node.to_string(),
                    section: port.to_string(),
                    property: None,
                },
                Some((section, property)) => InputAssignment::NodeReference {
                    node: node.to_string(),
                    section: section.to_string(),
                    property: Some(property.to_string()),
                },
            },
        }
    }

    /// Back to the `${...}` text form, or the literal itself.
    pub fn to_value(&self) -> Value {
        match self {
            InputAssignment::Literal(v) => v.clone(),
            other => Value::String(other.to_string()),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        InputAssignment::Literal(value.into())
    }

    pub fn flow_input(name: impl Into<String>) -> Self {
        InputAssignment::FlowInput { name: name.into() }
    }

    pub fn node_output(node: impl Into<String>) -> Self {
        InputAssignment::NodeReference {
            node: node.into(),
            section: "output".to_string(),
            property: None,
        }
    }

    /// Name of the referenced node, if this is a node reference.
    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            InputAssignment::NodeReference { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, InputAssignment::Literal(_))
    }

    /// True for literal empty strings and nulls.
    pub fn is_empty(&self) -> bool {
        match self {
            InputAssignment::Literal(Value::Null) => true,
            InputAssignment::Literal(Value::String(s)) => s.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for InputAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputAssignment::Literal(v) => write!(f, "{}", v),
            InputAssignment::FlowInput { name } => write!(f, "${{{}{}}}", FLOW_INPUT_PREFIX, name),
            InputAssignment::NodeReference {
                node,
                section,
                property: Some(property),
            } => write!(f, "${{{}.{}.{}}}", node, section, property),
            InputAssignment::NodeReference { node, section, .. } => write!(f, "${{{}.{}}}", node, section),
        }
    }
}

impl Default for InputAssignment {
    fn default() -> Self {
        InputAssignment::Literal(Value::String(String::new()))
    }
}

impl Serialize for InputAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InputAssignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(InputAssignment::parse(&value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSourceType {
    #[default]
    Code,
    Package,
    PackageWithPrompt,
}

impl ToolSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolSourceType::Code => "code",
            ToolSourceType::Package => "package",
            ToolSourceType::PackageWithPrompt => "package_with_prompt",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSource {
    #[serde(rename = "type", default)]
    pub source_type: ToolSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Node is bypassed unless `when` evaluates to `is`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateCondition {
    #[serde(default)]
    pub when: InputAssignment,
    #[serde(rename = "is", default)]
    pub is: Value,
}

/// Node is not executed when `when` evaluates to `is`; `return` becomes its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipCondition {
    #[serde(default)]
    pub when: InputAssignment,
    #[serde(rename = "is", default)]
    pub is: Value,
    #[serde(rename = "return", default)]
    pub return_value: InputAssignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<ToolType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ToolSource>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, alias = "reduce", skip_serializing_if = "is_false")]
    pub aggregation: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_variants: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<ActivateCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: ToolType) -> Self {
        Self {
            name: name.into(),
            node_type: Some(node_type),
            source: None,
            inputs: IndexMap::new(),
            tool: None,
            connection: None,
            api: None,
            provider: None,
            module: None,
            aggregation: false,
            use_variants: false,
            enable_cache: false,
            skip: None,
            activate: None,
            comment: None,
        }
    }

    pub fn with_source(mut self, source_type: ToolSourceType, tool: Option<&str>, path: Option<&str>) -> Self {
        self.source = Some(ToolSource {
            source_type,
            tool: tool.map(str::to_string),
            path: path.map(str::to_string),
        });
        self
    }

    /// Add an input parsed from its flow-definition form.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), InputAssignment::parse(&value.into()));
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn with_activate(mut self, when: impl Into<Value>, is: impl Into<Value>) -> Self {
        self.activate = Some(ActivateCondition {
            when: InputAssignment::parse(&when.into()),
            is: is.into(),
        });
        self
    }

    pub fn with_skip(mut self, when: impl Into<Value>, is: impl Into<Value>, return_value: impl Into<Value>) -> Self {
        self.skip = Some(SkipCondition {
            when: InputAssignment::parse(&when.into()),
            is: is.into(),
            return_value: InputAssignment::parse(&return_value.into()),
        });
        self
    }

    pub fn aggregation(mut self) -> Self {
        self.aggregation = true;
        self
    }

    pub fn source_type(&self) -> Option<ToolSourceType> {
        self.source.as_ref().map(|s| s.source_type)
    }

    /// Every assignment this node reads: inputs, then skip and activate conditions.
    pub fn all_assignments(&self) -> Vec<&InputAssignment> {
        let mut assignments: Vec<&InputAssignment> = self.inputs.values().collect();
        if let Some(skip) = &self.skip {
            assignments.push(&skip.when);
            assignments.push(&skip.return_value);
        }
        if let Some(activate) = &self.activate {
            assignments.push(&activate.when);
        }
        assignments
    }

    /// Names of nodes this node depends on, in first-seen order.
    pub fn dependencies(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.all_assignments()
            .into_iter()
            .filter_map(InputAssignment::referenced_node)
            .filter(|n| seen.insert(n.to_string()))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInputDefinition {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_chat_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_chat_history: Option<bool>,
}

impl FlowInputDefinition {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            default: None,
            description: None,
            enum_values: Vec::new(),
            is_chat_input: false,
            is_chat_history: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOutputDefinition {
    #[serde(rename = "type", default = "default_output_type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub reference: InputAssignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub evaluation_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_chat_output: bool,
}

fn default_output_type() -> ValueType {
    ValueType::String
}

impl FlowOutputDefinition {
    pub fn new(reference: impl Into<Value>) -> Self {
        Self {
            value_type: ValueType::String,
            reference: InputAssignment::parse(&reference.into()),
            description: None,
            evaluation_only: false,
            is_chat_output: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariant {
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariants {
    #[serde(default)]
    pub default_variant_id: String,
    pub variants: IndexMap<String, NodeVariant>,
}

/// A DAG flow definition as loaded from `flow.dag.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default = "default_flow_id")]
    pub id: String,
    #[serde(default = "default_flow_name")]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub inputs: IndexMap<String, FlowInputDefinition>,
    #[serde(default)]
    pub outputs: IndexMap<String, FlowOutputDefinition>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_variants: IndexMap<String, NodeVariants>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment_variables: IndexMap<String, Value>,
    #[serde(default = "default_message_format")]
    pub message_format: String,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: default_flow_id(),
            name: name.into(),
            nodes: Vec::new(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            tools: Vec::new(),
            node_variants: IndexMap::new(),
            environment_variables: IndexMap::new(),
            message_format: default_message_format(),
        }
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn add_input(&mut self, name: impl Into<String>, definition: FlowInputDefinition) {
        self.inputs.insert(name.into(), definition);
    }

    pub fn add_output(&mut self, name: impl Into<String>, reference: impl Into<Value>) {
        self.outputs.insert(name.into(), FlowOutputDefinition::new(reference));
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Load a flow file (YAML or JSON by extension) relative to `working_dir`,
    /// applying the default node variants.
    pub fn load(flow_file: &Path, working_dir: Option<&Path>) -> Result<Self, ValidationError> {
        let path = resolve_flow_path(flow_file, working_dir);
        let invalid = |error: String| ValidationError::InvalidFlowFile {
            path: path.display().to_string(),
            error,
        };
        let content = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let mut flow = if is_json {
            Self::from_json_str(&content).map_err(|e| invalid(e.to_string()))?
        } else {
            Self::from_yaml_str(&content).map_err(|e| invalid(e.to_string()))?
        };
        flow.apply_default_node_variants();
        Ok(flow)
    }

    /// Replace every `use_variants` node by its default variant, keeping the node name.
    pub fn apply_default_node_variants(&mut self) {
        let variants = &self.node_variants;
        for node in self.nodes.iter_mut().filter(|n| n.use_variants) {
            let Some(node_variants) = variants.get(&node.name) else {
                continue;
            };
            if let Some(default) = node_variants.variants.get(&node_variants.default_variant_id) {
                let mut replacement = default.node.clone();
                replacement.name = node.name.clone();
                *node = replacement;
            }
        }
    }

    /// Replace a node by one of its named variants.
    pub fn apply_node_variant(&mut self, node_name: &str, variant_id: &str) -> Result<(), ValidationError> {
        let not_found = || ValidationError::NodeVariantNotFound {
            node_name: node_name.to_string(),
            variant_id: variant_id.to_string(),
        };
        let variant = self
            .node_variants
            .get(node_name)
            .and_then(|v| v.variants.get(variant_id))
            .ok_or_else(not_found)?;
        let mut replacement = variant.node.clone();
        replacement.name = node_name.to_string();
        let slot = self
            .nodes
            .iter_mut()
            .find(|n| n.name == node_name)
            .ok_or_else(not_found)?;
        *slot = replacement;
        Ok(())
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn has_aggregation_node(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }

    pub fn is_aggregation_node(&self, name: &str) -> bool {
        self.get_node(name).map(|n| n.aggregation).unwrap_or(false)
    }

    pub fn is_normal_node(&self, name: &str) -> bool {
        self.get_node(name).map(|n| !n.aggregation).unwrap_or(false)
    }

    pub fn is_llm_node(&self, node: &Node) -> bool {
        node.node_type == Some(ToolType::Llm)
    }

    pub fn is_referenced_by_flow_output(&self, node: &Node) -> bool {
        self.outputs
            .values()
            .any(|o| o.reference.referenced_node() == Some(node.name.as_str()))
    }

    pub fn is_referenced_by_other_node(&self, node: &Node) -> bool {
        self.nodes
            .iter()
            .any(|other| other.inputs.values().any(|i| i.referenced_node() == Some(node.name.as_str())))
    }

    pub fn chat_input_name(&self) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(_, i)| i.is_chat_input)
            .map(|(name, _)| name.as_str())
    }

    pub fn chat_output_name(&self) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(_, o)| o.is_chat_output)
            .map(|(name, _)| name.as_str())
    }

    pub fn is_chat_flow(&self) -> bool {
        self.chat_input_name().is_some()
    }

    /// Declared type of each flow input.
    pub fn input_types(&self) -> IndexMap<String, ValueType> {
        self.inputs
            .iter()
            .map(|(name, def)| (name.clone(), def.value_type))
            .collect()
    }

    /// Connection names the flow's nodes need, from node `connection`
    /// fields and connection-typed literal inputs of known tools.
    pub fn connection_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if let Some(conn) = &node.connection {
                names.insert(conn.clone());
            }
            let tool = node
                .source
                .as_ref()
                .and_then(|s| s.tool.as_deref())
                .and_then(|t| self.get_tool(t));
            if let Some(tool) = tool {
                for name in tool.connection_input_names() {
                    if let Some(InputAssignment::Literal(Value::String(conn))) = node.inputs.get(&name) {
                        names.insert(conn.clone());
                    }
                }
            }
        }
        names.retain(|n| !n.is_empty());
        names
    }
}

fn resolve_flow_path(flow_file: &Path, working_dir: Option<&Path>) -> PathBuf {
    match working_dir {
        Some(dir) if flow_file.is_relative() => dir.join(flow_file),
        _ => flow_file.to_path_buf(),
    }
}
