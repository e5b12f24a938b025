use indexmap::IndexMap;
use pfcore::{
    AggregationError, Flow, FlowInputDefinition, FlowOutputDefinition, InputAssignment, ParseValueError,
    ValidationError, Value, ValueType,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

/// Validates flow definitions and the line inputs fed to them.
pub struct FlowValidator;

impl FlowValidator {
    /// Check the node graph and canonicalize the flow.
    ///
    /// Nodes come back in dependency order, ties broken by declaration
    /// order. Outputs referencing aggregation nodes are dropped with a
    /// warning. The flow is borrowed unchanged when it is already canonical.
    pub fn validate(flow: &Flow) -> Result<Cow<'_, Flow>, ValidationError> {
        Self::validate_nodes_topology(flow)?;
        let order = Self::ensure_nodes_order(flow)?;
        let outputs = Self::ensure_outputs_valid(flow)?;

        let reordered = order.iter().enumerate().any(|(i, idx)| *idx != i);
        let outputs_changed = outputs.len() != flow.outputs.len();
        if !reordered && !outputs_changed {
            return Ok(Cow::Borrowed(flow));
        }

        let mut canonical = flow.clone();
        canonical.nodes = order.into_iter().map(|i| flow.nodes[i].clone()).collect();
        canonical.outputs = outputs;
        Ok(Cow::Owned(canonical))
    }

    fn validate_nodes_topology(flow: &Flow) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for node in &flow.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ValidationError::DuplicateNodeName {
                    node_name: node.name.clone(),
                });
            }
        }
        for node in &flow.nodes {
            for assignment in node.all_assignments() {
                if let InputAssignment::FlowInput { name } = assignment {
                    if !flow.inputs.contains_key(name) {
                        return Err(ValidationError::InputReferenceNotFound {
                            node_name: node.name.clone(),
                            flow_input_name: name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the dependency graph and return node positions in execution order.
    fn ensure_nodes_order(flow: &Flow) -> Result<Vec<usize>, ValidationError> {
        let aggregation_nodes: HashSet<&str> = flow
            .nodes
            .iter()
            .filter(|n| n.aggregation)
            .map(|n| n.name.as_str())
            .collect();

        // Add nodes in declaration order so index order matches it
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut name_to_index: HashMap<&str, NodeIndex> = HashMap::new();
        for (pos, node) in flow.nodes.iter().enumerate() {
            name_to_index.insert(node.name.as_str(), graph.add_node(pos));
        }

        for node in &flow.nodes {
            if let Some(activate) = &node.activate {
                if let Some(referenced) = activate.when.referenced_node() {
                    if node.aggregation && !aggregation_nodes.contains(referenced) {
                        return Err(ValidationError::InvalidActivateReference {
                            node_name: node.name.clone(),
                            invalid_reference: referenced.to_string(),
                        });
                    }
                }
            }

            let mut invalid_reference = Vec::new();
            for dep in node.dependencies() {
                let Some(dep_idx) = name_to_index.get(dep.as_str()) else {
                    return Err(ValidationError::NodeReferenceNotFound {
                        node_name: node.name.clone(),
                        reference_node_name: dep,
                    });
                };
                if !node.aggregation && aggregation_nodes.contains(dep.as_str()) {
                    invalid_reference.push(dep.clone());
                }
                graph.add_edge(*dep_idx, name_to_index[node.name.as_str()], ());
            }
            if !invalid_reference.is_empty() {
                invalid_reference.sort();
                return Err(ValidationError::InvalidNodeReference {
                    node_name: node.name.clone(),
                    invalid_reference,
                });
            }
        }

        // Kahn's algorithm, one pick per round: the first ready node in declaration order
        let mut picked: HashSet<NodeIndex> = HashSet::new();
        let mut order = Vec::with_capacity(flow.nodes.len());
        for _ in 0..flow.nodes.len() {
            let next = graph.node_indices().find(|idx| {
                !picked.contains(idx)
                    && graph
                        .neighbors_directed(*idx, Direction::Incoming)
                        .all(|dep| picked.contains(&dep))
            });
            match next {
                Some(idx) => {
                    picked.insert(idx);
                    order.push(graph[idx]);
                }
                None => {
                    let mut remaining_nodes: Vec<String> = graph
                        .node_indices()
                        .filter(|idx| !picked.contains(idx))
                        .map(|idx| flow.nodes[graph[idx]].name.clone())
                        .collect();
                    remaining_nodes.sort();
                    return Err(ValidationError::NodeCircularDependency { remaining_nodes });
                }
            }
        }
        Ok(order)
    }

    /// Check every flow output reference; outputs pointing at aggregation nodes are dropped.
    pub fn ensure_outputs_valid(flow: &Flow) -> Result<IndexMap<String, FlowOutputDefinition>, ValidationError> {
        let mut outputs = IndexMap::new();
        for (name, output) in &flow.outputs {
            match &output.reference {
                r if r.is_empty() => {
                    return Err(ValidationError::EmptyOutputReference {
                        output_name: name.clone(),
                    })
                }
                InputAssignment::FlowInput { name: input } if !flow.inputs.contains_key(input) => {
                    return Err(ValidationError::OutputFlowInputNotFound {
                        output_name: name.clone(),
                        flow_input_name: input.clone(),
                    })
                }
                InputAssignment::NodeReference { node, .. } => match flow.get_node(node) {
                    None => {
                        return Err(ValidationError::OutputNodeNotFound {
                            output_name: name.clone(),
                            node_name: node.clone(),
                        })
                    }
                    Some(n) if n.aggregation => {
                        tracing::warn!(
                            "Output '{}' references a reduce node '{}', will not take effect.",
                            name,
                            node
                        );
                        continue;
                    }
                    Some(_) => {}
                },
                _ => {}
            }
            outputs.insert(name.clone(), output.clone());
        }
        Ok(outputs)
    }

    fn parse_input_value(
        key: &str,
        value: &Value,
        expected: ValueType,
        idx: Option<usize>,
    ) -> Result<Value, ValidationError> {
        let line_info = idx.map(|i| format!(" in line {} of input data", i)).unwrap_or_default();
        let flow_input_info = format!("'{}'{}", key, line_info);
        expected.parse(value).map_err(|e| match e {
            ParseValueError::Json(message) => ValidationError::InputParseError {
                flow_input_info,
                value_type: expected.as_str().to_string(),
                input_value: value.to_string(),
                error_type_and_message: format!("(JSONDecodeError) {}", message),
            },
            ParseValueError::Type(_) => ValidationError::InputTypeError {
                flow_input_info,
                expected_type: expected.as_str().to_string(),
            },
        })
    }

    /// Coerce the inputs that are declared by the flow; missing ones are ignored.
    pub fn resolve_flow_inputs_type(
        flow: &Flow,
        inputs: &IndexMap<String, Value>,
        idx: Option<usize>,
    ) -> Result<IndexMap<String, Value>, ValidationError> {
        Self::resolve_inputs_type_inner(&flow.inputs, inputs, idx)
    }

    fn resolve_inputs_type_inner(
        definitions: &IndexMap<String, FlowInputDefinition>,
        inputs: &IndexMap<String, Value>,
        idx: Option<usize>,
    ) -> Result<IndexMap<String, Value>, ValidationError> {
        let mut updated = inputs.clone();
        for (key, def) in definitions {
            if let Some(value) = inputs.get(key) {
                updated.insert(key.clone(), Self::parse_input_value(key, value, def.value_type, idx)?);
            }
        }
        Ok(updated)
    }

    /// Require every declared input to be present, then coerce types.
    pub fn ensure_flow_inputs_type(
        flow: &Flow,
        inputs: &IndexMap<String, Value>,
        idx: Option<usize>,
    ) -> Result<IndexMap<String, Value>, ValidationError> {
        for key in flow.inputs.keys() {
            if !inputs.contains_key(key) {
                let line_info = match idx {
                    Some(i) => format!("in line {} of input data", i),
                    None => "in input data".to_string(),
                };
                return Err(ValidationError::InputNotFound {
                    input_name: key.clone(),
                    line_info,
                });
            }
        }
        Self::resolve_inputs_type_inner(&flow.inputs, inputs, idx)
    }

    /// Coerce each element of list-valued aggregation inputs.
    pub fn resolve_aggregated_flow_inputs_type(
        flow: &Flow,
        inputs: &IndexMap<String, Vec<Value>>,
    ) -> Result<IndexMap<String, Vec<Value>>, ValidationError> {
        let mut updated = IndexMap::new();
        for (key, def) in &flow.inputs {
            if let Some(values) = inputs.get(key) {
                let parsed = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Self::parse_input_value(key, v, def.value_type, Some(i)))
                    .collect::<Result<Vec<_>, _>>()?;
                updated.insert(key.clone(), parsed);
            }
        }
        Ok(updated)
    }

    /// Fill missing inputs from their declared defaults.
    pub fn apply_default_value_for_input(
        definitions: &IndexMap<String, FlowInputDefinition>,
        line_inputs: &IndexMap<String, Value>,
    ) -> IndexMap<String, Value> {
        let mut updated = line_inputs.clone();
        for (key, def) in definitions {
            if updated.contains_key(key) {
                continue;
            }
            if let Some(default) = &def.default {
                updated.insert(key.clone(), default.clone());
            }
        }
        updated
    }

    /// Aggregated flow inputs and aggregation reference inputs must be
    /// disjoint lists of the same length.
    pub fn validate_aggregation_inputs(
        aggregated_flow_inputs: &IndexMap<String, Value>,
        aggregation_inputs: &IndexMap<String, Value>,
    ) -> Result<(), AggregationError> {
        for (key, value) in aggregated_flow_inputs {
            if aggregation_inputs.contains_key(key) {
                return Err(AggregationError::DuplicateInput { input_key: key.clone() });
            }
            if value.as_array().is_none() {
                return Err(AggregationError::FlowInputNotList {
                    input_key: key.clone(),
                    value_type: value.type_name().to_string(),
                });
            }
        }
        for (key, value) in aggregation_inputs {
            if value.as_array().is_none() {
                return Err(AggregationError::ReferenceInputNotList {
                    input_key: key.clone(),
                    value_type: value.type_name().to_string(),
                });
            }
        }

        let key_len: IndexMap<String, usize> = aggregated_flow_inputs
            .iter()
            .chain(aggregation_inputs.iter())
            .map(|(k, v)| (k.clone(), v.as_array().map(Vec::len).unwrap_or_default()))
            .collect();
        let distinct: HashSet<usize> = key_len.values().copied().collect();
        if distinct.len() > 1 {
            return Err(AggregationError::LengthMismatch { key_len });
        }
        Ok(())
    }

    /// A batch run needs at least one declared flow input.
    pub fn ensure_flow_valid_in_batch_mode(flow: &Flow) -> Result<(), ValidationError> {
        if flow.inputs.is_empty() {
            return Err(ValidationError::InputNotFound {
                input_name: "<any>".to_string(),
                line_info: "because the flow declares no inputs, which batch mode requires".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfcore::{Node, ToolType};

    fn python_node(name: &str) -> Node {
        Node::new(name, ToolType::Python)
    }

    #[test]
    fn test_reorders_by_dependency_and_declaration() {
        let mut flow = Flow::new("f");
        flow.add_input("text", FlowInputDefinition::new(ValueType::String));
        flow.add_node(python_node("c").with_input("x", "${b.output}"));
        flow.add_node(python_node("a").with_input("x", "${inputs.text}"));
        flow.add_node(python_node("b").with_input("x", "${a}"));
        flow.add_node(python_node("d"));

        let validated = FlowValidator::validate(&flow).unwrap();
        let names: Vec<_> = validated.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert!(matches!(validated, Cow::Owned(_)));

        // validating the canonical flow again is a no-op
        let again = FlowValidator::validate(&validated).unwrap();
        assert!(matches!(again, Cow::Borrowed(_)));
    }

    #[test]
    fn test_two_cycle_reports_both_nodes() {
        let mut flow = Flow::new("f");
        flow.add_node(python_node("start"));
        flow.add_node(python_node("y").with_input("v", "${x}"));
        flow.add_node(python_node("x").with_input("v", "${y}"));

        let err = FlowValidator::validate(&flow).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NodeCircularDependency {
                remaining_nodes: vec!["x".into(), "y".into()]
            }
        );
        assert!(err.to_string().contains("['x', 'y']"));
    }

    #[test]
    fn test_reference_errors() {
        let mut flow = Flow::new("f");
        flow.add_node(python_node("a").with_input("v", "${inputs.missing}"));
        assert_eq!(
            FlowValidator::validate(&flow).unwrap_err().error_code(),
            "InputReferenceNotFound"
        );

        let mut flow = Flow::new("f");
        flow.add_node(python_node("a").with_activate("${ghost.output}", true));
        assert_eq!(
            FlowValidator::validate(&flow).unwrap_err().error_code(),
            "NodeReferenceNotFound"
        );

        let mut flow = Flow::new("f");
        flow.add_node(python_node("a"));
        flow.add_node(python_node("a"));
        assert_eq!(FlowValidator::validate(&flow).unwrap_err().error_code(), "DuplicateNodeName");

        let mut flow = Flow::new("f");
        flow.add_node(python_node("agg").aggregation());
        flow.add_node(python_node("line").with_input("v", "${agg}"));
        assert_eq!(
            FlowValidator::validate(&flow).unwrap_err().error_code(),
            "InvalidNodeReference"
        );
    }

    #[test]
    fn test_outputs() {
        let mut flow = Flow::new("f");
        flow.add_node(python_node("line"));
        flow.add_node(python_node("agg").aggregation().with_input("v", "${line}"));
        flow.add_output("ok", "${line.output}");
        flow.add_output("dropped", "${agg.output}");
        let validated = FlowValidator::validate(&flow).unwrap();
        assert_eq!(validated.outputs.keys().collect::<Vec<_>>(), vec!["ok"]);

        flow.add_output("empty", "");
        assert_eq!(
            FlowValidator::validate(&flow).unwrap_err().error_code(),
            "EmptyOutputReference"
        );
    }

    #[test]
    fn test_ensure_inputs_type() {
        let mut flow = Flow::new("f");
        flow.add_input("n", FlowInputDefinition::new(ValueType::Int));
        flow.add_input("tags", FlowInputDefinition::new(ValueType::List));

        let mut inputs = IndexMap::new();
        inputs.insert("n".to_string(), Value::from("5"));
        let err = FlowValidator::ensure_flow_inputs_type(&flow, &inputs, Some(2)).unwrap_err();
        assert!(err.to_string().contains("'tags' is not provided in line 2 of input data"));

        inputs.insert("tags".to_string(), Value::from("[1,"));
        let err = FlowValidator::ensure_flow_inputs_type(&flow, &inputs, None).unwrap_err();
        assert_eq!(err.error_code(), "InputParseError");

        inputs.insert("tags".to_string(), Value::from("[1]"));
        let resolved = FlowValidator::ensure_flow_inputs_type(&flow, &inputs, None).unwrap();
        assert_eq!(resolved["n"], Value::Int(5));
        assert_eq!(resolved["tags"], Value::Array(vec![Value::Int(1)]));
    }

    #[test]
    fn test_aggregation_length_mismatch_message() {
        let mut flow_inputs = IndexMap::new();
        flow_inputs.insert("input1".to_string(), Value::Array(vec![Value::Int(1), Value::Int(2)]));
        let mut agg_inputs = IndexMap::new();
        agg_inputs.insert("input_2".to_string(), Value::Array(vec![Value::Int(1)]));

        let err = FlowValidator::validate_aggregation_inputs(&flow_inputs, &agg_inputs).unwrap_err();
        assert!(err.to_string().contains("{'input1': 2, 'input_2': 1}"));
    }
}
