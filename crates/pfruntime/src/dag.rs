use indexmap::{IndexMap, IndexSet};
use pfcore::{ExecutionError, InputAssignment, Node, Tool, ValidationError, Value};
use std::collections::HashSet;

/// Scheduling state of the nodes of one line.
///
/// Nodes move from pending to either completed (they ran, or were skipped
/// with a return value) or bypassed (their activate condition was not met).
pub struct DagManager {
    flow_inputs: IndexMap<String, Value>,
    pending: IndexMap<String, Node>,
    completed_nodes_outputs: IndexMap<String, Value>,
    bypassed_nodes: IndexSet<String>,
}

impl DagManager {
    pub fn new(nodes: Vec<Node>, flow_inputs: IndexMap<String, Value>) -> Self {
        Self {
            flow_inputs,
            pending: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            completed_nodes_outputs: IndexMap::new(),
            bypassed_nodes: IndexSet::new(),
        }
    }

    pub fn completed_nodes_outputs(&self) -> &IndexMap<String, Value> {
        &self.completed_nodes_outputs
    }

    pub fn bypassed_nodes(&self) -> &IndexSet<String> {
        &self.bypassed_nodes
    }

    pub fn flow_inputs(&self) -> &IndexMap<String, Value> {
        &self.flow_inputs
    }

    /// Take the pending nodes whose dependencies have all completed or been
    /// bypassed.
    pub fn pop_ready_nodes(&mut self) -> Vec<Node> {
        let ready: Vec<String> = self
            .pending
            .values()
            .filter(|n| self.is_node_ready(n))
            .map(|n| n.name.clone())
            .collect();
        ready.iter().filter_map(|name| self.pending.shift_remove(name)).collect()
    }

    /// Take the ready nodes that will not run, marking them bypassed.
    ///
    /// Call repeatedly until it returns nothing: bypassing one node can make
    /// its dependents bypassable.
    pub fn pop_bypassable_nodes(&mut self) -> Vec<Node> {
        let bypassable: Vec<String> = self
            .pending
            .values()
            .filter(|n| self.is_node_ready(n) && self.is_node_bypassable(n))
            .map(|n| n.name.clone())
            .collect();
        let nodes: Vec<Node> = bypassable
            .iter()
            .filter_map(|name| self.pending.shift_remove(name))
            .collect();
        self.bypassed_nodes.extend(bypassable);
        nodes
    }

    /// Resolve the node's inputs against the flow inputs and completed
    /// outputs. Inputs fed by a bypassed node fall back to the tool's
    /// default, or null when there is none.
    pub fn get_node_valid_inputs(
        &self,
        node: &Node,
        definition: Option<&Tool>,
    ) -> Result<IndexMap<String, Value>, ExecutionError> {
        let mut results = IndexMap::new();
        for (name, assignment) in &node.inputs {
            if let Some(dependency) = assignment.referenced_node() {
                if self.bypassed_nodes.contains(dependency) {
                    let has_default = definition
                        .and_then(|t| t.inputs.get(name))
                        .is_some_and(|d| d.default.is_some());
                    if !has_default {
                        tracing::warn!(
                            "The node '{}' referenced by the input '{}' of the current node '{}' has been bypassed, \
                             and no default value is set. Will use 'None' as the value for this input.",
                            dependency,
                            name,
                            node.name
                        );
                        results.insert(name.clone(), Value::Null);
                    }
                    continue;
                }
            }
            results.insert(
                name.clone(),
                parse_value(assignment, &self.completed_nodes_outputs, &self.flow_inputs)?,
            );
        }
        Ok(results)
    }

    /// Evaluate an assignment in the current state, e.g. a skip condition.
    pub fn evaluate(&self, assignment: &InputAssignment) -> Result<Value, ExecutionError> {
        parse_value(assignment, &self.completed_nodes_outputs, &self.flow_inputs)
    }

    pub fn complete_nodes(&mut self, nodes_outputs: IndexMap<String, Value>) {
        self.completed_nodes_outputs.extend(nodes_outputs);
    }

    /// No node is pending.
    pub fn completed(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fail with the first missing dependency of a node that can never run.
    pub fn ensure_completed(&self) -> Result<(), ExecutionError> {
        for node in self.pending.values() {
            let missing = node
                .all_assignments()
                .into_iter()
                .filter_map(InputAssignment::referenced_node)
                .find(|dep| !self.completed_nodes_outputs.contains_key(*dep) && !self.bypassed_nodes.contains(*dep));
            if let Some(dep) = missing {
                return Err(ExecutionError::NodeOutputNotFound {
                    output_name: node.name.clone(),
                    node_name: dep.to_string(),
                });
            }
        }
        Ok(())
    }

    fn is_node_ready(&self, node: &Node) -> bool {
        node.all_assignments()
            .into_iter()
            .filter_map(InputAssignment::referenced_node)
            .all(|dep| self.completed_nodes_outputs.contains_key(dep) || self.bypassed_nodes.contains(dep))
    }

    fn is_node_bypassable(&self, node: &Node) -> bool {
        if let Some(activate) = &node.activate {
            if let Some(dep) = activate.when.referenced_node() {
                if self.bypassed_nodes.contains(dep) {
                    tracing::info!(
                        "The node '{}' will be bypassed because it depends on the node '{}' which has already been \
                         bypassed in the activate config.",
                        node.name,
                        dep
                    );
                    return true;
                }
            }
            let value = parse_value(&activate.when, &self.completed_nodes_outputs, &self.flow_inputs).ok();
            if value.as_ref() != Some(&activate.is) {
                tracing::info!(
                    "The node '{}' will be bypassed because the activate condition is not met, i.e. '{}' is not \
                     equal to '{}'.",
                    node.name,
                    activate.when,
                    activate.is
                );
                return true;
            }
            tracing::info!(
                "The node '{}' will be executed because the activate condition is met, i.e. '{}' is equal to '{}'.",
                node.name,
                activate.when,
                activate.is
            );
            return false;
        }

        let dependencies: HashSet<&str> = node
            .inputs
            .values()
            .filter_map(InputAssignment::referenced_node)
            .collect();
        let all_bypassed = !dependencies.is_empty() && dependencies.iter().all(|d| self.bypassed_nodes.contains(*d));
        if all_bypassed {
            tracing::info!(
                "The node '{}' will be bypassed because all nodes {:?} it depends on are bypassed.",
                node.name,
                dependencies
            );
        }
        all_bypassed
    }
}

/// Evaluate an input assignment against node outputs and flow inputs.
pub fn parse_value(
    assignment: &InputAssignment,
    nodes_outputs: &IndexMap<String, Value>,
    flow_inputs: &IndexMap<String, Value>,
) -> Result<Value, ExecutionError> {
    match assignment {
        InputAssignment::Literal(value) => Ok(value.clone()),
        InputAssignment::FlowInput { name } => flow_inputs.get(name).cloned().ok_or_else(|| {
            ExecutionError::Input(ValidationError::InputNotFound {
                input_name: name.clone(),
                line_info: "in input data".to_string(),
            })
        }),
        InputAssignment::NodeReference { node, section, property } => {
            if section != "output" {
                return Err(ExecutionError::InvalidReferenceProperty {
                    node_name: node.clone(),
                    property: section.clone(),
                });
            }
            let output = nodes_outputs.get(node).ok_or_else(|| ExecutionError::NodeOutputNotFound {
                output_name: node.clone(),
                node_name: node.clone(),
            })?;
            parse_node_property(node, output, property.as_deref())
        }
    }
}

/// Walk `property` (e.g. `answer.choices[0].text` or `items.0`) into `value`.
pub fn parse_node_property(node_name: &str, value: &Value, property: Option<&str>) -> Result<Value, ExecutionError> {
    let Some(property) = property else {
        return Ok(value.clone());
    };
    let invalid = || ExecutionError::InvalidReferenceProperty {
        node_name: node_name.to_string(),
        property: property.to_string(),
    };

    let mut current = value;
    for segment in property.split('.') {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key).ok_or_else(invalid)?,
                Value::Array(items) => {
                    let index: usize = key.parse().map_err(|_| invalid())?;
                    items.get(index).ok_or_else(invalid)?
                }
                _ => return Err(invalid()),
            };
        }
        let mut rest = indexes;
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(invalid)?;
            let token = stripped[..end].trim_matches(|c| c == '\'' || c == '"');
            current = match current {
                Value::Array(items) => {
                    let index: usize = token.parse().map_err(|_| invalid())?;
                    items.get(index).ok_or_else(invalid)?
                }
                Value::Object(map) => map.get(token).ok_or_else(invalid)?,
                _ => return Err(invalid()),
            };
            rest = &stripped[end + 1..];
        }
        if !rest.is_empty() {
            return Err(invalid());
        }
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfcore::{InputDefinition, ToolType, ValueType};
    use serde_json::json;

    fn node(name: &str) -> Node {
        Node::new(name, ToolType::Python)
    }

    fn names(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_ready_nodes_follow_dependencies() {
        let nodes = vec![
            node("a").with_input("x", "${inputs.text}"),
            node("b").with_input("x", "${a.output}"),
            node("c").with_input("x", "${a}").with_input("y", "${b.output}"),
        ];
        let mut inputs = IndexMap::new();
        inputs.insert("text".to_string(), Value::from("hi"));
        let mut dag = DagManager::new(nodes, inputs);

        assert_eq!(names(&dag.pop_ready_nodes()), vec!["a"]);
        assert!(dag.pop_ready_nodes().is_empty());
        dag.complete_nodes([("a".to_string(), Value::from(1i64))].into_iter().collect());
        assert_eq!(names(&dag.pop_ready_nodes()), vec!["b"]);
        dag.complete_nodes([("b".to_string(), Value::from(2i64))].into_iter().collect());
        let ready = dag.pop_ready_nodes();
        assert_eq!(names(&ready), vec!["c"]);
        assert!(dag.completed());

        let inputs = dag.get_node_valid_inputs(&ready[0], None).unwrap();
        assert_eq!(inputs["x"], Value::from(1i64));
        assert_eq!(inputs["y"], Value::from(2i64));
    }

    #[test]
    fn test_activate_condition_bypasses_chain() {
        let nodes = vec![
            node("classify").with_input("x", "${inputs.text}"),
            node("math").with_input("q", "${inputs.text}").with_activate("${classify.output}", "math"),
            node("explain").with_input("answer", "${math.output}"),
            node("summary").with_input("answer", "${math.output}").with_input("label", "${classify.output}"),
        ];
        let mut inputs = IndexMap::new();
        inputs.insert("text".to_string(), Value::from("poem"));
        let mut dag = DagManager::new(nodes, inputs);

        assert!(dag.pop_bypassable_nodes().is_empty());
        assert_eq!(names(&dag.pop_ready_nodes()), vec!["classify"]);
        dag.complete_nodes([("classify".to_string(), Value::from("poetry"))].into_iter().collect());

        assert_eq!(names(&dag.pop_bypassable_nodes()), vec!["math"]);
        assert_eq!(names(&dag.pop_bypassable_nodes()), vec!["explain"]);
        assert!(dag.pop_bypassable_nodes().is_empty());

        let ready = dag.pop_ready_nodes();
        assert_eq!(names(&ready), vec!["summary"]);
        let inputs = dag.get_node_valid_inputs(&ready[0], None).unwrap();
        assert_eq!(inputs["answer"], Value::Null);
        assert_eq!(inputs["label"], Value::from("poetry"));
        assert!(dag.completed());
    }

    #[test]
    fn test_bypassed_input_uses_default_or_null() {
        let target = node("target").with_input("a", "${skipped.output}").with_input("b", "${skipped.output}");
        let mut dag = DagManager::new(vec![], IndexMap::new());
        dag.bypassed_nodes.insert("skipped".to_string());

        let tool = Tool::new("target", ToolType::Python)
            .with_input("a", InputDefinition::of(ValueType::String).with_default("fallback"))
            .with_input("b", InputDefinition::of(ValueType::String));
        let inputs = dag.get_node_valid_inputs(&target, Some(&tool)).unwrap();
        assert!(!inputs.contains_key("a"));
        assert_eq!(inputs["b"], Value::Null);
    }

    #[test]
    fn test_parse_value_errors() {
        let outputs = IndexMap::new();
        let inputs = IndexMap::new();
        let err = parse_value(&InputAssignment::flow_input("missing"), &outputs, &inputs).unwrap_err();
        assert!(matches!(err, ExecutionError::Input(ValidationError::InputNotFound { .. })));

        let err = parse_value(&InputAssignment::node_output("ghost"), &outputs, &inputs).unwrap_err();
        assert!(matches!(err, ExecutionError::NodeOutputNotFound { .. }));

        let reference = InputAssignment::parse(&Value::from("${a.input}"));
        let err = parse_value(&reference, &outputs, &inputs).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidReferenceProperty { .. }));
    }

    #[test]
    fn test_parse_node_property_paths() {
        let value = Value::from(json!({"choices": [{"text": "a"}, {"text": "b"}], "items": [1, 2]}));
        assert_eq!(
            parse_node_property("llm", &value, Some("choices[1].text")).unwrap(),
            Value::from("b")
        );
        assert_eq!(parse_node_property("llm", &value, Some("items.0")).unwrap(), Value::from(1i64));
        assert_eq!(parse_node_property("llm", &value, Some("choices[0]['text']")).unwrap(), Value::from("a"));
        assert!(matches!(
            parse_node_property("llm", &value, Some("missing")),
            Err(ExecutionError::InvalidReferenceProperty { .. })
        ));
        assert_eq!(parse_node_property("llm", &value, None).unwrap(), value);
    }
}
