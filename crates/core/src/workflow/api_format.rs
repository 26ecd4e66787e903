//! The map-keyed ("API") workflow encoding.
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["4", 0] },
//!     "_meta": { "title": "KSampler" }
//!   }
//! }
//! ```
//!
//! Edges are encoded as two-element arrays `[source_node_id, output_slot]`.
//! This is the only encoding the engine accepts for execution.

use serde_json::{Map, Value};

use super::graph::{GraphFormat, Input, Link, Node, WorkflowGraph};
use crate::error::CoreError;

/// Decode an API-format workflow.
pub fn decode(json: &Value) -> Result<WorkflowGraph, CoreError> {
    let obj = json
        .as_object()
        .ok_or_else(|| CoreError::MalformedWorkflow("Workflow JSON must be an object".to_string()))?;

    if obj.is_empty() {
        return Err(CoreError::MalformedWorkflow(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }

    let mut graph = WorkflowGraph::new(GraphFormat::Api);

    for (node_id, node_value) in obj {
        let class_type = node_value
            .get("class_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CoreError::MalformedWorkflow(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                ))
            })?;

        let mut node = Node::new(node_id.clone(), class_type);
        node.title = node_value
            .pointer("/_meta/title")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if let Some(inputs) = node_value.get("inputs").and_then(|v| v.as_object()) {
            for (name, value) in inputs {
                let input = match parse_link(value) {
                    Some(link) => Input::Link(link),
                    None => Input::Value(value.clone()),
                };
                node.inputs.insert(name.clone(), input);
            }
        }

        graph.insert(node);
    }

    graph.validate_links()?;
    Ok(graph)
}

/// Encode a graph in API format.
pub fn encode(graph: &WorkflowGraph) -> Value {
    let mut out = Map::new();
    for node in graph.nodes() {
        let mut inputs = Map::new();
        for (name, input) in &node.inputs {
            let value = match input {
                Input::Value(v) => v.clone(),
                Input::Link(link) => Value::Array(vec![
                    Value::String(link.node.clone()),
                    Value::from(link.slot),
                ]),
            };
            inputs.insert(name.clone(), value);
        }

        let mut entry = Map::new();
        entry.insert("class_type".to_string(), Value::String(node.class_type.clone()));
        entry.insert("inputs".to_string(), Value::Object(inputs));
        if let Some(title) = &node.title {
            entry.insert("_meta".to_string(), serde_json::json!({ "title": title }));
        }
        out.insert(node.id.clone(), Value::Object(entry));
    }
    Value::Object(out)
}

/// Interpret `[node_id, slot]` as an edge. Node ids may be strings or
/// integers; the slot must be a non-negative integer.
fn parse_link(value: &Value) -> Option<Link> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let node = match &arr[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };
    let slot = u32::try_from(arr[1].as_u64()?).ok()?;
    Some(Link::new(node, slot))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
