//! In-memory workflow graph shared by both physical encodings.
//!
//! Nodes live in a sorted map keyed by id, so iteration and encoding are
//! deterministic: compiling the same template with the same job always
//! produces the same bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::CoreError;
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Reference to output `slot` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub node: NodeId,
    pub slot: u32,
}

impl Link {
    pub fn new(node: impl Into<NodeId>, slot: u32) -> Self {
        Self {
            node: node.into(),
            slot,
        }
    }
}

/// A named node input: either a literal widget value or an edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Value(Value),
    Link(Link),
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub class_type: String,
    /// Display title from the editor, when the export carried one.
    pub title: Option<String>,
    pub inputs: BTreeMap<String, Input>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, class_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class_type: class_type.into(),
            title: None,
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.to_string(), Input::Value(value.into()));
        self
    }

    pub fn with_link(mut self, name: &str, link: Link) -> Self {
        self.inputs.insert(name.to_string(), Input::Link(link));
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Literal value of input `name`; `None` if absent or linked.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.inputs.get(name) {
            Some(Input::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn link(&self, name: &str) -> Option<&Link> {
        match self.inputs.get(name) {
            Some(Input::Link(l)) => Some(l),
            _ => None,
        }
    }

    /// Overwrite input `name` only if the node already exposes it as a
    /// literal. Linked or absent inputs are left alone. Returns whether the
    /// value was written.
    pub fn set_existing(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.inputs.get_mut(name) {
            Some(Input::Value(slot)) => {
                *slot = value.into();
                true
            }
            _ => false,
        }
    }

    /// All outgoing edges of this node's inputs, as `(input name, link)`.
    pub fn links(&self) -> impl Iterator<Item = (&str, &Link)> {
        self.inputs.iter().filter_map(|(name, input)| match input {
            Input::Link(l) => Some((name.as_str(), l)),
            Input::Value(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Physical encoding a graph was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    /// Map keyed by node id (`{"3": {"class_type": ..., "inputs": ...}}`).
    Api,
    /// Editor export: `nodes` array plus `links` table.
    Ui,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    nodes: BTreeMap<NodeId, Node>,
    format: GraphFormat,
}

impl WorkflowGraph {
    pub fn new(format: GraphFormat) -> Self {
        Self {
            nodes: BTreeMap::new(),
            format,
        }
    }

    pub fn from_nodes(format: GraphFormat, nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut graph = Self::new(format);
        for node in nodes {
            graph.insert(node);
        }
        graph
    }

    pub fn format(&self) -> GraphFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.id.clone(), node)
    }

    pub fn remove(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn contains_class(&self, class_type: &str) -> bool {
        self.nodes.values().any(|n| n.class_type == class_type)
    }

    pub fn nodes_of_class<'a>(&'a self, class_type: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes.values().filter(move |n| n.class_type == class_type)
    }

    /// Every input that links to node `id`, as `(consumer, input name, slot)`.
    pub fn consumers_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (&'a Node, &'a str, u32)> {
        self.nodes.values().flat_map(move |node| {
            node.links()
                .filter(move |(_, link)| link.node == id)
                .map(move |(name, link)| (node, name, link.slot))
        })
    }

    pub fn is_referenced(&self, id: &str) -> bool {
        self.consumers_of(id).next().is_some()
    }

    /// A fresh id one greater than the largest numeric id in the graph.
    pub fn next_node_id(&self) -> NodeId {
        let max = self
            .nodes
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }

    /// Ensure every edge points at a node that exists.
    pub fn validate_links(&self) -> Result<(), CoreError> {
        let ids: BTreeSet<&str> = self.nodes.keys().map(String::as_str).collect();
        for node in self.nodes.values() {
            for (name, link) in node.links() {
                if !ids.contains(link.node.as_str()) {
                    return Err(CoreError::MalformedWorkflow(format!(
                        "Node '{}' input '{name}' links to missing node '{}'",
                        node.id, link.node
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode for submission to the engine (always the API encoding).
    pub fn to_api_json(&self) -> Value {
        super::api_format::encode(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
