//! Prompt routing: deciding whether a prompt-encoder node carries the
//! positive or the negative prompt.
//!
//! Polarity is decided by an ordered list of resolvers. The first one to
//! answer wins; if none does, the node is treated as positive and the
//! decision is logged as a possible misrouting.

use std::collections::{BTreeSet, VecDeque};

use kiln_core::job::JobDescriptor;
use kiln_core::workflow::{node_types, Node, WorkflowGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

type Resolver = fn(&WorkflowGraph, &Node) -> Option<Polarity>;

/// Resolvers in priority order.
const RESOLVERS: &[(&str, Resolver)] = &[
    ("sampler_link", by_sampler_link as Resolver),
    ("title", by_title as Resolver),
];

/// Polarity of `node` and the resolver that decided it (`"default"` when
/// none did).
pub fn resolve_polarity(graph: &WorkflowGraph, node: &Node) -> (Polarity, &'static str) {
    RESOLVERS
        .iter()
        .find_map(|(name, resolve)| resolve(graph, node).map(|p| (p, *name)))
        .unwrap_or((Polarity::Positive, "default"))
}

/// Follow conditioning edges downstream until an input named `positive` or
/// `negative` consumes them. Intermediate nodes (guidance, control-net
/// apply, conditioning combine) are traversed. Reaching both polarities is
/// ambiguous and yields `None`.
pub fn by_sampler_link(graph: &WorkflowGraph, node: &Node) -> Option<Polarity> {
    let (mut positive, mut negative) = (false, false);
    let mut visited = BTreeSet::from([node.id.as_str()]);
    let mut frontier = VecDeque::from([node.id.as_str()]);

    while let Some(current) = frontier.pop_front() {
        for (consumer, input, _slot) in graph.consumers_of(current) {
            match input {
                "positive" => positive = true,
                "negative" => negative = true,
                _ => {
                    if visited.insert(consumer.id.as_str()) {
                        frontier.push_back(consumer.id.as_str());
                    }
                }
            }
        }
    }

    match (positive, negative) {
        (true, false) => Some(Polarity::Positive),
        (false, true) => Some(Polarity::Negative),
        _ => None,
    }
}

/// Editor titles such as "Negative Prompt" or "Pos".
pub fn by_title(_graph: &WorkflowGraph, node: &Node) -> Option<Polarity> {
    let title = node.title.as_deref()?.trim().to_ascii_lowercase();
    if title.contains("negative") || title.starts_with("neg") {
        Some(Polarity::Negative)
    } else if title.contains("positive") || title.starts_with("pos") {
        Some(Polarity::Positive)
    } else {
        None
    }
}

/// Write the job's prompt text into every prompt encoder. Text is only
/// written when the job supplies non-empty text for that polarity.
pub fn route_prompts(graph: &mut WorkflowGraph, job: &JobDescriptor) {
    let routed: Vec<(String, &'static [&'static str], Polarity)> = graph
        .nodes()
        .filter_map(|node| {
            let fields = node_types::prompt_fields(&node.class_type)?;
            let (polarity, resolver) = resolve_polarity(graph, node);
            if resolver == "default" {
                tracing::warn!(
                    job_id = job.primary_id(),
                    node_id = %node.id,
                    class_type = %node.class_type,
                    "Could not determine prompt polarity, treating as positive",
                );
            } else {
                tracing::debug!(node_id = %node.id, ?polarity, resolver, "Routed prompt encoder");
            }
            Some((node.id.clone(), fields, polarity))
        })
        .collect();

    for (id, fields, polarity) in routed {
        let text = match polarity {
            Polarity::Positive => Some(job.params.prompt.as_str()),
            Polarity::Negative => job.params.negative_prompt.as_deref(),
        };
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            continue;
        };
        if let Some(node) = graph.node_mut(&id) {
            for field in fields {
                node.set_existing(field, text);
            }
        }
    }
}
