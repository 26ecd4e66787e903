//! Text-to-image to image-to-image conversion.
//!
//! This is the only rewrite allowed to add nodes or move edges: the empty
//! canvas feeding the sampler is replaced by `LoadImage -> VAEEncode`,
//! followed by `RepeatLatentBatch` when the job is a batch, since the
//! encoded image is a single latent.

use kiln_core::workflow::node_types::{self as nt, CHECKPOINT_VAE_SLOT};
use kiln_core::workflow::{Input, Link, Node, WorkflowGraph};

/// Point the graph at `image_name`. Returns whether the graph now consumes
/// the staged image.
pub fn apply(graph: &mut WorkflowGraph, image_name: &str, batch_size: usize) -> bool {
    // Templates built for image input only need the filename.
    let loaders: Vec<String> = graph.nodes_of_class(nt::LOAD_IMAGE).map(|n| n.id.clone()).collect();
    if !loaders.is_empty() {
        for id in &loaders {
            if let Some(node) = graph.node_mut(id) {
                node.inputs
                    .insert("image".to_string(), Input::Value(image_name.into()));
            }
        }
        return true;
    }

    let canvases: Vec<String> = graph
        .nodes()
        .filter(|n| nt::EMPTY_IMAGE_LATENTS.contains(&n.class_type.as_str()))
        .map(|n| n.id.clone())
        .collect();
    if canvases.is_empty() {
        tracing::warn!("No empty-canvas node to replace, ignoring source image");
        return false;
    }

    let Some(vae) = find_vae(graph) else {
        tracing::warn!("No VAE source in template, ignoring source image");
        return false;
    };

    let load_id = graph.next_node_id();
    graph.insert(
        Node::new(load_id.clone(), nt::LOAD_IMAGE)
            .with_title("Source Image")
            .with_value("image", image_name),
    );
    let encode_id = graph.next_node_id();
    graph.insert(
        Node::new(encode_id.clone(), nt::VAE_ENCODE)
            .with_link("pixels", Link::new(load_id, 0))
            .with_link("vae", vae),
    );
    let latent_id = if batch_size > 1 {
        let repeat_id = graph.next_node_id();
        graph.insert(
            Node::new(repeat_id.clone(), nt::REPEAT_LATENT_BATCH)
                .with_link("samples", Link::new(encode_id.clone(), 0))
                .with_value("amount", batch_size),
        );
        repeat_id
    } else {
        encode_id.clone()
    };

    let rewires: Vec<String> = canvases
        .iter()
        .flat_map(|canvas| {
            graph
                .consumers_of(canvas)
                .filter(|(consumer, input, _)| {
                    *input == "latent_image" && nt::LATENT_CONSUMERS.contains(&consumer.class_type.as_str())
                })
                .map(|(consumer, _, _)| consumer.id.clone())
                .collect::<Vec<_>>()
        })
        .collect();

    for id in &rewires {
        if let Some(node) = graph.node_mut(id) {
            node.inputs
                .insert("latent_image".to_string(), Input::Link(Link::new(latent_id.clone(), 0)));
        }
    }

    for canvas in &canvases {
        if !graph.is_referenced(canvas) {
            graph.remove(canvas);
        }
    }

    tracing::debug!(
        rewired = rewires.len(),
        encode_node = %encode_id,
        latent_node = %latent_id,
        batch_size,
        "Converted template to image-to-image",
    );
    true
}

/// The VAE the graph already decodes with, else a standalone VAE loader,
/// else the checkpoint loader's VAE output.
fn find_vae(graph: &WorkflowGraph) -> Option<Link> {
    graph
        .nodes_of_class(nt::VAE_DECODE)
        .find_map(|n| n.link("vae").cloned())
        .or_else(|| graph.nodes_of_class(nt::VAE_LOADER).next().map(|n| Link::new(n.id.clone(), 0)))
        .or_else(|| {
            graph
                .nodes_of_class(nt::CHECKPOINT_LOADER)
                .next()
                .map(|n| Link::new(n.id.clone(), CHECKPOINT_VAE_SLOT))
        })
}
