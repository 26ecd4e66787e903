//! Workflow Compiler.
//!
//! Turns a template copy plus a job into the graph submitted to the engine.
//! Only literal inputs the template already exposes are overwritten; edges
//! are never touched except by the image-to-image rewrite in [`img2img`].
//! Compilation is pure: the same template and job always yield the same
//! graph.

pub mod img2img;
pub mod prompts;

use kiln_core::job::JobDescriptor;
use kiln_core::sampler::canonical_sampler_name;
use kiln_core::workflow::{node_types as nt, Node, WorkflowGraph};

use crate::error::CompileError;
use crate::staging::StagedImage;

/// Compile `template` for `job`.
///
/// `staged` is the engine-side name of the job's source image, already
/// uploaded; it is only used when the job asks for image conditioning.
pub fn compile(
    template: &WorkflowGraph,
    job: &JobDescriptor,
    staged: Option<&StagedImage>,
) -> Result<WorkflowGraph, CompileError> {
    if !template.nodes().any(|n| nt::is_recognized(&n.class_type)) {
        return Err(CompileError::UnsupportedTemplate {
            node_count: template.len(),
        });
    }

    let mut graph = template.clone();

    if job.wants_image_conditioning() {
        match staged {
            Some(image) => {
                img2img::apply(&mut graph, &image.filename, job.batch_size());
            }
            None => tracing::warn!(
                job_id = job.primary_id(),
                "Image-conditioned job without a staged image, compiling as text-to-image",
            ),
        }
    }

    for node in graph.nodes_mut() {
        if nt::is_sampler(&node.class_type) {
            apply_sampler(node, job);
        }
        if nt::is_size_node(&node.class_type) {
            apply_size(node, job);
        }
        if let Some(field) = nt::fps_field(&node.class_type) {
            if let Some(fps) = job.params.fps {
                node.set_existing(field, fps);
            }
        }
        if nt::is_output_node(&node.class_type) {
            node.set_existing("filename_prefix", job.output_prefix());
        }
    }

    prompts::route_prompts(&mut graph, job);

    graph.validate_links()?;
    Ok(graph)
}

fn apply_sampler(node: &mut Node, job: &JobDescriptor) {
    let params = &job.params;
    let seed = job.seed_for(0);
    node.set_existing("seed", seed);
    node.set_existing("noise_seed", seed);

    if let Some(steps) = params.steps {
        node.set_existing("steps", steps);
    }
    if let Some(cfg) = params.cfg_scale {
        node.set_existing("cfg", cfg);
    }
    if let Some(name) = &params.sampler_name {
        node.set_existing("sampler_name", canonical_sampler_name(name));
    }
    if let Some(scheduler) = &params.scheduler {
        node.set_existing("scheduler", scheduler.as_str());
    }
    if let Some(denoise) = params.denoise {
        node.set_existing("denoise", denoise);
    }
}

fn apply_size(node: &mut Node, job: &JobDescriptor) {
    let params = &job.params;
    if let Some(width) = params.width {
        node.set_existing("width", width);
    }
    if let Some(height) = params.height {
        node.set_existing("height", height);
    }
    if let Some(length) = params.video_length {
        node.set_existing("length", length);
    }
    if job.batch_size() > 1 {
        node.set_existing("batch_size", job.batch_size());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
