//! Per-job facts the detector and extractor need after compilation.

use kiln_core::job::JobDescriptor;
use kiln_core::media::{IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use kiln_core::workflow::node_types::VIDEO_LENGTH_NODES;
use kiln_core::workflow::WorkflowGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    pub job_id: String,
    /// Filename prefix the compiled graph writes outputs under.
    pub output_prefix: String,
    /// Image outputs are previews only and must never be delivered.
    pub video_only: bool,
}

impl JobMeta {
    pub fn new(job: &JobDescriptor, graph: &WorkflowGraph) -> Self {
        let video_graph = VIDEO_LENGTH_NODES.iter().any(|class| graph.contains_class(class));
        Self {
            job_id: job.primary_id().to_string(),
            output_prefix: job.output_prefix(),
            video_only: job.model_class().is_video_only() || video_graph,
        }
    }

    /// Extensions a produced file may carry.
    pub fn expected_extensions(&self) -> Vec<&'static str> {
        if self.video_only {
            VIDEO_EXTENSIONS.to_vec()
        } else {
            VIDEO_EXTENSIONS.iter().chain(IMAGE_EXTENSIONS).copied().collect()
        }
    }
}
