//! Result Extractor.
//!
//! Picks the deliverable files out of an execution's outputs (or the file
//! the filesystem fallback found), downloads and validates them, and
//! returns them as an [`ArtifactSet`].
//!
//! Selection rules:
//! - Video beats image. `videos` and `gifs` entries are video, as are
//!   `images` entries from animated savers or with a video extension.
//! - Video-only jobs never deliver images.
//! - Temporary previews are used only when no saved output exists.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use kiln_comfyui::history::{NodeOutput, OutputFile};
use kiln_core::media::{Artifact, ArtifactSet, MediaKind};

use crate::detector::Completion;
use crate::engine::EngineClient;
use crate::error::PipelineError;
use crate::meta::JobMeta;

pub struct ResultExtractor<'a> {
    engine: &'a dyn EngineClient,
}

impl<'a> ResultExtractor<'a> {
    pub fn new(engine: &'a dyn EngineClient) -> Self {
        Self { engine }
    }

    pub async fn extract(&self, completion: Completion, meta: &JobMeta) -> Result<ArtifactSet, PipelineError> {
        match completion {
            Completion::Outputs(outputs) => self.from_outputs(&outputs, meta).await,
            Completion::Fallback(path) => from_file(&path, meta).await,
        }
    }

    async fn from_outputs(
        &self,
        outputs: &BTreeMap<String, NodeOutput>,
        meta: &JobMeta,
    ) -> Result<ArtifactSet, PipelineError> {
        let selected = select_files(outputs, meta.video_only);
        if selected.is_empty() {
            return Err(PipelineError::NoArtifact(if meta.video_only {
                "no video output for a video-only job".to_string()
            } else {
                "engine reported no media outputs".to_string()
            }));
        }

        let mut artifacts = Vec::with_capacity(selected.len());
        for (file, kind) in selected {
            let bytes = match self.engine.fetch_file(file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(job_id = %meta.job_id, filename = %file.filename, error = %e, "Failed to fetch output");
                    continue;
                }
            };
            if let Some(artifact) = validate(bytes, kind, &file.filename, meta) {
                artifacts.push(artifact);
            }
        }

        ArtifactSet::new(artifacts)
            .ok_or_else(|| PipelineError::NoArtifact("every output was empty or undecodable".to_string()))
    }
}

/// Files to deliver, in node-id then position order.
pub fn select_files(outputs: &BTreeMap<String, NodeOutput>, video_only: bool) -> Vec<(&OutputFile, MediaKind)> {
    let mut videos = Vec::new();
    let mut images = Vec::new();

    for output in outputs.values() {
        videos.extend(output.videos.iter().chain(&output.gifs));
        for file in &output.images {
            let video_ext = MediaKind::from_filename(&file.filename) == Some(MediaKind::Video);
            if output.is_animated() || video_ext {
                videos.push(file);
            } else {
                images.push(file);
            }
        }
    }

    let (chosen, kind) = if !videos.is_empty() {
        (videos, MediaKind::Video)
    } else if video_only {
        return Vec::new();
    } else {
        (images, MediaKind::Image)
    };

    let saved: Vec<&OutputFile> = chosen.iter().copied().filter(|f| !f.is_temp()).collect();
    let files = if saved.is_empty() { chosen } else { saved };
    files.into_iter().map(|f| (f, kind)).collect()
}

async fn from_file(path: &Path, meta: &JobMeta) -> Result<ArtifactSet, PipelineError> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let kind = MediaKind::from_filename(&filename)
        .ok_or_else(|| PipelineError::NoArtifact(format!("unrecognised fallback file {filename}")))?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::NoArtifact(format!("failed to read {}: {e}", path.display())))?;

    validate(bytes, kind, &filename, meta)
        .and_then(|a| ArtifactSet::new(vec![a]))
        .ok_or_else(|| PipelineError::NoArtifact(format!("fallback file {filename} is not usable")))
}

fn validate(bytes: Vec<u8>, kind: MediaKind, filename: &str, meta: &JobMeta) -> Option<Artifact> {
    if bytes.is_empty() {
        tracing::warn!(job_id = %meta.job_id, filename, "Skipping empty output");
        return None;
    }
    if kind == MediaKind::Image {
        match image_dimensions(&bytes) {
            Some((width, height)) => {
                tracing::debug!(job_id = %meta.job_id, filename, width, height, "Validated image output");
            }
            None => {
                tracing::warn!(job_id = %meta.job_id, filename, "Skipping undecodable image output");
                return None;
            }
        }
    }
    Some(Artifact::new(bytes, kind, filename))
}

/// Read only the image header.
fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
