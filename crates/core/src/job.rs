//! Job descriptors as acquired from the remote queue.
//!
//! A [`JobDescriptor`] is built once on acquisition and never mutated
//! afterwards. Every generation parameter except the prompt and seeds is
//! optional: `None` means "keep whatever the workflow template says".

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Separator the queue uses to embed a negative prompt in the prompt text.
pub const NEGATIVE_PROMPT_SEPARATOR: &str = "###";

/// Prefix for every output filename the compiler assigns.
pub const OUTPUT_PREFIX: &str = "kiln_";

/// Model-name fragments that identify video-only model families.
const VIDEO_MODEL_MARKERS: &[&str] = &["wan", "ltx", "hunyuan", "mochi", "cogvideo", "video"];

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Where the source image for an image-conditioned job comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceImage {
    /// Downloadable from a URL.
    Url(String),
    /// Inline base64 payload.
    Inline(String),
}

/// Requested processing mode for the source image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProcessing {
    #[default]
    Txt2Img,
    Img2Img,
}

/// Generation parameters carried by a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    pub denoise: Option<f64>,
    /// One seed per batch item.
    pub seeds: Vec<u64>,
    /// Number of frames, for video models.
    pub video_length: Option<u32>,
    pub fps: Option<u32>,
}

/// One remote job (possibly a batch of several ids sharing parameters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Batch ids; never empty.
    pub ids: Vec<JobId>,
    pub model: String,
    pub params: GenerationParams,
    pub source_image: Option<SourceImage>,
    #[serde(default)]
    pub source_processing: SourceProcessing,
    /// Per-item upload URL, aligned with `ids`.
    #[serde(default)]
    pub delivery_targets: Vec<Option<String>>,
    pub acquired_at: Timestamp,
}

impl JobDescriptor {
    /// The id used for logging, output naming and in-flight tracking.
    pub fn primary_id(&self) -> &str {
        self.ids.first().map(String::as_str).unwrap_or_default()
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    /// Seed for batch item `index`.
    ///
    /// Falls back to the first seed, then to zero, so a job with fewer
    /// seeds than items still compiles deterministically.
    pub fn seed_for(&self, index: usize) -> u64 {
        self.params
            .seeds
            .get(index)
            .or_else(|| self.params.seeds.first())
            .copied()
            .unwrap_or(0)
    }

    /// Upload target for batch item `index`, if the queue supplied one.
    pub fn delivery_target(&self, index: usize) -> Option<&str> {
        self.delivery_targets.get(index).and_then(|t| t.as_deref())
    }

    /// Whether the job should be compiled as image-to-image.
    pub fn wants_image_conditioning(&self) -> bool {
        self.source_image.is_some() && self.source_processing == SourceProcessing::Img2Img
    }

    /// Filename prefix the engine will write this job's outputs under.
    pub fn output_prefix(&self) -> String {
        output_prefix(self.primary_id())
    }

    pub fn model_class(&self) -> ModelClass {
        ModelClass::from_model_name(&self.model)
    }
}

// ---------------------------------------------------------------------------
// Model class
// ---------------------------------------------------------------------------

/// Broad class of a model, used to decide which outputs count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Image,
    /// Produces video only; stray images are previews, never deliverables.
    VideoOnly,
}

impl ModelClass {
    pub fn from_model_name(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if VIDEO_MODEL_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::VideoOnly
        } else {
            Self::Image
        }
    }

    pub fn is_video_only(self) -> bool {
        self == Self::VideoOnly
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Output filename prefix derived from a job id.
///
/// Anything outside `[A-Za-z0-9_-]` is replaced with `_` so the prefix is
/// safe as a path component on every platform.
pub fn output_prefix(job_id: &str) -> String {
    let sanitized: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{OUTPUT_PREFIX}{sanitized}")
}

/// Split queue prompt text of the form `positive ### negative`.
///
/// Returns the trimmed positive part and, when present and non-empty, the
/// trimmed negative part.
pub fn split_prompt(text: &str) -> (String, Option<String>) {
    match text.split_once(NEGATIVE_PROMPT_SEPARATOR) {
        Some((positive, negative)) => {
            let negative = negative.trim();
            (
                positive.trim().to_string(),
                (!negative.is_empty()).then(|| negative.to_string()),
            )
        }
        None => (text.trim().to_string(), None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
