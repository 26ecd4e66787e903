//! HTTP client for the AI-Horde style job queue.
//!
//! `POST /v2/generate/pop` acquires a job, `POST /v2/generate/submit`
//! returns a result or, with `state: "faulted"`, reports a failure.
//! Every request carries the worker's key in the `apikey` header.

use async_trait::async_trait;
use kiln_core::hashing::sha256_hex;
use kiln_core::job::{split_prompt, GenerationParams, JobDescriptor, SourceImage, SourceProcessing};
use kiln_core::sampler::KARRAS_SCHEDULER;
use kiln_pipeline::error::QueueError;
use kiln_pipeline::queue::{JobQueue, Submission};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const BRIDGE_AGENT: &str = concat!("kiln-worker:", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PopRequest<'a> {
    name: &'a str,
    models: &'a [String],
    max_pixels: u64,
    nsfw: bool,
    allow_img2img: bool,
    bridge_agent: &'a str,
}

/// Body of a pop response. `id: null` means no job is available.
#[derive(Debug, Default, Deserialize)]
pub struct PopResponse {
    pub id: Option<String>,
    #[serde(default)]
    pub ids: Vec<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub payload: PopPayload,
    pub source_image: Option<String>,
    pub source_processing: Option<String>,
    pub r2_upload: Option<String>,
    #[serde(default)]
    pub r2_uploads: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PopPayload {
    #[serde(default)]
    pub prompt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub ddim_steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub sampler_name: Option<String>,
    #[serde(default)]
    pub karras: bool,
    pub denoising_strength: Option<f64>,
    /// String or number on the wire.
    pub seed: Option<Value>,
    pub n: Option<u32>,
    pub video_length: Option<u32>,
    pub fps: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    id: &'a str,
    generation: &'a str,
    state: &'a str,
    seed: String,
    media_type: &'a str,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HordeQueue {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    worker_name: String,
    models: Vec<String>,
    max_pixels: u64,
}

impl HordeQueue {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        worker_name: impl Into<String>,
        models: Vec<String>,
        max_pixels: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            worker_name: worker_name.into(),
            models,
            max_pixels,
        }
    }

    async fn post_submit(&self, body: &SubmitRequest<'_>) -> Result<(), QueueError> {
        let response = self
            .http
            .post(format!("{}/v2/generate/submit", self.base_url))
            .header("apikey", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if matches!(status.as_u16(), 400 | 404) {
            Err(QueueError::Rejected {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(QueueError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl JobQueue for HordeQueue {
    async fn pop(&self) -> Result<Option<JobDescriptor>, QueueError> {
        let request = PopRequest {
            name: &self.worker_name,
            models: &self.models,
            max_pixels: self.max_pixels,
            nsfw: false,
            allow_img2img: true,
            bridge_agent: BRIDGE_AGENT,
        };

        let response = self
            .http
            .post(format!("{}/v2/generate/pop", self.base_url))
            .header("apikey", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: PopResponse = response
            .json()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;

        let job = into_job(body, self.models.first().map(String::as_str));
        if let Some(job) = &job {
            tracing::debug!(job_id = job.primary_id(), model = %job.model, "Popped job");
        }
        Ok(job)
    }

    async fn submit(&self, submission: &Submission) -> Result<(), QueueError> {
        self.post_submit(&SubmitRequest {
            id: &submission.job_id,
            generation: &submission.reference,
            state: "ok",
            seed: submission.seed.to_string(),
            media_type: submission.media_kind.as_str(),
        })
        .await
    }

    async fn cancel(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        tracing::debug!(job_id, reason, "Reporting job as faulted");
        self.post_submit(&SubmitRequest {
            id: job_id,
            generation: "faulted",
            state: "faulted",
            seed: "0".to_string(),
            media_type: "image",
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Build a descriptor from a pop response. `default_model` is used when
/// the queue omits the model (single-model workers).
pub fn into_job(response: PopResponse, default_model: Option<&str>) -> Option<JobDescriptor> {
    let primary = response.id?;
    let ids = if response.ids.is_empty() {
        vec![primary]
    } else {
        response.ids
    };
    let model = response.model.or_else(|| default_model.map(str::to_string))?;
    let payload = response.payload;

    let source_image = response.source_image.filter(|s| !s.is_empty()).map(|s| {
        if s.starts_with("http://") || s.starts_with("https://") {
            SourceImage::Url(s)
        } else {
            SourceImage::Inline(s)
        }
    });
    let source_processing = match response.source_processing.as_deref() {
        Some("img2img") if source_image.is_some() => SourceProcessing::Img2Img,
        _ => SourceProcessing::Txt2Img,
    };

    let (prompt, negative_prompt) = split_prompt(&payload.prompt);
    let base_seed = payload.seed.as_ref().map(parse_seed).unwrap_or(0);
    let seeds = (0..ids.len() as u64).map(|i| base_seed.wrapping_add(i)).collect();

    let delivery_targets = if response.r2_uploads.is_empty() {
        let single = response.r2_upload.filter(|u| !u.is_empty());
        ids.iter().map(|_| single.clone()).collect()
    } else {
        ids.iter()
            .enumerate()
            .map(|(i, _)| response.r2_uploads.get(i).cloned().filter(|u| !u.is_empty()))
            .collect()
    };

    if let Some(n) = payload.n {
        if n as usize != ids.len() {
            tracing::debug!(n, ids = ids.len(), "Batch size differs from id count, using ids");
        }
    }

    Some(JobDescriptor {
        params: GenerationParams {
            prompt,
            negative_prompt,
            width: payload.width,
            height: payload.height,
            steps: payload.ddim_steps,
            cfg_scale: payload.cfg_scale,
            sampler_name: payload.sampler_name,
            scheduler: payload.karras.then(|| KARRAS_SCHEDULER.to_string()),
            denoise: if source_processing == SourceProcessing::Img2Img {
                payload.denoising_strength
            } else {
                None
            },
            seeds,
            video_length: payload.video_length,
            fps: payload.fps,
        },
        ids,
        model,
        source_image,
        source_processing,
        delivery_targets,
        acquired_at: chrono::Utc::now(),
    })
}

/// Numeric seeds are used as-is; any other text is hashed to a stable
/// number.
fn parse_seed(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_else(|_| {
            let digest = sha256_hex(s.as_bytes());
            u64::from_str_radix(&digest[..16], 16).unwrap_or_default()
        }),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pop(body: Value) -> PopResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn empty_pop_yields_no_job() {
        assert!(into_job(pop(json!({ "id": null, "skipped": {} })), Some("sdxl")).is_none());
    }

    #[test]
    fn maps_payload_to_descriptor() {
        let job = into_job(
            pop(json!({
                "id": "a1",
                "model": "sdxl",
                "payload": {
                    "prompt": "a red barn ### fog",
                    "width": 832, "height": 1216,
                    "ddim_steps": 25, "cfg_scale": 6.5,
                    "sampler_name": "k_dpmpp_2m", "karras": true,
                    "denoising_strength": 0.4,
                    "seed": "4242", "n": 1
                },
                "r2_upload": "https://blob/a1"
            })),
            None,
        )
        .unwrap();

        assert_eq!(job.ids, vec!["a1"]);
        assert_eq!(job.params.prompt, "a red barn");
        assert_eq!(job.params.negative_prompt.as_deref(), Some("fog"));
        assert_eq!(job.params.steps, Some(25));
        assert_eq!(job.params.scheduler.as_deref(), Some(KARRAS_SCHEDULER));
        assert_eq!(job.params.seeds, vec![4242]);
        // No source image: denoise strength is meaningless.
        assert_eq!(job.params.denoise, None);
        assert_eq!(job.delivery_target(0), Some("https://blob/a1"));
    }

    #[test]
    fn batch_ids_get_consecutive_seeds_and_own_targets() {
        let job = into_job(
            pop(json!({
                "id": "a",
                "ids": ["a", "b"],
                "model": "flux.1-dev",
                "payload": { "prompt": "p", "seed": 10, "n": 2 },
                "r2_uploads": ["https://blob/a", "https://blob/b"]
            })),
            None,
        )
        .unwrap();
        assert_eq!(job.params.seeds, vec![10, 11]);
        assert_eq!(job.delivery_target(1), Some("https://blob/b"));
    }

    #[test]
    fn img2img_jobs_keep_denoise_and_source() {
        let job = into_job(
            pop(json!({
                "id": "a",
                "model": "sdxl",
                "payload": { "prompt": "p", "denoising_strength": 0.55 },
                "source_image": "https://img/src.webp",
                "source_processing": "img2img"
            })),
            None,
        )
        .unwrap();
        assert!(job.wants_image_conditioning());
        assert_eq!(job.source_image, Some(SourceImage::Url("https://img/src.webp".into())));
        assert_eq!(job.params.denoise, Some(0.55));
    }

    #[test]
    fn missing_model_uses_default() {
        let job = into_job(pop(json!({ "id": "a", "payload": { "prompt": "p" } })), Some("sdxl")).unwrap();
        assert_eq!(job.model, "sdxl");
        assert!(into_job(pop(json!({ "id": "a", "payload": {} })), None).is_none());
    }

    #[test]
    fn non_numeric_seed_is_stable() {
        let seed = parse_seed(&json!("lighthouse"));
        assert_eq!(seed, parse_seed(&json!("lighthouse")));
        assert_ne!(seed, parse_seed(&json!("harbour")));
    }
}
