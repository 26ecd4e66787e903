//! In-memory collaborators shared by the pipeline integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kiln_comfyui::history::{HistoryEntry, OutputFile, QueueSnapshot};
use kiln_core::job::{GenerationParams, JobDescriptor, SourceProcessing};
use kiln_core::media::Artifact;
use kiln_pipeline::delivery::{Delivered, Delivery};
use kiln_pipeline::engine::{EngineClient, EngineStatus, ExecutionHandle};
use kiln_pipeline::error::{DeliveryError, EngineError, QueueError};
use kiln_pipeline::queue::{JobQueue, Submission};
use serde_json::{json, Value};

/// 1x1 transparent PNG.
pub const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

pub fn pixel_png() -> Vec<u8> {
    BASE64.decode(PIXEL_PNG).unwrap()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn template_json() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": 1, "steps": 20, "cfg": 7.0, "sampler_name": "euler",
                "scheduler": "normal", "denoise": 1.0,
                "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sdxl.safetensors" } },
        "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, "height": 1024, "batch_size": 1 } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } },
        "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } },
        "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
        "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] } }
    })
}

/// Write `sdxl.json` into `dir`.
pub fn write_template(dir: &Path) {
    std::fs::write(dir.join("sdxl.json"), template_json().to_string()).unwrap();
}

pub fn job(ids: &[&str]) -> JobDescriptor {
    JobDescriptor {
        ids: ids.iter().map(|s| s.to_string()).collect(),
        model: "sdxl".to_string(),
        params: GenerationParams {
            prompt: "a lighthouse at dusk".to_string(),
            seeds: (0..ids.len() as u64).map(|i| 100 + i).collect(),
            ..Default::default()
        },
        source_image: None,
        source_processing: SourceProcessing::Txt2Img,
        delivery_targets: ids.iter().map(|id| Some(format!("https://blob/{id}"))).collect(),
        acquired_at: chrono::Utc::now(),
    }
}

/// Status with the given image files on output node `9`.
pub fn completed_with_images(filenames: &[&str]) -> EngineStatus {
    let images: Vec<Value> = filenames
        .iter()
        .map(|f| json!({ "filename": f, "subfolder": "", "type": "output" }))
        .collect();
    let entry: HistoryEntry = serde_json::from_value(json!({
        "outputs": { "9": { "images": images } },
        "status": { "status_str": "success", "completed": true, "messages": [] }
    }))
    .unwrap();
    EngineStatus::from_history(Some(entry))
}

pub fn failed_status(message: &str) -> EngineStatus {
    let entry: HistoryEntry = serde_json::from_value(json!({
        "outputs": {},
        "status": {
            "status_str": "error",
            "completed": false,
            "messages": [["execution_error", { "exception_message": message }]]
        }
    }))
    .unwrap();
    EngineStatus::from_history(Some(entry))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine that replays a scripted status sequence; the last status repeats.
#[derive(Default)]
pub struct FakeEngine {
    statuses: Mutex<VecDeque<EngineStatus>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    queue: Mutex<QueueSnapshot>,
    status_errors: bool,
    pub submits: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub queue_calls: AtomicUsize,
    pub cancels: AtomicUsize,
    pub submitted: Mutex<Vec<Value>>,
}

impl FakeEngine {
    pub fn new(statuses: impl IntoIterator<Item = EngineStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Every status poll fails.
    pub fn unreachable() -> Self {
        Self {
            status_errors: true,
            ..Default::default()
        }
    }

    pub fn with_file(self, filename: &str, bytes: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(filename.to_string(), bytes);
        self
    }

    pub fn with_queue(self, snapshot: QueueSnapshot) -> Self {
        *self.queue.lock().unwrap() = snapshot;
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn submit(&self, workflow: &Value, client_id: &str) -> Result<ExecutionHandle, EngineError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push(workflow.clone());
        Ok(ExecutionHandle {
            prompt_id: format!("prompt-{n}"),
            client_id: client_id.to_string(),
        })
    }

    async fn status(&self, _handle: &ExecutionHandle) -> Result<EngineStatus, EngineError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.status_errors {
            return Err(EngineError::Rejected("connection refused".into()));
        }
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(status.unwrap_or_else(EngineStatus::pending))
    }

    async fn fetch_file(&self, file: &OutputFile) -> Result<Vec<u8>, EngineError> {
        self.files
            .lock()
            .unwrap()
            .get(&file.filename)
            .cloned()
            .ok_or_else(|| EngineError::Rejected(format!("no such file {}", file.filename)))
    }

    async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.queue.lock().unwrap().clone())
    }

    async fn upload_image(
        &self,
        _bytes: Vec<u8>,
        filename: &str,
        _content_type: &str,
    ) -> Result<String, EngineError> {
        Ok(filename.to_string())
    }

    async fn cancel(&self, _handle: &ExecutionHandle) -> Result<(), EngineError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeQueue {
    jobs: Mutex<VecDeque<JobDescriptor>>,
    reject_submits: bool,
    pub submissions: Mutex<Vec<Submission>>,
    pub cancelled: Mutex<Vec<(String, String)>>,
}

impl FakeQueue {
    pub fn with_jobs(jobs: impl IntoIterator<Item = JobDescriptor>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Refuses every submission, as when the job was aborted upstream.
    pub fn rejecting() -> Self {
        Self {
            reject_submits: true,
            ..Default::default()
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn pop(&self) -> Result<Option<JobDescriptor>, QueueError> {
        Ok(self.jobs.lock().unwrap().pop_front())
    }

    async fn submit(&self, submission: &Submission) -> Result<(), QueueError> {
        if self.reject_submits {
            return Err(QueueError::Rejected {
                status: 404,
                body: "processing generation not found".into(),
            });
        }
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(())
    }

    async fn cancel(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        self.cancelled
            .lock()
            .unwrap()
            .push((job_id.to_string(), reason.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Pretends every upload succeeds.
#[derive(Default)]
pub struct FakeDelivery {
    pub targets: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Delivery for FakeDelivery {
    async fn deliver(&self, _artifact: &Artifact, target: Option<&str>) -> Result<Delivered, DeliveryError> {
        self.targets.lock().unwrap().push(target.map(str::to_string));
        Ok(Delivered {
            reference: "R2".to_string(),
            uploaded: true,
        })
    }
}
