//! Job Pipeline.
//!
//! Acquire -> stage -> compile -> submit -> detect -> extract -> deliver,
//! one job at a time per task. [`JobPipeline::run`] is the long-lived
//! loop that pops jobs and runs them concurrently up to
//! `max_concurrent_jobs`. The in-flight id set is the only state shared
//! between jobs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_core::job::JobDescriptor;
use kiln_core::media::{Artifact, ArtifactSet};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::compiler;
use crate::delivery::Delivery;
use crate::detector::{CompletionDetector, DetectorConfig};
use crate::engine::EngineClient;
use crate::error::{PipelineError, QueueError};
use crate::extractor::ResultExtractor;
use crate::meta::JobMeta;
use crate::queue::{JobQueue, Submission};
use crate::staging::SourceStager;
use crate::templates::TemplateStore;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub max_concurrent_jobs: usize,
    /// Interval between queue pops.
    pub pop_interval: Duration,
    /// Pause after a failed pop.
    pub error_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            max_concurrent_jobs: 1,
            pop_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What [`JobPipeline::process`] did with a job that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// One of the job's ids was already being processed; nothing was done.
    Duplicate,
    /// The execution finished and every batch item was handed off.
    Completed {
        /// Accepted by the queue.
        delivered: usize,
        /// Refused by the queue (aborted upstream) and dropped.
        rejected: usize,
        /// Delivery or submission failed; the item was cancelled.
        failed: usize,
    },
}

enum ItemOutcome {
    Delivered,
    Rejected,
    Failed,
}

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

type InFlight = Arc<Mutex<HashSet<String>>>;

fn lock(set: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a job's ids in the in-flight set; releases them on drop, so a
/// panicking job future still clears its entry.
struct InFlightGuard {
    set: InFlight,
    ids: Vec<String>,
}

impl InFlightGuard {
    /// Claim every id, or none if any is already in flight.
    fn claim(set: &InFlight, ids: &[String]) -> Option<Self> {
        let mut current = lock(set);
        if ids.iter().any(|id| current.contains(id)) {
            return None;
        }
        current.extend(ids.iter().cloned());
        Some(Self {
            set: Arc::clone(set),
            ids: ids.to_vec(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut current = lock(&self.set);
        for id in &self.ids {
            current.remove(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct JobPipeline {
    engine: Arc<dyn EngineClient>,
    templates: Arc<TemplateStore>,
    queue: Arc<dyn JobQueue>,
    delivery: Arc<dyn Delivery>,
    stager: SourceStager,
    config: PipelineConfig,
    in_flight: InFlight,
}

impl JobPipeline {
    /// Create a pipeline over its collaborators. Source images are fetched
    /// with a default HTTP client unless [`JobPipeline::with_stager`] sets one.
    pub fn new(
        engine: Arc<dyn EngineClient>,
        templates: Arc<TemplateStore>,
        queue: Arc<dyn JobQueue>,
        delivery: Arc<dyn Delivery>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            engine,
            templates,
            queue,
            delivery,
            stager: SourceStager::default(),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Stage source images for image-to-image jobs through `stager`.
    pub fn with_stager(mut self, stager: SourceStager) -> Self {
        self.stager = stager;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Warm the template cache. A missing template directory is logged,
    /// not fatal: templates are still loaded lazily per job.
    pub async fn init(&self) {
        match self.templates.preload().await {
            Ok(count) => tracing::info!(
                templates = count,
                dir = %self.templates.dir().display(),
                "Workflow templates loaded",
            ),
            Err(e) => tracing::warn!(
                dir = %self.templates.dir().display(),
                error = %e,
                "Could not preload workflow templates",
            ),
        }
    }

    /// Forget all cross-job state.
    pub async fn teardown(&self) {
        lock(&self.in_flight).clear();
        self.templates.invalidate_all().await;
    }

    /// Whether `job_id` is currently claimed by a running job.
    pub fn is_in_flight(&self, job_id: &str) -> bool {
        lock(&self.in_flight).contains(job_id)
    }

    /// Number of claimed job ids, counting each id of a batch.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Run one job to completion.
    ///
    /// A job whose id is already in flight is ignored. On failure the
    /// queue is told (best effort) before the error is returned.
    pub async fn process(
        &self,
        job: JobDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some(_guard) = InFlightGuard::claim(&self.in_flight, &job.ids) else {
            tracing::debug!(job_id = job.primary_id(), "Job already in flight, ignoring");
            return Ok(ProcessOutcome::Duplicate);
        };

        let started = Instant::now();
        tracing::info!(
            job_id = job.primary_id(),
            model = %job.model,
            batch = job.batch_size(),
            "Job acquired",
        );

        match self.execute(&job, cancel).await {
            Ok(outcome) => {
                tracing::info!(
                    job_id = job.primary_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    outcome = ?outcome,
                    "Job finished",
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(
                    job_id = job.primary_id(),
                    kind = e.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Job failed",
                );
                self.report_failure(&job, &e).await;
                Err(e)
            }
        }
    }

    /// Pop and process jobs until `cancel` fires, then drain.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.pop_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            pop_interval_ms = self.config.pop_interval.as_millis() as u64,
            "Job pipeline started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job pipeline shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                continue;
            };

            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                popped = self.queue.pop() => popped,
            };

            match popped {
                Ok(Some(job)) => {
                    let pipeline = Arc::clone(&self);
                    let job_cancel = cancel.child_token();
                    tasks.spawn(async move {
                        let _permit = permit;
                        // Failures are logged and reported inside `process`.
                        let _ = pipeline.process(job, &job_cancel).await;
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "Queue pop failed, backing off",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        let draining = tasks.len();
        if draining > 0 {
            tracing::info!(jobs = draining, "Waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        self.teardown().await;
        tracing::info!("Job pipeline stopped");
    }

    // ---- private helpers ----

    async fn execute(
        &self,
        job: &JobDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PipelineError> {
        let template_name = self.templates.resolve(&job.model);
        let template = self.templates.get(&template_name).await?;

        let staged = self.stager.stage(self.engine.as_ref(), job).await?;
        let graph = compiler::compile(&template, job, staged.as_ref())?;
        let meta = JobMeta::new(job, &graph);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let handle = self
            .engine
            .submit(&graph.to_api_json(), &client_id)
            .await
            .map_err(PipelineError::Submit)?;

        tracing::info!(
            job_id = %meta.job_id,
            prompt_id = %handle.prompt_id,
            template = %template_name,
            video_only = meta.video_only,
            "Workflow submitted",
        );

        let detector = CompletionDetector::new(self.engine.as_ref(), &self.config.detector);
        let completion = match detector.await_completion(&handle, &meta, cancel).await {
            Ok(completion) => completion,
            Err(e) => {
                if matches!(e, PipelineError::TimedOut { .. } | PipelineError::Cancelled) {
                    if let Err(cancel_err) = self.engine.cancel(&handle).await {
                        tracing::debug!(
                            prompt_id = %handle.prompt_id,
                            error = %cancel_err,
                            "Could not stop execution on the engine",
                        );
                    }
                }
                return Err(e);
            }
        };

        let artifacts = ResultExtractor::new(self.engine.as_ref())
            .extract(completion, &meta)
            .await?;

        Ok(self.deliver(job, &artifacts).await)
    }

    /// Hand every batch item off concurrently.
    async fn deliver(&self, job: &JobDescriptor, artifacts: &ArtifactSet) -> ProcessOutcome {
        let items = job
            .ids
            .iter()
            .enumerate()
            .map(|(index, id)| self.deliver_item(job, index, id, artifacts.for_batch_index(index)));

        let (mut delivered, mut rejected, mut failed) = (0, 0, 0);
        for outcome in futures::future::join_all(items).await {
            match outcome {
                ItemOutcome::Delivered => delivered += 1,
                ItemOutcome::Rejected => rejected += 1,
                ItemOutcome::Failed => failed += 1,
            }
        }

        ProcessOutcome::Completed {
            delivered,
            rejected,
            failed,
        }
    }

    async fn deliver_item(
        &self,
        job: &JobDescriptor,
        index: usize,
        job_id: &str,
        artifact: &Artifact,
    ) -> ItemOutcome {
        let delivered = match self.delivery.deliver(artifact, job.delivery_target(index)).await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Delivery failed");
                self.cancel_item(job_id, &e.to_string()).await;
                return ItemOutcome::Failed;
            }
        };

        let submission = Submission {
            job_id: job_id.to_string(),
            reference: delivered.reference,
            seed: job.seed_for(index),
            media_kind: artifact.kind,
        };

        match self.queue.submit(&submission).await {
            Ok(()) => {
                tracing::info!(
                    job_id,
                    kind = %artifact.kind,
                    bytes = artifact.len(),
                    uploaded = delivered.uploaded,
                    "Result submitted",
                );
                ItemOutcome::Delivered
            }
            Err(QueueError::Rejected { status, body }) => {
                tracing::info!(job_id, status, body = %body, "Queue refused result, dropping");
                ItemOutcome::Rejected
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Result submission failed");
                self.cancel_item(job_id, &e.to_string()).await;
                ItemOutcome::Failed
            }
        }
    }

    async fn report_failure(&self, job: &JobDescriptor, error: &PipelineError) {
        let reason = error.to_string();
        for id in &job.ids {
            self.cancel_item(id, &reason).await;
        }
    }

    async fn cancel_item(&self, job_id: &str, reason: &str) {
        if let Err(e) = self.queue.cancel(job_id, reason).await {
            tracing::warn!(job_id, error = %e, "Failed to report job failure to queue");
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Job task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
