//! Completion Detector.
//!
//! Drives one submitted execution to a terminal state:
//!
//! ```text
//! Submitted -> Polling -> Completed | Failed | TimedOut | Cancelled
//! ```
//!
//! The engine's history endpoint is polled on an interval that tightens
//! once the job has been running for a while. Besides polling, each tick
//! may run stall diagnosis (status unchanged for the stall threshold) and
//! the filesystem fallback (the engine wrote a file but never reported
//! completion). The timeout is the only unconditional stop; stall diagnosis
//! only logs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use kiln_comfyui::history::NodeOutput;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineClient, ExecutionHandle};
use crate::error::PipelineError;
use crate::meta::JobMeta;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fallback candidates modified this long before polling began still count,
/// to absorb coarse filesystem timestamps and the gap after submission.
const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Hard ceiling, measured from submission.
    pub timeout: Duration,
    /// How long the status signature may stay unchanged before the queue
    /// is inspected.
    pub stall_threshold: Duration,
    /// Elapsed time after which the output directory is scanned.
    pub fallback_after: Duration,
    pub early_poll: Duration,
    pub late_poll: Duration,
    /// Elapsed time at which polling switches to `late_poll`.
    pub late_after: Duration,
    /// Fallback candidates smaller than this are never accepted.
    pub min_artifact_bytes: u64,
    /// Wait between the two size reads of a fallback candidate.
    pub settle_delay: Duration,
    /// Engine output directory; `None` disables the filesystem fallback.
    pub output_dir: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            stall_threshold: Duration::from_secs(60),
            fallback_after: Duration::from_secs(120),
            early_poll: Duration::from_secs(2),
            late_poll: Duration::from_millis(500),
            late_after: Duration::from_secs(30),
            min_artifact_bytes: 1024,
            settle_delay: Duration::from_secs(1),
            output_dir: None,
        }
    }
}

impl DetectorConfig {
    fn poll_interval(&self, elapsed: Duration) -> Duration {
        if elapsed >= self.late_after {
            self.late_poll
        } else {
            self.early_poll
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How an execution completed.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The engine reported outputs.
    Outputs(BTreeMap<String, NodeOutput>),
    /// The engine never reported; a settled file was found on disk.
    Fallback(PathBuf),
}

/// Where a stalled execution is, according to the engine queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallDiagnosis {
    /// Executing, just slowly.
    Running,
    /// Waiting behind `ahead` other prompts.
    Pending { ahead: usize },
    /// Neither running nor pending while other work is queued.
    Missing,
    /// Nothing is queued at all; the engine dropped or finished it silently.
    QueueEmpty,
}

impl StallDiagnosis {
    pub fn classify(snapshot: &kiln_comfyui::history::QueueSnapshot, prompt_id: &str) -> Self {
        if snapshot.is_running(prompt_id) {
            Self::Running
        } else if let Some(ahead) = snapshot.pending_position(prompt_id) {
            Self::Pending { ahead }
        } else if snapshot.is_empty() {
            Self::QueueEmpty
        } else {
            Self::Missing
        }
    }
}

/// Per-attempt tracking, reset whenever the status signature changes.
#[derive(Debug)]
struct ProgressState {
    last_signature: Option<String>,
    last_change: Instant,
    fallback_ran: bool,
    stall_diagnosed: bool,
}

impl ProgressState {
    fn new(now: Instant) -> Self {
        Self {
            last_signature: None,
            last_change: now,
            fallback_ran: false,
            stall_diagnosed: false,
        }
    }

    fn observe(&mut self, signature: &str, now: Instant) {
        if self.last_signature.as_deref() != Some(signature) {
            self.last_signature = Some(signature.to_string());
            self.last_change = now;
            self.stall_diagnosed = false;
        }
    }

    fn stalled_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_change)
    }
}

enum FallbackScan {
    Accepted(PathBuf),
    /// Nothing acceptable; do not scan again.
    Rejected,
    /// The candidate was still growing; scan again next tick.
    Unsettled,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct CompletionDetector<'a> {
    engine: &'a dyn EngineClient,
    config: &'a DetectorConfig,
}

impl<'a> CompletionDetector<'a> {
    pub fn new(engine: &'a dyn EngineClient, config: &'a DetectorConfig) -> Self {
        Self { engine, config }
    }

    /// Wait for `handle` to reach a terminal state.
    ///
    /// The engine's progress channel is followed concurrently for logging
    /// only; it is cancelled and joined before this returns.
    pub async fn await_completion(
        &self,
        handle: &ExecutionHandle,
        meta: &JobMeta,
        cancel: &CancellationToken,
    ) -> Result<Completion, PipelineError> {
        let listener_cancel = cancel.child_token();
        let listener = self.engine.watch_progress(handle, listener_cancel.clone());
        let poller = async {
            let result = self.poll(handle, meta, cancel).await;
            listener_cancel.cancel();
            result
        };

        let ((), result) = tokio::join!(listener, poller);
        result
    }

    async fn poll(
        &self,
        handle: &ExecutionHandle,
        meta: &JobMeta,
        cancel: &CancellationToken,
    ) -> Result<Completion, PipelineError> {
        let started = Instant::now();
        let not_before = SystemTime::now()
            .checked_sub(MTIME_TOLERANCE)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut state = ProgressState::new(started);

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let elapsed = started.elapsed();
            if elapsed > self.config.timeout {
                tracing::warn!(
                    job_id = %meta.job_id,
                    prompt_id = %handle.prompt_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Execution timed out",
                );
                return Err(PipelineError::TimedOut {
                    elapsed_secs: elapsed.as_secs(),
                });
            }

            match self.engine.status(handle).await {
                Ok(status) => {
                    if let Some(error) = &status.error {
                        return Err(PipelineError::Failed(error.clone()));
                    }
                    if status.completed && status.has_media() {
                        tracing::info!(
                            job_id = %meta.job_id,
                            prompt_id = %handle.prompt_id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Execution completed",
                        );
                        return Ok(Completion::Outputs(status.outputs));
                    }
                    state.observe(&status.signature, Instant::now());
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %meta.job_id,
                        prompt_id = %handle.prompt_id,
                        error = %e,
                        "Status poll failed, will retry",
                    );
                }
            }

            let now = Instant::now();
            if state.stalled_for(now) >= self.config.stall_threshold {
                self.diagnose_stall(handle, meta, &state, now).await;
                state.stall_diagnosed = true;
                state.last_change = now;
            }

            if !state.fallback_ran && started.elapsed() >= self.config.fallback_after {
                if let Some(dir) = &self.config.output_dir {
                    match self.scan_fallback(dir, meta, not_before, cancel).await? {
                        FallbackScan::Accepted(path) => {
                            tracing::info!(
                                job_id = %meta.job_id,
                                prompt_id = %handle.prompt_id,
                                path = %path.display(),
                                "Completed via filesystem fallback",
                            );
                            return Ok(Completion::Fallback(path));
                        }
                        FallbackScan::Rejected => state.fallback_ran = true,
                        FallbackScan::Unsettled => {}
                    }
                } else {
                    state.fallback_ran = true;
                }
            }

            let interval = self.config.poll_interval(started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Inspect the engine queue and log where the execution is. Never
    /// fails the job.
    async fn diagnose_stall(
        &self,
        handle: &ExecutionHandle,
        meta: &JobMeta,
        state: &ProgressState,
        now: Instant,
    ) {
        let stalled_ms = state.stalled_for(now).as_millis() as u64;
        let snapshot = match self.engine.queue_state().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    job_id = %meta.job_id,
                    prompt_id = %handle.prompt_id,
                    stalled_ms,
                    error = %e,
                    "Stalled and queue inspection failed",
                );
                return;
            }
        };

        let diagnosis = StallDiagnosis::classify(&snapshot, &handle.prompt_id);
        let repeat = state.stall_diagnosed;
        match diagnosis {
            StallDiagnosis::Running => tracing::info!(
                job_id = %meta.job_id,
                prompt_id = %handle.prompt_id,
                stalled_ms,
                repeat,
                "No status change; prompt is running (slow node?)",
            ),
            StallDiagnosis::Pending { ahead } => tracing::info!(
                job_id = %meta.job_id,
                prompt_id = %handle.prompt_id,
                stalled_ms,
                ahead,
                repeat,
                "No status change; prompt is still queued",
            ),
            StallDiagnosis::Missing => tracing::warn!(
                job_id = %meta.job_id,
                prompt_id = %handle.prompt_id,
                stalled_ms,
                running = snapshot.running.len(),
                pending = snapshot.pending.len(),
                repeat,
                "No status change; prompt is missing from the engine queue",
            ),
            StallDiagnosis::QueueEmpty => tracing::warn!(
                job_id = %meta.job_id,
                prompt_id = %handle.prompt_id,
                stalled_ms,
                repeat,
                "No status change and engine queue is empty",
            ),
        }
    }

    async fn scan_fallback(
        &self,
        dir: &Path,
        meta: &JobMeta,
        not_before: SystemTime,
        cancel: &CancellationToken,
    ) -> Result<FallbackScan, PipelineError> {
        let Some((path, size)) = largest_candidate(dir, meta, not_before).await else {
            tracing::debug!(job_id = %meta.job_id, dir = %dir.display(), "Fallback scan found nothing");
            return Ok(FallbackScan::Rejected);
        };

        if size < self.config.min_artifact_bytes {
            tracing::warn!(
                job_id = %meta.job_id,
                path = %path.display(),
                size,
                min_size = self.config.min_artifact_bytes,
                "Fallback candidate below minimum size, rejecting",
            );
            return Ok(FallbackScan::Rejected);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(self.config.settle_delay) => {}
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match tokio::fs::metadata(&path).await {
            Ok(m) if m.len() == size => Ok(FallbackScan::Accepted(path)),
            Ok(m) => {
                tracing::debug!(
                    job_id = %meta.job_id,
                    path = %path.display(),
                    before = size,
                    after = m.len(),
                    "Fallback candidate still being written",
                );
                Ok(FallbackScan::Unsettled)
            }
            Err(_) => Ok(FallbackScan::Unsettled),
        }
    }
}

/// Largest file under `dir` (and its immediate sub-directories) named with
/// the job's output prefix and an expected extension. Files last modified
/// before `not_before` are left over from an earlier attempt and skipped.
async fn largest_candidate(dir: &Path, meta: &JobMeta, not_before: SystemTime) -> Option<(PathBuf, u64)> {
    let extensions = meta.expected_extensions();
    let mut best: Option<(PathBuf, u64)> = None;
    let mut pending = vec![(dir.to_path_buf(), 0u8)];

    while let Some((current, depth)) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let path = entry.path();
            if metadata.is_dir() {
                if depth == 0 {
                    pending.push((path, depth + 1));
                }
                continue;
            }
            if !is_candidate(&path, meta, &extensions) {
                continue;
            }
            if metadata.modified().is_ok_and(|modified| modified < not_before) {
                tracing::debug!(job_id = %meta.job_id, path = %path.display(), "Ignoring stale fallback candidate");
                continue;
            }
            let size = metadata.len();
            if best.as_ref().map_or(true, |(_, best_size)| size > *best_size) {
                best = Some((path, size));
            }
        }
    }
    best
}

/// Savers name files `<prefix>_<counter>_.<ext>`, so the prefix must be
/// followed by `_` or `kiln_job-1` would also claim `kiln_job-10`.
fn is_candidate(path: &Path, meta: &JobMeta, extensions: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let owned = name
        .strip_prefix(meta.output_prefix.as_str())
        .is_some_and(|rest| rest.starts_with('_'));
    if !owned {
        return false;
    }
    kiln_core::media::extension_lower(name).is_some_and(|ext| extensions.contains(&ext.as_str()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
