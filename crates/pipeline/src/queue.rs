//! The job-queue seam.

use async_trait::async_trait;
use kiln_core::job::JobDescriptor;
use kiln_core::media::MediaKind;

use crate::error::QueueError;

/// One finished batch item, as reported back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    /// Delivery reference: `"R2"` for uploaded media or the inline body.
    pub reference: String,
    pub seed: u64,
    pub media_kind: MediaKind,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Acquire the next job. `None` when the queue has nothing for us.
    async fn pop(&self) -> Result<Option<JobDescriptor>, QueueError>;

    /// Report a finished item. [`QueueError::Rejected`] means the queue no
    /// longer wants it (aborted upstream); callers drop it.
    async fn submit(&self, submission: &Submission) -> Result<(), QueueError>;

    /// Report a job as failed.
    async fn cancel(&self, job_id: &str, reason: &str) -> Result<(), QueueError>;
}
