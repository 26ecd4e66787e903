//! The delivery seam: hand an artifact to blob storage or inline it.

use async_trait::async_trait;
use kiln_core::media::Artifact;

use crate::error::DeliveryError;

/// Outcome of delivering one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// What the queue receives as the generation reference.
    pub reference: String,
    /// `true` when the bytes went to the caller-supplied target, `false`
    /// when they were inlined.
    pub uploaded: bool,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, artifact: &Artifact, target: Option<&str>) -> Result<Delivered, DeliveryError>;
}
