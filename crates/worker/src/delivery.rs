//! Artifact delivery: HTTP PUT to the queue-supplied upload URL, with the
//! base64 body inlined into the submission when there is no target or the
//! upload fails.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kiln_core::media::Artifact;
use kiln_pipeline::delivery::{Delivered, Delivery};
use kiln_pipeline::error::DeliveryError;
use reqwest::header::CONTENT_TYPE;

/// Reference the queue expects for media it can fetch from its own bucket.
pub const UPLOADED_REFERENCE: &str = "R2";

pub struct HttpDelivery {
    http: reqwest::Client,
    inline_fallback: bool,
}

impl HttpDelivery {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            inline_fallback: true,
        }
    }

    /// When disabled, a failed upload is an error instead of an inline
    /// submission.
    pub fn with_inline_fallback(mut self, enabled: bool) -> Self {
        self.inline_fallback = enabled;
        self
    }

    async fn upload(&self, artifact: &Artifact, url: &str) -> Result<(), DeliveryError> {
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, artifact.content_type())
            .body(artifact.bytes.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Upload {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn deliver(&self, artifact: &Artifact, target: Option<&str>) -> Result<Delivered, DeliveryError> {
        let Some(url) = target else {
            return Ok(inline(artifact));
        };

        match self.upload(artifact, url).await {
            Ok(()) => {
                tracing::debug!(filename = %artifact.filename, bytes = artifact.len(), "Artifact uploaded");
                Ok(Delivered {
                    reference: UPLOADED_REFERENCE.to_string(),
                    uploaded: true,
                })
            }
            Err(e) if self.inline_fallback => {
                tracing::warn!(filename = %artifact.filename, error = %e, "Upload failed, submitting inline");
                Ok(inline(artifact))
            }
            Err(e) => Err(e),
        }
    }
}

fn inline(artifact: &Artifact) -> Delivered {
    Delivered {
        reference: BASE64.encode(&artifact.bytes),
        uploaded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kiln_core::media::MediaKind;

    fn artifact() -> Artifact {
        Artifact::new(b"pixels".to_vec(), MediaKind::Image, "kiln_a_00001_.png")
    }

    #[tokio::test]
    async fn no_target_is_inlined() {
        let delivered = HttpDelivery::new(reqwest::Client::new())
            .deliver(&artifact(), None)
            .await
            .unwrap();
        assert!(!delivered.uploaded);
        assert_eq!(delivered.reference, BASE64.encode(b"pixels"));
    }

    // Port 9 (discard) on localhost refuses connections.
    const UNREACHABLE: &str = "http://127.0.0.1:9/upload";

    #[tokio::test]
    async fn failed_upload_falls_back_to_inline() {
        let delivered = HttpDelivery::new(reqwest::Client::new())
            .deliver(&artifact(), Some(UNREACHABLE))
            .await
            .unwrap();
        assert!(!delivered.uploaded);
    }

    #[tokio::test]
    async fn failed_upload_without_fallback_is_an_error() {
        let result = HttpDelivery::new(reqwest::Client::new())
            .with_inline_fallback(false)
            .deliver(&artifact(), Some(UNREACHABLE))
            .await;
        assert_matches!(result, Err(DeliveryError::Http(_)));
    }
}
