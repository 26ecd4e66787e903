//! Source-image staging for image-conditioned jobs.
//!
//! The source image is fetched (URL download or inline base64), checked to
//! be a decodable image, and uploaded into the engine's input directory
//! before compilation, so the compiler itself never performs I/O.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kiln_core::job::{JobDescriptor, SourceImage};

use crate::engine::EngineClient;
use crate::error::PipelineError;

/// An image the engine can load by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub filename: String,
}

pub struct SourceStager {
    http: reqwest::Client,
}

impl Default for SourceStager {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl SourceStager {
    /// Download source images with `http`.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Stage the job's source image, if it needs one.
    pub async fn stage(
        &self,
        engine: &dyn EngineClient,
        job: &JobDescriptor,
    ) -> Result<Option<StagedImage>, PipelineError> {
        if !job.wants_image_conditioning() {
            return Ok(None);
        }
        let Some(source) = &job.source_image else {
            return Ok(None);
        };

        let bytes = match source {
            SourceImage::Url(url) => self.download(url).await?,
            SourceImage::Inline(data) => decode_inline(data)?,
        };

        let format = image::guess_format(&bytes)
            .map_err(|e| PipelineError::Staging(format!("source image is not a supported image: {e}")))?;
        let extension = format.extensions_str().first().copied().unwrap_or("png");
        let filename = format!("{}_source.{extension}", job.output_prefix());

        let stored = engine
            .upload_image(bytes, &filename, format.to_mime_type())
            .await
            .map_err(|e| PipelineError::Staging(format!("upload to engine failed: {e}")))?;

        tracing::debug!(job_id = job.primary_id(), filename = %stored, "Source image staged");
        Ok(Some(StagedImage { filename: stored }))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PipelineError::Staging(format!("source image download failed: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Staging(format!("source image download failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Decode an inline payload, tolerating a `data:<mime>;base64,` prefix.
pub fn decode_inline(data: &str) -> Result<Vec<u8>, PipelineError> {
    let payload = match data.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => data,
    };
    let compact: String = payload.split_whitespace().collect();
    BASE64
        .decode(compact)
        .map_err(|e| PipelineError::Staging(format!("invalid base64 source image: {e}")))
}
