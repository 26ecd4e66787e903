//! Produced media: kinds, artifacts, and filename classification.

use std::path::Path;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// File extensions the engine writes for still images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// File extensions the engine writes for video / animation output.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "gif"];

// ---------------------------------------------------------------------------
// MediaKind
// ---------------------------------------------------------------------------

/// Kind of media an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a filename by extension. Returns `None` for anything that is
    /// neither a known image nor a known video extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = extension_lower(filename)?;
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else {
            None
        }
    }

    /// Wire name used in queue submissions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-cased extension of `filename`, without the dot.
pub fn extension_lower(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Best-effort MIME type for an artifact filename.
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_lower(filename).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One produced media file, held in memory until delivery.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub kind: MediaKind,
    /// Filename as written by the engine.
    pub filename: String,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, kind: MediaKind, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            kind,
            filename: filename.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.filename)
    }
}

// Raw bytes are never useful in logs.
impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("filename", &self.filename)
            .field("kind", &self.kind)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Ordered artifacts produced by a single engine execution.
///
/// Batch item `i` receives artifact `i`; when the engine produced fewer
/// files than there are batch items, the remaining items share the first.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

#[allow(clippy::len_without_is_empty)]
impl ArtifactSet {
    /// Returns `None` for an empty list -- an empty set is never a result.
    pub fn new(artifacts: Vec<Artifact>) -> Option<Self> {
        if artifacts.is_empty() {
            None
        } else {
            Some(Self { artifacts })
        }
    }

    pub fn for_batch_index(&self, index: usize) -> &Artifact {
        self.artifacts.get(index).unwrap_or(&self.artifacts[0])
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
