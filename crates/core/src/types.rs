/// Job identifiers are opaque strings assigned by the remote queue.
pub type JobId = String;

/// ComfyUI node identifiers. API exports use string keys, UI exports use
/// integers; both are normalised to their decimal string form.
pub type NodeId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
