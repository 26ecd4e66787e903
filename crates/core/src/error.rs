#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Malformed workflow: {0}")]
    MalformedWorkflow(String),
}
