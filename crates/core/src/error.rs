#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}
