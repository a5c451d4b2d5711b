//! The request/response seam to the generation backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{GenerationParams, JobInput};
use crate::results::ResultInput;
use crate::system_status::SystemStatusPayload;

/// A generation to submit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationRequest {
    /// UI id the caller already assigned to the job.
    pub ui_id: String,
    pub params: GenerationParams,
    /// Backend-specific workflow graph, when the backend needs one.
    pub workflow: Option<serde_json::Value>,
}

/// Backend acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    #[serde(default)]
    pub queue_position: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// The endpoint or the referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The request could not be built from the given input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

#[async_trait]
pub trait GenerationApi: Send + Sync {
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<SubmitResponse, ApiError>;

    /// Cancel a queued or running job by backend id.
    async fn cancel_job(&self, backend_id: &str) -> Result<(), ApiError>;

    async fn delete_result(&self, result_id: &str) -> Result<(), ApiError>;

    /// [`ApiError::NotFound`] means the backend has no status endpoint.
    async fn fetch_system_status(&self) -> Result<SystemStatusPayload, ApiError>;

    /// Most recent first.
    async fn fetch_recent_results(&self, limit: usize) -> Result<Vec<ResultInput>, ApiError>;

    /// Server-side view of the queue.
    async fn list_jobs(&self) -> Result<Vec<JobInput>, ApiError>;
}
