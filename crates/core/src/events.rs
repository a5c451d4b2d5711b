//! Inbound events delivered by a transport adapter.
//!
//! Message payloads are deliberately loose (every field optional, ids
//! under several aliases) because they mirror whatever the backend
//! sends. The queue and results modules normalise them on ingestion.

use serde::Deserialize;

use crate::job::{GenerationParams, Job, JobInput};
use crate::results::ResultInput;
use crate::system_status::SystemStatusPayload;
use crate::transport::ConnectionSnapshot;
use crate::types::{first_non_blank, lenient_id};

/// Everything a transport adapter can report to the orchestrator.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Connection phase change (connect, reconnect, disconnect, error).
    Connection(ConnectionSnapshot),
    /// Backend status broadcast.
    SystemStatus(SystemStatusPayload),
    /// Authoritative server-side view of the queue.
    QueueSnapshot(Vec<JobInput>),
    /// Step-level progress for one job.
    Progress(ProgressMessage),
    /// A job finished and produced output.
    Completion(CompletionMessage),
    /// A job failed.
    Error(ErrorMessage),
    /// Recent results fetched by the adapter, most recent first.
    Results(Vec<ResultInput>),
}

/// One image or several. Backends disagree on which they send.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageField {
    One(String),
    Many(Vec<String>),
}

impl ImageField {
    /// First non-blank image reference, if any.
    pub fn first(&self) -> Option<&str> {
        match self {
            ImageField::One(s) => Some(s.as_str()).filter(|s| !s.trim().is_empty()),
            ImageField::Many(list) => list
                .iter()
                .map(String::as_str)
                .find(|s| !s.trim().is_empty()),
        }
    }
}

/// Progress update for a job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressMessage {
    #[serde(default, alias = "jobId", alias = "prompt_id", alias = "backend_id", deserialize_with = "lenient_id")]
    pub job_id: Option<String>,
    #[serde(default, alias = "uiId", deserialize_with = "lenient_id")]
    pub ui_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, alias = "currentStep", alias = "value")]
    pub current_step: Option<u32>,
    #[serde(default, alias = "totalSteps", alias = "max")]
    pub total_steps: Option<u32>,
}

/// A job completed successfully.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionMessage {
    #[serde(default, alias = "jobId", alias = "prompt_id", alias = "backend_id", deserialize_with = "lenient_id")]
    pub job_id: Option<String>,
    #[serde(default, alias = "uiId", deserialize_with = "lenient_id")]
    pub ui_id: Option<String>,
    #[serde(default, alias = "resultId", deserialize_with = "lenient_id")]
    pub result_id: Option<String>,
    #[serde(default, alias = "image", alias = "image_url", alias = "imageUrl")]
    pub images: Option<ImageField>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

/// A job failed on the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, alias = "jobId", alias = "prompt_id", alias = "backend_id", deserialize_with = "lenient_id")]
    pub job_id: Option<String>,
    #[serde(default, alias = "uiId", deserialize_with = "lenient_id")]
    pub ui_id: Option<String>,
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

/// Identifier a message refers to: the backend id when present,
/// otherwise the UI id.
fn message_identifier(job_id: &Option<String>, ui_id: &Option<String>) -> Option<String> {
    first_non_blank([job_id.as_deref(), ui_id.as_deref()])
}

impl ProgressMessage {
    pub fn identifier(&self) -> Option<String> {
        message_identifier(&self.job_id, &self.ui_id)
    }
}

impl CompletionMessage {
    pub fn identifier(&self) -> Option<String> {
        message_identifier(&self.job_id, &self.ui_id)
    }

    /// Fill display parameters the backend did not echo from the job
    /// that was tracking this generation.
    pub fn with_job_defaults(mut self, job: &Job) -> Self {
        self.params = self.params.or(&job.params);
        self
    }
}

impl ErrorMessage {
    pub fn identifier(&self) -> Option<String> {
        message_identifier(&self.job_id, &self.ui_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_field_accepts_string_or_list() {
        let one: CompletionMessage = serde_json::from_str(r#"{"jobId":"b","image":"a.png"}"#).unwrap();
        assert_eq!(one.images.unwrap().first(), Some("a.png"));

        let many: CompletionMessage =
            serde_json::from_str(r#"{"prompt_id":"b","images":["", "x.png","y.png"]}"#).unwrap();
        assert_eq!(many.job_id.as_deref(), Some("b"));
        assert_eq!(many.images.unwrap().first(), Some("x.png"));
    }

    #[test]
    fn progress_accepts_step_aliases() {
        let msg: ProgressMessage = serde_json::from_str(r#"{"prompt_id":"p","value":3,"max":10}"#).unwrap();
        assert_eq!(msg.identifier().as_deref(), Some("p"));
        assert_eq!(msg.current_step, Some(3));
        assert_eq!(msg.total_steps, Some(10));
    }

    #[test]
    fn identifier_falls_back_to_ui_id() {
        let msg = ErrorMessage {
            job_id: Some("  ".into()),
            ui_id: Some("u-1".into()),
            error: None,
        };
        assert_eq!(msg.identifier().as_deref(), Some("u-1"));
    }
}
