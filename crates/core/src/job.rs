//! Generation job model and the normalisation applied at ingestion.
//!
//! Inbound payloads arrive as [`JobInput`] (every field optional,
//! identifiers under several names). [`Job::from_input`] turns them into
//! the strict internal [`Job`] record. Nothing loosely typed travels past
//! this point.

use serde::{Deserialize, Serialize};

use crate::types::{first_non_blank, lenient_id};

/// Prefix for client-generated UI identifiers.
pub const GENERATED_UI_ID_PREFIX: &str = "job-";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Parse a backend status string. Unknown values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "waiting" => Some(Self::Queued),
            "processing" | "running" | "in_progress" | "executing" => Some(Self::Processing),
            "completed" | "complete" | "done" | "success" => Some(Self::Completed),
            "failed" | "error" | "cancelled" | "canceled" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Sort rank used by the active-job view. Lower sorts first.
    pub fn sort_rank(self) -> u8 {
        match self {
            Self::Processing => 0,
            Self::Queued => 1,
            Self::Completed => 2,
            Self::Failed => 3,
        }
    }

    /// `true` for statuses that can still be cancelled.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    /// `true` once the job has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Generation parameters echoed from the submission. Display only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "negativePrompt")]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default, alias = "cfgScale")]
    pub cfg_scale: Option<f64>,
    #[serde(default)]
    pub sampler: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
}

impl GenerationParams {
    /// Fill every missing field from `other`.
    pub fn or(self, other: &GenerationParams) -> GenerationParams {
        GenerationParams {
            prompt: self.prompt.or_else(|| other.prompt.clone()),
            negative_prompt: self
                .negative_prompt
                .or_else(|| other.negative_prompt.clone()),
            width: self.width.or(other.width),
            height: self.height.or(other.height),
            steps: self.steps.or(other.steps),
            cfg_scale: self.cfg_scale.or(other.cfg_scale),
            sampler: self.sampler.or_else(|| other.sampler.clone()),
            seed: self.seed.or(other.seed),
        }
    }
}

/// A generation job in flight or recently finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    /// Client-assigned identity, stable for the job's local lifetime.
    pub ui_id: String,
    /// Server-assigned identity. Equals `ui_id` until confirmed.
    pub backend_id: String,
    pub status: JobStatus,
    /// Normalised fraction in `0.0..=1.0`.
    pub progress: f64,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    /// Raw timestamps, kept unparsed so bad values can sort last.
    pub created_at: Option<String>,
    pub start_time: Option<String>,
    pub params: GenerationParams,
    /// Failure message, if the job was marked failed.
    pub error: Option<String>,
}

/// Loosely-typed job payload as received from a submission, a queue
/// snapshot, or a synthesised progress event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    #[serde(default, alias = "uiId", deserialize_with = "lenient_id")]
    pub ui_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, alias = "jobId", deserialize_with = "lenient_id")]
    pub job_id: Option<String>,
    #[serde(default, alias = "backendId", deserialize_with = "lenient_id")]
    pub backend_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, alias = "currentStep")]
    pub current_step: Option<u32>,
    #[serde(default, alias = "totalSteps")]
    pub total_steps: Option<u32>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default, alias = "startTime")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

/// Partial update merged into an existing job by `update_job`.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub backend_id: Option<String>,
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub start_time: Option<String>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

/// Generate a fallback UI identifier.
pub fn generate_ui_id() -> String {
    format!("{GENERATED_UI_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// UI id priority: `ui_id` → `id` → `job_id` → `backend_id` → generated.
pub fn resolve_ui_id(input: &JobInput) -> String {
    first_non_blank([
        input.ui_id.as_deref(),
        input.id.as_deref(),
        input.job_id.as_deref(),
        input.backend_id.as_deref(),
    ])
    .unwrap_or_else(generate_ui_id)
}

/// Backend id priority: `backend_id` → `job_id` → `id` → the resolved UI id.
pub fn resolve_backend_id(input: &JobInput, ui_id: &str) -> String {
    first_non_blank([
        input.backend_id.as_deref(),
        input.job_id.as_deref(),
        input.id.as_deref(),
    ])
    .unwrap_or_else(|| ui_id.to_string())
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Normalise a progress value into `0.0..=1.0`.
///
/// Values in `(1, 100]` are read as percentages. Non-finite input is 0.
pub fn normalize_progress(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let fraction = if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    };
    fraction.clamp(0.0, 1.0)
}

/// Derive progress from step counters when no explicit value is given.
fn progress_from_steps(current: Option<u32>, total: Option<u32>) -> Option<f64> {
    match (current, total) {
        (Some(current), Some(total)) if total > 0 => Some(f64::from(current) / f64::from(total)),
        _ => None,
    }
}

impl Job {
    /// Build a normalised job from a loosely-typed payload.
    pub fn from_input(input: JobInput) -> Job {
        let ui_id = resolve_ui_id(&input);
        let backend_id = resolve_backend_id(&input, &ui_id);
        let status = input
            .status
            .as_deref()
            .and_then(JobStatus::parse)
            .unwrap_or(JobStatus::Queued);

        let mut job = Job {
            ui_id,
            backend_id,
            status,
            progress: 0.0,
            current_step: input.current_step,
            total_steps: input.total_steps,
            created_at: input.created_at,
            start_time: input.start_time,
            params: input.params,
            error: input.error,
        };
        job.progress = input
            .progress
            .or_else(|| progress_from_steps(job.current_step, job.total_steps))
            .unwrap_or(0.0);
        job.normalize();
        job
    }

    /// Re-apply the status/progress invariants after a merge.
    pub fn normalize(&mut self) {
        self.progress = normalize_progress(self.progress);
        if self.status == JobStatus::Completed {
            self.progress = 1.0;
        }
        if let (Some(current), Some(total)) = (self.current_step, self.total_steps) {
            if current > total {
                self.current_step = Some(total);
            }
        }
    }

    /// Merge a partial update. The backend id is handled by the queue,
    /// which owns the identity index.
    pub fn apply_patch(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if patch.current_step.is_some() {
            self.current_step = patch.current_step;
        }
        if patch.total_steps.is_some() {
            self.total_steps = patch.total_steps;
        }
        match patch.progress {
            Some(progress) => self.progress = progress,
            None if patch.current_step.is_some() || patch.total_steps.is_some() => {
                if let Some(progress) = progress_from_steps(self.current_step, self.total_steps) {
                    self.progress = progress;
                }
            }
            None => {}
        }
        if patch.start_time.is_some() {
            self.start_time = patch.start_time.clone();
        }
        if patch.error.is_some() {
            self.error = patch.error.clone();
        }
        self.normalize();
    }

    /// `true` if `identifier` is either of this job's ids.
    pub fn matches(&self, identifier: &str) -> bool {
        self.ui_id == identifier || self.backend_id == identifier
    }
}

/// A job can be cancelled while it is queued or processing.
pub fn is_job_cancellable(job: &Job) -> bool {
    job.status.is_active()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(ui: Option<&str>, id: Option<&str>, job: Option<&str>, backend: Option<&str>) -> JobInput {
        JobInput {
            ui_id: ui.map(String::from),
            id: id.map(String::from),
            job_id: job.map(String::from),
            backend_id: backend.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn ui_id_priority() {
        assert_eq!(resolve_ui_id(&input(Some("u"), Some("i"), Some("j"), Some("b"))), "u");
        assert_eq!(resolve_ui_id(&input(None, Some("i"), Some("j"), Some("b"))), "i");
        assert_eq!(resolve_ui_id(&input(Some(" "), None, Some("j"), Some("b"))), "j");
        assert_eq!(resolve_ui_id(&input(None, None, None, Some("b"))), "b");
        assert!(resolve_ui_id(&input(None, None, None, None)).starts_with(GENERATED_UI_ID_PREFIX));
    }

    #[test]
    fn backend_id_priority() {
        assert_eq!(resolve_backend_id(&input(None, Some("i"), Some("j"), Some("b")), "u"), "b");
        assert_eq!(resolve_backend_id(&input(None, Some("i"), Some("j"), None), "u"), "j");
        assert_eq!(resolve_backend_id(&input(None, Some("i"), None, None), "u"), "i");
        assert_eq!(resolve_backend_id(&input(Some("u"), None, None, None), "u"), "u");
    }

    #[test]
    fn progress_percentages_are_scaled() {
        assert_eq!(normalize_progress(50.0), 0.5);
        assert_eq!(normalize_progress(0.25), 0.25);
        assert_eq!(normalize_progress(250.0), 1.0);
        assert_eq!(normalize_progress(-3.0), 0.0);
        assert_eq!(normalize_progress(f64::NAN), 0.0);
    }

    #[test]
    fn status_parsing_is_lenient() {
        assert_eq!(JobStatus::parse("RUNNING"), Some(JobStatus::Processing));
        assert_eq!(JobStatus::parse("pending"), Some(JobStatus::Queued));
        assert_eq!(JobStatus::parse("cancelled"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::parse("mystery"), None);
    }

    #[test]
    fn from_input_derives_progress_from_steps() {
        let job = Job::from_input(JobInput {
            id: Some("a".into()),
            status: Some("processing".into()),
            current_step: Some(5),
            total_steps: Some(20),
            ..Default::default()
        });
        assert_eq!(job.progress, 0.25);
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn completed_jobs_report_full_progress() {
        let mut job = Job::from_input(input(Some("a"), None, None, None));
        job.apply_patch(&JobPatch {
            status: Some(JobStatus::Completed),
            ..Default::default()
        });
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn deserializes_numeric_ids_and_camel_case() {
        let parsed: JobInput =
            serde_json::from_str(r#"{"jobId": 42, "uiId": "u-1", "createdAt": "2026-01-01T00:00:00Z", "prompt": "a cat"}"#)
                .unwrap();
        assert_eq!(parsed.job_id.as_deref(), Some("42"));
        assert_eq!(parsed.ui_id.as_deref(), Some("u-1"));
        assert_eq!(parsed.params.prompt.as_deref(), Some("a cat"));
    }

    #[test]
    fn cancellable_only_while_active() {
        let mut job = Job::from_input(input(Some("a"), None, None, None));
        assert!(is_job_cancellable(&job));
        job.status = JobStatus::Failed;
        assert!(!is_job_cancellable(&job));
    }
}
