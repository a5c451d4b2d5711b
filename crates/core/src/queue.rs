//! Authoritative set of in-flight generation jobs.
//!
//! Jobs are keyed by UI id with a secondary backend-id index, so every
//! lookup accepts either identifier. Event ingestion never fails: blank
//! identifiers and unknown jobs degrade to a no-op (or, for progress, to
//! a synthesised job) because the dispatch loop has no caller to report to.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::CoreError;
use crate::events::{CompletionMessage, ErrorMessage, ProgressMessage};
use crate::job::{Job, JobInput, JobPatch, JobStatus};
use crate::types::{first_non_blank, is_blank, parse_timestamp, Timestamp};

/// In-memory job queue indexed by both identifiers.
#[derive(Debug, Default)]
pub struct JobQueue {
    /// Jobs keyed by UI id.
    jobs: HashMap<String, Job>,
    /// Backend id -> UI id.
    backend_index: HashMap<String, String>,
    /// UI ids in insertion order.
    order: Vec<String>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    // ---- lookups ----

    /// Resolve either identifier to the UI key of a stored job.
    fn key_for(&self, identifier: &str) -> Option<String> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        if self.jobs.contains_key(identifier) {
            return Some(identifier.to_string());
        }
        self.backend_index.get(identifier).cloned()
    }

    /// Find a job by UI id or backend id.
    pub fn get_job_by_identifier(&self, identifier: &str) -> Option<&Job> {
        self.key_for(identifier).and_then(|key| self.jobs.get(&key))
    }

    /// Map an identifier to the backend id used for cancellation.
    ///
    /// In strict mode an unknown identifier is an error. Otherwise the
    /// identifier is assumed to already be a backend id.
    pub fn resolve_backend_id(&self, identifier: &str, strict: bool) -> Result<String, CoreError> {
        if is_blank(identifier) {
            return Err(CoreError::Validation("job identifier is empty".into()));
        }
        match self.get_job_by_identifier(identifier) {
            Some(job) => Ok(job.backend_id.clone()),
            None if strict => Err(CoreError::JobNotFound(identifier.trim().to_string())),
            None => Ok(identifier.trim().to_string()),
        }
    }

    // ---- mutation ----

    /// Insert or replace a job by its resolved identity.
    pub fn enqueue_job(&mut self, input: JobInput) -> Job {
        let job = Job::from_input(input);
        tracing::debug!(ui_id = %job.ui_id, backend_id = %job.backend_id, "Enqueued job");
        self.insert_at(None, job)
    }

    /// Replace the whole queue with a server snapshot.
    ///
    /// Entries that only carry a backend id keep the UI id (and any
    /// display parameters) of the job already tracking that backend id.
    pub fn set_jobs(&mut self, inputs: Vec<JobInput>) {
        let mut next = JobQueue::new();
        for mut input in inputs {
            if input.ui_id.as_deref().map_or(true, is_blank) {
                let backend = first_non_blank([
                    input.backend_id.as_deref(),
                    input.job_id.as_deref(),
                    input.id.as_deref(),
                ]);
                if let Some(existing) = backend.and_then(|b| self.get_job_by_identifier(&b)) {
                    input.ui_id = Some(existing.ui_id.clone());
                    input.params = input.params.or(&existing.params);
                    if input.created_at.is_none() {
                        input.created_at = existing.created_at.clone();
                    }
                }
            }
            next.insert_at(None, Job::from_input(input));
        }
        tracing::debug!(count = next.len(), "Replaced job queue from snapshot");
        *self = next;
    }

    /// Merge a partial update into the job found by either identifier.
    ///
    /// A new backend id re-keys the job. If another job is already
    /// tracked under that backend id (a progress event that beat the
    /// submission response), its live state is folded in and it is dropped.
    pub fn update_job(&mut self, identifier: &str, patch: JobPatch) -> Option<Job> {
        let Some(key) = self.key_for(identifier) else {
            tracing::debug!(identifier, "update_job ignored: job not found");
            return None;
        };
        let (position, mut job) = self.remove_key(&key)?;
        job.apply_patch(&patch);

        if let Some(backend_id) = patch.backend_id.as_deref().map(str::trim) {
            if !backend_id.is_empty() && backend_id != job.backend_id {
                if let Some(other_key) = self.key_for(backend_id) {
                    if let Some((_, other)) = self.remove_key(&other_key) {
                        absorb_live_state(&mut job, &other);
                    }
                }
                job.backend_id = backend_id.to_string();
            }
        }

        Some(self.insert_at(Some(position), job))
    }

    /// Remove a job by either identifier. Removing an absent job is a no-op.
    pub fn remove_job(&mut self, identifier: &str) -> Option<Job> {
        let key = self.key_for(identifier)?;
        self.remove_key(&key).map(|(_, job)| job)
    }

    /// Apply a progress event, synthesising the job if it is unknown.
    pub fn handle_progress_message(&mut self, msg: &ProgressMessage) -> Option<Job> {
        let Some(identifier) = msg.identifier() else {
            tracing::debug!("Progress message without identifier ignored");
            return None;
        };
        let status = msg
            .status
            .as_deref()
            .and_then(JobStatus::parse)
            .unwrap_or(JobStatus::Processing);

        let known = self
            .key_for(&identifier)
            .or_else(|| msg.ui_id.as_deref().and_then(|ui| self.key_for(ui)));

        match known {
            Some(key) => self.update_job(
                &key,
                JobPatch {
                    status: Some(status),
                    progress: msg.progress,
                    current_step: msg.current_step,
                    total_steps: msg.total_steps,
                    ..Default::default()
                },
            ),
            None => {
                tracing::debug!(identifier = %identifier, "Synthesising job from progress event");
                let input = JobInput {
                    ui_id: msg.ui_id.clone(),
                    backend_id: msg.job_id.clone(),
                    status: Some(status.as_str().to_string()),
                    progress: msg.progress,
                    current_step: msg.current_step,
                    total_steps: msg.total_steps,
                    created_at: Some(chrono::Utc::now().to_rfc3339()),
                    ..Default::default()
                };
                Some(self.insert_at(None, Job::from_input(input)))
            }
        }
    }

    /// A completed job leaves the queue. Returns it so the caller can
    /// build a result from its parameters.
    pub fn handle_completion_message(&mut self, msg: &CompletionMessage) -> Option<Job> {
        self.remove_referenced(msg.job_id.as_deref(), msg.ui_id.as_deref())
    }

    /// A failed job leaves the queue.
    pub fn handle_error_message(&mut self, msg: &ErrorMessage) -> Option<Job> {
        let removed = self.remove_referenced(msg.job_id.as_deref(), msg.ui_id.as_deref());
        if let Some(job) = &removed {
            tracing::debug!(
                ui_id = %job.ui_id,
                backend_id = %job.backend_id,
                error = msg.error.as_deref().unwrap_or("unknown"),
                "Job failed",
            );
        }
        removed
    }

    /// Drop every completed or failed job. Returns how many were dropped.
    pub fn clear_completed_jobs(&mut self) -> usize {
        let finished: Vec<String> = self
            .order
            .iter()
            .filter(|key| self.jobs.get(*key).is_some_and(|job| job.status.is_terminal()))
            .cloned()
            .collect();
        for key in &finished {
            self.remove_key(key);
        }
        finished.len()
    }

    // ---- views ----

    /// Jobs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|key| self.jobs.get(key))
    }

    pub fn jobs(&self) -> Vec<&Job> {
        self.iter().collect()
    }

    /// Jobs that are queued or processing, in insertion order.
    pub fn active_jobs(&self) -> Vec<&Job> {
        self.iter().filter(|job| job.status.is_active()).collect()
    }

    pub fn has_active_jobs(&self) -> bool {
        self.iter().any(|job| job.status.is_active())
    }

    /// Every held job ordered by status priority, then newest first.
    pub fn sorted_active_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.iter().collect();
        jobs.sort_by(|a, b| compare_jobs(a, b));
        jobs
    }

    // ---- internals ----

    fn remove_referenced(&mut self, job_id: Option<&str>, ui_id: Option<&str>) -> Option<Job> {
        if let Some(job) = job_id.and_then(|id| self.remove_job(id)) {
            return Some(job);
        }
        let removed = ui_id.and_then(|id| self.remove_job(id));
        if removed.is_none() {
            tracing::debug!(?job_id, ?ui_id, "Terminal event for unknown job ignored");
        }
        removed
    }

    fn remove_key(&mut self, ui_key: &str) -> Option<(usize, Job)> {
        let job = self.jobs.remove(ui_key)?;
        if self.backend_index.get(&job.backend_id).map(String::as_str) == Some(ui_key) {
            self.backend_index.remove(&job.backend_id);
        }
        let position = self.order.iter().position(|k| k == ui_key).unwrap_or(self.order.len());
        if position < self.order.len() {
            self.order.remove(position);
        }
        Some((position, job))
    }

    /// Store `job`, evicting any job that shares either identifier.
    fn insert_at(&mut self, preferred: Option<usize>, job: Job) -> Job {
        let mut position = preferred;
        let candidates = [
            self.jobs.get(&job.ui_id).map(|j| j.ui_id.clone()),
            self.backend_index.get(&job.ui_id).cloned(),
            self.jobs.get(&job.backend_id).map(|j| j.ui_id.clone()),
            self.backend_index.get(&job.backend_id).cloned(),
        ];
        for key in candidates.into_iter().flatten() {
            if let Some((removed_at, _)) = self.remove_key(&key) {
                position = Some(position.map_or(removed_at, |p| p.min(removed_at)));
            }
        }

        let position = position.unwrap_or(self.order.len()).min(self.order.len());
        self.order.insert(position, job.ui_id.clone());
        self.backend_index
            .insert(job.backend_id.clone(), job.ui_id.clone());
        self.jobs.insert(job.ui_id.clone(), job.clone());
        job
    }
}

/// Fold the live state of a job tracked under the backend id into the
/// locally submitted one.
fn absorb_live_state(job: &mut Job, live: &Job) {
    if live.status.sort_rank() < job.status.sort_rank() || live.status.is_terminal() {
        job.status = live.status;
    }
    job.progress = job.progress.max(live.progress);
    job.current_step = live.current_step.or(job.current_step);
    job.total_steps = live.total_steps.or(job.total_steps);
    job.start_time = job.start_time.take().or_else(|| live.start_time.clone());
    job.normalize();
}

fn job_timestamp(job: &Job) -> Option<Timestamp> {
    job.created_at
        .as_deref()
        .and_then(parse_timestamp)
        .or_else(|| job.start_time.as_deref().and_then(parse_timestamp))
}

/// Status priority first, then newest first. Unparsable timestamps sort
/// last and compare equal to each other.
fn compare_jobs(a: &Job, b: &Job) -> Ordering {
    a.status
        .sort_rank()
        .cmp(&b.status.sort_rank())
        .then_with(|| match (job_timestamp(a), job_timestamp(b)) {
            (Some(ta), Some(tb)) => tb.cmp(&ta),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn job_input(id: &str, status: &str, created_at: Option<&str>) -> JobInput {
        JobInput {
            id: Some(id.into()),
            status: Some(status.into()),
            created_at: created_at.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn lookup_by_either_identifier() {
        let mut queue = JobQueue::new();
        let job = queue.enqueue_job(JobInput {
            ui_id: Some("ui-1".into()),
            backend_id: Some("b-1".into()),
            ..Default::default()
        });
        assert_eq!(queue.get_job_by_identifier("ui-1"), Some(&job));
        assert_eq!(queue.get_job_by_identifier("b-1"), Some(&job));
        assert!(queue.get_job_by_identifier("nope").is_none());
    }

    #[test]
    fn single_id_serves_as_both_identities() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(JobInput {
            id: Some("a".into()),
            ..Default::default()
        });
        let job = queue.get_job_by_identifier("a").unwrap();
        assert_eq!(job.ui_id, "a");
        assert_eq!(job.backend_id, "a");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_replaces_existing_identity() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("a", "queued", None));
        queue.enqueue_job(job_input("a", "processing", None));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_job_by_identifier("a").unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("a", "queued", None));
        queue.enqueue_job(job_input("b", "queued", None));

        assert!(queue.remove_job("a").is_some());
        let after_first: Vec<String> = queue.iter().map(|j| j.ui_id.clone()).collect();
        assert!(queue.remove_job("a").is_none());
        let after_second: Vec<String> = queue.iter().map(|j| j.ui_id.clone()).collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn blank_identifiers_are_ignored() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("a", "queued", None));
        assert!(queue.remove_job("   ").is_none());
        assert!(queue.update_job("", JobPatch::default()).is_none());
        assert!(queue.handle_progress_message(&ProgressMessage::default()).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn sorted_view_orders_by_status_then_recency() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("done", "completed", Some("2026-01-03T00:00:00Z")));
        queue.enqueue_job(job_input("old-q", "queued", Some("2026-01-01T00:00:00Z")));
        queue.enqueue_job(job_input("bad-q", "queued", Some("not a date")));
        queue.enqueue_job(job_input("new-q", "queued", Some("2026-01-02T00:00:00Z")));
        queue.enqueue_job(job_input("broken", "failed", None));
        queue.enqueue_job(job_input("run", "processing", Some("2025-12-01T00:00:00Z")));

        let order: Vec<&str> = queue
            .sorted_active_jobs()
            .iter()
            .map(|j| j.ui_id.as_str())
            .collect();
        assert_eq!(order, vec!["run", "new-q", "old-q", "bad-q", "done", "broken"]);
    }

    #[test]
    fn unparsable_timestamps_keep_insertion_order() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("x", "queued", None));
        queue.enqueue_job(job_input("y", "queued", Some("garbage")));
        let order: Vec<&str> = queue
            .sorted_active_jobs()
            .iter()
            .map(|j| j.ui_id.as_str())
            .collect();
        assert_eq!(order, vec!["x", "y"]);
    }

    #[test]
    fn progress_for_unknown_job_synthesises_processing_job() {
        let mut queue = JobQueue::new();
        let job = queue
            .handle_progress_message(&ProgressMessage {
                job_id: Some("b-9".into()),
                progress: Some(40.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.backend_id, "b-9");
        assert_eq!(job.progress, 0.4);
        assert!(queue.has_active_jobs());
    }

    #[test]
    fn progress_updates_known_job() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(JobInput {
            ui_id: Some("u".into()),
            backend_id: Some("b".into()),
            ..Default::default()
        });
        let job = queue
            .handle_progress_message(&ProgressMessage {
                job_id: Some("b".into()),
                current_step: Some(10),
                total_steps: Some(40),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(job.ui_id, "u");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0.25);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn confirming_backend_id_absorbs_raced_progress() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(JobInput {
            ui_id: Some("u".into()),
            status: Some("queued".into()),
            ..Default::default()
        });
        // Progress arrives before the submission response.
        queue.handle_progress_message(&ProgressMessage {
            job_id: Some("b".into()),
            progress: Some(0.5),
            ..Default::default()
        });
        assert_eq!(queue.len(), 2);

        let job = queue
            .update_job(
                "u",
                JobPatch {
                    backend_id: Some("b".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(job.backend_id, "b");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0.5);
        assert_eq!(queue.get_job_by_identifier("b").unwrap().ui_id, "u");
    }

    #[test]
    fn completion_and_error_remove_jobs() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("a", "processing", None));
        queue.enqueue_job(job_input("b", "processing", None));

        let done = queue.handle_completion_message(&CompletionMessage {
            job_id: Some("a".into()),
            ..Default::default()
        });
        assert!(done.is_some());
        let failed = queue.handle_error_message(&ErrorMessage {
            ui_id: Some("b".into()),
            ..Default::default()
        });
        assert!(failed.is_some());
        assert!(queue.is_empty());
        assert!(queue
            .handle_completion_message(&CompletionMessage {
                job_id: Some("a".into()),
                ..Default::default()
            })
            .is_none());
    }

    #[test]
    fn clear_completed_keeps_active_jobs() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(job_input("a", "completed", None));
        queue.enqueue_job(job_input("b", "failed", None));
        queue.enqueue_job(job_input("c", "queued", None));
        assert_eq!(queue.clear_completed_jobs(), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.get_job_by_identifier("c").is_some());
    }

    #[test]
    fn snapshot_keeps_known_ui_ids() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(JobInput {
            ui_id: Some("u".into()),
            backend_id: Some("b".into()),
            params: crate::job::GenerationParams {
                prompt: Some("a red fox".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        queue.set_jobs(vec![
            JobInput {
                backend_id: Some("b".into()),
                status: Some("running".into()),
                ..Default::default()
            },
            job_input("other", "queued", None),
        ]);
        let job = queue.get_job_by_identifier("b").unwrap();
        assert_eq!(job.ui_id, "u");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.params.prompt.as_deref(), Some("a red fox"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn strict_resolution_fails_for_unknown_ids() {
        let mut queue = JobQueue::new();
        queue.enqueue_job(JobInput {
            ui_id: Some("u".into()),
            backend_id: Some("b".into()),
            ..Default::default()
        });
        assert_eq!(queue.resolve_backend_id("u", true).unwrap(), "b");
        assert_matches!(
            queue.resolve_backend_id("zzz", true),
            Err(CoreError::JobNotFound(ref id)) if id == "zzz"
        );
        assert_eq!(queue.resolve_backend_id("zzz", false).unwrap(), "zzz");
        assert!(queue.resolve_backend_id(" ", false).is_err());
    }
}
