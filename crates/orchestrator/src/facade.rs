//! The consumer-facing surface: commands plus read-only selectors.
//!
//! A [`GenerationFacade`] is one registered consumer of the shared
//! orchestrator. Every mutating command runs through the orchestrator's
//! [`CommandRunner`](crate::commands::CommandRunner), so its latency,
//! outcome and in-flight count are observable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use genorch_core::api::GenerationRequest;
use genorch_core::job::{generate_ui_id, Job, JobInput, JobPatch, JobStatus};
use genorch_core::results::GenerationResult;
use genorch_core::system_status::SystemStatus;
use genorch_core::transport::{
    ConnectionSnapshot, PausePayload, ResumePayload, TransportError, TransportMetrics, TransportPhase,
};
use genorch_core::types::{is_blank, Timestamp};

use crate::commands::CommandError;
use crate::error::OrchestratorError;
use crate::manager::{ConsumerHandle, InitOptions, Orchestrator, OrchestratorManager};
use crate::state::{lock, OrchestratorState};

/// Options for [`GenerationFacade::refresh_history`].
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// New history limit to apply before fetching.
    pub limit: Option<i64>,
    /// Also replace the job queue from the backend.
    pub include_queue: bool,
}

pub struct GenerationFacade {
    manager: Arc<OrchestratorManager>,
    consumer: ConsumerHandle,
    orchestrator: Mutex<Arc<Orchestrator>>,
    released: AtomicBool,
}

impl GenerationFacade {
    pub(crate) fn new(manager: Arc<OrchestratorManager>, consumer: ConsumerHandle) -> Self {
        let orchestrator = manager.ensure_orchestrator();
        Self {
            manager,
            consumer,
            orchestrator: Mutex::new(orchestrator),
            released: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self) -> ConsumerHandle {
        self.consumer
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// The orchestrator this facade reads from. Follows the manager to a
    /// fresh instance if the cached one was torn down.
    fn current(&self) -> Arc<Orchestrator> {
        let mut cached = lock(&self.orchestrator);
        if cached.is_destroyed() && !self.is_released() {
            *cached = self.manager.ensure_orchestrator();
        }
        Arc::clone(&cached)
    }

    fn live(&self) -> Result<Arc<Orchestrator>, OrchestratorError> {
        if self.is_released() {
            return Err(OrchestratorError::Destroyed);
        }
        Ok(self.current())
    }

    fn read<R>(&self, f: impl FnOnce(&OrchestratorState) -> R) -> R {
        f(self.current().state())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Initialize the shared orchestrator on behalf of this consumer. A
    /// failed attempt unregisters the consumer, so a retry registers it
    /// again first.
    pub async fn ensure_initialized(&self, mut options: InitOptions) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        self.manager.reregister_consumer(self.consumer);
        if self.is_released() {
            self.manager.unregister_read_only_consumer(self.consumer);
            return Err(OrchestratorError::Destroyed);
        }
        options.consumer = Some(self.consumer);
        orchestrator
            .state()
            .commands()
            .run("ensure_initialized", self.manager.ensure_initialized(options))
            .await
    }

    /// Give up this consumer's claim. The last release destroys the
    /// orchestrator. Returns `true` if this call did so.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.manager.release_if_last_consumer(self.consumer).await
    }

    // -----------------------------------------------------------------------
    // Job commands
    // -----------------------------------------------------------------------

    /// Submit a generation. The job is queued locally under its UI id
    /// before the request is sent and removed again if the backend rejects it.
    pub async fn submit_generation(&self, mut request: GenerationRequest) -> Result<Job, OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("submit_generation", async {
                if is_blank(&request.ui_id) {
                    request.ui_id = generate_ui_id();
                }
                let job = state.with_queue_mut(|q| {
                    q.enqueue_job(JobInput {
                        ui_id: Some(request.ui_id.clone()),
                        status: Some(JobStatus::Queued.as_str().to_string()),
                        created_at: Some(chrono::Utc::now().to_rfc3339()),
                        params: request.params.clone(),
                        ..Default::default()
                    })
                });

                match orchestrator.api().submit_generation(&request).await {
                    Ok(response) => {
                        let patch = JobPatch {
                            backend_id: Some(response.job_id.clone()),
                            ..Default::default()
                        };
                        let confirmed = state.with_queue_mut(|q| q.update_job(&job.ui_id, patch));
                        tracing::info!(
                            ui_id = %job.ui_id,
                            backend_id = %response.job_id,
                            queue_position = ?response.queue_position,
                            "Generation submitted",
                        );
                        Ok(confirmed.unwrap_or(job))
                    }
                    Err(e) => {
                        state.with_queue_mut(|q| q.remove_job(&job.ui_id));
                        Err(OrchestratorError::from(e))
                    }
                }
            })
            .await
    }

    /// Cancel a job by either identifier. The identifier must belong to a
    /// tracked job.
    pub async fn cancel_job(&self, identifier: &str) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("cancel_job", async {
                let backend_id = state.with_queue(|q| q.resolve_backend_id(identifier, true))?;
                orchestrator.api().cancel_job(&backend_id).await?;
                state.with_queue_mut(|q| q.remove_job(&backend_id));
                tracing::info!(backend_id = %backend_id, "Job cancelled");
                Ok::<_, OrchestratorError>(())
            })
            .await
    }

    /// Drop a job locally. Removing an unknown job is not an error.
    pub async fn remove_job(&self, identifier: &str) -> Result<Option<Job>, OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("remove_job", async { Ok(state.with_queue_mut(|q| q.remove_job(identifier))) })
            .await
    }

    /// Returns the number of jobs dropped.
    pub async fn clear_completed_jobs(&self) -> Result<usize, OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("clear_completed_jobs", async { Ok(state.with_queue_mut(|q| q.clear_completed_jobs())) })
            .await
    }

    // -----------------------------------------------------------------------
    // Result commands
    // -----------------------------------------------------------------------

    /// Refetch recent results, and optionally the queue.
    pub async fn refresh_history(&self, options: RefreshOptions) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("refresh_history", async {
                let limit = match options.limit {
                    Some(limit) => state.with_results_mut(|r| r.set_history_limit(limit)),
                    None => state.with_results(|r| r.history_limit()),
                };
                let results = orchestrator.api().fetch_recent_results(limit).await?;
                state.with_results_mut(|r| r.set_results(results));

                if options.include_queue {
                    let jobs = orchestrator.api().list_jobs().await?;
                    state.with_queue_mut(|q| q.set_jobs(jobs));
                }
                Ok::<_, OrchestratorError>(())
            })
            .await
    }

    /// Apply a new history limit. Returns the effective limit.
    pub async fn set_history_limit(&self, limit: i64) -> Result<usize, OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("set_history_limit", async { Ok(state.with_results_mut(|r| r.set_history_limit(limit))) })
            .await
    }

    /// Delete a result on the backend, then locally. A result the backend
    /// no longer knows is still removed locally.
    pub async fn remove_result(&self, id: &str) -> Result<bool, OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("remove_result", async {
                match orchestrator.api().delete_result(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        tracing::debug!(result_id = %id, "Result already gone on backend");
                    }
                    Err(e) => return Err(OrchestratorError::from(e)),
                }
                Ok(state.with_results_mut(|r| r.remove_result(id)))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Transport commands
    // -----------------------------------------------------------------------

    pub async fn reconnect(&self) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state.commands().run("reconnect", state.transport().reconnect()).await
    }

    pub async fn pause(&self, payload: PausePayload) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("pause", async {
                state.transport().pause_transport(&payload).await;
                Ok(())
            })
            .await
    }

    /// Resume the transport. The adapter resyncs up to the current
    /// history limit.
    pub async fn resume(&self, payload: ResumePayload) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        let history_limit = state.with_results(|r| r.history_limit());
        state
            .commands()
            .run("resume", state.transport().resume_transport(history_limit, &payload))
            .await
    }

    pub async fn set_poll_interval(&self, interval_ms: u64) -> Result<(), OrchestratorError> {
        let orchestrator = self.live()?;
        let state = orchestrator.state();
        state
            .commands()
            .run("set_poll_interval", async {
                state.transport().set_poll_interval(interval_ms);
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Selectors
    // -----------------------------------------------------------------------

    /// Every tracked job in insertion order.
    pub fn jobs(&self) -> Vec<Job> {
        self.read(|s| s.with_queue(|q| q.jobs().into_iter().cloned().collect()))
    }

    pub fn job(&self, identifier: &str) -> Option<Job> {
        self.read(|s| s.with_queue(|q| q.get_job_by_identifier(identifier).cloned()))
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.read(|s| s.with_queue(|q| q.active_jobs().into_iter().cloned().collect()))
    }

    pub fn sorted_active_jobs(&self) -> Vec<Job> {
        self.read(|s| s.with_queue(|q| q.sorted_active_jobs().into_iter().cloned().collect()))
    }

    pub fn has_active_jobs(&self) -> bool {
        self.read(|s| s.with_queue(|q| q.has_active_jobs()))
    }

    /// Newest first.
    pub fn results(&self) -> Vec<GenerationResult> {
        self.read(|s| s.with_results(|r| r.results().to_vec()))
    }

    /// Alias of [`results`](Self::results).
    pub fn recent_results(&self) -> Vec<GenerationResult> {
        self.results()
    }

    pub fn history_limit(&self) -> usize {
        self.read(|s| s.with_results(|r| r.history_limit()))
    }

    pub fn system_status(&self) -> SystemStatus {
        self.read(|s| s.status().status())
    }

    pub fn status_ready(&self) -> bool {
        self.read(|s| s.status().is_ready())
    }

    pub fn status_api_available(&self) -> bool {
        self.read(|s| s.status().is_api_available())
    }

    pub fn status_last_updated(&self) -> Option<Timestamp> {
        self.read(|s| s.status().last_updated())
    }

    pub fn is_connected(&self) -> bool {
        self.read(|s| s.transport().is_connected())
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.read(|s| s.transport().poll_interval_ms())
    }

    pub fn transport_metrics(&self) -> TransportMetrics {
        self.read(|s| s.transport().metrics())
    }

    pub fn transport_phase(&self) -> TransportPhase {
        self.read(|s| s.transport().phase())
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.transport_metrics().reconnect_attempt
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.transport_metrics().consecutive_failures
    }

    pub fn next_retry_delay_ms(&self) -> Option<u64> {
        self.transport_metrics().next_retry_delay_ms
    }

    pub fn total_downtime_ms(&self) -> u64 {
        self.transport_metrics().total_downtime_ms
    }

    pub fn is_paused(&self) -> bool {
        self.transport_metrics().paused
    }

    pub fn last_error(&self) -> Option<TransportError> {
        self.read(|s| s.transport().last_error())
    }

    pub fn last_snapshot(&self) -> Option<ConnectionSnapshot> {
        self.read(|s| s.transport().last_snapshot())
    }

    pub fn last_command_error(&self) -> Option<CommandError> {
        self.read(|s| s.commands().last_command_error())
    }

    pub fn last_action_at(&self) -> Option<Timestamp> {
        self.read(|s| s.commands().last_action_at())
    }

    pub fn pending_actions_count(&self) -> usize {
        self.read(|s| s.commands().pending_actions_count())
    }
}

impl Drop for GenerationFacade {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(&self.manager);
                let consumer = self.consumer;
                handle.spawn(async move {
                    manager.release_if_last_consumer(consumer).await;
                });
            }
            Err(_) => {
                self.manager.unregister_read_only_consumer(self.consumer);
            }
        }
    }
}
