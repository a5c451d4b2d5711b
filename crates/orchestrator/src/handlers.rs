//! Adapter event dispatch.
//!
//! Handlers are stateless: each event is applied to the modules in one
//! synchronous step, so a consumer never observes half of an update.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use genorch_core::events::AdapterEvent;
use genorch_core::results::create_result_from_completion;
use genorch_core::transport::ConnectionEvent;

use crate::state::OrchestratorState;

/// Apply one adapter event to the orchestrator state.
pub fn dispatch(state: &OrchestratorState, event: AdapterEvent) {
    match event {
        AdapterEvent::Connection(snapshot) => {
            if matches!(snapshot.event, ConnectionEvent::Disconnect | ConnectionEvent::Error) {
                state.status().reset_status();
            }
            state.transport().record_connection_snapshot(snapshot);
        }
        AdapterEvent::SystemStatus(payload) => state.status().apply_payload(payload),
        AdapterEvent::QueueSnapshot(jobs) => state.with_queue_mut(|queue| queue.set_jobs(jobs)),
        AdapterEvent::Progress(msg) => {
            state.with_queue_mut(|queue| queue.handle_progress_message(&msg));
        }
        AdapterEvent::Completion(msg) => {
            let stored = state.with_queue_and_results(|queue, results| {
                let msg = match queue.handle_completion_message(&msg) {
                    Some(job) => msg.with_job_defaults(&job),
                    None => msg,
                };
                let result = create_result_from_completion(&msg)?;
                results.insert(result.clone());
                Some(result)
            });
            match stored {
                Some(result) => tracing::debug!(result_id = %result.id, job_id = %result.job_id, "Stored generation result"),
                None => tracing::warn!("Completion event without job or result id dropped"),
            }
        }
        AdapterEvent::Error(msg) => {
            if state.with_queue_mut(|queue| queue.handle_error_message(&msg)).is_none() {
                tracing::debug!(job_id = ?msg.identifier(), "Error event for untracked job");
            }
        }
        AdapterEvent::Results(results) => state.with_results_mut(|history| history.set_results(results)),
    }
}

/// Drain the adapter's event channel until it closes or `cancel` fires.
pub async fn run_event_loop(
    state: Arc<OrchestratorState>,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => dispatch(&state, event),
            None => {
                tracing::debug!("Adapter event channel closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use genorch_core::api::{ApiError, GenerationApi, GenerationRequest, SubmitResponse};
    use genorch_core::events::{CompletionMessage, ErrorMessage, ProgressMessage};
    use genorch_core::job::{GenerationParams, JobInput, JobStatus};
    use genorch_core::results::ResultInput;
    use genorch_core::system_status::SystemStatusPayload;
    use genorch_core::transport::{ConnectionSnapshot, TransportPhase};

    use super::*;
    use crate::status_controller::SystemStatusController;

    struct NoApi;

    #[async_trait::async_trait]
    impl GenerationApi for NoApi {
        async fn submit_generation(&self, _: &GenerationRequest) -> Result<SubmitResponse, ApiError> {
            Err(ApiError::Transport("unused".into()))
        }
        async fn cancel_job(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn delete_result(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn fetch_system_status(&self) -> Result<SystemStatusPayload, ApiError> {
            Ok(SystemStatusPayload::default())
        }
        async fn fetch_recent_results(&self, _: usize) -> Result<Vec<ResultInput>, ApiError> {
            Ok(Vec::new())
        }
        async fn list_jobs(&self) -> Result<Vec<JobInput>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn state() -> OrchestratorState {
        OrchestratorState::new(SystemStatusController::new("test", Arc::new(NoApi)))
    }

    #[test]
    fn progress_then_completion_moves_job_to_results() {
        let state = state();
        state.with_queue_mut(|q| {
            q.enqueue_job(JobInput {
                ui_id: Some("ui-1".into()),
                backend_id: Some("b-1".into()),
                status: Some("queued".into()),
                params: GenerationParams {
                    prompt: Some("a red fox".into()),
                    seed: Some(11),
                    ..Default::default()
                },
                ..Default::default()
            })
        });

        dispatch(
            &state,
            AdapterEvent::Progress(ProgressMessage {
                job_id: Some("b-1".into()),
                progress: Some(0.5),
                ..Default::default()
            }),
        );
        let job = state.with_queue(|q| q.get_job_by_identifier("ui-1").cloned()).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0.5);

        dispatch(
            &state,
            AdapterEvent::Completion(CompletionMessage {
                job_id: Some("b-1".into()),
                ..Default::default()
            }),
        );
        assert!(state.with_queue(|q| q.get_job_by_identifier("b-1").is_none()));
        let results = state.with_results(|r| r.results().to_vec());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].job_id, "b-1");
        assert_eq!(results[0].prompt.as_deref(), Some("a red fox"));
        assert_eq!(results[0].seed, Some(11));
    }

    #[test]
    fn error_event_removes_job() {
        let state = state();
        state.with_queue_mut(|q| {
            q.enqueue_job(JobInput {
                backend_id: Some("b-2".into()),
                ..Default::default()
            })
        });
        dispatch(
            &state,
            AdapterEvent::Error(ErrorMessage {
                job_id: Some("b-2".into()),
                error: Some("oom".into()),
                ..Default::default()
            }),
        );
        assert!(state.with_queue(|q| q.is_empty()));
    }

    #[test]
    fn lost_connection_resets_status_and_records_phase() {
        let state = state();
        let ok = || {
            AdapterEvent::SystemStatus(SystemStatusPayload {
                status: Some("ok".into()),
                ..Default::default()
            })
        };
        dispatch(&state, ok());
        assert!(state.status().is_ready());

        dispatch(&state, AdapterEvent::Connection(ConnectionSnapshot::new(ConnectionEvent::Disconnect)));
        assert!(!state.status().is_ready());
        assert_eq!(state.status().status().status, "unknown");
        assert_eq!(state.transport().phase(), TransportPhase::Disconnected);

        // A failed connection drops the status the same way.
        dispatch(&state, ok());
        assert!(state.status().is_ready());
        dispatch(&state, AdapterEvent::Connection(ConnectionSnapshot::new(ConnectionEvent::Error)));
        assert!(!state.status().is_ready());
        assert_eq!(state.status().status().status, "unknown");
        assert_eq!(state.transport().phase(), TransportPhase::Disconnected);
    }

    #[test]
    fn snapshot_and_results_replace_state() {
        let state = state();
        dispatch(
            &state,
            AdapterEvent::QueueSnapshot(vec![JobInput {
                backend_id: Some("b-9".into()),
                status: Some("processing".into()),
                ..Default::default()
            }]),
        );
        assert_eq!(state.with_queue(|q| q.len()), 1);

        dispatch(
            &state,
            AdapterEvent::Results(vec![ResultInput {
                id: Some("r-1".into()),
                ..Default::default()
            }]),
        );
        assert_eq!(state.with_results(|r| r.results()[0].id.clone()), "r-1");
    }

    #[tokio::test]
    async fn event_loop_stops_on_cancel() {
        let state = Arc::new(state());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(state.clone(), rx, cancel.clone()));

        tx.send(AdapterEvent::Connection(ConnectionSnapshot::new(ConnectionEvent::ConnectSuccess)))
            .unwrap();
        cancel.cancel();
        task.await.unwrap();
        let _ = tx.send(AdapterEvent::Results(Vec::new()));
    }
}
