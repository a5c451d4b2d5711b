#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use genorch_core::adapter::{AdapterError, TransportAdapter};
use genorch_core::api::{ApiError, GenerationApi, GenerationRequest, SubmitResponse};
use genorch_core::events::AdapterEvent;
use genorch_core::job::JobInput;
use genorch_core::results::ResultInput;
use genorch_core::system_status::SystemStatusPayload;
use genorch_core::transport::{PausePayload, ResumePayload};
use genorch_orchestrator::error::OrchestratorError;
use genorch_orchestrator::manager::{OrchestratorFactory, OrchestratorManager, TransportContext};

pub const TEST_TARGET: &str = "http://fake-backend:8188";

// ---------------------------------------------------------------------------
// Fake REST API
// ---------------------------------------------------------------------------

/// In-memory `GenerationApi`. Every response can be swapped per test and
/// every call is counted.
pub struct FakeApi {
    pub results: Mutex<Result<Vec<ResultInput>, ApiError>>,
    pub jobs: Mutex<Result<Vec<JobInput>, ApiError>>,
    pub status: Mutex<Result<SystemStatusPayload, ApiError>>,
    pub submit: Mutex<Result<SubmitResponse, ApiError>>,
    pub cancel: Mutex<Result<(), ApiError>>,
    pub delete: Mutex<Result<(), ApiError>>,

    /// Delay applied to `fetch_recent_results` and `fetch_system_status`.
    pub latency: Mutex<Duration>,

    pub results_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub submitted: Mutex<Vec<GenerationRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            results: Mutex::new(Ok(Vec::new())),
            jobs: Mutex::new(Ok(Vec::new())),
            status: Mutex::new(Ok(SystemStatusPayload {
                status: Some("ok".into()),
                ..Default::default()
            })),
            submit: Mutex::new(Ok(SubmitResponse {
                job_id: "prompt-1".into(),
                queue_position: Some(0),
            })),
            cancel: Mutex::new(Ok(())),
            delete: Mutex::new(Ok(())),
            latency: Mutex::new(Duration::ZERO),
            results_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }
}

impl FakeApi {
    pub fn set_results(&self, results: Result<Vec<ResultInput>, ApiError>) {
        *self.results.lock().unwrap() = results;
    }

    pub fn set_jobs(&self, jobs: Result<Vec<JobInput>, ApiError>) {
        *self.jobs.lock().unwrap() = jobs;
    }

    pub fn set_status(&self, status: Result<SystemStatusPayload, ApiError>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub async fn wait(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl GenerationApi for FakeApi {
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<SubmitResponse, ApiError> {
        self.submitted.lock().unwrap().push(request.clone());
        self.submit.lock().unwrap().clone()
    }

    async fn cancel_job(&self, backend_id: &str) -> Result<(), ApiError> {
        self.cancelled.lock().unwrap().push(backend_id.to_string());
        self.cancel.lock().unwrap().clone()
    }

    async fn delete_result(&self, id: &str) -> Result<(), ApiError> {
        self.deleted.lock().unwrap().push(id.to_string());
        self.delete.lock().unwrap().clone()
    }

    async fn fetch_system_status(&self) -> Result<SystemStatusPayload, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        self.status.lock().unwrap().clone()
    }

    async fn fetch_recent_results(&self, limit: usize) -> Result<Vec<ResultInput>, ApiError> {
        self.results_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        self.results
            .lock()
            .unwrap()
            .clone()
            .map(|results| results.into_iter().take(limit).collect())
    }

    async fn list_jobs(&self) -> Result<Vec<JobInput>, ApiError> {
        self.jobs.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Fake transport adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTransport {
    pub paused: AtomicBool,
    pub cleared: AtomicBool,
    pub clears: AtomicUsize,
    pub fail_resume: AtomicBool,
    pub reconnects: AtomicUsize,
    pub poll_interval_ms: AtomicU64,
    pub resumed_with_limit: AtomicUsize,
}

#[async_trait]
impl TransportAdapter for FakeTransport {
    fn set_poll_interval(&self, interval_ms: u64) {
        self.poll_interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    async fn reconnect(&self) -> Result<(), AdapterError> {
        if self.cleared.load(Ordering::SeqCst) {
            return Err(AdapterError::new("cleared"));
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self, _payload: &PausePayload) -> Result<(), AdapterError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, history_limit: usize, _payload: &ResumePayload) -> Result<(), AdapterError> {
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(AdapterError::new("backend unreachable"));
        }
        self.resumed_with_limit.store(history_limit, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.cleared.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Fake factory
// ---------------------------------------------------------------------------

/// Hands out `FakeTransport`s and keeps the event sender of the latest one
/// so tests can push adapter events.
#[derive(Default)]
pub struct FakeFactory {
    pub api: Arc<FakeApi>,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub events: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
    pub contexts: Mutex<Vec<(usize, u64)>>,
    pub create_calls: AtomicUsize,
    pub fail_create: AtomicBool,
}

impl FakeFactory {
    pub fn transport(&self) -> Arc<FakeTransport> {
        self.transports.lock().unwrap().last().cloned().expect("no transport created")
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Push an event as if the adapter had received it.
    pub fn emit(&self, event: AdapterEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().expect("no transport created").send(event).unwrap();
    }
}

#[async_trait]
impl OrchestratorFactory for FakeFactory {
    fn target(&self) -> String {
        TEST_TARGET.to_string()
    }

    fn api(&self) -> Arc<dyn GenerationApi> {
        self.api.clone()
    }

    async fn create_transport(
        &self,
        ctx: TransportContext,
    ) -> Result<Arc<dyn TransportAdapter>, OrchestratorError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.api.wait().await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Transport("socket refused".into()));
        }
        self.contexts.lock().unwrap().push((ctx.history_limit, ctx.poll_interval_ms));
        *self.events.lock().unwrap() = Some(ctx.events);
        let transport = Arc::new(FakeTransport::default());
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn setup() -> (Arc<FakeFactory>, Arc<OrchestratorManager>) {
    let factory = Arc::new(FakeFactory::default());
    let manager = OrchestratorManager::new(factory.clone());
    (factory, manager)
}

pub fn result(id: &str) -> ResultInput {
    ResultInput {
        id: Some(id.into()),
        job_id: Some(format!("job-{id}")),
        created_at: Some("2026-01-01T00:00:00Z".into()),
        ..Default::default()
    }
}

/// Poll `condition` until it holds, failing the test after one second.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 1s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
