//! Backend status hydration and polling.
//!
//! One [`SystemStatusController`] exists per backend target for the
//! lifetime of the [`StatusControllerRegistry`], so the "status endpoint
//! unavailable" decision survives orchestrator teardown and recreation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use genorch_core::api::{ApiError, GenerationApi};
use genorch_core::system_status::{SystemStatus, SystemStatusPayload, SystemStatusStore};
use genorch_core::types::Timestamp;

use crate::state::{lock, read, write};

/// Default interval between status polls.
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);

type RefreshFuture = Shared<BoxFuture<'static, Result<(), ApiError>>>;

struct PollingTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SystemStatusController {
    target: String,
    api: Arc<dyn GenerationApi>,
    store: RwLock<SystemStatusStore>,
    inflight: Mutex<Option<RefreshFuture>>,
    polling: Mutex<Option<PollingTask>>,
    poll_interval_ms: AtomicU64,
}

impl SystemStatusController {
    pub fn new(target: impl Into<String>, api: Arc<dyn GenerationApi>) -> Arc<Self> {
        Arc::new(Self {
            target: target.into(),
            api,
            store: RwLock::new(SystemStatusStore::new()),
            inflight: Mutex::new(None),
            polling: Mutex::new(None),
            poll_interval_ms: AtomicU64::new(DEFAULT_STATUS_POLL_INTERVAL.as_millis() as u64),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    // ---- selectors ----

    pub fn status(&self) -> SystemStatus {
        read(&self.store).status().clone()
    }

    pub fn is_ready(&self) -> bool {
        read(&self.store).is_ready()
    }

    pub fn is_api_available(&self) -> bool {
        read(&self.store).is_api_available()
    }

    pub fn last_updated(&self) -> Option<Timestamp> {
        read(&self.store).last_updated()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.polling).is_some()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    // ---- store mutation ----

    /// Merge a pushed status payload (e.g. from the WebSocket).
    pub fn apply_payload(&self, payload: SystemStatusPayload) {
        write(&self.store).apply_system_status_payload(payload);
    }

    /// Back to defaults (on disconnect). Availability is kept.
    pub fn reset_status(&self) {
        write(&self.store).reset();
    }

    /// Takes effect from the next scheduled poll.
    pub fn set_poll_interval(&self, interval: Duration) {
        let ms = (interval.as_millis() as u64).max(1);
        self.poll_interval_ms.store(ms, Ordering::Relaxed);
    }

    // ---- fetching ----

    /// Fetch once unless the status is already known. A backend known to
    /// have no status endpoint is marked ready without a request.
    pub async fn ensure_hydrated(self: &Arc<Self>) -> Result<(), ApiError> {
        if self.is_ready() {
            return Ok(());
        }
        if !self.is_api_available() {
            write(&self.store).mark_system_status_unavailable();
            return Ok(());
        }
        self.refresh().await
    }

    /// Fetch the status. Concurrent callers share one request.
    ///
    /// A "not found" response marks the endpoint unavailable for good
    /// and is not reported as an error.
    pub async fn refresh(self: &Arc<Self>) -> Result<(), ApiError> {
        let fut = {
            let mut inflight = lock(&self.inflight);
            match inflight.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let this = Arc::clone(self);
                    let fut = async move { this.fetch_once().await }.boxed().shared();
                    *inflight = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        let mut inflight = lock(&self.inflight);
        if inflight.as_ref().is_some_and(|current| current.ptr_eq(&fut)) {
            *inflight = None;
        }
        result
    }

    async fn fetch_once(&self) -> Result<(), ApiError> {
        match self.api.fetch_system_status().await {
            Ok(payload) => {
                self.apply_payload(payload);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(backend = %self.target, "Backend has no status endpoint; disabling status polling");
                {
                    let mut store = write(&self.store);
                    store.reset();
                    store.mark_system_status_unavailable();
                }
                self.stop_polling();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(backend = %self.target, error = %e, "System status fetch failed");
                write(&self.store).mark_error();
                Err(e)
            }
        }
    }

    // ---- polling ----

    /// Start the polling task. Returns `false` if the endpoint is known
    /// to be unavailable.
    pub fn start_polling(self: &Arc<Self>) -> bool {
        if !self.is_api_available() {
            tracing::debug!(backend = %self.target, "Status endpoint unavailable; not polling");
            return false;
        }
        let mut polling = lock(&self.polling);
        if polling.is_some() {
            return true;
        }

        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(this) => this.poll_interval(),
                    None => return,
                };
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(this) = weak.upgrade() else { return };
                if !this.is_api_available() {
                    return;
                }
                if let Err(e) = this.refresh().await {
                    tracing::debug!(error = %e, "Status poll failed; will retry");
                }
            }
        });

        tracing::debug!(backend = %self.target, interval_ms = self.poll_interval().as_millis() as u64, "Started status polling");
        *polling = Some(PollingTask { cancel, handle });
        true
    }

    pub fn stop_polling(&self) {
        if let Some(task) = lock(&self.polling).take() {
            task.cancel.cancel();
            task.handle.abort();
            tracing::debug!(backend = %self.target, "Stopped status polling");
        }
    }
}

impl Drop for SystemStatusController {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

/// One status controller per backend target.
#[derive(Default)]
pub struct StatusControllerRegistry {
    controllers: Mutex<HashMap<String, Arc<SystemStatusController>>>,
}

impl StatusControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The controller for `target`, created with `api` on first use.
    pub fn controller_for(&self, target: &str, api: Arc<dyn GenerationApi>) -> Arc<SystemStatusController> {
        let mut controllers = lock(&self.controllers);
        Arc::clone(
            controllers
                .entry(target.to_string())
                .or_insert_with(|| SystemStatusController::new(target, api)),
        )
    }

    pub fn len(&self) -> usize {
        lock(&self.controllers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
