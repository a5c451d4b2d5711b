//! Transport module: owns the adapter handle and the connection metrics.
//!
//! The adapter reports connection changes as snapshots through the
//! handler loop; [`TransportModule::record_connection_snapshot`] is the
//! only path that moves the phase machine. Commands reach the adapter
//! through [`TransportModule::ensure_transport`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use genorch_comfyui::transport::DEFAULT_POLL_INTERVAL_MS;
use genorch_core::adapter::TransportAdapter;
use genorch_core::transport::{
    ConnectionSnapshot, PausePayload, ResumePayload, TransportError, TransportMetrics, TransportMonitor,
    TransportPhase,
};

use crate::error::OrchestratorError;
use crate::state::{read, write};

pub struct TransportModule {
    monitor: RwLock<TransportMonitor>,
    adapter: RwLock<Option<Arc<dyn TransportAdapter>>>,
    poll_interval_ms: AtomicU64,
}

impl Default for TransportModule {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportModule {
    pub fn new() -> Self {
        Self {
            monitor: RwLock::new(TransportMonitor::new()),
            adapter: RwLock::new(None),
            poll_interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub(crate) fn attach(&self, adapter: Arc<dyn TransportAdapter>) {
        adapter.set_poll_interval(self.poll_interval_ms());
        *write(&self.adapter) = Some(adapter);
    }

    /// Clear and drop the adapter. Returns `true` if one was attached.
    pub fn detach(&self) -> bool {
        let adapter = write(&self.adapter).take();
        match adapter {
            Some(adapter) => {
                adapter.clear();
                true
            }
            None => false,
        }
    }

    pub fn ensure_transport(&self) -> Result<Arc<dyn TransportAdapter>, OrchestratorError> {
        read(&self.adapter).clone().ok_or(OrchestratorError::NotInitialized)
    }

    pub fn is_attached(&self) -> bool {
        read(&self.adapter).is_some()
    }

    // ---- metrics ----

    pub fn record_connection_snapshot(&self, snapshot: ConnectionSnapshot) {
        write(&self.monitor).record_connection_snapshot(snapshot);
    }

    pub fn metrics(&self) -> TransportMetrics {
        read(&self.monitor).metrics()
    }

    pub fn phase(&self) -> TransportPhase {
        read(&self.monitor).phase()
    }

    pub fn is_connected(&self) -> bool {
        read(&self.monitor).is_connected()
    }

    pub fn last_error(&self) -> Option<TransportError> {
        read(&self.monitor).last_error().cloned()
    }

    pub fn last_snapshot(&self) -> Option<ConnectionSnapshot> {
        read(&self.monitor).last_snapshot().cloned()
    }

    /// Forget every counter and the pause state.
    pub(crate) fn reset(&self) {
        *write(&self.monitor) = TransportMonitor::new();
    }

    // ---- control ----

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.load(Ordering::Relaxed)
    }

    /// Record the fallback poll interval and forward it to the adapter.
    pub fn set_poll_interval(&self, interval_ms: u64) {
        self.poll_interval_ms.store(interval_ms, Ordering::Relaxed);
        if let Some(adapter) = read(&self.adapter).clone() {
            adapter.set_poll_interval(interval_ms);
        }
    }

    pub async fn reconnect(&self) -> Result<(), OrchestratorError> {
        let adapter = self.ensure_transport()?;
        adapter.reconnect().await?;
        Ok(())
    }

    /// Mark the transport paused and ask the adapter to stop. An adapter
    /// failure is logged; the local pause still holds.
    pub async fn pause_transport(&self, payload: &PausePayload) {
        write(&self.monitor).pause(payload, chrono::Utc::now());
        let adapter = read(&self.adapter).clone();
        if let Some(adapter) = adapter {
            if let Err(e) = adapter.pause(payload).await {
                tracing::warn!(error = %e, reasons = ?payload.reasons, "Adapter failed to pause");
            }
        }
    }

    /// Ask the adapter to resume and clear the pause once it has. On
    /// failure the pause state is left as it is and the error returned.
    pub async fn resume_transport(
        &self,
        history_limit: usize,
        payload: &ResumePayload,
    ) -> Result<(), OrchestratorError> {
        let adapter = read(&self.adapter).clone();
        if let Some(adapter) = adapter {
            if let Err(e) = adapter.resume(history_limit, payload).await {
                tracing::warn!(error = %e, "Adapter failed to resume; keeping transport paused");
                return Err(e.into());
            }
        }
        write(&self.monitor).clear_pause();
        Ok(())
    }
}
