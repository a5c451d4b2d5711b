//! [`TransportAdapter`] implementation backed by a ComfyUI server.
//!
//! A running transport owns one *session*: a connection task (connect ->
//! process -> reconnect loop) and a polling task that fetches the queue
//! over REST while the WebSocket is down. Each session runs under a
//! child of the transport's [`CancellationToken`]; pausing or
//! reconnecting stops the session and starts a fresh one.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use genorch_core::adapter::{AdapterError, TransportAdapter};
use genorch_core::api::GenerationApi;
use genorch_core::events::AdapterEvent;
use genorch_core::results::DEFAULT_HISTORY_LIMIT;
use genorch_core::transport::{
    ConnectionEvent, ConnectionSnapshot, PausePayload, ResumePayload, TransportErrorDetail,
};

use crate::client::ComfyUIClient;
use crate::processor::{process_messages, ExecutionTracker, StreamEnd};
use crate::reconnect::{error_snapshot, reconnect_loop, ReconnectConfig};

/// Default fallback polling interval while the WebSocket is down.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Floor for the polling interval so a bad value cannot spin.
const MIN_POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum ComfyUITransportError {
    #[error("Transport is paused")]
    Paused,

    #[error("Transport has been cleared")]
    Cleared,
}

impl From<ComfyUITransportError> for AdapterError {
    fn from(err: ComfyUITransportError) -> Self {
        AdapterError::new(err.to_string())
    }
}

/// Tunables for a [`ComfyUITransport`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub reconnect: ReconnectConfig,
    pub poll_interval_ms: u64,
    pub history_limit: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

pub struct ComfyUITransport {
    client: Arc<ComfyUIClient>,
    api: Arc<dyn GenerationApi>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    reconnect: ReconnectConfig,
    poll_interval_ms: Arc<AtomicU64>,
    history_limit: Arc<AtomicUsize>,
    paused: AtomicBool,
    session: Mutex<Option<Session>>,
    /// Parent of every session token. Cancelled once by [`clear`](TransportAdapter::clear).
    cancel: CancellationToken,
}

struct Session {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Everything the connection and polling tasks share.
#[derive(Clone)]
struct SessionContext {
    client: Arc<ComfyUIClient>,
    api: Arc<dyn GenerationApi>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    reconnect: ReconnectConfig,
    poll_interval_ms: Arc<AtomicU64>,
    history_limit: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ComfyUITransport {
    pub fn new(
        client: Arc<ComfyUIClient>,
        api: Arc<dyn GenerationApi>,
        events: mpsc::UnboundedSender<AdapterEvent>,
        options: TransportOptions,
    ) -> Self {
        Self {
            client,
            api,
            events,
            reconnect: options.reconnect,
            poll_interval_ms: Arc::new(AtomicU64::new(options.poll_interval_ms)),
            history_limit: Arc::new(AtomicUsize::new(options.history_limit)),
            paused: AtomicBool::new(false),
            session: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the connection and polling tasks. A no-op while a session
    /// is already running.
    pub fn start(&self) -> Result<(), ComfyUITransportError> {
        self.start_session(false)
    }

    fn start_session(&self, resync: bool) -> Result<(), ComfyUITransportError> {
        if self.cancel.is_cancelled() {
            return Err(ComfyUITransportError::Cleared);
        }
        if self.paused.load(Ordering::SeqCst) {
            return Err(ComfyUITransportError::Paused);
        }
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            return Ok(());
        }

        let ctx = SessionContext {
            client: Arc::clone(&self.client),
            api: Arc::clone(&self.api),
            events: self.events.clone(),
            reconnect: self.reconnect.clone(),
            poll_interval_ms: Arc::clone(&self.poll_interval_ms),
            history_limit: Arc::clone(&self.history_limit),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: self.cancel.child_token(),
        };
        let cancel = ctx.cancel.clone();

        let connection = tokio::spawn(run_connection_loop(ctx.clone(), resync));
        let poller = tokio::spawn(run_poll_loop(ctx));

        tracing::info!(url = self.client.ws_url(), resync, "Started ComfyUI transport session");
        *session = Some(Session {
            cancel,
            tasks: vec![connection, poller],
        });
        Ok(())
    }

    fn stop_session(&self) -> bool {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match session {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    fn emit(&self, snapshot: ConnectionSnapshot) {
        let _ = self.events.send(AdapterEvent::Connection(snapshot));
    }
}

#[async_trait]
impl TransportAdapter for ComfyUITransport {
    fn set_poll_interval(&self, interval_ms: u64) {
        self.poll_interval_ms.store(interval_ms, Ordering::Relaxed);
        tracing::debug!(interval_ms, "Updated fallback poll interval");
    }

    async fn reconnect(&self) -> Result<(), AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(ComfyUITransportError::Cleared.into());
        }
        if self.paused.load(Ordering::SeqCst) {
            return Err(ComfyUITransportError::Paused.into());
        }
        if self.stop_session() {
            self.emit(ConnectionSnapshot::new(ConnectionEvent::Disconnect).with_url(self.client.ws_url()));
        }
        self.start_session(true)?;
        Ok(())
    }

    async fn pause(&self, payload: &PausePayload) -> Result<(), AdapterError> {
        if self.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(reasons = ?payload.reasons, "Pausing ComfyUI transport");
        if self.stop_session() {
            self.emit(ConnectionSnapshot::new(ConnectionEvent::Disconnect).with_url(self.client.ws_url()));
        }
        Ok(())
    }

    async fn resume(&self, history_limit: usize, payload: &ResumePayload) -> Result<(), AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(ComfyUITransportError::Cleared.into());
        }
        self.history_limit.store(history_limit, Ordering::Relaxed);
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!(reason = payload.reason.as_deref().unwrap_or("-"), "Resuming ComfyUI transport");
        self.start_session(true)?;
        Ok(())
    }

    fn clear(&self) {
        self.cancel.cancel();
        if self.stop_session() {
            tracing::info!(url = self.client.ws_url(), "ComfyUI transport cleared");
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Drop for ComfyUITransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.stop_session();
    }
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

/// Core connection loop: connect -> process messages -> reconnect.
///
/// Runs until the session token is triggered. `resync` refetches queue
/// and results after the first connection as well as after every reconnect.
async fn run_connection_loop(ctx: SessionContext, mut resync: bool) {
    let client = &ctx.client;
    let mut tracker = ExecutionTracker::new(client.api_url());
    let mut disconnected_at: Option<Instant> = None;

    let _ = ctx.events.send(AdapterEvent::Connection(
        ConnectionSnapshot::new(ConnectionEvent::ConnectStart).with_url(client.ws_url()),
    ));
    let first = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        result = client.connect() => result,
    };
    let mut conn = match first {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
            let _ = ctx
                .events
                .send(AdapterEvent::Connection(error_snapshot(client, 0, e.to_string())));
            disconnected_at = Some(Instant::now());
            match reconnect_loop(client, &ctx.reconnect, &ctx.cancel, &ctx.events).await {
                Some(conn) => conn,
                None => return,
            }
        }
    };

    loop {
        let mut snapshot = ConnectionSnapshot::new(ConnectionEvent::ConnectSuccess).with_url(client.ws_url());
        if let Some(since) = disconnected_at.take() {
            snapshot = snapshot.with_downtime_ms(since.elapsed().as_millis() as u64);
        }
        let _ = ctx.events.send(AdapterEvent::Connection(snapshot));
        ctx.connected.store(true, Ordering::SeqCst);

        if resync {
            resync_state(&ctx).await;
        }
        resync = true;

        let end = process_messages(&mut conn.ws_stream, &mut tracker, &ctx.events, &ctx.cancel).await;
        ctx.connected.store(false, Ordering::SeqCst);

        if end == StreamEnd::Cancelled || ctx.cancel.is_cancelled() {
            let _ = conn.ws_stream.close(None).await;
            return;
        }

        disconnected_at = Some(Instant::now());
        let mut snapshot = ConnectionSnapshot::new(ConnectionEvent::Disconnect).with_url(client.ws_url());
        if let StreamEnd::Failed(message) = end {
            snapshot = snapshot.with_error(TransportErrorDetail::new(message).with_source("websocket"));
        }
        let _ = ctx.events.send(AdapterEvent::Connection(snapshot));

        tracing::info!(url = client.ws_url(), "Connection lost, entering reconnect loop");
        conn = match reconnect_loop(client, &ctx.reconnect, &ctx.cancel, &ctx.events).await {
            Some(conn) => conn,
            None => return,
        };
    }
}

/// Refetch what may have been missed while disconnected.
async fn resync_state(ctx: &SessionContext) {
    match ctx.api.list_jobs().await {
        Ok(jobs) => {
            let _ = ctx.events.send(AdapterEvent::QueueSnapshot(jobs));
        }
        Err(e) => tracing::warn!(error = %e, "Queue resync failed"),
    }
    let limit = ctx.history_limit.load(Ordering::Relaxed);
    match ctx.api.fetch_recent_results(limit).await {
        Ok(results) => {
            let _ = ctx.events.send(AdapterEvent::Results(results));
        }
        Err(e) => tracing::warn!(error = %e, "Results resync failed"),
    }
}

/// Poll the queue over REST while the WebSocket is down.
async fn run_poll_loop(ctx: SessionContext) {
    loop {
        let interval = ctx.poll_interval_ms.load(Ordering::Relaxed).max(MIN_POLL_INTERVAL_MS);
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
        }
        if ctx.connected.load(Ordering::SeqCst) {
            continue;
        }
        match ctx.api.list_jobs().await {
            Ok(jobs) => {
                tracing::debug!(count = jobs.len(), "Polled queue while disconnected");
                let _ = ctx.events.send(AdapterEvent::QueueSnapshot(jobs));
            }
            Err(e) => tracing::debug!(error = %e, "Queue poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use genorch_core::api::{ApiError, GenerationRequest, SubmitResponse};
    use genorch_core::job::JobInput;
    use genorch_core::results::ResultInput;
    use genorch_core::system_status::SystemStatusPayload;

    use super::*;

    struct QueueOnlyApi;

    #[async_trait]
    impl GenerationApi for QueueOnlyApi {
        async fn submit_generation(&self, _: &GenerationRequest) -> Result<SubmitResponse, ApiError> {
            Err(ApiError::Transport("offline".into()))
        }
        async fn cancel_job(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn delete_result(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn fetch_system_status(&self) -> Result<SystemStatusPayload, ApiError> {
            Err(ApiError::NotFound("/system_stats".into()))
        }
        async fn fetch_recent_results(&self, _: usize) -> Result<Vec<ResultInput>, ApiError> {
            Ok(Vec::new())
        }
        async fn list_jobs(&self) -> Result<Vec<JobInput>, ApiError> {
            Ok(vec![JobInput {
                backend_id: Some("p-1".into()),
                status: Some("queued".into()),
                ..Default::default()
            }])
        }
    }

    fn transport() -> (ComfyUITransport, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(ComfyUIClient::new("ws://127.0.0.1:1", "http://127.0.0.1:1"));
        let options = TransportOptions {
            reconnect: ReconnectConfig::from_millis(60_000, 60_000),
            poll_interval_ms: MIN_POLL_INTERVAL_MS,
            ..Default::default()
        };
        (ComfyUITransport::new(client, Arc::new(QueueOnlyApi), tx, options), rx)
    }

    #[tokio::test]
    async fn polls_queue_while_disconnected() {
        let (transport, mut rx) = transport();
        transport.start().unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(AdapterEvent::QueueSnapshot(jobs)) = rx.recv().await {
                    return jobs;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(snapshot[0].backend_id.as_deref(), Some("p-1"));
        transport.clear();
    }

    #[tokio::test]
    async fn pause_stops_session_and_blocks_reconnect() {
        let (transport, mut rx) = transport();
        transport.start().unwrap();
        assert!(transport.is_running());

        transport.pause(&PausePayload::reason("hidden")).await.unwrap();
        assert!(transport.is_paused());
        assert!(!transport.is_running());
        assert!(transport.reconnect().await.is_err());

        let mut saw_disconnect = false;
        while let Ok(event) = rx.try_recv() {
            if let AdapterEvent::Connection(s) = event {
                saw_disconnect |= s.event == ConnectionEvent::Disconnect;
            }
        }
        assert!(saw_disconnect);

        transport.resume(5, &ResumePayload::default()).await.unwrap();
        assert!(!transport.is_paused());
        assert!(transport.is_running());
        transport.clear();
    }

    #[tokio::test]
    async fn clear_is_final_and_idempotent() {
        let (transport, _rx) = transport();
        transport.start().unwrap();
        transport.clear();
        transport.clear();
        assert!(!transport.is_running());
        assert_matches!(transport.start(), Err(ComfyUITransportError::Cleared));
        assert!(transport.resume(10, &ResumePayload::default()).await.is_err());
    }

    #[tokio::test]
    async fn poll_interval_is_adjustable() {
        let (transport, _rx) = transport();
        transport.set_poll_interval(12_000);
        assert_eq!(transport.poll_interval_ms(), 12_000);
    }
}
