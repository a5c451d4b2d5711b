//! Backoff schedule for re-establishing the ComfyUI socket.
//!
//! [`reconnect_loop`] keeps dialing until a connection is made or its
//! token fires. The orchestrator learns about each step only through the
//! [`ConnectionSnapshot`]s it emits: scheduled, started, failed.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use genorch_core::events::AdapterEvent;
use genorch_core::transport::{ConnectionEvent, ConnectionSnapshot, TransportErrorDetail};

use crate::client::{ComfyUIClient, ComfyUIConnection};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single wait.
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Build from millisecond settings. The cap never drops below the
    /// initial delay.
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        let initial_delay = Duration::from_millis(initial_ms.max(1));
        Self {
            initial_delay,
            max_delay: Duration::from_millis(max_ms).max(initial_delay),
            ..Default::default()
        }
    }
}

/// The wait that follows `current`, capped at `config.max_delay`.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    current.mul_f64(config.multiplier).min(config.max_delay)
}

pub(crate) fn error_snapshot(
    client: &ComfyUIClient,
    attempt: u32,
    message: impl Into<String>,
) -> ConnectionSnapshot {
    ConnectionSnapshot::new(ConnectionEvent::Error)
        .with_attempt(attempt)
        .with_url(client.ws_url())
        .with_error(TransportErrorDetail::new(message).with_source("websocket"))
}

fn emit(events: &mpsc::UnboundedSender<AdapterEvent>, snapshot: ConnectionSnapshot) {
    // A closed channel means the orchestrator is gone; the token stops us soon.
    let _ = events.send(AdapterEvent::Connection(snapshot));
}

/// Dial `client` until it answers. `None` means `cancel` fired first.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
    events: &mpsc::UnboundedSender<AdapterEvent>,
) -> Option<ComfyUIConnection> {
    let url = client.ws_url();
    let mut delay = config.initial_delay;

    for attempt in 1u32.. {
        let delay_ms = delay.as_millis() as u64;
        tracing::info!(url, attempt, delay_ms, "Scheduling ComfyUI reconnect");
        emit(
            events,
            ConnectionSnapshot::new(ConnectionEvent::ReconnectScheduled)
                .with_attempt(attempt)
                .with_retry_delay_ms(delay_ms)
                .with_url(url),
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        emit(
            events,
            ConnectionSnapshot::new(ConnectionEvent::ConnectStart)
                .with_attempt(attempt)
                .with_url(url),
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = client.connect() => Some(outcome),
        };
        match outcome {
            None => {
                tracing::debug!(url, attempt, "Reconnect abandoned");
                return None;
            }
            Some(Ok(connection)) => {
                tracing::info!(url, attempt, "ComfyUI socket re-established");
                return Some(connection);
            }
            Some(Err(e)) => {
                tracing::warn!(url, attempt, error = %e, "ComfyUI reconnect attempt failed");
                emit(events, error_snapshot(client, attempt, e.to_string()));
            }
        }

        delay = next_delay(delay, config);
    }
    None
}
