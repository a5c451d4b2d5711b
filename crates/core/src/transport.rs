//! Connection phase state machine and transport metrics.
//!
//! [`TransportMonitor`] holds the raw counters. Adapters report
//! [`ConnectionSnapshot`]s and [`TransportMonitor::record_connection_snapshot`]
//! is the only place phases and counters change. Consumers read an owned
//! [`TransportMetrics`] value recomputed on every call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Phases and snapshots
// ---------------------------------------------------------------------------

/// Observable connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPhase {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    /// Reported whenever the pause flag is set, whatever the underlying phase.
    Paused,
}

/// Connection lifecycle event carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    #[serde(rename = "connect:start")]
    ConnectStart,
    #[serde(rename = "reconnect:scheduled")]
    ReconnectScheduled,
    #[serde(rename = "connect:success")]
    ConnectSuccess,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "error")]
    Error,
}

impl ConnectionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectStart => "connect:start",
            Self::ReconnectScheduled => "reconnect:scheduled",
            Self::ConnectSuccess => "connect:success",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }
}

/// Error detail attached to a snapshot by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportErrorDetail {
    pub message: String,
    pub source: Option<String>,
    pub status_code: Option<u16>,
    pub details: Option<serde_json::Value>,
}

impl TransportErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            status_code: None,
            details: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// A connection-state report from the transport adapter.
///
/// Built with [`ConnectionSnapshot::new`] and the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub event: ConnectionEvent,
    pub attempt: Option<u32>,
    pub next_retry_delay_ms: Option<u64>,
    /// Length of the outage that just ended (on `connect:success`).
    pub downtime_ms: Option<u64>,
    pub error: Option<TransportErrorDetail>,
    pub url: Option<String>,
    pub timestamp: Timestamp,
}

impl ConnectionSnapshot {
    pub fn new(event: ConnectionEvent) -> Self {
        Self {
            event,
            attempt: None,
            next_retry_delay_ms: None,
            downtime_ms: None,
            error: None,
            url: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.next_retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_downtime_ms(mut self, downtime_ms: u64) -> Self {
        self.downtime_ms = Some(downtime_ms);
        self
    }

    pub fn with_error(mut self, error: TransportErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A transport failure as recorded for consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportError {
    pub source: String,
    /// The snapshot event that carried the error.
    pub context: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub attempt: Option<u32>,
    pub timestamp: Timestamp,
    pub url: Option<String>,
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Pause bookkeeping
// ---------------------------------------------------------------------------

/// Why the transport is being paused (e.g. `"hidden"`, `"offline"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PausePayload {
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl PausePayload {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
        }
    }
}

/// Context passed to the adapter on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Pause flag plus its causes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PauseState {
    pub paused: bool,
    pub reasons: BTreeSet<String>,
    pub since: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Immutable view of every transport counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportMetrics {
    pub phase: TransportPhase,
    pub reconnect_attempt: u32,
    pub consecutive_failures: u32,
    pub next_retry_delay_ms: Option<u64>,
    pub last_connected_at: Option<Timestamp>,
    pub last_disconnected_at: Option<Timestamp>,
    pub downtime_ms: Option<u64>,
    pub total_downtime_ms: u64,
    pub last_error: Option<TransportError>,
    pub paused: bool,
    pub pause_reasons: BTreeSet<String>,
    pub pause_since: Option<Timestamp>,
}

/// Raw transport counters and the phase state machine.
#[derive(Debug)]
pub struct TransportMonitor {
    phase: TransportPhase,
    reconnect_attempt: u32,
    consecutive_failures: u32,
    next_retry_delay_ms: Option<u64>,
    last_connected_at: Option<Timestamp>,
    last_disconnected_at: Option<Timestamp>,
    downtime_ms: Option<u64>,
    total_downtime_ms: u64,
    last_error: Option<TransportError>,
    pause: PauseState,
    last_snapshot: Option<ConnectionSnapshot>,
}

impl Default for TransportMonitor {
    fn default() -> Self {
        Self {
            phase: TransportPhase::Idle,
            reconnect_attempt: 0,
            consecutive_failures: 0,
            next_retry_delay_ms: None,
            last_connected_at: None,
            last_disconnected_at: None,
            downtime_ms: None,
            total_downtime_ms: 0,
            last_error: None,
            pause: PauseState::default(),
            last_snapshot: None,
        }
    }
}

impl TransportMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Underlying phase, ignoring the pause flag.
    pub fn underlying_phase(&self) -> TransportPhase {
        self.phase
    }

    /// Phase as consumers see it.
    pub fn phase(&self) -> TransportPhase {
        if self.pause.paused {
            TransportPhase::Paused
        } else {
            self.phase
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.pause.paused && self.phase == TransportPhase::Connected
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn last_snapshot(&self) -> Option<&ConnectionSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Apply one adapter snapshot.
    pub fn record_connection_snapshot(&mut self, snapshot: ConnectionSnapshot) {
        match snapshot.event {
            ConnectionEvent::ConnectStart => {
                self.phase = TransportPhase::Connecting;
                if let Some(attempt) = snapshot.attempt {
                    self.reconnect_attempt = attempt;
                }
            }
            ConnectionEvent::ReconnectScheduled => {
                self.phase = TransportPhase::Reconnecting;
                self.reconnect_attempt = snapshot
                    .attempt
                    .unwrap_or_else(|| self.reconnect_attempt.saturating_add(1));
                self.next_retry_delay_ms = snapshot.next_retry_delay_ms;
            }
            ConnectionEvent::ConnectSuccess => {
                self.phase = TransportPhase::Connected;
                if let Some(downtime) = snapshot.downtime_ms {
                    self.downtime_ms = Some(downtime);
                    self.total_downtime_ms = self.total_downtime_ms.saturating_add(downtime);
                }
                self.last_connected_at = Some(snapshot.timestamp);
                self.reconnect_attempt = 0;
                self.consecutive_failures = 0;
                self.next_retry_delay_ms = None;
            }
            ConnectionEvent::Disconnect | ConnectionEvent::Error => {
                self.phase = TransportPhase::Disconnected;
                self.last_disconnected_at = Some(snapshot.timestamp);
                if snapshot.event == ConnectionEvent::Error {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                if let Some(detail) = &snapshot.error {
                    self.last_error = Some(TransportError {
                        source: detail.source.clone().unwrap_or_else(|| "transport".into()),
                        context: snapshot.event.as_str().to_string(),
                        message: detail.message.clone(),
                        status_code: detail.status_code,
                        attempt: snapshot.attempt,
                        timestamp: snapshot.timestamp,
                        url: snapshot.url.clone(),
                        details: detail.details.clone(),
                    });
                }
            }
        }
        tracing::debug!(
            event = snapshot.event.as_str(),
            phase = ?self.phase(),
            attempt = self.reconnect_attempt,
            "Recorded connection snapshot",
        );
        self.last_snapshot = Some(snapshot);
    }

    /// Set the pause flag and add the given reasons.
    pub fn pause(&mut self, payload: &PausePayload, now: Timestamp) {
        if !self.pause.paused {
            self.pause.since = Some(now);
        }
        self.pause.paused = true;
        self.pause
            .reasons
            .extend(payload.reasons.iter().map(|r| r.trim().to_string()).filter(|r| !r.is_empty()));
    }

    pub fn pause_state(&self) -> PauseState {
        self.pause.clone()
    }

    pub fn clear_pause(&mut self) {
        self.pause = PauseState::default();
    }

    /// Recompute the consumer-facing metrics.
    pub fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            phase: self.phase(),
            reconnect_attempt: self.reconnect_attempt,
            consecutive_failures: self.consecutive_failures,
            next_retry_delay_ms: self.next_retry_delay_ms,
            last_connected_at: self.last_connected_at,
            last_disconnected_at: self.last_disconnected_at,
            downtime_ms: self.downtime_ms,
            total_downtime_ms: self.total_downtime_ms,
            last_error: self.last_error.clone(),
            paused: self.pause.paused,
            pause_reasons: self.pause.reasons.clone(),
            pause_since: self.pause.since,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let monitor = TransportMonitor::new();
        assert_eq!(monitor.metrics().phase, TransportPhase::Idle);
        assert!(!monitor.is_connected());
    }

    #[test]
    fn reconnect_accounting_adds_downtime() {
        let mut monitor = TransportMonitor::new();
        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::ConnectSuccess));
        let before = monitor.metrics().total_downtime_ms;

        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::Disconnect));
        assert_eq!(monitor.metrics().phase, TransportPhase::Disconnected);

        monitor.record_connection_snapshot(
            ConnectionSnapshot::new(ConnectionEvent::ConnectSuccess).with_downtime_ms(1500),
        );
        let metrics = monitor.metrics();
        assert_eq!(metrics.total_downtime_ms - before, 1500);
        assert_eq!(metrics.downtime_ms, Some(1500));
        assert_eq!(metrics.phase, TransportPhase::Connected);
        assert!(metrics.last_connected_at.is_some());
    }

    #[test]
    fn phase_transitions() {
        let mut monitor = TransportMonitor::new();
        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::ConnectStart));
        assert_eq!(monitor.phase(), TransportPhase::Connecting);

        monitor.record_connection_snapshot(
            ConnectionSnapshot::new(ConnectionEvent::ReconnectScheduled)
                .with_attempt(3)
                .with_retry_delay_ms(4000),
        );
        let metrics = monitor.metrics();
        assert_eq!(metrics.phase, TransportPhase::Reconnecting);
        assert_eq!(metrics.reconnect_attempt, 3);
        assert_eq!(metrics.next_retry_delay_ms, Some(4000));

        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::ConnectSuccess));
        let metrics = monitor.metrics();
        assert_eq!(metrics.reconnect_attempt, 0);
        assert_eq!(metrics.next_retry_delay_ms, None);
    }

    #[test]
    fn error_snapshot_records_transport_error() {
        let mut monitor = TransportMonitor::new();
        monitor.record_connection_snapshot(
            ConnectionSnapshot::new(ConnectionEvent::Error)
                .with_attempt(2)
                .with_url("ws://gpu-01:8188/ws")
                .with_error(
                    TransportErrorDetail::new("connection refused")
                        .with_source("websocket")
                        .with_status_code(502),
                ),
        );
        let metrics = monitor.metrics();
        assert_eq!(metrics.phase, TransportPhase::Disconnected);
        assert_eq!(metrics.consecutive_failures, 1);
        let error = metrics.last_error.unwrap();
        assert_eq!(error.source, "websocket");
        assert_eq!(error.context, "error");
        assert_eq!(error.message, "connection refused");
        assert_eq!(error.status_code, Some(502));
        assert_eq!(error.attempt, Some(2));
        assert_eq!(error.url.as_deref(), Some("ws://gpu-01:8188/ws"));
    }

    #[test]
    fn paused_overrides_observed_phase() {
        let mut monitor = TransportMonitor::new();
        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::ConnectSuccess));
        monitor.pause(&PausePayload::reason("hidden"), chrono::Utc::now());
        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::ConnectStart));

        let metrics = monitor.metrics();
        assert_eq!(metrics.phase, TransportPhase::Paused);
        assert!(metrics.paused);
        assert!(metrics.pause_reasons.contains("hidden"));
        assert_eq!(monitor.underlying_phase(), TransportPhase::Connecting);

        monitor.clear_pause();
        assert_eq!(monitor.phase(), TransportPhase::Connecting);
    }

    #[test]
    fn repeated_pause_keeps_first_timestamp() {
        let mut monitor = TransportMonitor::new();
        let first = chrono::Utc::now();
        monitor.pause(&PausePayload::reason("hidden"), first);
        monitor.pause(
            &PausePayload::reason("offline"),
            first + chrono::Duration::seconds(5),
        );
        let state = monitor.pause_state();
        assert_eq!(state.since, Some(first));
        assert_eq!(state.reasons.len(), 2);
    }

    #[test]
    fn unnumbered_retry_counter_saturates() {
        let mut monitor = TransportMonitor::new();
        monitor.record_connection_snapshot(
            ConnectionSnapshot::new(ConnectionEvent::ConnectStart).with_attempt(u32::MAX),
        );
        monitor.record_connection_snapshot(ConnectionSnapshot::new(ConnectionEvent::ReconnectScheduled));
        assert_eq!(monitor.metrics().reconnect_attempt, u32::MAX);
    }
}
