//! Command telemetry: pending counter, last action time, last error.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use genorch_core::types::Timestamp;

use crate::error::OrchestratorError;
use crate::state::lock;

/// The most recent failed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandError {
    pub command: String,
    pub error: String,
    pub timestamp: Timestamp,
}

/// Wraps every mutating facade command.
#[derive(Debug, Default)]
pub struct CommandRunner {
    pending: AtomicUsize,
    last_action_at: Mutex<Option<Timestamp>>,
    last_error: Mutex<Option<CommandError>>,
}

/// Decrements the pending counter even if the command future is dropped.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<T, F>(&self, command: &'static str, action: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(&self.pending);
        *lock(&self.last_action_at) = Some(chrono::Utc::now());
        tracing::info!(command, "Command started");

        let started = Instant::now();
        let result = action.await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                *lock(&self.last_error) = None;
                tracing::info!(command, duration_ms, "Command succeeded");
            }
            Err(e) => {
                *lock(&self.last_error) = Some(CommandError {
                    command: command.to_string(),
                    error: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                tracing::warn!(command, duration_ms, error = %e, "Command failed");
            }
        }
        result
    }

    pub fn pending_actions_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn last_action_at(&self) -> Option<Timestamp> {
        *lock(&self.last_action_at)
    }

    pub fn last_command_error(&self) -> Option<CommandError> {
        lock(&self.last_error).clone()
    }
}
