//! The transport adapter seam.
//!
//! An adapter owns the live connection to one backend. It reports state
//! through [`AdapterEvent`](crate::events::AdapterEvent)s on the channel
//! it was created with and accepts control calls through this trait.

use async_trait::async_trait;

use crate::transport::{PausePayload, ResumePayload};

/// Failure reported by an adapter control call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct AdapterError(pub String);

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Change the fallback polling interval used while disconnected.
    fn set_poll_interval(&self, interval_ms: u64);

    /// Drop the current connection (if any) and connect again.
    async fn reconnect(&self) -> Result<(), AdapterError>;

    /// Stop network activity until resumed.
    async fn pause(&self, payload: &PausePayload) -> Result<(), AdapterError>;

    /// Restart network activity and resync state missed while paused,
    /// fetching at most `history_limit` recent results.
    async fn resume(&self, history_limit: usize, payload: &ResumePayload) -> Result<(), AdapterError>;

    /// Tear down every connection and background task. Idempotent.
    fn clear(&self);

    fn is_paused(&self) -> bool;
}
