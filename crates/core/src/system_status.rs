//! Backend system status record and its readiness metadata.
//!
//! Kept separate from the job queue: status comes from its own polling
//! controller and from broadcast messages, on its own schedule.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{parse_timestamp, Timestamp};

/// Status string before the first payload arrives.
pub const STATUS_UNKNOWN: &str = "unknown";

/// Status string after a failed (non-"not found") fetch.
pub const STATUS_ERROR: &str = "error";

/// Envelope keys that are never merged into the status record.
const ENVELOPE_KEYS: &[&str] = &["type", "timestamp"];

/// Backend status as shown to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub status: String,
    pub gpu_available: bool,
    pub gpu_status: Option<String>,
    pub queue_length: u32,
    pub memory_used: Option<u64>,
    pub memory_total: Option<u64>,
    /// Any additional fields the backend reports.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            status: STATUS_UNKNOWN.to_string(),
            gpu_available: false,
            gpu_status: None,
            queue_length: 0,
            memory_used: None,
            memory_total: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Loosely-typed status payload. Absent fields leave the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStatusPayload {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "gpuAvailable")]
    pub gpu_available: Option<bool>,
    #[serde(default, alias = "gpuStatus")]
    pub gpu_status: Option<String>,
    #[serde(default, alias = "queueLength")]
    pub queue_length: Option<u32>,
    #[serde(default, alias = "memoryUsed")]
    pub memory_used: Option<u64>,
    #[serde(default, alias = "memoryTotal")]
    pub memory_total: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Status record plus the out-of-band readiness flags.
#[derive(Debug, Clone)]
pub struct SystemStatusStore {
    status: SystemStatus,
    ready: bool,
    api_available: bool,
    last_updated: Option<Timestamp>,
}

impl Default for SystemStatusStore {
    fn default() -> Self {
        Self {
            status: SystemStatus::default(),
            ready: false,
            api_available: true,
            last_updated: None,
        }
    }
}

impl SystemStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &SystemStatus {
        &self.status
    }

    /// A fetch has succeeded or failed conclusively.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// `false` once the backend confirmed it has no status endpoint.
    pub fn is_api_available(&self) -> bool {
        self.api_available
    }

    pub fn last_updated(&self) -> Option<Timestamp> {
        self.last_updated
    }

    /// Merge a payload into the record and mark it ready.
    pub fn apply_system_status_payload(&mut self, payload: SystemStatusPayload) {
        let status = &mut self.status;
        if let Some(value) = payload.status {
            status.status = value;
        }
        if let Some(value) = payload.gpu_available {
            status.gpu_available = value;
        }
        if payload.gpu_status.is_some() {
            status.gpu_status = payload.gpu_status;
        }
        if let Some(value) = payload.queue_length {
            status.queue_length = value;
        }
        if payload.memory_used.is_some() {
            status.memory_used = payload.memory_used;
        }
        if payload.memory_total.is_some() {
            status.memory_total = payload.memory_total;
        }
        for (key, value) in payload.extra {
            if !ENVELOPE_KEYS.contains(&key.as_str()) {
                status.extra.insert(key, value);
            }
        }

        self.ready = true;
        self.api_available = true;
        self.last_updated = Some(
            payload
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(chrono::Utc::now),
        );
    }

    /// Record that the backend has no status endpoint. Session-lifetime.
    pub fn mark_system_status_unavailable(&mut self) {
        self.api_available = false;
        self.ready = true;
        self.last_updated = Some(chrono::Utc::now());
    }

    /// A fetch failed for a transient reason.
    pub fn mark_error(&mut self) {
        self.status.status = STATUS_ERROR.to_string();
        self.ready = true;
        self.last_updated = Some(chrono::Utc::now());
    }

    /// Back to defaults. The availability decision survives.
    pub fn reset(&mut self) {
        self.status = SystemStatus::default();
        self.ready = false;
        self.last_updated = None;
    }
}
