use std::str::FromStr;
use std::time::Duration;

use genorch_comfyui::reconnect::ReconnectConfig;
use genorch_comfyui::transport::DEFAULT_POLL_INTERVAL_MS;
use genorch_core::results::DEFAULT_HISTORY_LIMIT;

use crate::manager::InitOptions;
use crate::status_controller::DEFAULT_STATUS_POLL_INTERVAL;

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8188";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";
const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Orchestrator configuration loaded from environment variables.
///
/// All fields have defaults that match a local ComfyUI instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// WebSocket endpoint of the backend (default: `ws://127.0.0.1:8188`).
    pub ws_url: String,
    /// REST base URL of the backend (default: `http://127.0.0.1:8188`).
    pub api_url: String,
    pub history_limit: i64,
    /// Fallback queue polling interval while the socket is down.
    pub poll_interval_ms: u64,
    pub status_poll_interval_secs: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.into(),
            api_url: DEFAULT_API_URL.into(),
            history_limit: DEFAULT_HISTORY_LIMIT as i64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            status_poll_interval_secs: DEFAULT_STATUS_POLL_INTERVAL.as_secs(),
            reconnect_initial_delay_ms: DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `BACKEND_WS_URL`             | `ws://127.0.0.1:8188`   |
    /// | `BACKEND_API_URL`            | `http://127.0.0.1:8188` |
    /// | `HISTORY_LIMIT`              | `10`                    |
    /// | `POLL_INTERVAL_MS`           | `5000`                  |
    /// | `STATUS_POLL_INTERVAL_SECS`  | `10`                    |
    /// | `RECONNECT_INITIAL_DELAY_MS` | `1000`                  |
    /// | `RECONNECT_MAX_DELAY_MS`     | `30000`                 |
    ///
    /// Unparsable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        Self {
            ws_url: text("BACKEND_WS_URL", defaults.ws_url),
            api_url: text("BACKEND_API_URL", defaults.api_url),
            history_limit: parsed(&lookup, "HISTORY_LIMIT", defaults.history_limit),
            poll_interval_ms: parsed(&lookup, "POLL_INTERVAL_MS", defaults.poll_interval_ms),
            status_poll_interval_secs: parsed(
                &lookup,
                "STATUS_POLL_INTERVAL_SECS",
                defaults.status_poll_interval_secs,
            ),
            reconnect_initial_delay_ms: parsed(
                &lookup,
                "RECONNECT_INITIAL_DELAY_MS",
                defaults.reconnect_initial_delay_ms,
            ),
            reconnect_max_delay_ms: parsed(&lookup, "RECONNECT_MAX_DELAY_MS", defaults.reconnect_max_delay_ms),
        }
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig::from_millis(self.reconnect_initial_delay_ms, self.reconnect_max_delay_ms)
    }

    pub fn init_options(&self) -> InitOptions {
        InitOptions {
            consumer: None,
            history_limit: Some(self.history_limit),
            poll_interval_ms: Some(self.poll_interval_ms),
            status_poll_interval: Some(Duration::from_secs(self.status_poll_interval_secs.max(1))),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "Invalid config value; using default");
            default
        }
    }
}
