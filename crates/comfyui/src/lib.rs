//! ComfyUI backend for the generation orchestrator.
//!
//! Provides typed WebSocket message parsing, the WebSocket client with
//! backoff reconnection, REST endpoint wrappers implementing
//! [`GenerationApi`](genorch_core::api::GenerationApi), and
//! [`ComfyUITransport`](transport::ComfyUITransport), the
//! [`TransportAdapter`](genorch_core::adapter::TransportAdapter) that
//! translates server frames into orchestrator events.

pub mod api;
pub mod client;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod transport;
