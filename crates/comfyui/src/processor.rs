//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants and translates them into
//! orchestrator [`AdapterEvent`]s through an [`ExecutionTracker`].

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use genorch_core::events::{AdapterEvent, CompletionMessage, ErrorMessage, ImageField, ProgressMessage};
use genorch_core::system_status::SystemStatusPayload;

use crate::api::view_url;
use crate::client::WsStream;
use crate::messages::{message_type, parse_message, ComfyUIMessage, KNOWN_MESSAGE_TYPES};

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The server closed the socket or the stream ended.
    Closed,
    /// A receive error broke the connection.
    Failed(String),
    /// The cancellation token fired.
    Cancelled,
}

/// Per-connection execution state.
///
/// ComfyUI reports outputs node by node and signals completion
/// separately, so images are collected per prompt until the prompt
/// finishes. Older servers omit `prompt_id` on progress frames; those
/// are attributed to the prompt that most recently started.
#[derive(Debug)]
pub struct ExecutionTracker {
    api_url: String,
    current_prompt: Option<String>,
    /// Prompts seen executing, with the image URLs produced so far.
    running: HashMap<String, Vec<String>>,
}

impl ExecutionTracker {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            current_prompt: None,
            running: HashMap::new(),
        }
    }

    /// Translate one text frame. Unknown or malformed frames yield nothing.
    pub fn handle_text(&mut self, text: &str) -> Vec<AdapterEvent> {
        match parse_message(text) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => {
                match message_type(text) {
                    Some(kind) if !KNOWN_MESSAGE_TYPES.contains(&kind.as_str()) => {
                        tracing::trace!(kind = %kind, "Ignoring unhandled ComfyUI message type");
                    }
                    _ => {
                        tracing::warn!(
                            error = %e,
                            raw_message = %text,
                            "Failed to parse ComfyUI message",
                        );
                    }
                }
                Vec::new()
            }
        }
    }

    pub fn handle_message(&mut self, msg: ComfyUIMessage) -> Vec<AdapterEvent> {
        match msg {
            ComfyUIMessage::Status(data) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
                vec![AdapterEvent::SystemStatus(SystemStatusPayload {
                    queue_length: Some(data.status.exec_info.queue_remaining),
                    ..Default::default()
                })]
            }
            ComfyUIMessage::ExecutionStart(data) => {
                tracing::info!(prompt_id = %data.prompt_id, "Execution started");
                self.track(&data.prompt_id);
                vec![self.progress(data.prompt_id, Some(0.0), None, None)]
            }
            ComfyUIMessage::ExecutionCached(data) => {
                tracing::debug!(prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
                self.track(&data.prompt_id);
                Vec::new()
            }
            ComfyUIMessage::Executing(data) => match data.node {
                Some(node) => {
                    tracing::debug!(prompt_id = %data.prompt_id, node = %node, "Executing node");
                    self.track(&data.prompt_id);
                    Vec::new()
                }
                None => self.complete(&data.prompt_id).into_iter().collect(),
            },
            ComfyUIMessage::Progress(data) => {
                let Some(prompt_id) = data.prompt_id.clone().or_else(|| self.current_prompt.clone())
                else {
                    tracing::debug!("Progress frame with no running prompt ignored");
                    return Vec::new();
                };
                self.track(&prompt_id);
                let fraction = if data.max > 0 {
                    f64::from(data.value) / f64::from(data.max)
                } else {
                    0.0
                };
                tracing::debug!(prompt_id = %prompt_id, value = data.value, max = data.max, "Generation progress");
                vec![self.progress(prompt_id, Some(fraction), Some(data.value), Some(data.max))]
            }
            ComfyUIMessage::Executed(data) => {
                tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, images = data.output.images.len(), "Node executed with output");
                let urls: Vec<String> = data
                    .output
                    .images
                    .iter()
                    .filter_map(|image| view_url(&self.api_url, image))
                    .collect();
                self.running.entry(data.prompt_id).or_default().extend(urls);
                Vec::new()
            }
            ComfyUIMessage::ExecutionSuccess(data) => self.complete(&data.prompt_id).into_iter().collect(),
            ComfyUIMessage::ExecutionInterrupted(data) => {
                tracing::info!(prompt_id = %data.prompt_id, "Execution interrupted");
                vec![self.fail(data.prompt_id, "Execution interrupted".into())]
            }
            ComfyUIMessage::ExecutionError(data) => {
                tracing::error!(
                    prompt_id = %data.prompt_id,
                    node_id = data.node_id.as_deref().unwrap_or("-"),
                    error_type = data.exception_type.as_deref().unwrap_or("-"),
                    error_message = %data.exception_message,
                    "Execution error",
                );
                vec![self.fail(data.prompt_id, data.exception_message)]
            }
        }
    }

    fn track(&mut self, prompt_id: &str) {
        self.current_prompt = Some(prompt_id.to_string());
        self.running.entry(prompt_id.to_string()).or_default();
    }

    fn progress(
        &self,
        prompt_id: String,
        progress: Option<f64>,
        current_step: Option<u32>,
        total_steps: Option<u32>,
    ) -> AdapterEvent {
        AdapterEvent::Progress(ProgressMessage {
            job_id: Some(prompt_id),
            status: Some("processing".into()),
            progress,
            current_step,
            total_steps,
            ..Default::default()
        })
    }

    /// Completion is signalled twice on current servers (`executing`
    /// with no node, then `execution_success`). Only the first one for a
    /// tracked prompt produces an event.
    fn complete(&mut self, prompt_id: &str) -> Option<AdapterEvent> {
        let images = self.running.remove(prompt_id)?;
        if self.current_prompt.as_deref() == Some(prompt_id) {
            self.current_prompt = None;
        }
        tracing::info!(prompt_id, images = images.len(), "Execution completed");
        Some(AdapterEvent::Completion(CompletionMessage {
            job_id: Some(prompt_id.to_string()),
            images: (!images.is_empty()).then_some(ImageField::Many(images)),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        }))
    }

    fn fail(&mut self, prompt_id: String, error: String) -> AdapterEvent {
        self.running.remove(&prompt_id);
        if self.current_prompt.as_deref() == Some(prompt_id.as_str()) {
            self.current_prompt = None;
        }
        AdapterEvent::Error(ErrorMessage {
            job_id: Some(prompt_id),
            error: Some(error),
            ..Default::default()
        })
    }
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// the stream is exhausted, or `cancel` fires. Each text frame is
/// translated by `tracker` and the resulting events are sent on `events`.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    tracker: &mut ExecutionTracker,
    events: &mpsc::UnboundedSender<AdapterEvent>,
    cancel: &CancellationToken,
) -> StreamEnd {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            frame = ws_stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                for event in tracker.handle_text(&text) {
                    let _ = events.send(event);
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return StreamEnd::Closed;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return StreamEnd::Failed(e.to_string());
            }
            None => return StreamEnd::Closed,
        }
    }
}
