//! Frames pushed by ComfyUI on `/ws`.
//!
//! Every frame is a `{"type", "data"}` pair. Only the execution and queue
//! frames are modelled; extension frames are recognised by
//! [`message_type`] and skipped.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, session id).
    #[serde(rename = "status")]
    Status(StatusData),

    /// The prompt left the queue.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Nodes reused from the cache. Ignored.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// Node switch. `node: null` is the legacy end-of-prompt marker.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Sampler step counter.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// Output of one node, images included.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Every node of the prompt finished.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    /// The prompt was interrupted through `/interrupt`.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptRef),

    /// The prompt raised inside a node.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// Message types [`ComfyUIMessage`] understands. Anything else is
/// extension traffic and skipped without a warning.
pub const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "status",
    "execution_start",
    "execution_cached",
    "executing",
    "progress",
    "executed",
    "execution_success",
    "execution_interrupted",
    "execution_error",
];

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Session id assigned by the server when no `clientId` was sent.
    #[serde(default)]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

/// Payload of messages that only name a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    /// Sent by newer servers; older ones only report the running prompt
    /// through `execution_start`.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    #[serde(default)]
    pub output: NodeOutput,
    pub prompt_id: String,
}

/// The part of a node's output the orchestrator reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// A file written by an output node, addressable through `/view`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Decode one text frame. Fails on bad JSON and on frame types outside
/// [`KNOWN_MESSAGE_TYPES`]; [`message_type`] tells the two apart.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// The `type` tag of a frame, if it has one.
pub fn message_type(text: &str) -> Option<String> {
    serde_json::from_str::<Envelope>(text).ok().map(|e| e.kind)
}
