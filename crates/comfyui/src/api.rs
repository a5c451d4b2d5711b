//! ComfyUI's REST endpoints behind the [`GenerationApi`] seam.
//!
//! Queue, history and system-stats responses are mapped onto the loose
//! input types the core modules normalise.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use genorch_core::api::{ApiError, GenerationApi, GenerationRequest, SubmitResponse};
use genorch_core::events::ImageField;
use genorch_core::job::JobInput;
use genorch_core::results::ResultInput;
use genorch_core::system_status::SystemStatusPayload;

use crate::messages::ImageRef;

pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    /// Sent with every submission so the server routes progress frames
    /// to our WebSocket session.
    client_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("ComfyUI request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI answered {status}: {body}")]
    ApiError {
        status: u16,
        body: String,
    },

    /// ComfyUI refused the workflow (`node_errors` in a 200 response).
    #[error("Workflow rejected: {0}")]
    Rejected(String),
}

impl From<ComfyUIApiError> for ApiError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::ApiError { status: 404, body } => ApiError::NotFound(body),
            ComfyUIApiError::ApiError { status, body } => ApiError::Status { status, body },
            ComfyUIApiError::Request(e) if e.is_decode() => ApiError::Decode(e.to_string()),
            ComfyUIApiError::Request(e) => ApiError::Transport(e.to_string()),
            ComfyUIApiError::Rejected(msg) => ApiError::InvalidRequest(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
    #[serde(default)]
    number: Option<i64>,
    #[serde(default)]
    node_errors: serde_json::Map<String, serde_json::Value>,
}

/// `GET /queue`. Each entry is `[number, prompt_id, prompt, extra_data, outputs]`.
#[derive(Debug, Default, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    queue_pending: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct SystemStatsResponse {
    #[serde(default)]
    system: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    devices: Vec<DeviceStats>,
}

#[derive(Debug, Deserialize)]
struct DeviceStats {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    vram_total: Option<u64>,
    #[serde(default)]
    vram_free: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    /// `[number, prompt_id, workflow, extra_data, output_nodes]`.
    #[serde(default)]
    prompt: Vec<serde_json::Value>,
    #[serde(default)]
    outputs: HashMap<String, crate::messages::NodeOutput>,
    #[serde(default)]
    status: Option<HistoryStatus>,
}

#[derive(Debug, Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    status_str: Option<String>,
    /// `[[event_name, {"timestamp": ms, ...}], ...]`.
    #[serde(default)]
    messages: Vec<(String, serde_json::Value)>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl ComfyUIApi {
    /// `client_id` must be the socket's id; submissions are attributed to it.
    pub fn new(api_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, client_id)
    }

    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution (`POST /prompt`).
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let parsed: PromptResponse = Self::parse_response(response).await?;
        if !parsed.node_errors.is_empty() {
            let nodes: Vec<&str> = parsed.node_errors.keys().map(String::as_str).collect();
            return Err(ComfyUIApiError::Rejected(format!(
                "node errors in {}",
                nodes.join(", ")
            )));
        }
        Ok(SubmitResponse {
            job_id: parsed.prompt_id,
            queue_position: parsed.number.and_then(|n| u32::try_from(n).ok()),
        })
    }

    /// Remove a queued prompt (`POST /queue` with `delete`).
    pub async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&serde_json::json!({ "delete": [prompt_id] }))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Stop whatever prompt is executing. ComfyUI has no per-prompt interrupt.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Ids of the running and pending prompts, in that order.
    async fn get_queue(&self) -> Result<QueueResponse, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve up to `max_items` history entries keyed by prompt id.
    async fn get_history(
        &self,
        max_items: usize,
    ) -> Result<HashMap<String, HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history", self.api_url))
            .query(&[("max_items", max_items)])
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- response handling ----

    /// Pass 2xx responses through; turn anything else into
    /// [`ComfyUIApiError::ApiError`] with the body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl GenerationApi for ComfyUIApi {
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<SubmitResponse, ApiError> {
        let workflow = request.workflow.as_ref().ok_or_else(|| {
            ApiError::InvalidRequest("ComfyUI submissions require a workflow graph".into())
        })?;
        let response = self.submit_workflow(workflow).await?;
        tracing::info!(
            ui_id = %request.ui_id,
            prompt_id = %response.job_id,
            "Workflow submitted to ComfyUI",
        );
        Ok(response)
    }

    async fn cancel_job(&self, backend_id: &str) -> Result<(), ApiError> {
        let queue = self.get_queue().await?;
        let running = queue
            .queue_running
            .iter()
            .any(|entry| queue_entry_id(entry) == Some(backend_id));
        if running {
            self.interrupt().await?;
        } else {
            self.delete_from_queue(backend_id).await?;
        }
        tracing::info!(prompt_id = backend_id, running, "Cancelled ComfyUI prompt");
        Ok(())
    }

    async fn delete_result(&self, result_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/history", self.api_url))
            .json(&serde_json::json!({ "delete": [result_id] }))
            .send()
            .await
            .map_err(ComfyUIApiError::from)?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn fetch_system_status(&self) -> Result<SystemStatusPayload, ApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .send()
            .await
            .map_err(ComfyUIApiError::from)?;
        let stats: SystemStatsResponse = Self::parse_response(response).await?;
        Ok(map_system_stats(stats))
    }

    async fn fetch_recent_results(&self, limit: usize) -> Result<Vec<ResultInput>, ApiError> {
        let history = self.get_history(limit).await?;
        Ok(map_history(&self.api_url, history, limit))
    }

    async fn list_jobs(&self) -> Result<Vec<JobInput>, ApiError> {
        let queue = self.get_queue().await?;
        Ok(map_queue(queue))
    }
}

// ---------------------------------------------------------------------------
// Response mapping
// ---------------------------------------------------------------------------

/// Build the `/view` URL for an output image.
pub fn view_url(api_url: &str, image: &ImageRef) -> Option<String> {
    reqwest::Url::parse_with_params(
        &format!("{}/view", api_url.trim_end_matches('/')),
        &[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.kind.as_str()),
        ],
    )
    .ok()
    .map(String::from)
}

fn queue_entry_id(entry: &[serde_json::Value]) -> Option<&str> {
    entry.get(1).and_then(serde_json::Value::as_str)
}

fn map_queue(queue: QueueResponse) -> Vec<JobInput> {
    let running = queue.queue_running.iter().map(|e| (e, "processing"));
    let pending = queue.queue_pending.iter().map(|e| (e, "queued"));
    running
        .chain(pending)
        .filter_map(|(entry, status)| {
            let prompt_id = queue_entry_id(entry)?;
            Some(JobInput {
                backend_id: Some(prompt_id.to_string()),
                status: Some(status.to_string()),
                params: entry.get(2).map(workflow_params).unwrap_or_default(),
                ..Default::default()
            })
        })
        .collect()
}

fn map_system_stats(stats: SystemStatsResponse) -> SystemStatusPayload {
    let gpu = stats.devices.iter().find(|d| d.kind != "cpu");
    let mut payload = SystemStatusPayload {
        status: Some("ok".into()),
        gpu_available: Some(gpu.is_some()),
        gpu_status: gpu.map(|d| d.name.clone()),
        memory_total: gpu.and_then(|d| d.vram_total),
        memory_used: gpu.and_then(|d| Some(d.vram_total?.saturating_sub(d.vram_free?))),
        ..Default::default()
    };
    for key in ["comfyui_version", "python_version", "os"] {
        if let Some(value) = stats.system.get(key) {
            payload.extra.insert(key.to_string(), value.clone());
        }
    }
    payload
}

/// Map history entries to results, most recent first.
fn map_history(
    api_url: &str,
    history: HashMap<String, HistoryEntry>,
    limit: usize,
) -> Vec<ResultInput> {
    let mut results: Vec<(i64, ResultInput)> = history
        .into_iter()
        .filter(|(_, entry)| {
            entry
                .status
                .as_ref()
                .and_then(|s| s.status_str.as_deref())
                .map_or(true, |s| s == "success")
        })
        .map(|(prompt_id, entry)| {
            let finished_at = entry
                .status
                .as_ref()
                .and_then(|s| s.messages.iter().rev().find_map(|(_, data)| data.get("timestamp")?.as_i64()))
                .unwrap_or(0);
            let mut outputs: Vec<(&String, &crate::messages::NodeOutput)> = entry.outputs.iter().collect();
            outputs.sort_by(|a, b| a.0.cmp(b.0));
            let images: Vec<String> = outputs
                .into_iter()
                .flat_map(|(_, out)| out.images.iter())
                .filter_map(|image| view_url(api_url, image))
                .collect();
            let params = entry.prompt.get(2).map(workflow_params).unwrap_or_default();
            let input = ResultInput {
                id: Some(prompt_id.clone()),
                job_id: Some(prompt_id),
                prompt: params.prompt,
                negative_prompt: params.negative_prompt,
                width: params.width,
                height: params.height,
                steps: params.steps,
                seed: params.seed,
                image_url: (!images.is_empty()).then_some(ImageField::Many(images)),
                created_at: (finished_at > 0).then(|| finished_at.to_string()),
            };
            (finished_at, input)
        })
        .collect();
    results.sort_by(|a, b| b.0.cmp(&a.0));
    results.into_iter().take(limit).map(|(_, r)| r).collect()
}

/// Pull display parameters out of an API-format workflow graph.
///
/// Reads the first sampler node and the text encoders wired to its
/// `positive` and `negative` inputs. Anything missing stays `None`.
fn workflow_params(workflow: &serde_json::Value) -> genorch_core::job::GenerationParams {
    let mut params = genorch_core::job::GenerationParams::default();
    let Some(nodes) = workflow.as_object() else {
        return params;
    };

    let mut sampler_ids: Vec<&String> = nodes
        .iter()
        .filter(|(_, node)| {
            node.get("class_type")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|c| c.starts_with("KSampler"))
        })
        .map(|(id, _)| id)
        .collect();
    sampler_ids.sort();
    let Some(inputs) = sampler_ids
        .first()
        .and_then(|id| nodes.get(*id))
        .and_then(|node| node.get("inputs"))
    else {
        return params;
    };

    let number = |key: &str| inputs.get(key).and_then(serde_json::Value::as_u64);
    params.seed = inputs
        .get("seed")
        .or_else(|| inputs.get("noise_seed"))
        .and_then(serde_json::Value::as_i64);
    params.steps = number("steps").and_then(|v| u32::try_from(v).ok());
    params.cfg_scale = inputs.get("cfg").and_then(serde_json::Value::as_f64);
    params.sampler = inputs
        .get("sampler_name")
        .and_then(serde_json::Value::as_str)
        .map(String::from);

    let linked_text = |key: &str| -> Option<String> {
        let link = inputs.get(key)?.as_array()?;
        let node = nodes.get(link.first()?.as_str()?)?;
        node.get("inputs")?.get("text")?.as_str().map(String::from)
    };
    params.prompt = linked_text("positive");
    params.negative_prompt = linked_text("negative");

    let latent = inputs
        .get("latent_image")
        .and_then(|l| l.as_array()?.first()?.as_str())
        .and_then(|id| nodes.get(id)?.get("inputs"));
    if let Some(latent) = latent {
        params.width = latent.get("width").and_then(|v| u32::try_from(v.as_u64()?).ok());
        params.height = latent.get("height").and_then(|v| u32::try_from(v.as_u64()?).ok());
    }
    params
}
