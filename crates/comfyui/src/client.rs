//! Socket endpoint and identity of one ComfyUI backend.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// The `client_id` is generated once and reused for every connection
/// so prompts submitted over REST keep routing their progress frames to
/// this client after a reconnect.
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
    client_id: String,
}

pub struct ComfyUIConnection {
    pub client_id: String,
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// Trailing slashes are stripped from both base URLs.
    pub fn new(ws_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `/ws` URL with the `clientId` query parameter.
    pub fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }

    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let (ws_stream, _) = connect_async(self.endpoint())
            .await
            .map_err(|e| ComfyUIClientError::Connection(format!("{}: {e}", self.ws_url)))?;

        tracing::info!(url = %self.ws_url, client_id = %self.client_id, "ComfyUI socket open");

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("Could not open ComfyUI socket at {0}")]
    Connection(String),
}
