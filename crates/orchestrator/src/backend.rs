//! Wires the ComfyUI client, REST API and transport into the manager.

use std::sync::Arc;

use async_trait::async_trait;

use genorch_comfyui::api::ComfyUIApi;
use genorch_comfyui::client::ComfyUIClient;
use genorch_comfyui::reconnect::ReconnectConfig;
use genorch_comfyui::transport::{ComfyUITransport, TransportOptions};
use genorch_core::adapter::{AdapterError, TransportAdapter};
use genorch_core::api::GenerationApi;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::manager::{OrchestratorFactory, TransportContext};

pub struct ComfyUIFactory {
    client: Arc<ComfyUIClient>,
    api: Arc<ComfyUIApi>,
    reconnect: ReconnectConfig,
}

impl ComfyUIFactory {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let client = Arc::new(ComfyUIClient::new(&config.ws_url, &config.api_url));
        // Submissions must carry the socket's client id or progress frames
        // for them are never routed to us.
        let api = Arc::new(ComfyUIApi::new(&config.api_url, client.client_id()));
        Self {
            client,
            api,
            reconnect: config.reconnect(),
        }
    }

    pub fn client(&self) -> &ComfyUIClient {
        &self.client
    }
}

#[async_trait]
impl OrchestratorFactory for ComfyUIFactory {
    fn target(&self) -> String {
        self.api.api_url().to_string()
    }

    fn api(&self) -> Arc<dyn GenerationApi> {
        self.api.clone()
    }

    async fn create_transport(
        &self,
        ctx: TransportContext,
    ) -> Result<Arc<dyn TransportAdapter>, OrchestratorError> {
        let transport = ComfyUITransport::new(
            Arc::clone(&self.client),
            self.api(),
            ctx.events,
            TransportOptions {
                reconnect: self.reconnect.clone(),
                poll_interval_ms: ctx.poll_interval_ms,
                history_limit: ctx.history_limit,
            },
        );
        transport.start().map_err(AdapterError::from)?;
        tracing::info!(url = self.client.ws_url(), "ComfyUI transport created");
        Ok(Arc::new(transport))
    }
}
