use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genorch_orchestrator::backend::ComfyUIFactory;
use genorch_orchestrator::config::OrchestratorConfig;
use genorch_orchestrator::manager::OrchestratorManager;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genorch_orchestrator=info,genorch_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = OrchestratorConfig::from_env();
    tracing::info!(ws_url = %config.ws_url, api_url = %config.api_url, "Loaded orchestrator configuration");

    // --- Orchestrator ---
    let manager = OrchestratorManager::new(std::sync::Arc::new(ComfyUIFactory::new(&config)));
    let facade = manager.acquire();
    if let Err(e) = facade.ensure_initialized(config.init_options()).await {
        tracing::error!(error = %e, "Failed to initialize orchestrator");
        facade.release().await;
        std::process::exit(1);
    }

    // --- Monitor loop ---
    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let metrics = facade.transport_metrics();
                let status = facade.system_status();
                tracing::info!(
                    phase = ?metrics.phase,
                    reconnect_attempt = metrics.reconnect_attempt,
                    total_downtime_ms = metrics.total_downtime_ms,
                    active_jobs = facade.active_jobs().len(),
                    results = facade.results().len(),
                    backend_status = %status.status,
                    queue_length = status.queue_length,
                    "Orchestrator summary",
                );
                for job in facade.sorted_active_jobs() {
                    tracing::info!(
                        ui_id = %job.ui_id,
                        backend_id = %job.backend_id,
                        status = job.status.as_str(),
                        progress = job.progress,
                        "Active job",
                    );
                }
            }
        }
    }

    // --- Shutdown ---
    facade.release().await;
    tracing::info!("Orchestrator released");
}
