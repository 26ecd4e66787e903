use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use kiln_comfyui::api::ComfyUIApi;
use kiln_comfyui::client::ComfyUIClient;
use kiln_pipeline::engine::ComfyUIEngine;
use kiln_pipeline::orchestrator::JobPipeline;
use kiln_pipeline::staging::SourceStager;
use kiln_pipeline::templates::TemplateStore;
use kiln_worker::config::{LogFormat, WorkerConfig};
use kiln_worker::delivery::HttpDelivery;
use kiln_worker::queue_client::HordeQueue;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env();
    let log_format = config.as_ref().map(|c| c.log_format).unwrap_or_default();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kiln_worker=info,kiln_pipeline=info,kiln_comfyui=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        worker = %config.worker_name,
        grid = %config.grid_api_url,
        comfyui = %config.comfyui_url,
        models = ?config.models,
        "Loaded worker configuration",
    );

    let http = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
        Ok(http) => http,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    // --- Engine ---
    let engine = ComfyUIEngine::new(
        ComfyUIApi::with_client(http.clone(), &config.comfyui_url),
        Some(ComfyUIClient::new(&config.comfyui_ws_url)),
    );

    // --- Templates ---
    let templates = TemplateStore::new(&config.workflow_dir).with_aliases(config.workflow_map.clone());

    // --- Queue & delivery ---
    let queue = HordeQueue::new(
        http.clone(),
        &config.grid_api_url,
        &config.grid_api_key,
        &config.worker_name,
        config.models.clone(),
        config.max_pixels,
    );
    let delivery = HttpDelivery::new(http.clone());

    // --- Pipeline ---
    let pipeline = Arc::new(
        JobPipeline::new(
            Arc::new(engine),
            Arc::new(templates),
            Arc::new(queue),
            Arc::new(delivery),
            config.pipeline_config(),
        )
        .with_stager(SourceStager::new(http)),
    );
    pipeline.init().await;

    let cancel = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&pipeline).run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = runner.await {
        tracing::error!(error = %e, "Job pipeline task failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("Graceful shutdown complete");
    ExitCode::SUCCESS
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), draining in-flight jobs");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, draining in-flight jobs");
        }
    }
}
