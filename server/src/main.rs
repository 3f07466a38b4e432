use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use server::{app, config::ServerConfig, AppState};
use stream_core::{PiperGenerator, VoiceRegistry};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting podcast generation server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, min_chunk={}s, max_wait={}s",
        config.port, config.rate_limit_per_minute, config.min_chunk_secs, config.max_wait_secs
    );

    info!("Loading Piper model from {}...", config.piper_config.display());
    let piper_config = config.piper_config.clone();
    let generator = tokio::task::spawn_blocking(move || PiperGenerator::from_config_path(piper_config))
        .await?
        .context("Failed to load TTS model. Set PIPER_CONFIG to a Piper .onnx.json config")?;

    let voices = VoiceRegistry::scan(&config.voices_dir);
    info!("Loaded {} voice presets", voices.snapshot().len());

    let port = config.port;
    let state = AppState::new(Arc::new(generator), voices, config);
    let router = app(state)?;

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
