//! Tidemark node binary: config loading, telemetry install, HTTP serving,
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tidemark_server::http::{app, AppState, SharedSecretVerifier};
use tidemark_server::{Engine, EngineConfig, EngineDeps};

#[derive(Parser, Debug)]
#[command(name = "tidemark-node", about = "Tidemark sync engine node")]
struct Args {
    /// Address to serve clients on.
    #[arg(long, env = "TIDEMARK_LISTEN", default_value = "127.0.0.1:7400")]
    listen: SocketAddr,

    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long, env = "TIDEMARK_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Shared bearer secret clients must present.
    #[arg(long, env = "TIDEMARK_SECRET", default_value = "dev-secret")]
    secret: String,

    /// Prometheus exporter address; omit to disable.
    #[arg(long, env = "TIDEMARK_METRICS")]
    metrics: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config: EngineConfig = match &args.config {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => EngineConfig::default(),
    };

    if let Some(addr) = args.metrics {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        tracing::info!(%addr, "prometheus exporter listening");
    }

    let engine = Engine::assemble(config.clone(), EngineDeps::default()).await?;
    let mut background = engine.spawn_background();
    if !config.seed_nodes.is_empty() {
        background.extend(engine.spawn_cluster_client());
    }
    tracing::info!(node_id = %engine.node_id, "engine assembled");

    let state = AppState::new(
        config.clone(),
        &engine,
        Arc::new(SharedSecretVerifier::new(args.secret.into_bytes())),
    );
    let collector = state.spawn_rejection_collector();

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, "serving");
    let shutdown_state = state.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            // Open sessions get a SHUTDOWN reason frame and close; only
            // then does the graceful server drain complete.
            shutdown_state.begin_shutdown();
        })
        .await?;

    engine.shutdown().await;
    collector.abort();
    for handle in background {
        handle.abort();
    }
    tracing::info!("bye");
    Ok(())
}
