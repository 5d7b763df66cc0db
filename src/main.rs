//! shadowkv: sparse-attention KV cache inference server.
//!
//! Reduces the KV cache footprint a long-context decode needs resident by
//! summarizing prefill chunks into landmarks, keeping outlier and recent
//! chunks resident, and factorizing the rest into a low-rank approximation
//! that is reconstructed on demand during decode.
//!
//! Exposes an OpenAI-compatible HTTP API for drop-in integration.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use shadowkv::config::{Cli, Config};
use shadowkv::inference::engine::InferenceEngine;
use shadowkv::server::openai_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "shadowkv=debug,tower_http=debug"
    } else {
        "shadowkv=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("shadowkv v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        n_layers = config.model.n_layers,
        n_kv_heads = config.model.n_kv_heads,
        head_dim = config.model.head_dim,
        "Configuration loaded"
    );

    info!(
        max_length = config.shadow.max_length,
        sparse_budget = config.shadow.sparse_budget,
        rank = config.shadow.rank,
        chunk_size = config.shadow.chunk_size,
        local_chunk = config.shadow.local_chunk,
        outlier_chunk = config.shadow.outlier_chunk,
        device = config.shadow.device,
        "ShadowKV cache sizing"
    );

    let engine = InferenceEngine::new(config.clone());

    let state = Arc::new(AppState {
        engine: RwLock::new(engine),
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = build_router(state);

    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
