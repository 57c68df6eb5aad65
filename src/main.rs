use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mitolens::{AppState, Args, ModelProvider, Pipeline, Renderer, router};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    // Models are loaded once; any failure stops the process before it serves.
    let provider = ModelProvider::load(&args).context("loading models")?;
    let renderer = Renderer::from_font_file(args.font.as_deref())?;
    match &args.font {
        Some(path) => info!(font = %path.display(), "using label font override"),
        None => info!("using embedded label font"),
    }
    let state = Arc::new(AppState::new(Pipeline::new(provider, renderer)));

    let addr = args.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "prediction server listening");

    axum::serve(listener, router(state, args.max_upload_bytes()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
