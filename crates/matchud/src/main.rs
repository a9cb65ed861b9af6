use std::sync::Arc;

use anyhow::Result;
use matchu_core::{EngineManager, OnnxFactory, Verifier, probe_decoder};
use matchud::{AppState, Config, create_router};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        bind_addr = %config.bind_addr,
        model = %config.model_name,
        model_root = %config.model_root.display(),
        ctx_id = config.ctx_id,
        threshold = config.similarity_threshold,
        "matchud starting"
    );

    let manager = Arc::new(
        EngineManager::new(OnnxFactory, config.engine_settings(), probe_decoder())
            .retry_interval(config.retry_interval),
    );

    let warm = Arc::clone(&manager);
    if tokio::task::spawn_blocking(move || warm.warmup()).await? {
        tracing::info!("face engine warmup succeeded");
    } else {
        tracing::warn!(
            error = manager.last_error().as_deref().unwrap_or("unknown_error"),
            "face engine warmup failed"
        );
    }

    let bind_addr = config.bind_addr;
    let app = create_router(Arc::new(AppState::new(Verifier::new(manager), config)));

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "matchud listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("matchud shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
