use std::sync::Arc;

use anyhow::Result;
use matchu_moderation::{Config, OnnxClassifier, create_router};
use tokio::net::TcpListener;
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
        model_dir = %config.model_dir.display(),
        max_length = config.max_length,
        bind_addr = %config.bind_addr,
        "matchu-moderationd starting"
    );

    // The model is loaded once, before serving.
    let classifier = OnnxClassifier::load(&config.model_dir, config.max_length)?;
    let app = create_router(Arc::new(classifier));

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "matchu-moderationd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("received Ctrl+C, shutting down");
        })
        .await?;

    Ok(())
}
