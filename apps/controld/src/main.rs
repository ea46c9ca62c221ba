//! FluxForge control-plane daemon entry point.

use std::sync::Arc;

use controld::api;
use controld::app::AppRoot;
use controld::config::ControldConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControldConfig::load()?;
    let listen_addr = config.listen_addr;
    tracing::info!(node = %config.node_id, %listen_addr, "controld starting");

    let root = Arc::new(AppRoot::start(config)?);
    let shutdown = root.shutdown_token();
    let router = api::router(root.clone());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    let serve = axum::serve(listener, router).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
                () = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        }
    });

    serve.await?;

    // The HTTP surface is down; stop the control loops.
    match Arc::try_unwrap(root) {
        Ok(root) => root.stop().await,
        Err(_) => shutdown.cancel(),
    }
    tracing::info!("controld stopped");
    Ok(())
}
