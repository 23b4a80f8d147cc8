//! REST/WebSocket surface over the orchestrator.

pub mod routes;
pub mod ws;

use crate::error::Result;
use crate::orchestration::orchestrator::Orchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub use routes::{build_router, AppState};

/// Bind and serve the REST/WebSocket API until ctrl-c.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Result<()> {
    let app = build_router(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
