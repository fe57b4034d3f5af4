use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::context::ServerContext;
use crate::server::supervisor::Supervisor;

/// Binds the configured address and runs the worker pool on it.
pub async fn run(server: Arc<ServerContext>) -> anyhow::Result<()> {
    let addr = server.config.server.listen_addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    serve(server, listener).await
}

/// Runs the worker pool on an already bound listener.
pub async fn serve(server: Arc<ServerContext>, listener: TcpListener) -> anyhow::Result<()> {
    Supervisor::new(server, Arc::new(listener))
        .run()
        .await
        .context("worker pool stopped")
}
