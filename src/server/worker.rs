use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;

use crate::context::ServerContext;
use crate::error::ConfigError;
use crate::http::connection::ConnectionHandler;
use crate::http::socket::LineSocket;
use crate::module::ModulePipeline;

/// Lets a connection handler ask for its worker to be replaced.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: usize,
    respawn: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            respawn: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Requests a respawn of this worker slot once the current connection is done.
    pub fn shutdown(&self) {
        tracing::warn!(worker = self.id, "Worker respawn requested");
        self.respawn.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.respawn.load(Ordering::SeqCst)
    }
}

/// Accepts connections and serves them one after another with its own pipeline.
pub struct Worker {
    handle: WorkerHandle,
    server: Arc<ServerContext>,
    pipeline: ModulePipeline,
}

impl Worker {
    /// Builds the worker's module pipeline; configuration errors surface here.
    pub fn new(id: usize, server: Arc<ServerContext>) -> Result<Self, ConfigError> {
        let pipeline = ModulePipeline::from_config(&server)?;
        tracing::debug!(worker = id, modules = ?pipeline.module_names(), "Worker ready");
        Ok(Self {
            handle: WorkerHandle::new(id),
            server,
            pipeline,
        })
    }

    pub fn id(&self) -> usize {
        self.handle.id()
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Serves connections until a respawn is requested or accepting fails.
    pub async fn run(mut self, listener: Arc<TcpListener>) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(worker = self.handle.id(), %peer, "Accepted connection");

            let socket = LineSocket::new(stream, peer);
            ConnectionHandler::new(Arc::clone(&self.server), &mut self.pipeline)
                .handle(socket, &self.handle)
                .await;

            if self.handle.is_shutdown_requested() {
                tracing::info!(worker = self.handle.id(), "Worker exiting for respawn");
                return Ok(());
            }
        }
    }
}
