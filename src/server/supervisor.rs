//! Keeps the worker pool at full strength.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::context::ServerContext;
use crate::error::ConfigError;
use crate::server::worker::Worker;

const RESPAWN_DELAY: Duration = Duration::from_millis(100);

type WorkerExit = (usize, std::thread::Result<std::io::Result<()>>);

/// Owns the worker tasks and replaces each one that exits or panics.
pub struct Supervisor {
    server: Arc<ServerContext>,
    listener: Arc<TcpListener>,
}

impl Supervisor {
    pub fn new(server: Arc<ServerContext>, listener: Arc<TcpListener>) -> Self {
        Self { server, listener }
    }

    /// Starts the configured number of workers and supervises them forever.
    ///
    /// Only returns when a replacement worker cannot be built, which means
    /// the configuration itself is broken.
    pub async fn run(self) -> Result<(), ConfigError> {
        let count = self.server.config.server.workers.max(1);
        let mut workers = JoinSet::new();

        // Build every worker up front so a bad configuration fails startup.
        for id in 0..count {
            let worker = Worker::new(id, Arc::clone(&self.server))?;
            self.spawn(&mut workers, worker);
        }
        tracing::info!(workers = count, "Worker pool started");

        let mut next_id = count;
        while let Some(joined) = workers.join_next().await {
            let id = match joined {
                Ok((id, Ok(Ok(())))) => {
                    tracing::info!(worker = id, "Worker exited, respawning");
                    id
                }
                Ok((id, Ok(Err(e)))) => {
                    tracing::error!(worker = id, error = %e, "Worker stopped accepting, respawning");
                    id
                }
                Ok((id, Err(_))) => {
                    tracing::error!(worker = id, "Worker panicked, respawning");
                    id
                }
                Err(e) => {
                    tracing::error!(error = %e, "Worker task failed, respawning");
                    next_id += 1;
                    next_id - 1
                }
            };

            tokio::time::sleep(RESPAWN_DELAY).await;
            let worker = Worker::new(id, Arc::clone(&self.server))?;
            self.spawn(&mut workers, worker);
        }

        Ok(())
    }

    fn spawn(&self, workers: &mut JoinSet<WorkerExit>, worker: Worker) {
        let id = worker.id();
        let listener = Arc::clone(&self.listener);
        workers.spawn(async move {
            let result = AssertUnwindSafe(worker.run(listener)).catch_unwind().await;
            (id, result)
        });
    }
}
