use ferrule::config::Config;
use ferrule::context::ServerContext;
use ferrule::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    tracing::info!(
        listen = %cfg.server.listen_addr,
        document_root = %cfg.server.document_root.display(),
        modules = ?cfg.modules,
        "Configuration loaded"
    );
    let server = ServerContext::new(cfg);

    tokio::select! {
        res = server::listener::run(server) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
