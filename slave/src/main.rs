mod agent;
mod config;
mod executor;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{agent::Agent, config::SlaveConfig, executor::Executor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("slave=debug,reqwest=info")),
        )
        .init();

    let config = SlaveConfig::from_env();
    let listen_addr = config.listen_addr;
    let (executor, done) =
        Executor::new(config.total_cores, config.total_memory, config.simulated_work);

    // primero escuchar: el master puede mandar jobs apenas nos registramos
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {listen_addr}"))?;
    info!("slave escuchando en {}", listener.local_addr()?);
    let app = agent::build_router(executor.clone());
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let agent = Agent::new(config);
    agent.register().await;

    tokio::spawn(agent.clone().report_loop(done));
    tokio::spawn(agent.heartbeat_loop(executor));

    server.await??;
    Ok(())
}
