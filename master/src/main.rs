use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use master::{handlers, store::MemoryStore, transport::HttpDispatcher, Hive, HiveConfig};

/// SIGTERM o SIGINT cancelan el token; cada loop se detiene entre ciclos.
fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("no se pudo instalar SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("no se pudo instalar SIGINT")?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM recibido, apagando"),
            _ = sigint.recv() => info!("SIGINT recibido, apagando"),
        }
        cancel.cancel();
    });

    Ok(token)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info,tower_http=info")),
        )
        .init();

    let config = HiveConfig::from_env().context("configuración inválida")?;
    info!(?config, "configuración cargada");

    let dispatcher = Arc::new(HttpDispatcher::new(config.dispatch_timeout)?);
    let hive = Hive::new(&config, Arc::new(MemoryStore::new()), dispatcher);
    let shutdown = install_shutdown_handler()?;

    // loops en segundo plano
    let scheduler = tokio::spawn(hive.state.scheduler.clone().run(shutdown.clone()));
    let monitor = tokio::spawn(hive.monitor.clone().run(shutdown.clone()));
    let janitor = tokio::spawn(hive.state.janitor.clone().run(shutdown.clone()));

    // router HTTP
    let app = handlers::build_router(hive.state.clone());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.listen_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(scheduler, monitor, janitor);
    info!("master detenido");
    Ok(())
}
