use agent_gateway::{
    config::Config,
    connection::{Connection, ConnectionConfig},
    executor::TaskExecutor,
    gateway::Gateway,
    memory::{open_store, MemoryManager},
    runner::ProcessRunnerFactory,
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Agent Gateway");

    let config = Config::load()?;
    info!(
        host_id = %config.host.host_id,
        server = %config.server.url,
        max_concurrent = config.host.max_concurrent,
        "gateway configured"
    );

    let store = open_store(&config.data_dir)?;
    let memory = Arc::new(MemoryManager::new(
        store,
        config.host.host_id.clone(),
        config.data_dir.clone(),
        config.memory.clone(),
    )?);
    let factory = Arc::new(ProcessRunnerFactory::new(&config.runner));

    let (connection, inbound) = Connection::new(ConnectionConfig {
        url: config.server.url.clone(),
        host_id: config.host.host_id.clone(),
        token: config.server.auth_token.clone(),
        capabilities: config.capabilities(),
        reconnect: true,
    });
    let connection = Arc::new(connection);

    let (signals_tx, signals_rx) = tokio::sync::mpsc::unbounded_channel();
    let executor = Arc::new(TaskExecutor::new(
        config.capabilities(),
        config.host.allowed_project_roots.clone(),
        factory.clone(),
        memory.clone(),
        signals_tx.clone(),
    ));
    let gateway = Gateway::new(
        connection.clone(),
        executor.clone(),
        memory.clone(),
        factory,
        signals_tx,
        config.host.cwd.clone(),
    );

    connection.connect()?;

    tokio::select! {
        _ = gateway.run(inbound, signals_rx) => {
            warn!("entry loop ended");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    executor.shutdown().await;
    connection.disconnect().await;
    info!("Agent Gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
