//! camfleet Node Agent
//!
//! Runs on every cluster machine. Listens for the control plane, receives
//! this node's process manifest and executes lifecycle commands against the
//! processes it owns.

use std::sync::Arc;

use anyhow::Result;
use camfleet_node_agent::{spawn_supervisor, AgentServer, Config, HostLauncher};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level applies from the start
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        max_restarts = config.policy.max_restarts,
        health_interval_ms = config.policy.health_interval.as_millis(),
        "Starting camfleet node agent"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher = Arc::new(HostLauncher::default());
    let (supervisor, supervisor_task) =
        spawn_supervisor(launcher, config.policy, shutdown_rx.clone());

    let server = AgentServer::bind(config.listen_addr, supervisor, config.manifest_timeout).await?;
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_task => {
            if let Err(e) = result {
                error!(error = %e, "Control listener task panicked");
            }
        }
    }

    // Signal shutdown; the supervisor kills what is still running
    let _ = shutdown_tx.send(true);
    if let Err(e) = supervisor_task.await {
        error!(error = %e, "Supervisor task panicked");
    }

    info!("Node agent shutdown complete");
    Ok(())
}
