//! camfleet Control Plane
//!
//! Reads the run config and the node templates, generates every node's
//! manifest, hands the manifests to the node agents and then relays the
//! lifecycle commands typed at the prompt.

use anyhow::{Context, Result};
use camfleet_control_plane::prompt::{help_text, spawn_stdin_prompt};
use camfleet_control_plane::{Config, ControlPlane, DispatchReport};
use camfleet_manifest::{load_templates, ManifestGenerator, RunConfig};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to CAMFLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting camfleet control plane");

    // Configuration errors are fatal before anything is distributed
    let run = RunConfig::load(&config.run_config)
        .with_context(|| format!("loading run config {}", config.run_config.display()))?;
    let templates = load_templates(&config.template_dir)
        .with_context(|| format!("loading templates from {}", config.template_dir.display()))?;
    let manifests = ManifestGenerator::new(&run.parameters)
        .generate(&templates, &run.servers)
        .context("generating manifests")?;

    info!(
        nodes = manifests.len(),
        parameters = run.parameters.len(),
        "Manifests generated"
    );

    let control = ControlPlane::new(run.servers, manifests, config.link_settings());
    log_failures("initialize", &control.initialize().await);

    let (command_tx, mut command_rx) = mpsc::channel(16);
    spawn_stdin_prompt(command_tx).context("starting the prompt")?;
    print!("{}", help_text());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            command = command_rx.recv() => {
                let Some(command) = command else {
                    info!("Prompt closed");
                    break;
                };
                let report = control.dispatch(command).await;
                log_failures(&command.to_string(), &report);
            }
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}

fn log_failures(operation: &str, report: &DispatchReport) {
    if report.is_complete() {
        info!(operation, nodes = report.delivered.len(), "All nodes reached");
        return;
    }

    for (node, e) in &report.failed {
        error!(operation, node = %node, error = %e, "Node not reached");
    }
    warn!(
        operation,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Some nodes were not reached"
    );
}
