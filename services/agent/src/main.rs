//! upsync agent
//!
//! Polls the Kubernetes API for pods matching a label selector, renders the
//! proxy's upstream configuration from their host addresses and reloads the
//! proxy whenever that set of addresses changes.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upsync_agent::{ClusterAccess, CommandReload, Config, FilePublisher, KubernetesSource};
use upsync_reconcile::Reconciler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting upsync agent");
    info!(
        kubeconfig = %config.kubeconfig.display(),
        in_cluster = config.in_cluster,
        template = %config.template.display(),
        output = %config.output.display(),
        selector = %config.selector,
        port = config.port,
        interval_secs = config.interval_secs,
        reload_command = %config.reload_command,
        "Configuration loaded"
    );

    let params = config.render_parameters()?;

    let access = if config.in_cluster {
        ClusterAccess::in_cluster().context("failed to load in-cluster credentials")?
    } else {
        ClusterAccess::from_kubeconfig(&config.kubeconfig)?
    };
    info!(server = %access.server, "Using Kubernetes API server");

    let source = KubernetesSource::new(access, config.query_timeout())?;

    let mut reconciler = Reconciler::new(
        config.reconciler_config(),
        params,
        Arc::new(source),
        Arc::new(FilePublisher::new()),
        Arc::new(CommandReload::new()),
    );

    if config.once {
        let outcome = reconciler.run_once().await?;
        info!(outcome = ?outcome, "Single cycle complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    shutdown_signal().await?;
    info!("Received shutdown signal");

    // The loop finishes any cycle in progress before it stops.
    let _ = shutdown_tx.send(true);
    reconciler_handle
        .await
        .context("reconciliation task panicked")?;

    info!("upsync agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
