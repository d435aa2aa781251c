//! Dotmesh cluster operator: keeps one dotmesh server pod running on every
//! eligible node, rolling restarts through image or node changes without
//! dropping the storage fleet below its safety threshold.
//!
//! There is NO persistent state stored in this process other than caches and
//! other recreatable stuff. Stopping and starting the operator has no
//! practical effects at all.

pub mod common;
pub mod config;
pub mod controller;
pub mod error;
pub mod resources;
pub mod watch;

use std::env;

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::signal::unix::{signal, SignalKind};
use tracing::*;
use tracing_subscriber::EnvFilter;

use crate::common::DOTMESH_IMAGE_VAR;
use crate::config::OperatorConfig;
use crate::controller::DotmeshController;
use crate::watch::ClusterCaches;

#[derive(Parser)]
#[command(version, about = "Runs a dotmesh server pod on every eligible node")]
struct Opts {
    /// Path to a kubeconfig file. When empty, in-cluster service-account
    /// credentials are used; a local kubeconfig makes development and
    /// testing easier.
    #[arg(long, default_value = "")]
    kubeconfig: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to stderr so everything shows up in `kubectl logs`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let client = build_client(&opts.kubeconfig)
        .await
        .context("Failed to build cluster client")?;

    info!(
        "Starting Dotmesh Operator version {}",
        env!("CARGO_PKG_VERSION")
    );

    let image = env::var(DOTMESH_IMAGE_VAR).with_context(|| {
        format!(
            "{} must name the dotmesh server image to deploy",
            DOTMESH_IMAGE_VAR
        )
    })?;

    let operator_config = OperatorConfig::load(&client).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let caches = ClusterCaches::start(&client, operator_config.node_selector(), shutdown_rx.clone());
    caches.wait_for_sync(shutdown_rx.clone()).await?;

    DotmeshController::new(client, &caches, operator_config, image)
        .run(shutdown_rx)
        .await;

    info!("Stopping Dotmesh Operator");
    Ok(())
}

async fn build_client(kubeconfig: &str) -> Result<Client> {
    let config = if kubeconfig.is_empty() {
        Config::incluster()?
    } else {
        let kc = Kubeconfig::read_from(kubeconfig)?;
        Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?
    };
    Ok(Client::try_from(config)?)
}

async fn wait_for_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
