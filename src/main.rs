mod cli;
mod config;
mod controller;
mod error;
mod kubernetes;
mod queue;
mod shipper;
mod store;
mod telegram;
mod types;
mod utils;

use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cli::{Cli, version_info};
use config::Config;
use controller::Controller;
use kubernetes::{ChangeFeed, KubeLogSource, build_client};
use queue::WorkQueue;
use shipper::{Shipper, ShipperPool};
use store::Store;
use telegram::TelegramSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        print!("{}", version_info());
        return Ok(());
    }

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let client = match build_client(config.kubeconfig.as_deref()).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create Kubernetes client: {:#}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let sink = Arc::new(TelegramSink::new(&config.telegram)?);
    let logs = Arc::new(KubeLogSource::new(client.clone()));
    let shipper = Arc::new(Shipper::new(config.ship.clone(), logs, sink));
    let (pool, shipper_handles) =
        ShipperPool::spawn(shipper, config.shippers, config.ship_backlog, cancel.clone());

    let store: Store<Pod> = Store::new();
    let queue = WorkQueue::default();
    let feed = ChangeFeed::new(
        client,
        &config.namespace,
        config.label_selector.as_deref(),
        store.clone(),
        queue.clone(),
    );
    info!(
        "Watching pods in namespace {} (delay {}s, tail {} lines)",
        config.namespace,
        config.ship.delay.as_secs(),
        config.ship.tail_lines
    );
    let feed_handle = tokio::spawn(feed.run(cancel.clone()));

    // Nothing is reconciled against a partially listed cache.
    let synced = tokio::select! {
        synced = store.wait_for_initial_sync(config.sync_timeout) => synced,
        _ = cancel.cancelled() => return Ok(()),
    };
    if !synced {
        error!(
            "Timed out after {}s waiting for the pod cache to sync",
            config.sync_timeout.as_secs()
        );
        std::process::exit(1);
    }

    let controller = Arc::new(Controller::new(store, queue, pool));
    controller.run(config.workers, cancel).await;

    feed_handle.await?;
    for handle in shipper_handles {
        handle.await?;
    }
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Received shutdown signal");
    cancel.cancel();
}
