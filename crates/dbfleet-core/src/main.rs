// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! dbfleet core daemon
//!
//! Opens the instance store, connects to AWS and keeps stored instance
//! status reconciled until interrupted. Outer layers embed
//! [`InstanceService`] directly; this binary is the standalone worker.

use std::sync::Arc;
use tracing::{info, warn};

use dbfleet_core::config::Config;
use dbfleet_core::provider::ProviderClients;
use dbfleet_core::provider::aws::AwsProvider;
use dbfleet_core::reconcile_worker::ReconcileWorker;
use dbfleet_core::service::InstanceService;
use dbfleet_core::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbfleet_core=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        region = %config.provider.region,
        database_url = %config.database_url,
        "Starting dbfleet core"
    );

    if let Err(e) = config.infra.require() {
        warn!(error = %e, "Launch infrastructure incomplete, instance creation disabled");
    }

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    info!("Instance store ready");

    let provider = Arc::new(AwsProvider::new(&config.provider).await);

    let service = InstanceService::builder()
        .config(config.clone())
        .provider(ProviderClients::from_backend(provider))
        .store(store)
        .build()?;

    let worker = Arc::new(ReconcileWorker::new(
        service.lifecycle().clone(),
        config.reconcile_interval,
    ));
    let shutdown = worker.shutdown_handle();
    let worker_task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.notify_one();
    if let Err(e) = worker_task.await {
        warn!(error = %e, "Reconcile worker task failed");
    }

    info!("dbfleet core shut down");

    Ok(())
}
