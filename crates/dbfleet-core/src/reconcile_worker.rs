// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps stored instance status in line with the provider.
//!
//! Reads already reconcile on demand; this worker makes sure instances
//! nobody looks at still pick up provider-side transitions (a `stopping`
//! machine becoming `stopped`, a `terminating` one becoming `terminated`).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::lifecycle::LifecycleManager;

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic reconciliation loop.
pub struct ReconcileWorker {
    lifecycle: LifecycleManager,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    /// Create a worker running one pass every `interval`.
    pub fn new(lifecycle: LifecycleManager, interval: Duration) -> Self {
        Self {
            lifecycle,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Reconcile worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    self.run_once().await;
                }
            }
        }

        info!("Reconcile worker stopped");
    }

    /// One reconciliation pass.
    pub async fn run_once(&self) {
        match self.lifecycle.reconcile_all().await {
            Ok(0) => debug!("No instance changed"),
            Ok(changed) => info!(changed, "Reconciled instances"),
            Err(e) => error!(error = %e, "Reconciliation pass failed"),
        }
    }
}
