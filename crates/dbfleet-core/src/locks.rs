// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance serialization.
//!
//! Lifecycle actions and command batches on the same instance handle run one
//! at a time; different handles proceed in parallel. Entries nobody holds or
//! waits on are dropped on the next acquire, so the registry tracks only
//! handles in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of async locks keyed by instance handle.
#[derive(Clone, Default)]
pub struct InstanceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl InstanceLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `instance_id`.
    ///
    /// The lock is held until the returned guard is dropped.
    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Guards and waiters keep their own Arc; a count of one means idle.
            locks.retain(|id, lock| id == instance_id || Arc::strong_count(lock) > 1);
            locks
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of handles currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no handle is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
