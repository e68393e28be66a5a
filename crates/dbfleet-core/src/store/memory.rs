// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory instance store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{InstanceFilter, InstanceStore, Result, StoreError};
use crate::model::ManagedInstance;

/// Store keeping records in process memory.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ManagedInstance>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert(&self, instance: &ManagedInstance) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(instance.instance_id()) {
            return Err(StoreError::Duplicate(instance.instance_id().to_string()));
        }
        records.insert(instance.instance_id().to_string(), instance.clone());
        Ok(())
    }

    async fn save(&self, instance: &ManagedInstance) -> Result<()> {
        self.records
            .write()
            .await
            .insert(instance.instance_id().to_string(), instance.clone());
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Option<ManagedInstance>> {
        Ok(self.records.read().await.get(instance_id).cloned())
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<ManagedInstance>> {
        let records = self.records.read().await;
        let mut matching: Vec<ManagedInstance> = records
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.launched_at
                .cmp(&b.launched_at)
                .then_with(|| a.instance_id().cmp(b.instance_id()))
        });
        Ok(matching)
    }
}
