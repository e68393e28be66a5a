// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence for managed instance records.
//!
//! Records are loaded and saved whole, keyed by provider instance handle.
//! There is no delete: terminated instances remain as history.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Engine, InstanceStatus, ManagedInstance};

/// Store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem setup failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value does not map onto the model.
    #[error("Corrupt record '{instance_id}': {details}")]
    Corrupt {
        /// Affected record.
        instance_id: String,
        /// What is wrong with it.
        details: String,
    },

    /// A record with this handle already exists.
    #[error("Instance already exists: {0}")]
    Duplicate(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Equality and range filters for listing records.
///
/// All set fields must match. Launch-time bounds are `[after, before)`.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Owning user.
    pub owner_id: Option<String>,
    /// Exact status.
    pub status: Option<InstanceStatus>,
    /// Engine.
    pub engine: Option<Engine>,
    /// Launched at or after.
    pub launched_after: Option<DateTime<Utc>>,
    /// Launched strictly before.
    pub launched_before: Option<DateTime<Utc>>,
    /// Skip terminated records.
    pub exclude_terminated: bool,
}

impl InstanceFilter {
    /// Records owned by `owner_id`.
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Default::default()
        }
    }

    /// Records that are not terminated.
    pub fn live() -> Self {
        Self {
            exclude_terminated: true,
            ..Default::default()
        }
    }

    /// Whether `instance` passes the filter.
    pub fn matches(&self, instance: &ManagedInstance) -> bool {
        if let Some(owner) = &self.owner_id
            && &instance.owner_id != owner
        {
            return false;
        }
        if let Some(status) = self.status
            && instance.status != status
        {
            return false;
        }
        if let Some(engine) = self.engine
            && instance.engine != engine
        {
            return false;
        }
        if let Some(after) = self.launched_after
            && instance.launched_at < after
        {
            return false;
        }
        if let Some(before) = self.launched_before
            && instance.launched_at >= before
        {
            return false;
        }
        !(self.exclude_terminated && instance.status == InstanceStatus::Terminated)
    }
}

/// Persistence interface for managed instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Record a new instance. Fails with [`StoreError::Duplicate`] if the handle is taken.
    async fn insert(&self, instance: &ManagedInstance) -> Result<()>;

    /// Write the full record, replacing whatever is stored under its handle.
    async fn save(&self, instance: &ManagedInstance) -> Result<()>;

    /// Load one record.
    async fn get(&self, instance_id: &str) -> Result<Option<ManagedInstance>>;

    /// Load all matching records, oldest launch first.
    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<ManagedInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkPlacement, NewInstance, Secret};
    use chrono::TimeZone;

    fn instance(id: &str, owner: &str, day: u32, status: InstanceStatus) -> ManagedInstance {
        let mut instance = ManagedInstance::new(
            id,
            NewInstance {
                owner_id: owner.to_string(),
                name: id.to_string(),
                engine: Engine::Postgresql,
                engine_version: "15".to_string(),
                instance_size: "t3.micro".to_string(),
                placement: NetworkPlacement::default(),
                port: 5432,
                master_username: "dbadmin".to_string(),
                master_password: Secret::new("pw"),
                launched_at: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
            },
        );
        instance.status = status;
        instance
    }

    #[test]
    fn test_filter_matches() {
        let a = instance("i-a", "alice", 10, InstanceStatus::Running);
        let b = instance("i-b", "bob", 20, InstanceStatus::Terminated);

        assert!(InstanceFilter::default().matches(&a));
        assert!(InstanceFilter::owner("alice").matches(&a));
        assert!(!InstanceFilter::owner("alice").matches(&b));
        assert!(!InstanceFilter::live().matches(&b));

        let range = InstanceFilter {
            launched_after: Some(Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap()),
            launched_before: Some(Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(range.matches(&a));
        assert!(!range.matches(&b));

        let engine = InstanceFilter {
            engine: Some(Engine::Mysql),
            ..Default::default()
        };
        assert!(!engine.matches(&a));
    }
}
