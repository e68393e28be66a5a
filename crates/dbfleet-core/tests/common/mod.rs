// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dbfleet-core integration tests.
//!
//! Provides TestContext wiring an InstanceService over the mock provider.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dbfleet_core::config::{Config, InfraConfig, ReadinessConfig};
use dbfleet_core::model::Secret;
use dbfleet_core::provider::{MockProvider, ProviderClients};
use dbfleet_core::service::{CreateInstanceRequest, InstanceService};
use dbfleet_core::store::{InstanceStore, MemoryStore, SqliteStore};

pub const MASTER_USER: &str = "dbadmin";
pub const MASTER_PASSWORD: &str = "Master-Pass-42";

/// Config with launch infrastructure set and a fast readiness budget.
pub fn test_config() -> Config {
    Config {
        infra: InfraConfig {
            image_id: Some("ami-0123456789abcdef0".to_string()),
            subnet_id: Some("subnet-0aa".to_string()),
            security_group_id: Some("sg-0db".to_string()),
            vpc_id: Some("vpc-0main".to_string()),
            instance_profile: Some("dbfleet-agent".to_string()),
            key_name: None,
        },
        readiness: ReadinessConfig {
            max_attempts: 3,
            poll_interval: Duration::ZERO,
        },
        ..Config::default()
    }
}

/// Test context holding the service and the provider behind it.
pub struct TestContext {
    pub provider: Arc<MockProvider>,
    pub store: Arc<dyn InstanceStore>,
    pub service: InstanceService,
}

impl TestContext {
    /// Context over an in-memory store.
    pub fn new(provider: MockProvider) -> Self {
        Self::with_store(provider, Arc::new(MemoryStore::new()), test_config())
    }

    /// Context over an in-memory SQLite store.
    pub async fn sqlite(provider: MockProvider) -> Self {
        let store = SqliteStore::in_memory()
            .await
            .expect("Failed to open in-memory SQLite store");
        Self::with_store(provider, Arc::new(store), test_config())
    }

    /// Context with explicit store and config.
    pub fn with_store(
        provider: MockProvider,
        store: Arc<dyn InstanceStore>,
        config: Config,
    ) -> Self {
        let provider = Arc::new(provider);
        let service = InstanceService::builder()
            .config(config)
            .provider(ProviderClients::from_backend(provider.clone()))
            .store(store.clone())
            .build()
            .expect("Failed to build service");
        Self {
            provider,
            store,
            service,
        }
    }

    /// Launch an instance of `engine` and return its handle.
    pub async fn launch(&self, engine: &str) -> String {
        let instance = self
            .service
            .create_instance(create_request(engine))
            .await
            .expect("Failed to create instance");
        instance.instance_id().to_string()
    }
}

/// A valid creation request for `engine`.
pub fn create_request(engine: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        owner_id: "user-1".to_string(),
        name: format!("{}-test", engine),
        engine: engine.to_string(),
        engine_version: match engine {
            "mysql" => "8.0".to_string(),
            _ => "16".to_string(),
        },
        instance_size: "t3.micro".to_string(),
        master_username: MASTER_USER.to_string(),
        master_password: Secret::new(MASTER_PASSWORD),
        port: None,
        allowed_cidr: None,
    }
}

pub fn privileges(names: &[&str]) -> Vec<String> {
    names.iter().map(|p| p.to_string()).collect()
}
