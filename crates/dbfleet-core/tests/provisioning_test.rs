// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for instance creation, service wiring and log retrieval.

mod common;

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration as ChronoDuration, Utc};
use dbfleet_core::Error;
use dbfleet_core::config::Config;
use dbfleet_core::model::{Engine, InstanceStatus, PortRule};
use dbfleet_core::planner::{AGENT_BLOCK_MARKER, MYSQL_BLOCK_MARKER, POSTGRES_BLOCK_MARKER};
use dbfleet_core::provider::{LogEvent, MockProvider};
use dbfleet_core::service::InstanceService;
use dbfleet_core::store::{InstanceStore, MemoryStore};

use common::{MASTER_PASSWORD, TestContext, create_request, test_config};

fn decoded_script(user_data: &str) -> String {
    String::from_utf8(STANDARD.decode(user_data).unwrap()).unwrap()
}

#[tokio::test]
async fn test_create_postgres_instance() {
    let ctx = TestContext::new(MockProvider::new());

    let instance = ctx
        .service
        .create_instance(create_request("postgresql"))
        .await
        .unwrap();

    assert!(instance.instance_id().starts_with("i-"));
    assert_eq!(instance.engine, Engine::Postgresql);
    assert_eq!(instance.status, InstanceStatus::Pending);
    assert_eq!(instance.port, 5432);
    assert_eq!(instance.placement.vpc_id.as_deref(), Some("vpc-0main"));
    assert_eq!(instance.placement.subnet_id.as_deref(), Some("subnet-0aa"));
    assert_eq!(instance.placement.security_group_ids, vec!["sg-0db"]);
    assert_eq!(instance.port_rules, vec![PortRule::tcp(5432, "0.0.0.0/0")]);
    assert!(instance.database_users.is_empty());

    let launches = ctx.provider.launches().await;
    assert_eq!(launches.len(), 1);
    let launch = &launches[0];
    assert_eq!(launch.image_id, "ami-0123456789abcdef0");
    assert_eq!(launch.instance_type, "t3.micro");
    assert_eq!(launch.instance_profile.as_deref(), Some("dbfleet-agent"));
    assert_eq!(launch.tags.get("dbfleet:owner").map(String::as_str), Some("user-1"));
    assert_eq!(
        launch.tags.get("dbfleet:engine").map(String::as_str),
        Some("postgresql")
    );

    let script = decoded_script(&launch.user_data);
    let agent = script.find(AGENT_BLOCK_MARKER).expect("agent block");
    let engine = script.find(POSTGRES_BLOCK_MARKER).expect("engine block");
    assert!(agent < engine);
    assert!(!script.contains(MYSQL_BLOCK_MARKER));

    assert_eq!(
        ctx.provider.ingress_rules().await,
        vec![("sg-0db".to_string(), PortRule::tcp(5432, "0.0.0.0/0"))]
    );

    let stored = ctx.store.get(instance.instance_id()).await.unwrap().unwrap();
    assert_eq!(stored.master_password.expose(), MASTER_PASSWORD);
}

#[tokio::test]
async fn test_create_mysql_instance_with_custom_port() {
    let ctx = TestContext::new(MockProvider::auto_online());
    let mut request = create_request("MySQL");
    request.port = Some(13306);
    request.allowed_cidr = Some("10.0.0.0/16".to_string());

    let instance = ctx.service.create_instance(request).await.unwrap();

    assert_eq!(instance.engine, Engine::Mysql);
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.port, 13306);
    assert_eq!(instance.port_rules, vec![PortRule::tcp(13306, "10.0.0.0/16")]);

    let script = decoded_script(&ctx.provider.launches().await[0].user_data);
    assert!(script.contains(MYSQL_BLOCK_MARKER));
    assert!(script.contains("13306"));
}

#[tokio::test]
async fn test_ingress_failure_does_not_fail_creation() {
    let mut provider = MockProvider::new();
    provider.fail_ingress = true;
    let ctx = TestContext::new(provider);

    let instance = ctx
        .service
        .create_instance(create_request("postgresql"))
        .await
        .unwrap();

    assert!(instance.port_rules.is_empty());
    assert!(ctx.store.get(instance.instance_id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_missing_infrastructure_config() {
    let provider = MockProvider::new();
    let ctx = TestContext::with_store(provider, Arc::new(MemoryStore::new()), Config::default());

    let err = ctx
        .service
        .create_instance(create_request("postgresql"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotConfigured("DBFLEET_AMI_ID")));
    assert!(ctx.provider.launches().await.is_empty());
}

#[tokio::test]
async fn test_unsupported_engine_and_bad_input_launch_nothing() {
    let ctx = TestContext::new(MockProvider::new());

    let err = ctx
        .service
        .create_instance(create_request("oracle"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedEngine(name) if name == "oracle"));

    let mut request = create_request("postgresql");
    request.engine_version = "16; rm -rf /".to_string();
    let err = ctx.service.create_instance(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let mut request = create_request("postgresql");
    request.master_username = "root user".to_string();
    let err = ctx.service.create_instance(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let mut request = create_request("postgresql");
    request.master_username = "postgres".to_string();
    let err = ctx.service.create_instance(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let mut request = create_request("mysql");
    request.engine_version = "5.7".to_string();
    let err = ctx.service.create_instance(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(msg) if msg.contains("5.7")));

    assert!(ctx.provider.launches().await.is_empty());
    assert!(ctx.store.list(&Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_launch_failure_stores_nothing() {
    let mut provider = MockProvider::new();
    provider.fail_compute = true;
    let ctx = TestContext::new(provider);

    let err = ctx
        .service
        .create_instance(create_request("mysql"))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "PROVIDER_API_ERROR");
    assert!(ctx.store.list(&Default::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_builder_requires_provider_and_store() {
    let err = InstanceService::builder()
        .config(test_config())
        .store(Arc::new(MemoryStore::new()))
        .build()
        .err()
        .expect("build without provider must fail");
    assert!(matches!(err, Error::NotConfigured("provider")));

    let err = InstanceService::builder()
        .provider(dbfleet_core::provider::ProviderClients::from_backend(Arc::new(
            MockProvider::new(),
        )))
        .build()
        .err()
        .expect("build without store must fail");
    assert!(matches!(err, Error::NotConfigured("store")));
}

#[tokio::test]
async fn test_serialized_instance_has_no_passwords() {
    let ctx = TestContext::sqlite(MockProvider::auto_online()).await;
    let instance_id = ctx.launch("postgresql").await;

    let instance = ctx.service.get_instance(&instance_id).await.unwrap();
    let json = serde_json::to_string(&instance).unwrap();

    assert!(!json.contains(MASTER_PASSWORD));
    assert!(json.contains("\"engine\":\"postgresql\""));
    assert!(json.contains("\"status\":\"running\""));
}

#[tokio::test]
async fn test_fetch_logs_in_range() {
    let ctx = TestContext::new(MockProvider::auto_online());
    let instance_id = ctx.launch("postgresql").await;
    let now = Utc::now();

    for (offset, message) in [(-30, "old"), (-5, "boot started"), (-1, "boot done")] {
        ctx.provider
            .push_log_event(
                "/dbfleet/instances",
                &instance_id,
                LogEvent {
                    timestamp: now + ChronoDuration::minutes(offset),
                    message: message.to_string(),
                },
            )
            .await;
    }

    let events = ctx
        .service
        .fetch_logs(&instance_id, now - ChronoDuration::minutes(10), now, None)
        .await
        .unwrap();
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["boot started", "boot done"]);

    let err = ctx
        .service
        .fetch_logs(&instance_id, now, now, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let err = ctx
        .service
        .fetch_logs("i-missing", now - ChronoDuration::minutes(10), now, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound(_)));
}
