// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for remote command dispatch and result retrieval.

mod common;

use std::time::Duration;

use dbfleet_core::Error;
use dbfleet_core::dispatcher::{CommandHandle, DispatchOptions};
use dbfleet_core::provider::{InvocationStatus, MockProvider};

use common::TestContext;

fn batch(commands: &[&str]) -> Vec<String> {
    commands.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn test_dispatch_to_running_instance() {
    let ctx = TestContext::new(MockProvider::auto_online());
    let instance_id = ctx.launch("postgresql").await;

    let handle = ctx
        .service
        .dispatch(&instance_id, &batch(&["uptime", "df -h"]))
        .await
        .expect("dispatch should succeed");

    let sent = ctx.provider.sent_commands().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].instance_id, instance_id);
    assert_eq!(sent[0].commands, vec!["uptime", "df -h"]);
    assert_eq!(sent[0].execution_timeout, Duration::from_secs(600));

    let result = ctx
        .service
        .fetch_result(&handle, &instance_id)
        .await
        .expect("fetch should succeed");
    assert_eq!(result.status, InvocationStatus::Pending);
    assert!(!result.is_complete);
}

#[tokio::test]
async fn test_stopped_instance_rejected_without_send() {
    let ctx = TestContext::new(MockProvider::auto_online());
    let instance_id = ctx.launch("postgresql").await;
    ctx.provider.set_instance_state(&instance_id, "stopped").await;

    let err = ctx
        .service
        .dispatch(&instance_id, &batch(&["uptime"]))
        .await
        .unwrap_err();

    match err {
        Error::NotRunning { instance_id: id, state } => {
            assert_eq!(id, instance_id);
            assert_eq!(state, "stopped");
        }
        other => panic!("Expected NotRunning, got {:?}", other),
    }
    assert_eq!(ctx.provider.send_command_count(), 0);
    assert_eq!(ctx.provider.agent_poll_count(), 0);
}

#[tokio::test]
async fn test_agent_not_ready_sends_nothing() {
    let ctx = TestContext::new(MockProvider::new());
    ctx.provider.add_instance("i-noagent", "running").await;

    let err = ctx
        .service
        .dispatch("i-noagent", &batch(&["uptime"]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AgentNotReady { attempts: 3, .. }));
    assert_eq!(ctx.provider.send_command_count(), 0);
}

#[tokio::test]
async fn test_dispatch_with_options() {
    let ctx = TestContext::new(MockProvider::new());
    ctx.provider.add_running_instance("i-opts").await;

    let options = DispatchOptions {
        execution_timeout: Duration::from_secs(30),
        comment: Some("vacuum".to_string()),
    };
    ctx.service
        .dispatch_with("i-opts", &batch(&["vacuumdb --all"]), &options)
        .await
        .expect("dispatch should succeed");

    let sent = ctx.provider.sent_commands().await;
    assert_eq!(sent[0].execution_timeout, Duration::from_secs(30));
    assert_eq!(sent[0].comment.as_deref(), Some("vacuum"));
}

#[tokio::test]
async fn test_in_progress_is_not_complete_and_timed_out_is() {
    let ctx = TestContext::new(MockProvider::new());
    ctx.provider.add_running_instance("i-run").await;
    let handle = ctx
        .service
        .dispatch("i-run", &batch(&["sleep 5"]))
        .await
        .unwrap();

    ctx.provider
        .set_command_status(handle.as_str(), "i-run", InvocationStatus::InProgress, "", "")
        .await;
    let result = ctx.service.fetch_result(&handle, "i-run").await.unwrap();
    assert_eq!(result.status, InvocationStatus::InProgress);
    assert!(!result.is_complete);
    assert!(result.ended_at.is_none());

    ctx.provider
        .set_command_status(handle.as_str(), "i-run", InvocationStatus::TimedOut, "", "")
        .await;
    let result = ctx.service.fetch_result(&handle, "i-run").await.unwrap();
    assert_eq!(result.status, InvocationStatus::TimedOut);
    assert!(result.is_complete);
    assert_eq!(result.status_message(), "Command timed out");
}

#[tokio::test]
async fn test_failed_command_carries_output() {
    let ctx = TestContext::new(MockProvider::new());
    ctx.provider.add_running_instance("i-fail").await;
    let handle = ctx
        .service
        .dispatch("i-fail", &batch(&["false"]))
        .await
        .unwrap();

    ctx.provider
        .set_command_status(
            handle.as_str(),
            "i-fail",
            InvocationStatus::Failed,
            "partial output",
            "boom",
        )
        .await;
    let result = ctx.service.fetch_result(&handle, "i-fail").await.unwrap();

    assert!(result.is_complete);
    assert_eq!(result.stdout, "partial output");
    assert_eq!(result.stderr, "boom");
    assert_eq!(result.status_message(), "Command failed: boom");
}

#[tokio::test]
async fn test_unknown_command_handle() {
    let ctx = TestContext::new(MockProvider::new());
    ctx.provider.add_running_instance("i-1").await;

    let err = ctx
        .service
        .fetch_result(&CommandHandle::new("cmd-does-not-exist"), "i-1")
        .await
        .unwrap_err();

    match err {
        Error::CommandNotFound {
            command_id,
            instance_id,
        } => {
            assert_eq!(command_id, "cmd-does-not-exist");
            assert_eq!(instance_id, "i-1");
        }
        other => panic!("Expected CommandNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_failure_surfaces_provider_error() {
    let mut provider = MockProvider::new();
    provider.fail_send_command = true;
    let ctx = TestContext::new(provider);
    ctx.provider.add_running_instance("i-1").await;

    let err = ctx
        .service
        .dispatch("i-1", &batch(&["uptime"]))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "PROVIDER_API_ERROR");
}

#[tokio::test]
async fn test_verify_engine_dispatches_health_check() {
    let ctx = TestContext::new(MockProvider::auto_online());
    let instance_id = ctx.launch("mysql").await;

    ctx.service
        .verify_engine(&instance_id)
        .await
        .expect("health check dispatch should succeed");

    let sent = ctx.provider.sent_commands().await;
    assert_eq!(sent.len(), 1);
    assert!(
        sent[0]
            .commands
            .iter()
            .any(|c| c.contains("systemctl is-active"))
    );
}
