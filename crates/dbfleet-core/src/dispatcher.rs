// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command dispatch.
//!
//! Sends a batch of shell commands to one machine through the management
//! channel and reads the outcome back by command handle.
//!
//! ```text
//!   dispatch(instance, commands)
//!     ├─ describe_instances ── state != running ──► NotRunning
//!     ├─ await_ready        ── agent offline   ──► AgentNotReady
//!     └─ send_command       ──────────────────────► CommandHandle
//!
//!   fetch_result(handle, instance) ──► CommandResult { status, is_complete, ... }
//! ```
//!
//! Dispatch returns as soon as the provider accepted the batch. Nothing is
//! retried; if the agent is not ready no command reaches the host.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::provider::{
    ComputeApi, InvocationStatus, ProviderClients, ProviderError, RemoteExecutionApi,
    SendCommandRequest,
};
use crate::readiness::ReadinessTracker;

/// Default execution timeout enforced by the remote agent.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Opaque handle of a dispatched command batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CommandHandle(String);

impl CommandHandle {
    /// Wrap a provider command id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The provider command id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Execution timeout enforced by the remote agent.
    pub execution_timeout: Duration,
    /// Comment attached to the provider request.
    pub comment: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            comment: None,
        }
    }
}

/// Outcome of a dispatched batch as reported by the provider.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// Command handle.
    pub command_id: CommandHandle,
    /// Target machine.
    pub instance_id: String,
    /// Provider status.
    pub status: InvocationStatus,
    /// Whether the status is final.
    pub is_complete: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended.
    pub ended_at: Option<DateTime<Utc>>,
}

impl CommandResult {
    /// Human-readable description of the status.
    pub fn status_message(&self) -> String {
        match &self.status {
            InvocationStatus::Pending => "Command is queued and waiting for delivery".to_string(),
            InvocationStatus::InProgress => "Command is running".to_string(),
            InvocationStatus::Delayed => "Command delivery is delayed".to_string(),
            InvocationStatus::Success => "Command completed successfully".to_string(),
            InvocationStatus::Failed => {
                let detail = self.stderr.trim();
                if detail.is_empty() {
                    "Command failed".to_string()
                } else {
                    format!("Command failed: {}", detail)
                }
            }
            InvocationStatus::Cancelled => "Command was cancelled".to_string(),
            InvocationStatus::TimedOut => "Command timed out".to_string(),
            InvocationStatus::Cancelling => "Command is being cancelled".to_string(),
            InvocationStatus::Unknown(status) => format!("Command status: {}", status),
        }
    }
}

/// Sends command batches and reads their results.
#[derive(Clone)]
pub struct CommandDispatcher {
    compute: Arc<dyn ComputeApi>,
    remote: Arc<dyn RemoteExecutionApi>,
    readiness: ReadinessTracker,
    execution_timeout: Duration,
}

impl CommandDispatcher {
    /// Create a dispatcher.
    pub fn new(clients: &ProviderClients, readiness: ReadinessTracker) -> Self {
        Self {
            compute: clients.compute.clone(),
            remote: clients.remote.clone(),
            readiness,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    /// Set the execution timeout used by [`dispatch`](Self::dispatch).
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Send `commands` with the configured execution timeout.
    pub async fn dispatch(&self, instance_id: &str, commands: &[String]) -> Result<CommandHandle> {
        let options = DispatchOptions {
            execution_timeout: self.execution_timeout,
            comment: None,
        };
        self.dispatch_with(instance_id, commands, &options).await
    }

    /// Send `commands` to `instance_id` as one remote-execution request.
    pub async fn dispatch_with(
        &self,
        instance_id: &str,
        commands: &[String],
        options: &DispatchOptions,
    ) -> Result<CommandHandle> {
        if commands.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one command is required".to_string(),
            ));
        }

        let ids = vec![instance_id.to_string()];
        let description = self
            .compute
            .describe_instances(&ids)
            .await?
            .into_iter()
            .find(|d| d.instance_id == instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;

        if description.state != "running" {
            debug!(
                instance_id = %instance_id,
                state = %description.state,
                "Refusing to dispatch to non-running instance"
            );
            return Err(Error::NotRunning {
                instance_id: instance_id.to_string(),
                state: description.state,
            });
        }

        self.readiness.await_ready_default(instance_id).await?;

        let request = SendCommandRequest {
            instance_id: instance_id.to_string(),
            commands: commands.to_vec(),
            execution_timeout: options.execution_timeout,
            comment: options.comment.clone(),
        };
        let command_id = self.remote.send_command(&request).await?;

        info!(
            instance_id = %instance_id,
            command_id = %command_id,
            commands = commands.len(),
            "Dispatched command batch"
        );

        Ok(CommandHandle(command_id))
    }

    /// Read the current outcome of a dispatched batch.
    pub async fn fetch_result(
        &self,
        command_id: &CommandHandle,
        instance_id: &str,
    ) -> Result<CommandResult> {
        let invocation = self
            .remote
            .get_command_invocation(command_id.as_str(), instance_id)
            .await
            .map_err(|e| match e {
                ProviderError::InvocationNotFound {
                    command_id,
                    instance_id,
                } => Error::CommandNotFound {
                    command_id,
                    instance_id,
                },
                other => Error::ProviderApi(other),
            })?;

        Ok(CommandResult {
            command_id: command_id.clone(),
            instance_id: invocation.instance_id,
            is_complete: invocation.status.is_complete(),
            status: invocation.status,
            stdout: invocation.stdout,
            stderr: invocation.stderr,
            started_at: invocation.started_at,
            ended_at: invocation.ended_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessConfig;
    use crate::provider::MockProvider;

    fn dispatcher(provider: Arc<MockProvider>) -> CommandDispatcher {
        let clients = ProviderClients::from_backend(provider.clone());
        let readiness = ReadinessTracker::with_config(
            clients.remote.clone(),
            ReadinessConfig {
                max_attempts: 2,
                poll_interval: Duration::ZERO,
            },
        );
        CommandDispatcher::new(&clients, readiness)
    }

    #[tokio::test]
    async fn test_empty_batch_rejected_before_provider_call() {
        let provider = Arc::new(MockProvider::new());
        let err = dispatcher(provider.clone())
            .dispatch("i-1", &[])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(provider.describe_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let provider = Arc::new(MockProvider::new());
        let err = dispatcher(provider)
            .dispatch("i-missing", &["true".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InstanceNotFound(id) if id == "i-missing"));
    }

    #[test]
    fn test_status_message() {
        let result = CommandResult {
            command_id: CommandHandle::new("cmd-1"),
            instance_id: "i-1".to_string(),
            status: InvocationStatus::Failed,
            is_complete: true,
            stdout: String::new(),
            stderr: "ERROR: role \"x\" does not exist\n".to_string(),
            started_at: None,
            ended_at: None,
        };
        assert_eq!(
            result.status_message(),
            "Command failed: ERROR: role \"x\" does not exist"
        );
    }

    #[test]
    fn test_handle_serializes_as_string() {
        let json = serde_json::to_string(&CommandHandle::new("cmd-9")).unwrap();
        assert_eq!(json, "\"cmd-9\"");
    }
}
