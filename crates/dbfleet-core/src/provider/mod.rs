// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider API traits.
//!
//! The core talks to the cloud through three narrow interfaces: compute
//! (virtual machines and network rules), remote execution (the management
//! agent inside each machine) and logs. Backends are pure API adapters; they
//! never touch the persistence store.

#[cfg(feature = "aws")]
pub mod aws;
pub mod mock;

pub use mock::MockProvider;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::PortRule;

/// Errors from provider API calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider rejected or failed the call.
    #[error("{operation} failed: {message}")]
    Api {
        /// Provider operation name.
        operation: &'static str,
        /// Provider error detail.
        message: String,
    },

    /// No invocation exists for the command/instance pair (yet).
    #[error("Invocation of command '{command_id}' on '{instance_id}' does not exist")]
    InvocationNotFound {
        /// Command identifier.
        command_id: String,
        /// Instance identifier.
        instance_id: String,
    },

    /// The provider does not know the instance.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// The provider answered with something unusable.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Parameters for launching one virtual machine.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Name tag for the machine.
    pub name: String,
    /// Machine image.
    pub image_id: String,
    /// Size class.
    pub instance_type: String,
    /// Subnet placement.
    pub subnet_id: String,
    /// Security groups to attach.
    pub security_group_ids: Vec<String>,
    /// Profile granting the management agent its permissions.
    pub instance_profile: Option<String>,
    /// SSH key pair.
    pub key_name: Option<String>,
    /// Base64-encoded boot script.
    pub user_data: String,
    /// Extra tags.
    pub tags: HashMap<String, String>,
}

/// What the provider returns for an accepted launch.
#[derive(Debug, Clone)]
pub struct LaunchedInstance {
    /// Provider instance handle.
    pub instance_id: String,
    /// Provider state name right after launch.
    pub state: String,
    /// Launch time.
    pub launched_at: DateTime<Utc>,
}

/// Provider view of one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    /// Provider instance handle.
    pub instance_id: String,
    /// Provider state name (`pending`, `running`, `shutting-down`, ...).
    pub state: String,
    /// Public address, if assigned.
    pub public_ip: Option<String>,
    /// Private address, if assigned.
    pub private_ip: Option<String>,
}

/// Heartbeat state of a management agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PingStatus {
    /// Agent is connected.
    Online,
    /// Agent was connected and went silent.
    ConnectionLost,
    /// Agent is registered but inactive.
    Inactive,
    /// Anything else the provider reports.
    Unknown(String),
}

impl PingStatus {
    /// Parse the provider vocabulary.
    pub fn parse(value: &str) -> Self {
        match value {
            "Online" => PingStatus::Online,
            "ConnectionLost" => PingStatus::ConnectionLost,
            "Inactive" => PingStatus::Inactive,
            other => PingStatus::Unknown(other.to_string()),
        }
    }

    /// Provider name of the status.
    pub fn as_str(&self) -> &str {
        match self {
            PingStatus::Online => "Online",
            PingStatus::ConnectionLost => "ConnectionLost",
            PingStatus::Inactive => "Inactive",
            PingStatus::Unknown(s) => s,
        }
    }
}

impl fmt::Display for PingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry in the provider's agent registration directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRegistration {
    /// Provider instance handle.
    pub instance_id: String,
    /// Heartbeat state.
    pub ping_status: PingStatus,
    /// Last heartbeat.
    pub last_ping_at: Option<DateTime<Utc>>,
    /// Agent version string.
    pub agent_version: Option<String>,
}

/// A batch of shell commands for one machine.
#[derive(Debug, Clone)]
pub struct SendCommandRequest {
    /// Target machine.
    pub instance_id: String,
    /// Commands, executed in order in one shell context.
    pub commands: Vec<String>,
    /// Execution timeout enforced by the agent.
    pub execution_timeout: Duration,
    /// Free-form comment shown in provider consoles.
    pub comment: Option<String>,
}

/// Provider status of a command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InvocationStatus {
    /// Queued, not delivered.
    Pending,
    /// Running on the host.
    InProgress,
    /// Delivery delayed by the provider.
    Delayed,
    /// Finished with exit code zero.
    Success,
    /// Finished with a non-zero exit code.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
    /// Killed by the execution timeout.
    TimedOut,
    /// Cancellation in progress.
    Cancelling,
    /// Anything else the provider reports.
    Unknown(String),
}

impl InvocationStatus {
    /// Parse the provider vocabulary.
    pub fn parse(value: &str) -> Self {
        match value {
            "Pending" => InvocationStatus::Pending,
            "InProgress" => InvocationStatus::InProgress,
            "Delayed" => InvocationStatus::Delayed,
            "Success" => InvocationStatus::Success,
            "Failed" => InvocationStatus::Failed,
            "Cancelled" => InvocationStatus::Cancelled,
            "TimedOut" => InvocationStatus::TimedOut,
            "Cancelling" => InvocationStatus::Cancelling,
            other => InvocationStatus::Unknown(other.to_string()),
        }
    }

    /// Provider name of the status.
    pub fn as_str(&self) -> &str {
        match self {
            InvocationStatus::Pending => "Pending",
            InvocationStatus::InProgress => "InProgress",
            InvocationStatus::Delayed => "Delayed",
            InvocationStatus::Success => "Success",
            InvocationStatus::Failed => "Failed",
            InvocationStatus::Cancelled => "Cancelled",
            InvocationStatus::TimedOut => "TimedOut",
            InvocationStatus::Cancelling => "Cancelling",
            InvocationStatus::Unknown(s) => s,
        }
    }

    /// Whether the invocation will not change any more.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Success
                | InvocationStatus::Failed
                | InvocationStatus::Cancelled
                | InvocationStatus::TimedOut
        )
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider record of one command on one machine.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    /// Command identifier.
    pub command_id: String,
    /// Target machine.
    pub instance_id: String,
    /// Provider status.
    pub status: InvocationStatus,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// When execution started on the host.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended on the host.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Time-ranged log query.
#[derive(Debug, Clone)]
pub struct LogQuery {
    /// Log group.
    pub log_group: String,
    /// Log stream within the group.
    pub log_stream: String,
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
    /// Maximum events to return.
    pub limit: Option<i32>,
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Log message.
    pub message: String,
}

/// Virtual machine and network-rule operations.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Provider identifier (e.g. "aws", "mock").
    fn provider_type(&self) -> &'static str;

    /// Launch one machine. Returns as soon as the provider accepted the request.
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<LaunchedInstance>;

    /// Describe the given machines in a single call.
    ///
    /// Machines the provider no longer knows are omitted from the result.
    async fn describe_instances(&self, instance_ids: &[String])
    -> Result<Vec<InstanceDescription>>;

    /// Start a stopped machine.
    async fn start_instance(&self, instance_id: &str) -> Result<()>;

    /// Stop a running machine.
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    /// Terminate a machine.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Create a security group and return its identifier.
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> Result<String>;

    /// Open an inbound rule on a security group. Existing identical rules are not an error.
    async fn authorize_ingress(&self, security_group_id: &str, rule: &PortRule) -> Result<()>;
}

/// Management-agent operations.
#[async_trait]
pub trait RemoteExecutionApi: Send + Sync {
    /// List registered agents, optionally restricted to the given machines.
    async fn describe_agents(
        &self,
        instance_ids: Option<&[String]>,
    ) -> Result<Vec<AgentRegistration>>;

    /// Submit a command batch and return the command identifier.
    async fn send_command(&self, request: &SendCommandRequest) -> Result<String>;

    /// Read the invocation of a command on one machine.
    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation>;
}

/// Log retrieval.
#[async_trait]
pub trait LogApi: Send + Sync {
    /// Fetch log events in a time range.
    async fn fetch_log_events(&self, query: &LogQuery) -> Result<Vec<LogEvent>>;
}

/// The three provider clients the core needs, shared behind `Arc`s.
#[derive(Clone)]
pub struct ProviderClients {
    /// Compute API.
    pub compute: Arc<dyn ComputeApi>,
    /// Remote-execution API.
    pub remote: Arc<dyn RemoteExecutionApi>,
    /// Log API.
    pub logs: Arc<dyn LogApi>,
}

impl ProviderClients {
    /// Use one backend for all three APIs.
    pub fn from_backend<P>(backend: Arc<P>) -> Self
    where
        P: ComputeApi + RemoteExecutionApi + LogApi + 'static,
    {
        Self {
            compute: backend.clone(),
            remote: backend.clone(),
            logs: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_status_completion() {
        for (name, complete) in [
            ("Pending", false),
            ("InProgress", false),
            ("Delayed", false),
            ("Cancelling", false),
            ("Success", true),
            ("Failed", true),
            ("Cancelled", true),
            ("TimedOut", true),
            ("Whatever", false),
        ] {
            let status = InvocationStatus::parse(name);
            assert_eq!(status.is_complete(), complete, "status {}", name);
            assert_eq!(status.as_str(), name);
        }
    }

    #[test]
    fn test_ping_status_parse() {
        assert_eq!(PingStatus::parse("Online"), PingStatus::Online);
        assert_eq!(
            PingStatus::parse("Rebooting"),
            PingStatus::Unknown("Rebooting".to_string())
        );
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::InvocationNotFound {
            command_id: "cmd-1".to_string(),
            instance_id: "i-1".to_string(),
        };
        assert!(err.to_string().contains("cmd-1"));
    }
}
