// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote agent readiness tracking.
//!
//! A freshly launched machine is useless until its management agent has
//! registered with the provider and reports `Online`. [`ReadinessTracker`]
//! polls the agent directory, filtered to one machine, with a fixed interval
//! and a bounded attempt budget.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReadinessConfig;
use crate::error::{Error, Result};
use crate::provider::{AgentRegistration, PingStatus, RemoteExecutionApi};
use crate::retry::{Attempt, PollOutcome, RetryPolicy};

/// Polls the provider until a machine's agent is online.
#[derive(Clone)]
pub struct ReadinessTracker {
    remote: Arc<dyn RemoteExecutionApi>,
    defaults: ReadinessConfig,
}

impl ReadinessTracker {
    /// Create a tracker with the default polling budget.
    pub fn new(remote: Arc<dyn RemoteExecutionApi>) -> Self {
        Self::with_config(remote, ReadinessConfig::default())
    }

    /// Create a tracker with an explicit default polling budget.
    pub fn with_config(remote: Arc<dyn RemoteExecutionApi>, defaults: ReadinessConfig) -> Self {
        Self { remote, defaults }
    }

    /// Wait until the agent on `instance_id` is online.
    ///
    /// Succeeds on the first poll that sees the agent online. Polling errors
    /// count as a spent attempt. Fails with [`Error::AgentNotReady`] once
    /// `max_attempts` polls have been made.
    pub async fn await_ready(
        &self,
        instance_id: &str,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> Result<()> {
        let ids = vec![instance_id.to_string()];
        let policy = RetryPolicy::new(max_attempts, poll_interval);

        let outcome = policy
            .poll(|attempt| {
                let ids = ids.as_slice();
                async move {
                    let agents = match self.remote.describe_agents(Some(ids)).await {
                        Ok(agents) => agents,
                        Err(e) => {
                            debug!(instance_id = %ids[0], attempt, error = %e, "Agent poll failed");
                            return Err(e);
                        }
                    };

                    match agents.into_iter().find(|a| a.instance_id == ids[0]) {
                        Some(agent) if agent.ping_status == PingStatus::Online => {
                            Ok(Attempt::Ready(agent))
                        }
                        Some(agent) => {
                            debug!(
                                instance_id = %ids[0],
                                attempt,
                                ping_status = %agent.ping_status,
                                "Agent registered but not online"
                            );
                            Ok(Attempt::Pending)
                        }
                        None => {
                            debug!(instance_id = %ids[0], attempt, "Agent not registered yet");
                            Ok(Attempt::Pending)
                        }
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Ready { value, attempts } => {
                info!(
                    instance_id = %instance_id,
                    attempts,
                    agent_version = value.agent_version.as_deref().unwrap_or("unknown"),
                    "Remote agent online"
                );
                Ok(())
            }
            PollOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let last_error = last_error.map(|e| e.to_string());
                warn!(
                    instance_id = %instance_id,
                    attempts,
                    last_error = last_error.as_deref().unwrap_or("none"),
                    "Remote agent not ready"
                );
                Err(Error::AgentNotReady {
                    instance_id: instance_id.to_string(),
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// [`await_ready`](Self::await_ready) with the configured budget.
    pub async fn await_ready_default(&self, instance_id: &str) -> Result<()> {
        self.await_ready(
            instance_id,
            self.defaults.max_attempts,
            self.defaults.poll_interval,
        )
        .await
    }

    /// Every registered agent and its state, for operator diagnostics.
    ///
    /// Never fails: a provider error yields an empty list.
    pub async fn diagnostics(&self) -> Vec<AgentRegistration> {
        match self.remote.describe_agents(None).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Failed to list registered agents");
                Vec::new()
            }
        }
    }
}
