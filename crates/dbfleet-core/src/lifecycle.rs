// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle state machine.
//!
//! ```text
//!                 start                     stop
//!   stopped ─────────────► pending ──► running ─────► stopping ──► stopped
//!
//!   (any) ── terminate ──► terminating ──► terminated
//! ```
//!
//! Caller actions move an instance into the transitional state of the
//! action (`pending`, `stopping`, `terminating`); the provider moves it on
//! from there and reconciliation picks that up.
//!
//! No transition skips its transitional state, including those reconciliation
//! applies: a provider report of a settled state (`running`, `stopped`,
//! `terminated`) reached without passing the matching transitional state is
//! recorded in two steps (see [`InstanceStatus::step_toward`]). A running
//! instance terminated outside this system reads `terminating` first and
//! `terminated` on the next reconciliation.
//!
//! `terminate` on an instance that is already `terminated` is the one
//! exception to "terminate passes through `terminating` and stamps the
//! termination time": the record is returned as-is, with no provider call and
//! the original timestamp kept.
//!
//! | Action      | Rejected from                          | Result        |
//! |-------------|----------------------------------------|---------------|
//! | `start`     | running, terminating, terminated       | `pending`     |
//! | `stop`      | stopped, terminating, terminated       | `stopping`    |
//! | `terminate` | never                                  | `terminating` |

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::locks::InstanceLocks;
use crate::model::{InstanceStatus, ManagedInstance};
use crate::provider::{ComputeApi, InstanceDescription};
use crate::store::{InstanceFilter, InstanceStore};

/// Caller-initiated lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    /// Boot a stopped machine.
    Start,
    /// Shut a machine down, keeping its disk.
    Stop,
    /// Destroy the machine.
    Terminate,
}

impl LifecycleAction {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Terminate => "terminate",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status an action leads to from `current`, or `None` if the action is not allowed.
///
/// Terminating an already terminated instance is accepted and leaves it
/// terminated; the manager then skips the provider and keeps the timestamp.
pub fn plan_transition(
    current: InstanceStatus,
    action: LifecycleAction,
) -> Option<InstanceStatus> {
    use InstanceStatus::*;

    match (action, current) {
        (LifecycleAction::Start, Running | Terminating | Terminated) => None,
        (LifecycleAction::Start, _) => Some(Pending),
        (LifecycleAction::Stop, Stopped | Terminating | Terminated) => None,
        (LifecycleAction::Stop, _) => Some(Stopping),
        (LifecycleAction::Terminate, Terminated) => Some(Terminated),
        (LifecycleAction::Terminate, _) => Some(Terminating),
    }
}

/// Apply a provider description to a record.
///
/// Returns whether anything changed besides the check timestamp.
pub fn apply_description(
    instance: &mut ManagedInstance,
    description: &InstanceDescription,
    now: DateTime<Utc>,
) -> bool {
    let before = (
        instance.status,
        instance.public_ip.clone(),
        instance.private_ip.clone(),
    );

    match InstanceStatus::from_provider_state(&description.state) {
        Some(observed) => instance.status = instance.status.step_toward(observed),
        None => debug!(
            instance_id = %instance.instance_id(),
            state = %description.state,
            "Unmapped provider state, keeping local status"
        ),
    }
    instance.public_ip = description.public_ip.clone();
    instance.private_ip = description.private_ip.clone();
    if matches!(
        instance.status,
        InstanceStatus::Terminating | InstanceStatus::Terminated
    ) && instance.terminated_at.is_none()
    {
        instance.terminated_at = Some(now);
    }
    instance.last_status_check = Some(now);

    before
        != (
            instance.status,
            instance.public_ip.clone(),
            instance.private_ip.clone(),
        )
}

/// Drives lifecycle actions and reconciliation for stored instances.
#[derive(Clone)]
pub struct LifecycleManager {
    compute: Arc<dyn ComputeApi>,
    store: Arc<dyn InstanceStore>,
    locks: InstanceLocks,
}

impl LifecycleManager {
    /// Create a manager.
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        store: Arc<dyn InstanceStore>,
        locks: InstanceLocks,
    ) -> Self {
        Self {
            compute,
            store,
            locks,
        }
    }

    async fn load(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.store
            .get(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    fn plan(instance: &ManagedInstance, action: LifecycleAction) -> Result<InstanceStatus> {
        plan_transition(instance.status, action).ok_or_else(|| Error::InvalidTransition {
            instance_id: instance.instance_id().to_string(),
            action,
            current: instance.status,
        })
    }

    /// Start a stopped instance.
    pub async fn start(&self, instance_id: &str) -> Result<ManagedInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        let next = Self::plan(&instance, LifecycleAction::Start)?;

        self.compute.start_instance(instance_id).await?;

        instance.status = next;
        self.store.save(&instance).await?;
        info!(instance_id = %instance_id, status = %instance.status, "Instance start requested");
        Ok(instance)
    }

    /// Stop a running instance.
    pub async fn stop(&self, instance_id: &str) -> Result<ManagedInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        let next = Self::plan(&instance, LifecycleAction::Stop)?;

        self.compute.stop_instance(instance_id).await?;

        instance.status = next;
        self.store.save(&instance).await?;
        info!(instance_id = %instance_id, status = %instance.status, "Instance stop requested");
        Ok(instance)
    }

    /// Terminate an instance. Accepted from any status.
    pub async fn terminate(&self, instance_id: &str) -> Result<ManagedInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        let next = Self::plan(&instance, LifecycleAction::Terminate)?;

        if instance.status.is_terminal() {
            debug!(instance_id = %instance_id, "Instance already terminated");
            return Ok(instance);
        }

        self.compute.terminate_instance(instance_id).await?;

        instance.status = next;
        instance.terminated_at = Some(Utc::now());
        self.store.save(&instance).await?;
        info!(instance_id = %instance_id, "Instance termination requested");
        Ok(instance)
    }

    /// Load one instance, reconciled against the provider when possible.
    pub async fn get(&self, instance_id: &str) -> Result<ManagedInstance> {
        let instance = self.load(instance_id).await?;
        let mut instances = vec![instance];
        self.reconcile(&mut instances).await;
        instances
            .pop()
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    /// List instances, reconciled against the provider when possible.
    pub async fn list(&self, filter: &InstanceFilter) -> Result<Vec<ManagedInstance>> {
        let mut instances = self.store.list(filter).await?;
        self.reconcile(&mut instances).await;
        Ok(instances)
    }

    /// Reconcile every stored instance that is not terminated.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let mut instances = self.store.list(&InstanceFilter::live()).await?;
        Ok(self.reconcile(&mut instances).await)
    }

    /// Refresh status and addresses from one batched provider query.
    ///
    /// Terminated records are skipped. Handles the provider does not return
    /// are left untouched. Provider and store failures are logged and the
    /// last known state is kept. Returns the number of records whose status
    /// or addresses changed.
    pub async fn reconcile(&self, instances: &mut [ManagedInstance]) -> usize {
        let ids: Vec<String> = instances
            .iter()
            .filter(|i| !i.status.is_terminal())
            .map(|i| i.instance_id().to_string())
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let descriptions = match self.compute.describe_instances(&ids).await {
            Ok(descriptions) => descriptions,
            Err(e) => {
                warn!(count = ids.len(), error = %e, "Reconciliation failed, serving last known state");
                return 0;
            }
        };

        let now = Utc::now();
        let mut changed = 0;
        for instance in instances.iter_mut().filter(|i| !i.status.is_terminal()) {
            let Some(description) = descriptions
                .iter()
                .find(|d| d.instance_id == instance.instance_id())
            else {
                debug!(instance_id = %instance.instance_id(), "Provider did not return instance");
                continue;
            };

            if apply_description(instance, description, now) {
                changed += 1;
                debug!(
                    instance_id = %instance.instance_id(),
                    status = %instance.status,
                    "Reconciled instance"
                );
            }

            if let Err(e) = self.persist_reconciled(description, now).await {
                warn!(
                    instance_id = %instance.instance_id(),
                    error = %e,
                    "Failed to persist reconciled state"
                );
            }
        }

        changed
    }

    async fn persist_reconciled(
        &self,
        description: &InstanceDescription,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(&description.instance_id).await;
        let Some(mut stored) = self.store.get(&description.instance_id).await? else {
            return Ok(());
        };
        if stored.status.is_terminal() {
            return Ok(());
        }
        apply_description(&mut stored, description, now);
        self.store.save(&stored).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn test_start_transitions() {
        assert_eq!(plan_transition(Stopped, LifecycleAction::Start), Some(Pending));
        assert_eq!(plan_transition(Pending, LifecycleAction::Start), Some(Pending));
        assert_eq!(plan_transition(Running, LifecycleAction::Start), None);
        assert_eq!(plan_transition(Terminated, LifecycleAction::Start), None);
        assert_eq!(plan_transition(Terminating, LifecycleAction::Start), None);
    }

    #[test]
    fn test_stop_transitions() {
        assert_eq!(plan_transition(Running, LifecycleAction::Stop), Some(Stopping));
        assert_eq!(plan_transition(Pending, LifecycleAction::Stop), Some(Stopping));
        assert_eq!(plan_transition(Stopped, LifecycleAction::Stop), None);
        assert_eq!(plan_transition(Terminated, LifecycleAction::Stop), None);
    }

    #[test]
    fn test_terminate_always_allowed() {
        for status in [Pending, Running, Stopping, Stopped, Terminating] {
            assert_eq!(
                plan_transition(status, LifecycleAction::Terminate),
                Some(Terminating),
                "from {}",
                status
            );
        }
        assert_eq!(
            plan_transition(Terminated, LifecycleAction::Terminate),
            Some(Terminated)
        );
    }

    #[test]
    fn test_action_display() {
        assert_eq!(LifecycleAction::Terminate.to_string(), "terminate");
        assert_eq!(
            serde_json::to_string(&LifecycleAction::Stop).unwrap(),
            "\"stop\""
        );
    }
}
