// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provisioning facade.
//!
//! [`InstanceService`] wires the components together and is what an outer
//! layer (HTTP handlers, CLI) talks to.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dbfleet_core::config::Config;
//! use dbfleet_core::provider::{MockProvider, ProviderClients};
//! use dbfleet_core::service::{CreateInstanceRequest, InstanceService};
//! use dbfleet_core::store::SqliteStore;
//!
//! let service = InstanceService::builder()
//!     .config(Config::from_env()?)
//!     .provider(ProviderClients::from_backend(Arc::new(MockProvider::auto_online())))
//!     .store(Arc::new(SqliteStore::in_memory().await?))
//!     .build()?;
//!
//! let instance = service.create_instance(request).await?;
//! service.await_agent(instance.instance_id()).await?;
//! let handle = service.verify_engine(instance.instance_id()).await?;
//! let result = service.fetch_result(&handle, instance.instance_id()).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::commands;
use crate::config::Config;
use crate::dispatcher::{CommandDispatcher, CommandHandle, CommandResult, DispatchOptions};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;
use crate::locks::InstanceLocks;
use crate::model::{
    Engine, InstanceStatus, ManagedInstance, NetworkPlacement, NewInstance, PortRule, Secret,
};
use crate::planner::{BootRequest, plan_boot};
use crate::provider::{LaunchRequest, LogEvent, LogQuery, ProviderClients};
use crate::readiness::ReadinessTracker;
use crate::store::{InstanceFilter, InstanceStore};
use crate::users::UserManager;

/// CIDR opened for the engine port unless the request names another one.
pub const DEFAULT_ALLOWED_CIDR: &str = "0.0.0.0/0";

/// Parameters for a new managed instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    /// Owning user reference.
    pub owner_id: String,
    /// Human-readable name.
    pub name: String,
    /// Engine name, `postgresql` or `mysql`.
    pub engine: String,
    /// Engine version.
    pub engine_version: String,
    /// Provider size class.
    pub instance_size: String,
    /// Master login name.
    pub master_username: String,
    /// Master login password.
    pub master_password: Secret,
    /// Engine port; the engine default when `None`.
    pub port: Option<u16>,
    /// Source CIDR for the engine port.
    pub allowed_cidr: Option<String>,
}

/// Builder for [`InstanceService`].
#[derive(Default)]
pub struct InstanceServiceBuilder {
    config: Option<Config>,
    clients: Option<ProviderClients>,
    store: Option<Arc<dyn InstanceStore>>,
}

impl InstanceServiceBuilder {
    /// Set the configuration. Defaults apply when not set.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the provider clients (required).
    pub fn provider(mut self, clients: ProviderClients) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Set the persistence store (required).
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the service.
    pub fn build(self) -> Result<InstanceService> {
        let clients = self.clients.ok_or(Error::NotConfigured("provider"))?;
        let store = self.store.ok_or(Error::NotConfigured("store"))?;
        Ok(InstanceService::new(
            self.config.unwrap_or_default(),
            clients,
            store,
        ))
    }
}

/// Entry point for provisioning and operating managed instances.
#[derive(Clone)]
pub struct InstanceService {
    config: Config,
    clients: ProviderClients,
    store: Arc<dyn InstanceStore>,
    locks: InstanceLocks,
    readiness: ReadinessTracker,
    dispatcher: CommandDispatcher,
    lifecycle: LifecycleManager,
    users: UserManager,
}

impl InstanceService {
    /// Create a builder.
    pub fn builder() -> InstanceServiceBuilder {
        InstanceServiceBuilder::default()
    }

    /// Wire the components.
    pub fn new(config: Config, clients: ProviderClients, store: Arc<dyn InstanceStore>) -> Self {
        let locks = InstanceLocks::new();
        let readiness = ReadinessTracker::with_config(clients.remote.clone(), config.readiness);
        let dispatcher = CommandDispatcher::new(&clients, readiness.clone())
            .with_execution_timeout(config.command_timeout);
        let lifecycle =
            LifecycleManager::new(clients.compute.clone(), store.clone(), locks.clone());
        let users = UserManager::new(dispatcher.clone(), store.clone(), locks.clone());

        Self {
            config,
            clients,
            store,
            locks,
            readiness,
            dispatcher,
            lifecycle,
            users,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Database user manager.
    pub fn users(&self) -> &UserManager {
        &self.users
    }

    /// Readiness tracker.
    pub fn readiness(&self) -> &ReadinessTracker {
        &self.readiness
    }

    /// Launch a machine with a boot script for the requested engine and record it.
    ///
    /// Returns once the provider accepted the launch; the instance is
    /// `pending` until the provider reports it running.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ManagedInstance> {
        let infra = self.config.infra.require()?;
        let engine: Engine = request.engine.parse()?;
        if request.owner_id.trim().is_empty() || request.name.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "owner and name are required".to_string(),
            ));
        }
        if request.instance_size.trim().is_empty() {
            return Err(Error::InvalidRequest("instance size is required".to_string()));
        }
        let port = request.port.unwrap_or_else(|| engine.default_port());

        let script = plan_boot(&BootRequest {
            engine: engine.as_str(),
            engine_version: &request.engine_version,
            master_username: &request.master_username,
            master_password: request.master_password.expose(),
            port,
        })?;

        let tags = HashMap::from([
            ("dbfleet:owner".to_string(), request.owner_id.clone()),
            ("dbfleet:engine".to_string(), engine.as_str().to_string()),
        ]);
        let launch = LaunchRequest {
            name: request.name.clone(),
            image_id: infra.image_id,
            instance_type: request.instance_size.clone(),
            subnet_id: infra.subnet_id.clone(),
            security_group_ids: vec![infra.security_group_id.clone()],
            instance_profile: Some(infra.instance_profile),
            key_name: infra.key_name,
            user_data: script.to_user_data(),
            tags,
        };
        let launched = self.clients.compute.launch_instance(&launch).await?;

        let mut instance = ManagedInstance::new(
            launched.instance_id.clone(),
            NewInstance {
                owner_id: request.owner_id,
                name: request.name,
                engine,
                engine_version: request.engine_version,
                instance_size: request.instance_size,
                placement: NetworkPlacement {
                    vpc_id: infra.vpc_id,
                    subnet_id: Some(infra.subnet_id),
                    security_group_ids: vec![infra.security_group_id.clone()],
                },
                port,
                master_username: request.master_username,
                master_password: request.master_password,
                launched_at: launched.launched_at,
            },
        );
        instance.status =
            InstanceStatus::from_provider_state(&launched.state).unwrap_or(InstanceStatus::Pending);

        let rule = PortRule::tcp(
            port,
            request
                .allowed_cidr
                .unwrap_or_else(|| DEFAULT_ALLOWED_CIDR.to_string()),
        );
        match self
            .clients
            .compute
            .authorize_ingress(&infra.security_group_id, &rule)
            .await
        {
            Ok(()) => instance.port_rules.push(rule),
            Err(e) => warn!(
                instance_id = %launched.instance_id,
                security_group_id = %infra.security_group_id,
                port,
                error = %e,
                "Failed to open engine port"
            ),
        }

        self.store.insert(&instance).await?;

        info!(
            instance_id = %instance.instance_id(),
            owner_id = %instance.owner_id,
            engine = %engine,
            engine_version = %instance.engine_version,
            port,
            "Instance launched"
        );
        Ok(instance)
    }

    /// Wait for the instance's agent with the configured budget.
    ///
    /// On failure the registered agents are logged for operators.
    pub async fn await_agent(&self, instance_id: &str) -> Result<()> {
        match self.readiness.await_ready_default(instance_id).await {
            Err(e @ Error::AgentNotReady { .. }) => {
                let agents = self.readiness.diagnostics().await;
                warn!(
                    instance_id = %instance_id,
                    registered_agents = agents.len(),
                    "Agent not ready, dumping registered agents"
                );
                for agent in &agents {
                    warn!(
                        instance_id = %agent.instance_id,
                        ping_status = %agent.ping_status,
                        agent_version = agent.agent_version.as_deref().unwrap_or("unknown"),
                        "Registered agent"
                    );
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Dispatch the engine health check.
    pub async fn verify_engine(&self, instance_id: &str) -> Result<CommandHandle> {
        let instance = self.load(instance_id).await?;
        let commands = commands::health_check(instance.engine, Some(&instance.master_password))?;
        self.dispatch(instance_id, &commands).await
    }

    async fn load(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.store
            .get(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    /// Load one instance, reconciled against the provider.
    pub async fn get_instance(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.lifecycle.get(instance_id).await
    }

    /// List instances, reconciled against the provider.
    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<ManagedInstance>> {
        self.lifecycle.list(filter).await
    }

    /// Start a stopped instance.
    pub async fn start_instance(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.lifecycle.start(instance_id).await
    }

    /// Stop a running instance.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.lifecycle.stop(instance_id).await
    }

    /// Terminate an instance.
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.lifecycle.terminate(instance_id).await
    }

    /// Send a command batch, serialized with other work on the instance.
    pub async fn dispatch(&self, instance_id: &str, commands: &[String]) -> Result<CommandHandle> {
        let _guard = self.locks.acquire(instance_id).await;
        self.dispatcher.dispatch(instance_id, commands).await
    }

    /// [`dispatch`](Self::dispatch) with explicit options.
    pub async fn dispatch_with(
        &self,
        instance_id: &str,
        commands: &[String],
        options: &DispatchOptions,
    ) -> Result<CommandHandle> {
        let _guard = self.locks.acquire(instance_id).await;
        self.dispatcher
            .dispatch_with(instance_id, commands, options)
            .await
    }

    /// Read the outcome of a dispatched batch.
    pub async fn fetch_result(
        &self,
        command_id: &CommandHandle,
        instance_id: &str,
    ) -> Result<CommandResult> {
        self.dispatcher.fetch_result(command_id, instance_id).await
    }

    /// Log events of an instance in `[start, end)`.
    pub async fn fetch_logs(
        &self,
        instance_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i32>,
    ) -> Result<Vec<LogEvent>> {
        if start >= end {
            return Err(Error::InvalidRequest(
                "log range start must be before end".to_string(),
            ));
        }
        self.load(instance_id).await?;

        let query = LogQuery {
            log_group: self.config.log_group.clone(),
            log_stream: instance_id.to_string(),
            start,
            end,
            limit,
        };
        Ok(self.clients.logs.fetch_log_events(&query).await?)
    }
}
