// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database user management on managed instances.
//!
//! Each operation validates the request, generates the engine commands,
//! dispatches them and then updates the stored user list. What happens to
//! the stored list when dispatch fails is decided per engine by
//! [`RecordPolicy`]:
//!
//! | Engine     | Policy         | On dispatch failure                         |
//! |------------|----------------|---------------------------------------------|
//! | PostgreSQL | `RecordAnyway` | record the change, report the dispatch error |
//! | MySQL      | `RejectRecord` | leave the record alone, return the error     |
//!
//! Operations on one instance are serialized through [`InstanceLocks`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::commands::{self, CommandRequest, UserAction};
use crate::dispatcher::{CommandDispatcher, CommandHandle};
use crate::error::{Error, Result};
use crate::locks::InstanceLocks;
use crate::model::{
    DatabaseUser, Engine, ManagedInstance, Secret, validate_privileges, validate_username,
};
use crate::store::InstanceStore;

/// What to do with the stored user list when dispatch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    /// Apply the change to the record and report the dispatch error.
    RecordAnyway,
    /// Keep the record unchanged and fail.
    RejectRecord,
}

impl RecordPolicy {
    /// Built-in policy for an engine.
    pub fn for_engine(engine: Engine) -> Self {
        match engine {
            Engine::Postgresql => RecordPolicy::RecordAnyway,
            Engine::Mysql => RecordPolicy::RejectRecord,
        }
    }
}

/// Result of a user-changing operation whose change was recorded.
#[derive(Debug, Clone, Serialize)]
pub struct UserOutcome {
    /// Handle of the dispatched batch, if dispatch succeeded.
    pub command_id: Option<CommandHandle>,
    /// Dispatch failure, if the change was recorded regardless.
    pub dispatch_error: Option<String>,
}

/// Creates, modifies and removes database users.
#[derive(Clone)]
pub struct UserManager {
    dispatcher: CommandDispatcher,
    store: Arc<dyn InstanceStore>,
    locks: InstanceLocks,
    policies: HashMap<Engine, RecordPolicy>,
}

impl UserManager {
    /// Create a manager with the built-in record policies.
    pub fn new(
        dispatcher: CommandDispatcher,
        store: Arc<dyn InstanceStore>,
        locks: InstanceLocks,
    ) -> Self {
        let policies = [Engine::Postgresql, Engine::Mysql]
            .into_iter()
            .map(|engine| (engine, RecordPolicy::for_engine(engine)))
            .collect();
        Self {
            dispatcher,
            store,
            locks,
            policies,
        }
    }

    /// Override the record policy of one engine.
    pub fn with_policy(mut self, engine: Engine, policy: RecordPolicy) -> Self {
        self.policies.insert(engine, policy);
        self
    }

    /// Record policy in effect for an engine.
    pub fn policy(&self, engine: Engine) -> RecordPolicy {
        self.policies
            .get(&engine)
            .copied()
            .unwrap_or_else(|| RecordPolicy::for_engine(engine))
    }

    async fn load(&self, instance_id: &str) -> Result<ManagedInstance> {
        self.store
            .get(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }

    fn existing_user<'a>(
        instance: &'a ManagedInstance,
        username: &str,
    ) -> Result<&'a DatabaseUser> {
        if instance.is_protected(username) {
            return Err(Error::ProtectedUser(username.to_string()));
        }
        instance.user(username).ok_or_else(|| Error::UserNotFound {
            instance_id: instance.instance_id().to_string(),
            username: username.to_string(),
        })
    }

    /// Dispatch `commands`, then apply `mutate` to the record as the engine policy allows.
    async fn dispatch_and_record<F>(
        &self,
        mut instance: ManagedInstance,
        action: UserAction,
        username: &str,
        commands: Vec<String>,
        mutate: F,
    ) -> Result<UserOutcome>
    where
        F: FnOnce(&mut ManagedInstance),
    {
        let instance_id = instance.instance_id().to_string();
        let policy = self.policy(instance.engine);

        let (command_id, dispatch_error) =
            match self.dispatcher.dispatch(&instance_id, &commands).await {
                Ok(handle) => (Some(handle), None),
                Err(e) if policy == RecordPolicy::RejectRecord => {
                    warn!(
                        instance_id = %instance_id,
                        username = %username,
                        action = %action,
                        error = %e,
                        "User command dispatch failed, record left unchanged"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance_id,
                        username = %username,
                        action = %action,
                        error = %e,
                        "User command dispatch failed, recording change anyway"
                    );
                    (None, Some(e.to_string()))
                }
            };

        mutate(&mut instance);
        self.store.save(&instance).await?;

        info!(
            instance_id = %instance_id,
            username = %username,
            action = %action,
            command_id = command_id.as_ref().map(|c| c.as_str()).unwrap_or("-"),
            "User change recorded"
        );

        Ok(UserOutcome {
            command_id,
            dispatch_error,
        })
    }

    /// Create a database user with the given privileges.
    pub async fn create_user(
        &self,
        instance_id: &str,
        username: &str,
        password: Secret,
        privileges: &[String],
    ) -> Result<UserOutcome> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(Error::InvalidRequest("password must not be empty".to_string()));
        }

        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        if instance.is_protected(username) {
            return Err(Error::ProtectedUser(username.to_string()));
        }
        if instance.user(username).is_some() {
            return Err(Error::UserAlreadyExists {
                instance_id: instance_id.to_string(),
                username: username.to_string(),
            });
        }
        let privileges = validate_privileges(instance.engine, privileges)?;

        let commands = commands::generate_for(
            instance.engine,
            UserAction::CreateUser,
            &CommandRequest {
                username: username.to_string(),
                password: Some(password.clone()),
                privileges: privileges.clone(),
                master_password: Some(instance.master_password.clone()),
            },
        )?;

        let user = DatabaseUser {
            username: username.to_string(),
            password,
            privileges: privileges.into_iter().collect(),
            created_at: Utc::now(),
        };
        self.dispatch_and_record(
            instance,
            UserAction::CreateUser,
            username,
            commands,
            move |instance| instance.database_users.push(user),
        )
        .await
    }

    /// Revoke everything from a user and drop it.
    pub async fn delete_user(&self, instance_id: &str, username: &str) -> Result<UserOutcome> {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        Self::existing_user(&instance, username)?;

        let commands = commands::generate_for(
            instance.engine,
            UserAction::DeleteUser,
            &CommandRequest {
                username: username.to_string(),
                master_password: Some(instance.master_password.clone()),
                ..Default::default()
            },
        )?;

        let name = username.to_string();
        self.dispatch_and_record(
            instance,
            UserAction::DeleteUser,
            username,
            commands,
            move |instance| instance.database_users.retain(|u| u.username != name),
        )
        .await
    }

    /// Set a new password for a user.
    pub async fn change_password(
        &self,
        instance_id: &str,
        username: &str,
        new_password: Secret,
    ) -> Result<UserOutcome> {
        if new_password.is_empty() {
            return Err(Error::InvalidRequest("password must not be empty".to_string()));
        }

        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        Self::existing_user(&instance, username)?;

        let commands = commands::generate_for(
            instance.engine,
            UserAction::ChangePassword,
            &CommandRequest {
                username: username.to_string(),
                password: Some(new_password.clone()),
                master_password: Some(instance.master_password.clone()),
                ..Default::default()
            },
        )?;

        let name = username.to_string();
        self.dispatch_and_record(
            instance,
            UserAction::ChangePassword,
            username,
            commands,
            move |instance| {
                if let Some(user) = instance
                    .database_users
                    .iter_mut()
                    .find(|u| u.username == name)
                {
                    user.password = new_password;
                }
            },
        )
        .await
    }

    /// Add privileges to a user.
    pub async fn grant_privileges(
        &self,
        instance_id: &str,
        username: &str,
        privileges: &[String],
    ) -> Result<UserOutcome> {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        Self::existing_user(&instance, username)?;
        let privileges = validate_privileges(instance.engine, privileges)?;

        let commands = commands::generate_for(
            instance.engine,
            UserAction::GrantPrivileges,
            &CommandRequest {
                username: username.to_string(),
                privileges: privileges.clone(),
                master_password: Some(instance.master_password.clone()),
                ..Default::default()
            },
        )?;

        let name = username.to_string();
        self.dispatch_and_record(
            instance,
            UserAction::GrantPrivileges,
            username,
            commands,
            move |instance| {
                if let Some(user) = instance
                    .database_users
                    .iter_mut()
                    .find(|u| u.username == name)
                {
                    user.privileges.extend(privileges);
                }
            },
        )
        .await
    }

    /// Users recorded for an instance, in creation order.
    pub async fn recorded_users(&self, instance_id: &str) -> Result<Vec<DatabaseUser>> {
        Ok(self.load(instance_id).await?.database_users)
    }

    /// Ask the engine for its login list. Read the output with the returned handle.
    pub async fn list_users(&self, instance_id: &str) -> Result<CommandHandle> {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        let commands = commands::generate_for(
            instance.engine,
            UserAction::ListUsers,
            &CommandRequest {
                master_password: Some(instance.master_password.clone()),
                ..Default::default()
            },
        )?;
        self.dispatcher.dispatch(instance_id, &commands).await
    }

    /// Re-apply a user's recorded privileges.
    pub async fn repair_privileges(
        &self,
        instance_id: &str,
        username: &str,
    ) -> Result<CommandHandle> {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        let user = Self::existing_user(&instance, username)?;
        let privileges: Vec<String> = user.privileges.iter().cloned().collect();

        let commands = commands::repair_privileges(
            instance.engine,
            username,
            &privileges,
            Some(&instance.master_password),
        )?;
        info!(instance_id = %instance_id, username = %username, "Repairing user privileges");
        self.dispatcher.dispatch(instance_id, &commands).await
    }

    /// Run free-form SQL as the superuser.
    pub async fn run_sql(
        &self,
        instance_id: &str,
        database: Option<&str>,
        sql: &str,
    ) -> Result<CommandHandle> {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = self.load(instance_id).await?;
        let commands = commands::run_sql(
            instance.engine,
            database,
            sql,
            Some(&instance.master_password),
        )?;
        self.dispatcher.dispatch(instance_id, &commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        assert_eq!(
            RecordPolicy::for_engine(Engine::Postgresql),
            RecordPolicy::RecordAnyway
        );
        assert_eq!(
            RecordPolicy::for_engine(Engine::Mysql),
            RecordPolicy::RejectRecord
        );
    }
}
