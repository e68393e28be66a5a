// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed instance data model.
//!
//! Records in this module are what the persistence store holds and what the
//! outer layer receives. Passwords are wrapped in [`Secret`], which never
//! serializes and redacts itself in `Debug` output.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// PostgreSQL grant keywords accepted for database users.
pub const POSTGRES_PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
    "TRIGGER",
];

/// MySQL grant keywords accepted for database users.
pub const MYSQL_PRIVILEGES: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "INDEX",
];

/// Database engine installed on a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// PostgreSQL server.
    Postgresql,
    /// MySQL server.
    Mysql,
}

impl Engine {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgresql => "postgresql",
            Engine::Mysql => "mysql",
        }
    }

    /// Port the engine listens on unless the caller picks another one.
    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Postgresql => 5432,
            Engine::Mysql => 3306,
        }
    }

    /// Name of the systemd unit running the engine.
    pub fn service_name(&self) -> &'static str {
        match self {
            Engine::Postgresql => "postgresql",
            Engine::Mysql => "mysql",
        }
    }

    /// Grant keywords this engine accepts for database users.
    pub fn privileges(&self) -> &'static [&'static str] {
        match self {
            Engine::Postgresql => POSTGRES_PRIVILEGES,
            Engine::Mysql => MYSQL_PRIVILEGES,
        }
    }

    /// Whether `username` names an account the engine itself owns.
    ///
    /// PostgreSQL: `postgres` and the `pg_` role namespace. MySQL: `root`
    /// and the `mysql.*` system accounts. Compared case-insensitively.
    pub fn is_reserved_username(&self, username: &str) -> bool {
        let name = username.to_ascii_lowercase();
        match self {
            Engine::Postgresql => name == "postgres" || name.starts_with("pg_"),
            Engine::Mysql => name == "root" || name.starts_with("mysql."),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Engine::Postgresql),
            "mysql" => Ok(Engine::Mysql),
            _ => Err(Error::UnsupportedEngine(s.to_string())),
        }
    }
}

/// Lifecycle status of a managed instance.
///
/// ```text
///   pending ──► running ──► stopping ──► stopped
///      ▲                                    │
///      └──────────────── start ─────────────┘
///
///   (any) ── terminate ──► terminating ──► terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Launch or start requested, not yet running.
    Pending,
    /// Provider reports the machine as running.
    Running,
    /// Stop requested.
    Stopping,
    /// Machine is stopped.
    Stopped,
    /// Termination requested.
    Terminating,
    /// Machine is gone. Terminal.
    Terminated,
}

impl InstanceStatus {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Terminated)
    }

    /// Whether this is an in-between state the provider will move out of on its own.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Pending | InstanceStatus::Stopping | InstanceStatus::Terminating
        )
    }

    /// Transitional state every entry into this settled state passes through.
    pub fn transitional_predecessor(&self) -> Option<Self> {
        match self {
            InstanceStatus::Running => Some(InstanceStatus::Pending),
            InstanceStatus::Stopped => Some(InstanceStatus::Stopping),
            InstanceStatus::Terminated => Some(InstanceStatus::Terminating),
            _ => None,
        }
    }

    /// Status to record when the provider reports `observed` for an instance
    /// currently at `self`.
    ///
    /// A settled state is only entered from itself or its transitional
    /// predecessor; any other jump records the predecessor first and the next
    /// reconciliation completes it. `terminating` only ever moves on to
    /// `terminated`.
    pub fn step_toward(self, observed: Self) -> Self {
        use InstanceStatus::*;

        if self == Terminating && !matches!(observed, Terminating | Terminated) {
            return Terminating;
        }
        match observed.transitional_predecessor() {
            Some(via) if self != observed && self != via => via,
            _ => observed,
        }
    }

    /// Map a provider state name onto a status.
    ///
    /// Returns `None` for states this model has no counterpart for.
    pub fn from_provider_state(state: &str) -> Option<Self> {
        match state.to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceStatus::Pending),
            "running" => Some(InstanceStatus::Running),
            "stopping" => Some(InstanceStatus::Stopping),
            "stopped" => Some(InstanceStatus::Stopped),
            "shutting-down" | "terminating" => Some(InstanceStatus::Terminating),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            "terminating" => Ok(InstanceStatus::Terminating),
            "terminated" => Ok(InstanceStatus::Terminated),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// A password or other credential that must never leave the process in clear text.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the clear-text value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the wrapped value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Inbound network rule opened for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    /// IP protocol, e.g. `tcp`.
    pub protocol: String,
    /// First port of the range.
    pub from_port: u16,
    /// Last port of the range.
    pub to_port: u16,
    /// Source CIDR block.
    pub cidr: String,
}

impl PortRule {
    /// Single TCP port open to a CIDR block.
    pub fn tcp(port: u16, cidr: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            cidr: cidr.into(),
        }
    }
}

/// Where the instance lives on the provider network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlacement {
    /// VPC reference.
    pub vpc_id: Option<String>,
    /// Subnet reference.
    pub subnet_id: Option<String>,
    /// Security groups attached to the machine.
    pub security_group_ids: Vec<String>,
}

/// A database login created on a managed instance.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseUser {
    /// Login name, unique within the instance.
    pub username: String,
    /// Login password.
    #[serde(skip_serializing)]
    pub password: Secret,
    /// Engine-specific grant keywords.
    pub privileges: BTreeSet<String>,
    /// When the user was recorded.
    pub created_at: DateTime<Utc>,
}

/// A database server running on a provider-hosted virtual machine.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedInstance {
    instance_id: String,
    /// Owning user reference.
    pub owner_id: String,
    /// Human-readable name.
    pub name: String,
    /// Installed engine.
    pub engine: Engine,
    /// Installed engine version.
    pub engine_version: String,
    /// Provider size class (machine type).
    pub instance_size: String,
    /// Network placement.
    pub placement: NetworkPlacement,
    /// Port the engine listens on.
    pub port: u16,
    /// Master account name.
    pub master_username: String,
    /// Master account password.
    #[serde(skip_serializing)]
    pub master_password: Secret,
    /// Database users created through the user-management path, in creation order.
    pub database_users: Vec<DatabaseUser>,
    /// Public address, only known while running.
    pub public_ip: Option<String>,
    /// Private address, only known once running.
    pub private_ip: Option<String>,
    /// Inbound rules opened for the instance.
    pub port_rules: Vec<PortRule>,
    /// Last known lifecycle status.
    pub status: InstanceStatus,
    /// When the machine was launched.
    pub launched_at: DateTime<Utc>,
    /// When termination was requested.
    pub terminated_at: Option<DateTime<Utc>>,
    /// When the status was last reconciled against the provider.
    pub last_status_check: Option<DateTime<Utc>>,
}

/// Everything needed to record a freshly launched instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Owning user reference.
    pub owner_id: String,
    /// Human-readable name.
    pub name: String,
    /// Installed engine.
    pub engine: Engine,
    /// Installed engine version.
    pub engine_version: String,
    /// Provider size class.
    pub instance_size: String,
    /// Network placement.
    pub placement: NetworkPlacement,
    /// Engine port.
    pub port: u16,
    /// Master account name.
    pub master_username: String,
    /// Master account password.
    pub master_password: Secret,
    /// Launch time reported by the provider.
    pub launched_at: DateTime<Utc>,
}

impl ManagedInstance {
    /// Create a record for an instance the provider just accepted.
    pub fn new(instance_id: impl Into<String>, new: NewInstance) -> Self {
        Self {
            instance_id: instance_id.into(),
            owner_id: new.owner_id,
            name: new.name,
            engine: new.engine,
            engine_version: new.engine_version,
            instance_size: new.instance_size,
            placement: new.placement,
            port: new.port,
            master_username: new.master_username,
            master_password: new.master_password,
            database_users: Vec::new(),
            public_ip: None,
            private_ip: None,
            port_rules: Vec::new(),
            status: InstanceStatus::Pending,
            launched_at: new.launched_at,
            terminated_at: None,
            last_status_check: None,
        }
    }

    /// Provider instance handle. Immutable once assigned.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Look up a database user by name.
    pub fn user(&self, username: &str) -> Option<&DatabaseUser> {
        self.database_users.iter().find(|u| u.username == username)
    }

    /// Whether the name refers to the master account.
    pub fn is_master(&self, username: &str) -> bool {
        self.master_username == username
    }

    /// Whether user operations must leave this account alone: the master
    /// login or an engine-reserved account.
    pub fn is_protected(&self, username: &str) -> bool {
        self.is_master(username) || self.engine.is_reserved_username(username)
    }
}

/// Normalize and check a privilege list against the engine vocabulary.
///
/// Keywords are upper-cased and de-duplicated, keeping the first occurrence.
pub fn validate_privileges(engine: Engine, privileges: &[String]) -> Result<Vec<String>> {
    if privileges.is_empty() {
        return Err(Error::InvalidRequest(
            "at least one privilege is required".to_string(),
        ));
    }

    let allowed = engine.privileges();
    let mut normalized: Vec<String> = Vec::with_capacity(privileges.len());
    for privilege in privileges {
        let upper = privilege.trim().to_ascii_uppercase();
        if !allowed.contains(&upper.as_str()) {
            return Err(Error::InvalidRequest(format!(
                "privilege '{}' is not valid for {} (allowed: {})",
                privilege,
                engine,
                allowed.join(", ")
            )));
        }
        if !normalized.contains(&upper) {
            normalized.push(upper);
        }
    }
    Ok(normalized)
}

/// Check that a name is usable as an unquoted SQL identifier.
pub fn validate_username(username: &str) -> Result<()> {
    let mut chars = username.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_first || !valid_rest || username.len() > 63 {
        return Err(Error::InvalidRequest(format!(
            "invalid username '{}': must start with a letter or underscore, \
             contain only letters, digits and underscores, and be at most 63 characters",
            username
        )));
    }
    Ok(())
}
