// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! dbfleet core - Managed Database Instance Provisioning
//!
//! This crate provisions PostgreSQL and MySQL servers on provider-hosted
//! virtual machines and operates them afterwards through the provider's
//! remote-execution channel. There is no SSH and no direct database
//! connection: every change on a host is a shell command batch delivered
//! to the management agent running inside the machine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outer layer (HTTP API, CLI, ...)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      InstanceService (this crate)                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Launch    │  │  Lifecycle  │  │    User     │  │  Reconcile  │     │
//! │  │   Planner   │  │   Manager   │  │   Manager   │  │   Worker    │     │
//! │  └─────────────┘  └─────────────┘  └──────┬──────┘  └─────────────┘     │
//! │                                    ┌──────┴──────┐                      │
//! │                                    │  Command    │── Readiness Tracker  │
//! │                                    │  Dispatcher │                      │
//! │                                    └─────────────┘                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                 │
//!           ▼                                 ▼
//! ┌───────────────────────┐       ┌──────────────────────────────────────┐
//! │  Instance store       │       │  Provider (compute, remote exec,     │
//! │  (SQLite / memory)    │       │  logs): AWS or in-process mock       │
//! └───────────────────────┘       └──────────────────────────────────────┘
//! ```
//!
//! # Provisioning Flow
//!
//! 1. [`service::InstanceService::create_instance`] renders a boot script
//!    ([`planner`]) and launches the machine. It returns at once with status
//!    `pending`.
//! 2. [`service::InstanceService::await_agent`] polls the agent registry
//!    ([`readiness`]) until the management agent reports online.
//! 3. Everything after that goes through the [`dispatcher`]: user changes
//!    ([`users`], commands from [`commands`]), health checks and ad-hoc SQL.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DBFLEET_DATABASE_URL` | No | `sqlite:.data/dbfleet.db?mode=rwc` | Instance store |
//! | `DBFLEET_AWS_REGION` | No | `us-east-1` | Provider region |
//! | `DBFLEET_AWS_ACCESS_KEY_ID` | No | - | Static credentials (with the secret key) |
//! | `DBFLEET_AWS_SECRET_ACCESS_KEY` | No | - | Static credentials (with the key id) |
//! | `DBFLEET_AMI_ID` | For launch | - | Machine image |
//! | `DBFLEET_SUBNET_ID` | For launch | - | Subnet placement |
//! | `DBFLEET_SECURITY_GROUP_ID` | For launch | - | Security group for the engine port |
//! | `DBFLEET_INSTANCE_PROFILE` | For launch | - | Profile granting the agent its permissions |
//! | `DBFLEET_VPC_ID` | No | - | VPC reference recorded on instances |
//! | `DBFLEET_KEY_NAME` | No | - | SSH key pair |
//! | `DBFLEET_READINESS_ATTEMPTS` | No | `30` | Agent readiness polls |
//! | `DBFLEET_READINESS_INTERVAL_MS` | No | `10000` | Delay between readiness polls |
//! | `DBFLEET_COMMAND_TIMEOUT_SECS` | No | `600` | Remote execution timeout |
//! | `DBFLEET_RECONCILE_INTERVAL_SECS` | No | `60` | Background reconciliation interval |
//! | `DBFLEET_LOG_GROUP` | No | `/dbfleet/instances` | Log group of instance logs |
//!
//! # Modules
//!
//! - [`commands`]: Engine-specific user and maintenance command generation
//! - [`config`]: Configuration from environment variables
//! - [`dispatcher`]: Remote command dispatch and result retrieval
//! - [`lifecycle`]: Start/stop/terminate state machine and reconciliation
//! - [`planner`]: Boot script generation for new instances
//! - [`provider`]: Provider API traits, AWS and mock backends
//! - [`readiness`]: Management agent readiness polling
//! - [`service`]: The provisioning facade
//! - [`store`]: Instance persistence
//! - [`users`]: Database user management

#![warn(missing_docs)]

/// Engine-specific user and maintenance command generation.
pub mod commands;

/// Configuration loaded from environment variables.
pub mod config;

/// Remote command dispatch.
pub mod dispatcher;

/// Error types.
pub mod error;

/// Lifecycle state machine and reconciliation.
pub mod lifecycle;

/// Per-instance operation serialization.
pub mod locks;

/// Managed instance data model.
pub mod model;

/// Boot script generation.
pub mod planner;

/// Provider API traits and backends.
pub mod provider;

/// Agent readiness polling.
pub mod readiness;

/// Background reconciliation worker.
pub mod reconcile_worker;

/// Bounded polling helper.
pub mod retry;

/// Provisioning facade.
pub mod service;

/// Shell and SQL quoting.
pub mod shell;

/// Instance persistence.
pub mod store;

/// Database user management.
pub mod users;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{Engine, InstanceStatus, ManagedInstance, Secret};
pub use service::{CreateInstanceRequest, InstanceService};
