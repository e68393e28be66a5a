// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for dbfleet-core.

use thiserror::Error;

use crate::lifecycle::LifecycleAction;
use crate::model::InstanceStatus;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// A provider API call failed.
    #[error("Provider API error: {0}")]
    ProviderApi(#[from] crate::provider::ProviderError),

    /// The requested database engine is not one of the supported engines.
    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// The requested engine/action combination cannot be generated.
    #[error("Unsupported operation '{action}' for engine '{engine}'")]
    UnsupportedOperation {
        /// Engine name as requested.
        engine: String,
        /// Action name as requested.
        action: String,
    },

    /// The remote management agent never came online.
    #[error("Remote agent on instance '{instance_id}' not ready after {attempts} attempts")]
    AgentNotReady {
        /// Provider instance handle.
        instance_id: String,
        /// Number of polls performed.
        attempts: u32,
        /// Last transient polling error, if any.
        last_error: Option<String>,
    },

    /// The provider has no invocation for this command/instance pair.
    #[error("Command '{command_id}' not found on instance '{instance_id}'")]
    CommandNotFound {
        /// Command handle.
        command_id: String,
        /// Provider instance handle.
        instance_id: String,
    },

    /// The lifecycle action is not allowed from the current status.
    #[error("Cannot {action} instance '{instance_id}' while it is {current}")]
    InvalidTransition {
        /// Provider instance handle.
        instance_id: String,
        /// Rejected action.
        action: LifecycleAction,
        /// Status at the time of the request.
        current: InstanceStatus,
    },

    /// Commands can only be dispatched to running instances.
    #[error("Instance '{instance_id}' is not running (provider state: {state})")]
    NotRunning {
        /// Provider instance handle.
        instance_id: String,
        /// Provider-reported state.
        state: String,
    },

    /// Required infrastructure configuration is missing.
    #[error("Missing infrastructure configuration: {0}")]
    NotConfigured(&'static str),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Database user was not found on the instance.
    #[error("User '{username}' not found on instance '{instance_id}'")]
    UserNotFound {
        /// Provider instance handle.
        instance_id: String,
        /// Database username.
        username: String,
    },

    /// Database user already exists on the instance.
    #[error("User '{username}' already exists on instance '{instance_id}'")]
    UserAlreadyExists {
        /// Provider instance handle.
        instance_id: String,
        /// Database username.
        username: String,
    },

    /// The master account and engine-reserved accounts cannot be modified
    /// through the user-management path.
    #[error("User '{0}' is a protected account")]
    ProtectedUser(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::ProviderApi(_) => "PROVIDER_API_ERROR",
            Self::UnsupportedEngine(_) => "UNSUPPORTED_ENGINE",
            Self::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            Self::AgentNotReady { .. } => "AGENT_NOT_READY",
            Self::CommandNotFound { .. } => "COMMAND_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NotRunning { .. } => "NOT_RUNNING",
            Self::NotConfigured(_) => "NOT_CONFIGURED",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
            Self::UserAlreadyExists { .. } => "USER_ALREADY_EXISTS",
            Self::ProtectedUser(_) => "PROTECTED_USER",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

/// Result type using the core Error.
pub type Result<T> = std::result::Result<T, Error>;
