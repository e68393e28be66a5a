// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for dbfleet-core.

use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:.data/dbfleet.db?mode=rwc";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_LOG_GROUP: &str = "/dbfleet/instances";

/// Process configuration loaded once from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistence store URL.
    pub database_url: String,
    /// Provider client settings.
    pub provider: ProviderConfig,
    /// Launch-time infrastructure references.
    pub infra: InfraConfig,
    /// Remote agent readiness polling.
    pub readiness: ReadinessConfig,
    /// Execution timeout passed to the remote agent.
    pub command_timeout: Duration,
    /// Interval of the background reconciliation loop.
    pub reconcile_interval: Duration,
    /// Log group holding per-instance log streams.
    pub log_group: String,
}

/// Settings for building provider clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider region.
    pub region: String,
    /// Static credentials. `None` uses the provider's default chain.
    pub credentials: Option<StaticCredentials>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            credentials: None,
        }
    }
}

/// Access key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

/// Infrastructure references needed to launch a machine.
///
/// Every field is optional at load time so that read-only tooling can run
/// without them; [`InfraConfig::require`] checks them at launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfraConfig {
    /// Machine image.
    pub image_id: Option<String>,
    /// Subnet placement.
    pub subnet_id: Option<String>,
    /// Security group attached to every instance.
    pub security_group_id: Option<String>,
    /// VPC recorded on instances.
    pub vpc_id: Option<String>,
    /// Profile granting the management agent its permissions.
    pub instance_profile: Option<String>,
    /// SSH key pair.
    pub key_name: Option<String>,
}

/// Infrastructure references validated for a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInfra {
    /// Machine image.
    pub image_id: String,
    /// Subnet placement.
    pub subnet_id: String,
    /// Security group attached to every instance.
    pub security_group_id: String,
    /// VPC recorded on instances.
    pub vpc_id: Option<String>,
    /// Profile granting the management agent its permissions.
    pub instance_profile: String,
    /// SSH key pair.
    pub key_name: Option<String>,
}

impl InfraConfig {
    /// Check that everything a launch needs is present.
    pub fn require(&self) -> Result<LaunchInfra> {
        fn field(value: &Option<String>, name: &'static str) -> Result<String> {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or(Error::NotConfigured(name))
        }

        Ok(LaunchInfra {
            image_id: field(&self.image_id, "DBFLEET_AMI_ID")?,
            subnet_id: field(&self.subnet_id, "DBFLEET_SUBNET_ID")?,
            security_group_id: field(&self.security_group_id, "DBFLEET_SECURITY_GROUP_ID")?,
            vpc_id: self.vpc_id.clone(),
            instance_profile: field(&self.instance_profile, "DBFLEET_INSTANCE_PROFILE")?,
            key_name: self.key_name.clone(),
        })
    }
}

/// Remote agent readiness polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Maximum number of polls.
    pub max_attempts: u32,
    /// Fixed wait between polls.
    pub poll_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            provider: ProviderConfig::default(),
            infra: InfraConfig::default(),
            readiness: ReadinessConfig::default(),
            command_timeout: Duration::from_secs(600),
            reconcile_interval: Duration::from_secs(60),
            log_group: DEFAULT_LOG_GROUP.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let credentials = match (
            get("DBFLEET_AWS_ACCESS_KEY_ID"),
            get("DBFLEET_AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Some(StaticCredentials {
                access_key_id,
                secret_access_key,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialCredentials),
        };

        let max_attempts = parse_or(
            get("DBFLEET_READINESS_ATTEMPTS"),
            "DBFLEET_READINESS_ATTEMPTS",
            defaults.readiness.max_attempts,
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DBFLEET_READINESS_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        let interval_ms: u64 = parse_or(
            get("DBFLEET_READINESS_INTERVAL_MS"),
            "DBFLEET_READINESS_INTERVAL_MS",
            defaults.readiness.poll_interval.as_millis() as u64,
        )?;
        let command_timeout_secs: u64 = parse_or(
            get("DBFLEET_COMMAND_TIMEOUT_SECS"),
            "DBFLEET_COMMAND_TIMEOUT_SECS",
            defaults.command_timeout.as_secs(),
        )?;
        let reconcile_secs: u64 = parse_or(
            get("DBFLEET_RECONCILE_INTERVAL_SECS"),
            "DBFLEET_RECONCILE_INTERVAL_SECS",
            defaults.reconcile_interval.as_secs(),
        )?;

        Ok(Self {
            database_url: get("DBFLEET_DATABASE_URL").unwrap_or(defaults.database_url),
            provider: ProviderConfig {
                region: get("DBFLEET_AWS_REGION").unwrap_or(defaults.provider.region),
                credentials,
            },
            infra: InfraConfig {
                image_id: get("DBFLEET_AMI_ID"),
                subnet_id: get("DBFLEET_SUBNET_ID"),
                security_group_id: get("DBFLEET_SECURITY_GROUP_ID"),
                vpc_id: get("DBFLEET_VPC_ID"),
                instance_profile: get("DBFLEET_INSTANCE_PROFILE"),
                key_name: get("DBFLEET_KEY_NAME"),
            },
            readiness: ReadinessConfig {
                max_attempts,
                poll_interval: Duration::from_millis(interval_ms),
            },
            command_timeout: Duration::from_secs(command_timeout_secs),
            reconcile_interval: Duration::from_secs(reconcile_secs),
            log_group: get("DBFLEET_LOG_GROUP").unwrap_or(defaults.log_group),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> std::result::Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
    /// Only one half of the static credential pair was set.
    #[error(
        "DBFLEET_AWS_ACCESS_KEY_ID and DBFLEET_AWS_SECRET_ACCESS_KEY must be set together"
    )]
    PartialCredentials,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> std::result::Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.provider.region, "us-east-1");
        assert!(config.provider.credentials.is_none());
        assert_eq!(config.readiness.max_attempts, 30);
        assert_eq!(config.readiness.poll_interval, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(600));
        assert_eq!(config.log_group, "/dbfleet/instances");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DBFLEET_AWS_REGION", "eu-central-1"),
            ("DBFLEET_READINESS_ATTEMPTS", "5"),
            ("DBFLEET_READINESS_INTERVAL_MS", "250"),
            ("DBFLEET_AMI_ID", "ami-1"),
        ])
        .unwrap();
        assert_eq!(config.provider.region, "eu-central-1");
        assert_eq!(config.readiness.max_attempts, 5);
        assert_eq!(config.readiness.poll_interval, Duration::from_millis(250));
        assert_eq!(config.infra.image_id.as_deref(), Some("ami-1"));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("DBFLEET_COMMAND_TIMEOUT_SECS", "ten")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DBFLEET_COMMAND_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let err = load(&[("DBFLEET_AWS_ACCESS_KEY_ID", "AKIA")]).unwrap_err();
        assert!(matches!(err, ConfigError::PartialCredentials));
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let config = load(&[
            ("DBFLEET_AWS_ACCESS_KEY_ID", "AKIA"),
            ("DBFLEET_AWS_SECRET_ACCESS_KEY", "very-secret"),
        ])
        .unwrap();
        assert!(!format!("{:?}", config).contains("very-secret"));
    }

    #[test]
    fn test_infra_require_names_missing_field() {
        let infra = InfraConfig {
            image_id: Some("ami-1".to_string()),
            subnet_id: Some("subnet-1".to_string()),
            security_group_id: None,
            ..Default::default()
        };
        assert!(matches!(
            infra.require(),
            Err(Error::NotConfigured("DBFLEET_SECURITY_GROUP_ID"))
        ));
    }

    #[test]
    fn test_infra_require_complete() {
        let infra = InfraConfig {
            image_id: Some("ami-1".to_string()),
            subnet_id: Some("subnet-1".to_string()),
            security_group_id: Some("sg-1".to_string()),
            vpc_id: None,
            instance_profile: Some("dbfleet-agent".to_string()),
            key_name: None,
        };
        let launch = infra.require().unwrap();
        assert_eq!(launch.security_group_id, "sg-1");
        assert_eq!(launch.instance_profile, "dbfleet-agent");
    }
}
