// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::engine::FailurePolicy;

/// signalflow configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Default checkpoint interval for source nodes; `None` disables checkpointing
    pub checkpoint_interval: Option<Duration>,
    /// Maximum database connections
    pub max_connections: u32,
    /// Record every committed switch-over in the audit relation
    pub audit_switches: bool,
    /// Refuse to declare a node whose relation is already active
    pub reject_active_duplicates: bool,
    /// What caller-facing operations do with store failures
    pub failure_policy: FailurePolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SIGNALFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SIGNALFLOW_CHECKPOINT_INTERVAL_SECS`: checkpoint interval (default: unset, disabled; 0 also disables)
    /// - `SIGNALFLOW_MAX_CONNECTIONS`: pool size (default: 5)
    /// - `SIGNALFLOW_AUDIT_SWITCHES`: record switch-overs (default: false)
    /// - `SIGNALFLOW_REJECT_ACTIVE_DUPLICATES`: reject active duplicates (default: false)
    /// - `SIGNALFLOW_FAILURE_POLICY`: `continue` or `propagate` (default: continue)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SIGNALFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SIGNALFLOW_DATABASE_URL"))?;

        let checkpoint_secs: u64 = std::env::var("SIGNALFLOW_CHECKPOINT_INTERVAL_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SIGNALFLOW_CHECKPOINT_INTERVAL_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let max_connections: u32 = std::env::var("SIGNALFLOW_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "SIGNALFLOW_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let audit_switches = parse_flag("SIGNALFLOW_AUDIT_SWITCHES")?;
        let reject_active_duplicates = parse_flag("SIGNALFLOW_REJECT_ACTIVE_DUPLICATES")?;

        let failure_policy = match std::env::var("SIGNALFLOW_FAILURE_POLICY") {
            Ok(value) => FailurePolicy::parse(&value).ok_or(ConfigError::Invalid(
                "SIGNALFLOW_FAILURE_POLICY",
                "must be 'continue' or 'propagate'",
            ))?,
            Err(_) => FailurePolicy::default(),
        };

        Ok(Self {
            database_url,
            checkpoint_interval: (checkpoint_secs > 0).then(|| Duration::from_secs(checkpoint_secs)),
            max_connections,
            audit_switches,
            reject_active_duplicates,
            failure_policy,
        })
    }

    /// The engine part of the configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            checkpoint_interval: self.checkpoint_interval,
            audit_switches: self.audit_switches,
            reject_active_duplicates: self.reject_active_duplicates,
            failure_policy: self.failure_policy,
        }
    }
}

fn parse_flag(key: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(false),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be a boolean")),
        },
    }
}

/// Engine settings, passed explicitly to [`crate::Engine::new`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Default checkpoint interval for nodes that do not set one.
    pub checkpoint_interval: Option<Duration>,
    /// Record committed switch-overs in the audit relation.
    pub audit_switches: bool,
    /// Fail `declare` when the relation is already active.
    pub reject_active_duplicates: bool,
    /// Failure policy for caller-facing operations.
    pub failure_policy: FailurePolicy,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
