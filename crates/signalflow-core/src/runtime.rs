// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for signalflow-core.
//!
//! [`SignalRuntime`] wires a store, a notification transport, a clock and a failure hook
//! into an [`Engine`] and owns its shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use signalflow_core::persistence::SqliteStore;
//! use signalflow_core::runtime::SignalRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/signals.db").await?);
//!
//!     let runtime = SignalRuntime::builder()
//!         .store(store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let engine = runtime.engine();
//!     // ... declare nodes ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, EngineConfig};
use crate::engine::{Engine, FailureHook, TracingFailureHook};
use crate::persistence::{PostgresStore, SqliteStore, TimeSeriesStore};
use crate::transport::{LocalTransport, NotificationTransport, PgNotifyTransport};

/// Builder for creating a [`SignalRuntime`].
#[derive(Default)]
pub struct SignalRuntimeBuilder {
    store: Option<Arc<dyn TimeSeriesStore>>,
    transport: Option<Arc<dyn NotificationTransport>>,
    clock: Option<Arc<dyn Clock>>,
    hook: Option<Arc<dyn FailureHook>>,
    engine: EngineConfig,
    reset_registry: bool,
}

impl std::fmt::Debug for SignalRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("transport", &self.transport.as_ref().map(|_| "..."))
            .field("clock", &self.clock.as_ref().map(|_| "..."))
            .field("hook", &self.hook.as_ref().map(|_| "..."))
            .field("engine", &self.engine)
            .field("reset_registry", &self.reset_registry)
            .finish()
    }
}

impl SignalRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-series store (required).
    pub fn store(mut self, store: Arc<dyn TimeSeriesStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the notification transport.
    ///
    /// Default: an in-process [`LocalTransport`].
    pub fn transport(mut self, transport: Arc<dyn NotificationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the clock. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the failure hook. Default: [`TracingFailureHook`].
    pub fn failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Set the engine configuration.
    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    /// Mark every registered relation inactive on start.
    ///
    /// Use when this process is the only owner of the store.
    pub fn reset_registry(mut self, reset: bool) -> Self {
        self.reset_registry = reset;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<SignalRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        Ok(SignalRuntimeConfig {
            store,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(LocalTransport::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            hook: self.hook.unwrap_or_else(|| Arc::new(TracingFailureHook)),
            engine: self.engine,
            reset_registry: self.reset_registry,
        })
    }
}

/// Configuration for a [`SignalRuntime`].
pub struct SignalRuntimeConfig {
    store: Arc<dyn TimeSeriesStore>,
    transport: Arc<dyn NotificationTransport>,
    clock: Arc<dyn Clock>,
    hook: Arc<dyn FailureHook>,
    engine: EngineConfig,
    reset_registry: bool,
}

impl std::fmt::Debug for SignalRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRuntimeConfig")
            .field("store", &"...")
            .field("transport", &"...")
            .field("engine", &self.engine)
            .field("reset_registry", &self.reset_registry)
            .finish()
    }
}

impl SignalRuntimeConfig {
    /// Check the store and create the engine.
    pub async fn start(self) -> Result<SignalRuntime> {
        self.store.health_check().await?;
        if self.reset_registry {
            let stale = self.store.deactivate_all().await?;
            if stale > 0 {
                warn!(relations = stale, "Reset stale registry entries");
            }
        }

        let runtime_id = Uuid::new_v4();
        let engine = Engine::new(
            self.store,
            self.transport,
            self.clock,
            self.hook,
            self.engine,
        );

        info!(
            runtime_id = %runtime_id,
            checkpoint_interval_secs = engine.config().checkpoint_interval.map(|d| d.as_secs()),
            failure_policy = ?engine.config().failure_policy,
            "SignalRuntime started"
        );

        Ok(SignalRuntime { engine, runtime_id })
    }
}

/// A running signal engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
#[derive(Debug)]
pub struct SignalRuntime {
    engine: Engine,
    runtime_id: Uuid,
}

impl SignalRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SignalRuntimeBuilder {
        SignalRuntimeBuilder::new()
    }

    /// Connect to the database named in `config` and start.
    ///
    /// `sqlite:` URLs use [`SqliteStore`] with an in-process transport; `postgres://`
    /// URLs use [`PostgresStore`] with LISTEN/NOTIFY. Migrations run on connect and
    /// stale registry entries are reset.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let url = config.database_url.as_str();
        let builder = if url.starts_with("sqlite:") {
            let store = SqliteStore::connect(url, config.max_connections).await?;
            Self::builder().store(Arc::new(store))
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let store = PostgresStore::connect(url, config.max_connections).await?;
            let transport = PgNotifyTransport::new(store.pool().clone());
            Self::builder()
                .store(Arc::new(store))
                .transport(Arc::new(transport))
        } else {
            anyhow::bail!("unsupported database URL scheme: {}", url);
        };

        builder
            .engine_config(config.engine_config())
            .reset_registry(true)
            .build()?
            .start()
            .await
    }

    /// Unique id of this runtime, for log correlation.
    pub fn runtime_id(&self) -> Uuid {
        self.runtime_id
    }

    /// The engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Stop every task and deactivate the declared relations.
    pub async fn shutdown(self) -> Result<()> {
        info!(runtime_id = %self.runtime_id, "SignalRuntime shutting down...");
        self.engine.shutdown().await;
        info!(runtime_id = %self.runtime_id, "SignalRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;
    use crate::persistence::MemoryStore;
    use crate::value::ColumnType;

    #[test]
    fn test_builder_requires_store() {
        let result = SignalRuntimeBuilder::new().build();
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "store is required");
    }

    #[test]
    fn test_builder_defaults() {
        let builder = SignalRuntime::builder();
        assert!(builder.store.is_none());
        let config = builder.store(Arc::new(MemoryStore::new())).build().unwrap();
        assert!(!config.reset_registry);
        assert!(format!("{:?}", config).contains("SignalRuntimeConfig"));
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let runtime = SignalRuntime::builder()
            .store(store.clone())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        runtime
            .engine()
            .declare(NodeSpec::new("Temp").column("value", ColumnType::Double))
            .await
            .unwrap();
        assert!(store.is_active("temp").await.unwrap());

        runtime.shutdown().await.unwrap();
        assert!(!store.is_active("temp").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_registry_on_start() {
        let store = Arc::new(MemoryStore::new());
        store.register_relation("stale", &[]).await.unwrap();

        let runtime = SignalRuntime::builder()
            .store(store.clone())
            .reset_registry(true)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(!store.is_active("stale").await.unwrap());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            checkpoint_interval: None,
            max_connections: 1,
            audit_switches: false,
            reject_active_duplicates: false,
            failure_policy: Default::default(),
        };
        let runtime = SignalRuntime::from_config(&config).await.unwrap();
        runtime.engine().health_check().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_rejects_unknown_scheme() {
        let config = Config {
            database_url: "mysql://localhost/signals".to_string(),
            checkpoint_interval: None,
            max_connections: 1,
            audit_switches: false,
            reject_active_duplicates: false,
            failure_policy: Default::default(),
        };
        let err = SignalRuntime::from_config(&config).await.unwrap_err();
        assert!(err.to_string().contains("unsupported database URL scheme"));
    }
}
