// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for signalflow-core integration tests.
//!
//! Provides an in-memory engine driven by a manual clock, plus helpers for waiting on
//! asynchronous propagation.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use signalflow_core::{
    ColumnType, Commit, Engine, EngineConfig, FailureHook, LocalTransport, ManualClock,
    MemoryStore, NodeSpec, Row, SignalNode, SyncError, Timestamp, TimeSeriesStore, Value,
};

/// Upper bound for anything that waits on listener tasks.
pub const WAIT: Duration = Duration::from_secs(5);

/// Timestamp `secs` seconds after the Unix epoch.
pub fn ts(secs: i64) -> Timestamp {
    signalflow_core::value::from_micros(secs * 1_000_000)
}

/// Failure hook that records every report.
#[derive(Debug, Default)]
pub struct RecordingHook {
    pub failures: Mutex<Vec<(String, String, String)>>,
}

impl RecordingHook {
    pub fn codes(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, code)| code.clone())
            .collect()
    }
}

impl FailureHook for RecordingHook {
    fn on_failure(&self, node: &str, operation: &str, error: &SyncError) {
        self.failures.lock().unwrap().push((
            node.to_string(),
            operation.to_string(),
            error.error_code().to_string(),
        ));
    }
}

/// Engine over a memory store and an in-process transport.
pub struct TestContext {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub hook: Arc<RecordingHook>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(ts(1)));
        let hook = Arc::new(RecordingHook::default());
        let engine = Engine::new(
            store.clone(),
            Arc::new(LocalTransport::new()),
            clock.clone(),
            hook.clone(),
            config,
        );
        Self {
            engine,
            store,
            clock,
            hook,
        }
    }

    /// Declare a source node with one double column `value`.
    pub async fn source(&self, id: &str) -> SignalNode {
        self.engine
            .declare(NodeSpec::new(id).column("value", ColumnType::Double))
            .await
            .expect("Failed to declare source")
    }

    /// Declare a node copying `value` from its upstreams.
    pub async fn copy_of(&self, id: &str, upstream: &str) -> SignalNode {
        self.engine
            .declare(
                NodeSpec::new(id)
                    .column("value", ColumnType::Double)
                    .upstream("in", upstream),
            )
            .await
            .expect("Failed to declare copy node")
    }

    /// Commit `value` on `node` at `secs`, through the engine.
    pub async fn set_at(&self, node: &SignalNode, secs: i64, value: f64) -> Commit {
        self.clock.set(ts(secs));
        node.set("value", value)
            .await
            .expect("set failed")
            .expect("single-column set should commit")
    }

    /// Write a row straight into the store, bypassing notification.
    pub async fn insert_silently(&self, node: &SignalNode, secs: i64, value: f64) {
        let columns = node.columns().unwrap();
        let row = Row::from([("value".to_string(), Value::Float(value))]);
        self.store
            .insert_row(node.relation(), &columns, ts(secs), &row)
            .await
            .expect("insert failed");
    }

    /// Commit timestamps of `node` in seconds, ascending.
    pub async fn seconds(&self, node: &SignalNode) -> Vec<i64> {
        let mut list: Vec<i64> = node
            .timestamp_list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.timestamp())
            .collect();
        list.sort();
        list
    }
}

/// Receive the next commit or fail after [`WAIT`].
pub async fn next_commit(rx: &mut broadcast::Receiver<Commit>) -> Commit {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for a commit")
        .expect("Commit channel closed")
}

/// Poll `check` until it returns true or [`WAIT`] elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Skip the test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
