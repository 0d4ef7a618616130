// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests over PostgreSQL with LISTEN/NOTIFY propagation.
//!
//! Run with `TEST_DATABASE_URL=postgres://...`; skipped otherwise.

#[macro_use]
mod common;

use std::sync::Arc;

use common::*;
use signalflow_core::{
    ColumnType, EngineConfig, NodeSpec, PgNotifyTransport, PostgresStore, SignalRuntime,
    SwitchOutcome, TimeSeriesStore, Value,
};
use uuid::Uuid;

async fn start(audit: bool) -> Option<SignalRuntime> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let store = PostgresStore::connect(&url, 5).await.ok()?;
    let transport = PgNotifyTransport::new(store.pool().clone());
    SignalRuntime::builder()
        .store(Arc::new(store))
        .transport(Arc::new(transport))
        .engine_config(EngineConfig {
            audit_switches: audit,
            ..Default::default()
        })
        .build()
        .ok()?
        .start()
        .await
        .ok()
}

/// Node id unique to this test run.
fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notify_propagates_commits() {
    skip_if_no_db!();

    let Some(runtime) = start(false).await else {
        eprintln!("Skipping test: failed to start runtime");
        return;
    };
    let engine = runtime.engine();
    let source = unique("src");
    let derived = unique("dst");

    let a = engine
        .declare(NodeSpec::new(&source).column("value", ColumnType::Double))
        .await
        .unwrap();
    let m = engine
        .declare(
            NodeSpec::new(&derived)
                .column("value", ColumnType::Double)
                .upstream("in", &source),
        )
        .await
        .unwrap();
    let mut rx = m.commits().unwrap();

    let written = a.set("value", 3.25).await.unwrap().unwrap();
    let commit = next_commit(&mut rx).await;

    assert_eq!(commit.time, written.time);
    assert_eq!(commit.values["value"], Value::Float(3.25));
    assert_eq!(m.value("value").await.unwrap(), Value::Float(3.25));

    m.discard().await.unwrap();
    a.discard().await.unwrap();
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_is_audited() {
    skip_if_no_db!();

    let Some(runtime) = start(true).await else {
        eprintln!("Skipping test: failed to start runtime");
        return;
    };
    let engine = runtime.engine();
    let old = unique("old");
    let new = unique("new");
    let derived = unique("dst");

    engine
        .declare(NodeSpec::new(&old).column("value", ColumnType::Double))
        .await
        .unwrap();
    let c = engine
        .declare(NodeSpec::new(&new).column("value", ColumnType::Double))
        .await
        .unwrap();
    let m = engine
        .declare(
            NodeSpec::new(&derived)
                .column("value", ColumnType::Double)
                .upstream("in", &old),
        )
        .await
        .unwrap();

    let handle = m.set_upstream("in", &c).await.unwrap();
    assert_eq!(handle.outcome(), SwitchOutcome::Committed);

    let audit = engine.store().list_switches(Some(derived.as_str())).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].payload["upstreams"][0]["node"], new.as_str());

    runtime.shutdown().await.unwrap();
}
