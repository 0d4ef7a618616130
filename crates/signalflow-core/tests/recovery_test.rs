// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint and recovery tests.
//!
//! Missed commits are simulated by writing rows straight into the store, which skips
//! change notification.

mod common;

use std::time::Duration;

use common::*;
use signalflow_core::{
    Assignments, ColumnType, CommitKind, Inputs, MergePolicy, NodeSpec, SignalNode, Value,
};

async fn sum_node(ctx: &TestContext, id: &str, policy: MergePolicy) -> SignalNode {
    ctx.engine
        .declare(
            NodeSpec::new(id)
                .column("value", ColumnType::Double)
                .policy(policy)
                .upstream("left", "A")
                .upstream("right", "B")
                .compute(|inputs: &Inputs, out: &mut Assignments| {
                    let l = inputs.f64("left", "value").unwrap_or_default();
                    let r = inputs.f64("right", "value").unwrap_or_default();
                    out.set("value", l + r);
                }),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ensure_consistency_restores_single_gap() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let m = ctx.copy_of("M", "A").await;
    for (secs, value) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
        ctx.insert_silently(&a, secs, value).await;
    }
    ctx.insert_silently(&m, 10, 1.0).await;
    ctx.insert_silently(&m, 30, 3.0).await;
    let mut rx = m.commits().unwrap();

    let restored = m.ensure_consistency(ts(0), ts(40)).await.unwrap();

    assert_eq!(restored, vec![ts(20)]);
    assert_eq!(ctx.seconds(&m).await, vec![10, 20, 30]);

    let commit = next_commit(&mut rx).await;
    assert_eq!(commit.kind, CommitKind::Restore);
    assert_eq!(commit.time, ts(20));
    assert_eq!(commit.values["value"], Value::Float(2.0));

    // A consistent window restores nothing.
    assert!(m.ensure_consistency(ts(0), ts(40)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restore_keeps_view_cursor() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let m = ctx.copy_of("M", "A").await;
    ctx.insert_silently(&a, 10, 1.0).await;
    ctx.insert_silently(&m, 30, 3.0).await;

    m.snapshot(ts(20)).await.unwrap();
    let commit = m.restore(ts(10)).await.unwrap().unwrap();

    assert_eq!(commit.values["value"], Value::Float(1.0));
    assert_eq!(m.cursor().unwrap(), Some(ts(20)));
    assert_eq!(m.value("value").await.unwrap(), Value::Float(1.0));
}

#[tokio::test]
async fn test_union_restores_slot_minimum() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let b = ctx.source("B").await;
    let m = sum_node(&ctx, "M", MergePolicy::UNION_BUFFERLESS).await;
    ctx.insert_silently(&a, 10, 1.0).await;
    ctx.insert_silently(&a, 20, 2.0).await;
    ctx.insert_silently(&b, 12, 10.0).await;
    ctx.insert_silently(&b, 22, 20.0).await;
    ctx.insert_silently(&m, 12, 11.0).await;

    let restored = m.ensure_consistency(ts(0), ts(30)).await.unwrap();

    assert_eq!(restored, vec![ts(20)]);
    // Restores read each upstream at or before the restored timestamp.
    assert_eq!(m.value("value").await.unwrap(), Value::Float(12.0));
}

#[tokio::test]
async fn test_difference_restores_every_missing_timestamp() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let b = ctx.source("B").await;
    let m = sum_node(&ctx, "M", MergePolicy::DIFFERENCE).await;
    ctx.insert_silently(&a, 10, 1.0).await;
    ctx.insert_silently(&a, 20, 2.0).await;
    ctx.insert_silently(&b, 15, 10.0).await;
    ctx.insert_silently(&m, 10, 1.0).await;

    let restored = m.ensure_consistency(ts(0), ts(30)).await.unwrap();

    assert_eq!(restored, vec![ts(15), ts(20)]);
    assert_eq!(ctx.seconds(&m).await, vec![10, 15, 20]);
}

#[tokio::test]
async fn test_push_checkpoint_walks_downstream() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let m = ctx.copy_of("M", "A").await;
    let s = ctx.copy_of("S", "M").await;
    for (secs, value) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
        ctx.insert_silently(&a, secs, value).await;
    }
    for node in [&m, &s] {
        ctx.insert_silently(node, 10, 1.0).await;
        ctx.insert_silently(node, 30, 3.0).await;
    }

    let restored = m.push_checkpoint(ts(0), ts(40)).await.unwrap();

    assert_eq!(restored, 2);
    assert_eq!(ctx.seconds(&m).await, vec![10, 20, 30]);
    assert_eq!(ctx.seconds(&s).await, vec![10, 20, 30]);
    assert_eq!(
        s.checkpoint_window().await.unwrap(),
        (Some(ts(0)), Some(ts(40)))
    );
}

#[tokio::test]
async fn test_push_checkpoint_waits_for_every_upstream() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let b = ctx.source("B").await;
    let m = sum_node(&ctx, "M", MergePolicy::UNION_BUFFERED).await;
    ctx.insert_silently(&a, 10, 1.0).await;
    ctx.insert_silently(&b, 10, 2.0).await;

    assert_eq!(m.push_checkpoint(ts(0), ts(20)).await.unwrap(), 0);
    assert!(!m.is_initialized().await.unwrap());

    assert_eq!(m.push_checkpoint(ts(0), ts(20)).await.unwrap(), 1);
    assert_eq!(m.value("value").await.unwrap(), Value::Float(3.0));
}

#[tokio::test]
async fn test_checkpoint_ticks_trigger_recovery() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let m = ctx.copy_of("M", "A").await;
    let mut rx = m.commits().unwrap();

    ctx.clock.set(ts(5));
    assert_eq!(a.checkpoint_tick().await.unwrap(), None);
    // Derived nodes do not tick.
    assert_eq!(m.checkpoint_tick().await.unwrap(), None);

    ctx.set_at(&a, 10, 1.0).await;
    assert_eq!(next_commit(&mut rx).await.time, ts(10));
    ctx.insert_silently(&a, 20, 2.0).await;

    ctx.clock.set(ts(25));
    assert_eq!(a.checkpoint_tick().await.unwrap(), Some(ts(5)));

    let restored = next_commit(&mut rx).await;
    assert_eq!(restored.kind, CommitKind::Restore);
    assert_eq!(restored.time, ts(20));
    assert_eq!(ctx.seconds(&m).await, vec![10, 20]);
    assert_eq!(
        a.checkpoint_window().await.unwrap(),
        (Some(ts(5)), Some(ts(25)))
    );
}

#[tokio::test]
async fn test_checkpoint_timer_recovers_on_its_own() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let m = ctx
        .engine
        .declare(
            NodeSpec::new("M")
                .column("value", ColumnType::Double)
                .upstream("in", "A")
                .checkpoint_interval(Duration::from_millis(20)),
        )
        .await
        .unwrap();

    ctx.set_at(&a, 10, 1.0).await;
    ctx.insert_silently(&a, 20, 2.0).await;
    ctx.clock.set(ts(30));

    let ctx_ref = &ctx;
    let recovered = eventually(move || {
        let m = m.clone();
        async move { ctx_ref.seconds(&m).await.contains(&20) }
    })
    .await;
    assert!(recovered, "timer-driven recovery did not restore the missed commit");
    assert!(ctx.hook.codes().is_empty());

    ctx.engine.shutdown().await;
}
