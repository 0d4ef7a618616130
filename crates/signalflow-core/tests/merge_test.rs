// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Merge-mode tests: commits produced by upstream arrivals.

mod common;

use std::time::Duration;

use common::*;
use signalflow_core::{Assignments, ColumnType, CommitKind, Inputs, MergePolicy, NodeSpec, Value};

fn sum(inputs: &Inputs, out: &mut Assignments) {
    let left = inputs.f64("left", "value").unwrap_or_default();
    let right = inputs.f64("right", "value").unwrap_or_default();
    out.set("value", left + right);
}

fn sum_spec(id: &str, policy: MergePolicy) -> NodeSpec {
    NodeSpec::new(id)
        .column("value", ColumnType::Double)
        .policy(policy)
        .upstream("left", "A")
        .upstream("right", "B")
        .compute(sum)
}

#[tokio::test]
async fn test_bufferless_commits_at_max_of_latest() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let b = ctx.source("B").await;
    let m = ctx
        .engine
        .declare(sum_spec("M", MergePolicy::UNION_BUFFERLESS))
        .await
        .unwrap();
    let mut rx = m.commits().unwrap();

    ctx.set_at(&a, 10, 1.0).await;
    // B commits earlier than A's latest; the merge must not go back in time.
    ctx.set_at(&b, 5, 2.0).await;

    let first = next_commit(&mut rx).await;
    let second = next_commit(&mut rx).await;
    assert_eq!(first.time, ts(10));
    assert_eq!(second.time, ts(10));
    assert_eq!(second.kind, CommitKind::Live);
    assert_eq!(m.value("value").await.unwrap(), Value::Float(3.0));
}

#[tokio::test]
async fn test_buffered_pairs_arrivals_in_order() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let b = ctx.source("B").await;
    let m = ctx
        .engine
        .declare(sum_spec("M", MergePolicy::UNION_BUFFERED))
        .await
        .unwrap();
    let mut rx = m.commits().unwrap();

    ctx.set_at(&a, 10, 1.0).await;
    ctx.set_at(&b, 15, 10.0).await;
    ctx.set_at(&a, 20, 2.0).await;
    ctx.set_at(&b, 25, 20.0).await;
    ctx.set_at(&a, 30, 3.0).await;

    let first = next_commit(&mut rx).await;
    let second = next_commit(&mut rx).await;
    assert_eq!(first.time, ts(15));
    assert_eq!(first.values["value"], Value::Float(11.0));
    assert_eq!(second.time, ts(25));
    assert_eq!(second.values["value"], Value::Float(22.0));

    // A's third commit has no partner yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.seconds(&m).await, vec![15, 25]);

    ctx.set_at(&b, 35, 30.0).await;
    let third = next_commit(&mut rx).await;
    assert_eq!(third.time, ts(35));
    assert_eq!(third.values["value"], Value::Float(33.0));
}

#[tokio::test]
async fn test_difference_commits_every_arrival_at_now() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let b = ctx.source("B").await;
    let m = ctx
        .engine
        .declare(sum_spec("M", MergePolicy::DIFFERENCE))
        .await
        .unwrap();
    let mut rx = m.commits().unwrap();

    ctx.set_at(&a, 10, 1.0).await;
    let first = next_commit(&mut rx).await;
    assert_eq!(first.time, ts(10));
    assert_eq!(first.values["value"], Value::Float(1.0));

    ctx.set_at(&b, 40, 2.0).await;
    let second = next_commit(&mut rx).await;
    assert_eq!(second.time, ts(40));
    assert_eq!(second.values["value"], Value::Float(3.0));

    assert_eq!(ctx.seconds(&m).await, vec![10, 40]);
}

#[tokio::test]
async fn test_copy_without_compute_follows_upstream() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let m = ctx.copy_of("M", "A").await;
    let s = ctx.copy_of("S", "M").await;
    let mut rx = s.commits().unwrap();

    ctx.set_at(&a, 10, 4.5).await;

    let commit = next_commit(&mut rx).await;
    assert_eq!(commit.node, "S");
    assert_eq!(commit.time, ts(10));
    assert_eq!(commit.values["value"], Value::Float(4.5));
    assert_eq!(m.value("value").await.unwrap(), Value::Float(4.5));
}

#[tokio::test]
async fn test_reval_from_non_upstream_is_ignored() {
    let ctx = TestContext::new();
    let a = ctx.source("A").await;
    let other = ctx.source("Other").await;
    let m = ctx.copy_of("M", "A").await;

    ctx.clock.set(ts(10));
    assert_eq!(m.reval(&other, ts(10)).await.unwrap(), 0);
    assert!(!m.is_initialized().await.unwrap());

    ctx.insert_silently(&a, 10, 1.0).await;
    assert_eq!(m.reval(&a, ts(10)).await.unwrap(), 1);
    assert_eq!(ctx.seconds(&m).await, vec![10]);
}
