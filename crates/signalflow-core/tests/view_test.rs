// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! View factory boundary tests.

mod common;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration;
use common::*;
use signalflow_core::{
    AnalyticOp, ColumnType, Engine, NodeSpec, SignalNode, SyncError, Value, ViewFactory, ViewKind,
    ViewRequest,
};

/// Materializes every view as a plain copy of the base column.
#[derive(Default)]
struct CopyFactory {
    requests: Mutex<Vec<ViewRequest>>,
}

#[async_trait]
impl ViewFactory for CopyFactory {
    async fn create(
        &self,
        engine: &Engine,
        request: &ViewRequest,
    ) -> signalflow_core::Result<SignalNode> {
        self.requests.lock().unwrap().push(request.clone());
        engine
            .declare(
                NodeSpec::new(&request.name)
                    .column(&request.column, ColumnType::Double)
                    .upstream("base", &request.source),
            )
            .await
    }
}

#[tokio::test]
async fn test_derive_hands_request_to_factory() {
    let ctx = TestContext::new();
    let temp = ctx.source("Temp").await;
    let other = ctx.source("Other").await;
    let factory = CopyFactory::default();

    let view = temp
        .derive(&factory, &temp.avg("temp_avg", "value"))
        .await
        .unwrap();
    assert_eq!(view.id(), "temp_avg");
    assert_eq!(view.upstreams()[0].1, temp);

    temp.derive(&factory, &temp.distance("temp_gap", "value", &other))
        .await
        .unwrap();

    let requests = factory.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].kind, ViewKind::Analytic { op: AnalyticOp::Avg });
    assert_eq!(requests[0].base, "temp");
    assert_eq!(requests[0].source, "Temp");
    assert_eq!(
        requests[1].kind,
        ViewKind::Distance {
            other: "other".to_string()
        }
    );

    let mut rx = view.commits().unwrap();
    ctx.set_at(&temp, 10, 21.5).await;
    let commit = next_commit(&mut rx).await;
    assert_eq!(commit.values["value"], Value::Float(21.5));
}

#[tokio::test]
async fn test_derive_validates_before_factory() {
    let ctx = TestContext::new();
    let temp = ctx.source("Temp").await;
    let factory = CopyFactory::default();

    let err = temp
        .derive(&factory, &temp.max("temp_max", "missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownColumn { .. }));

    let err = temp
        .derive(&factory, &temp.first("not a name", "value"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    let window = temp.within("temp_window", "value", ts(0), Duration::zero());
    let err = temp.derive(&factory, &window).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    assert!(factory.requests.lock().unwrap().is_empty());
}

#[test]
fn test_request_json_shape() {
    let request = |kind: ViewKind| ViewRequest {
        kind,
        base: "temp".to_string(),
        name: "v".to_string(),
        source: "Temp".to_string(),
        column: "value".to_string(),
    };
    let lag = request(ViewKind::LastDiff { offset: 3 });
    let json = serde_json::to_value(&lag).unwrap();
    assert_eq!(json["kind"]["kind"], "last_diff");
    assert_eq!(json["kind"]["offset"], 3);

    let sum = request(ViewKind::Analytic { op: AnalyticOp::PSum });
    let json = serde_json::to_value(&sum).unwrap();
    assert_eq!(json["kind"]["op"], "psum");
}
