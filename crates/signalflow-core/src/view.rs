// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boundary to derived-signal ("view") generators.
//!
//! A view is a read-only node derived from a base node: a time window, a lagged
//! difference, the distance to another node, or an aggregate. The engine only builds the
//! [`ViewRequest`]; a [`ViewFactory`] supplied by the embedder materializes it.

use std::fmt;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::node::SignalNode;
use crate::value::{Timestamp, validate_identifier};

/// Aggregate applied by an analytic view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticOp {
    /// Running count.
    PCount,
    /// Running average.
    Avg,
    /// Running sum.
    PSum,
    /// Running maximum.
    Max,
    /// Running minimum.
    Min,
}

impl fmt::Display for AnalyticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PCount => "pcount",
            Self::Avg => "avg",
            Self::PSum => "psum",
            Self::Max => "max",
            Self::Min => "min",
        };
        f.write_str(name)
    }
}

/// Kind of derived signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewKind {
    /// Rows in `[start, start + interval)`.
    Within {
        /// Window start.
        start: Timestamp,
        /// Window length.
        #[serde(with = "duration_secs")]
        interval: Duration,
    },
    /// Difference to the row `offset` commits earlier.
    LastDiff {
        /// Lag in commits.
        offset: u32,
    },
    /// Distance to another node's column of the same name.
    Distance {
        /// Relation of the other node.
        other: String,
    },
    /// Running aggregate.
    Analytic {
        /// Aggregate function.
        op: AnalyticOp,
    },
    /// The first committed row.
    First,
}

/// Everything a generator needs to build a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRequest {
    /// View kind and parameters.
    pub kind: ViewKind,
    /// Relation of the base node.
    pub base: String,
    /// Id of the view node to create.
    pub name: String,
    /// Id of the base node.
    pub source: String,
    /// Column the view reads.
    pub column: String,
}

/// Materializes views.
#[async_trait]
pub trait ViewFactory: Send + Sync {
    /// Create the view node described by `request`.
    async fn create(&self, engine: &Engine, request: &ViewRequest) -> Result<SignalNode>;
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}

impl SignalNode {
    fn view_request(&self, kind: ViewKind, name: &str, column: &str) -> ViewRequest {
        ViewRequest {
            kind,
            base: self.relation().to_string(),
            name: name.to_string(),
            source: self.id().to_string(),
            column: column.to_string(),
        }
    }

    /// Rows of `column` within `[start, start + interval)`.
    pub fn within(&self, name: &str, column: &str, start: Timestamp, interval: Duration) -> ViewRequest {
        self.view_request(ViewKind::Within { start, interval }, name, column)
    }

    /// Difference of `column` to its value `offset` commits earlier.
    pub fn last_diff(&self, name: &str, column: &str, offset: u32) -> ViewRequest {
        self.view_request(ViewKind::LastDiff { offset }, name, column)
    }

    /// Distance of `column` to the same column of `other`.
    pub fn distance(&self, name: &str, column: &str, other: &SignalNode) -> ViewRequest {
        let other = other.relation().to_string();
        self.view_request(ViewKind::Distance { other }, name, column)
    }

    /// Running count of `column`.
    pub fn pcount(&self, name: &str, column: &str) -> ViewRequest {
        self.analytic(AnalyticOp::PCount, name, column)
    }

    /// Running average of `column`.
    pub fn avg(&self, name: &str, column: &str) -> ViewRequest {
        self.analytic(AnalyticOp::Avg, name, column)
    }

    /// Running sum of `column`.
    pub fn psum(&self, name: &str, column: &str) -> ViewRequest {
        self.analytic(AnalyticOp::PSum, name, column)
    }

    /// Running maximum of `column`.
    pub fn max(&self, name: &str, column: &str) -> ViewRequest {
        self.analytic(AnalyticOp::Max, name, column)
    }

    /// Running minimum of `column`.
    pub fn min(&self, name: &str, column: &str) -> ViewRequest {
        self.analytic(AnalyticOp::Min, name, column)
    }

    /// First committed value of `column`.
    pub fn first(&self, name: &str, column: &str) -> ViewRequest {
        self.view_request(ViewKind::First, name, column)
    }

    fn analytic(&self, op: AnalyticOp, name: &str, column: &str) -> ViewRequest {
        self.view_request(ViewKind::Analytic { op }, name, column)
    }

    /// Validate `request` and hand it to `factory`.
    pub async fn derive(
        &self,
        factory: &dyn ViewFactory,
        request: &ViewRequest,
    ) -> Result<SignalNode> {
        validate_identifier("name", &request.name)?;
        if !self.columns()?.iter().any(|c| c.name == request.column) {
            return Err(SyncError::UnknownColumn {
                node_id: self.id().to_string(),
                column: request.column.clone(),
            });
        }
        if let ViewKind::Within { interval, .. } = &request.kind
            && *interval <= Duration::zero()
        {
            return Err(SyncError::validation(
                "interval",
                "window length must be positive",
            ));
        }
        factory.create(self.engine(), request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::from_micros;

    #[test]
    fn test_analytic_names() {
        assert_eq!(AnalyticOp::PCount.to_string(), "pcount");
        assert_eq!(AnalyticOp::PSum.to_string(), "psum");
    }

    #[test]
    fn test_request_serializes_with_kind_tag() {
        let request = ViewRequest {
            kind: ViewKind::Within {
                start: from_micros(0),
                interval: Duration::seconds(60),
            },
            base: "temp".to_string(),
            name: "temp_last_minute".to_string(),
            source: "Temp".to_string(),
            column: "value".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"]["kind"], "within");
        assert_eq!(json["kind"]["interval"], 60);

        let back: ViewRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
