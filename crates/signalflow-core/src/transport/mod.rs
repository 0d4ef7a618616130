// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification transport between nodes.
//!
//! Every node publishes on two topics:
//!
//! | Topic | Fired on | Payload |
//! |-------|----------|---------|
//! | `<relation>_channel` | every live commit | [`ChangeNotice`] |
//! | `<relation>_checkpoint` | every checkpoint timer tick | [`CheckpointNotice`] |

pub mod local;
pub mod postgres;

pub use self::local::LocalTransport;
pub use self::postgres::PgNotifyTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::value::Timestamp;

/// Data topic of a relation.
pub fn data_topic(relation: &str) -> String {
    format!("{}_channel", relation)
}

/// Checkpoint topic of a relation.
pub fn checkpoint_topic(relation: &str) -> String {
    format!("{}_checkpoint", relation)
}

/// A message received on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: String,
}

/// Payload of a data-topic notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    /// Node that committed.
    pub node: String,
    /// Commit timestamp.
    pub time: Timestamp,
}

/// Payload of a checkpoint-topic notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointNotice {
    /// Source node whose timer fired.
    pub node: String,
    /// Watermark written by the tick.
    pub watermark: Timestamp,
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Wrap a receiver fed by a transport.
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next notification. `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

/// Publish/subscribe channel used to wake node listeners.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Publish `payload` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), SyncError>;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SyncError>;
}
