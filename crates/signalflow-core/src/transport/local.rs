// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncError;

use super::{Notification, NotificationTransport, Subscription};

/// Fan-out transport for nodes living in one process.
#[derive(Debug, Default)]
pub struct LocalTransport {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl LocalTransport {
    /// Create a transport with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|t| t.get(topic).map_or(0, |s| s.iter().filter(|tx| !tx.is_closed()).count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl NotificationTransport for LocalTransport {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), SyncError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| SyncError::transport(topic, "subscriber table poisoned"))?;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| {
                tx.send(Notification {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .map_err(|_| SyncError::transport(topic, "subscriber table poisoned"))?
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic, rx))
    }
}
