// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL LISTEN/NOTIFY transport.
//!
//! Publishing runs `pg_notify` on the pool. Each subscription holds its own
//! [`PgListener`] connection and forwards notifications on a background task until
//! the [`Subscription`] is dropped.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SyncError;

use super::{Notification, NotificationTransport, Subscription};

/// Delay before retrying after a listener receive error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Transport over PostgreSQL `NOTIFY`.
#[derive(Clone)]
pub struct PgNotifyTransport {
    pool: PgPool,
}

impl PgNotifyTransport {
    /// Create a transport on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn forward(mut listener: PgListener, topic: String, tx: mpsc::UnboundedSender<Notification>) {
    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(topic = %topic, "Subscription dropped, stopping listener");
                break;
            }
            received = listener.recv() => match received {
                Ok(notification) => {
                    let message = Notification {
                        topic: notification.channel().to_string(),
                        payload: notification.payload().to_string(),
                    };
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Listener receive failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            },
        }
    }
}

#[async_trait]
impl NotificationTransport for PgNotifyTransport {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), SyncError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::transport(topic, e))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, SyncError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| SyncError::transport(topic, e))?;
        listener
            .listen(topic)
            .await
            .map_err(|e| SyncError::transport(topic, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(listener, topic.to_string(), tx));
        Ok(Subscription::new(topic, rx))
    }
}
