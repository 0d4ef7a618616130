// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-series store interfaces and backends for signalflow-core.
//!
//! Each node owns one append-only relation `(id, time, <columns>)`. A registry relation
//! tracks which relations are active together with their checkpoint watermark, and an
//! optional audit relation records every committed switch-over.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::value::{ColumnSpec, Row, StoredRow, Timestamp};

/// Outcome of registering a node's relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The relation did not exist and was created.
    Created,
    /// The relation existed but was inactive; it is active again.
    Reactivated,
    /// The relation is already active (another live node uses it).
    AlreadyActive,
}

/// Which row `row_as_of` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cutoff {
    /// The most recent row.
    Latest,
    /// The most recent row with `time < ts`.
    Before(Timestamp),
    /// The most recent row with `time <= ts`.
    AtOrBefore(Timestamp),
}

/// Registry entry of a relation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegistryRecord {
    /// Relation name (lower-cased node id).
    pub relation_name: String,
    /// Whether a live node currently owns the relation.
    pub active: bool,
}

/// Audit record of a committed switch-over.
#[derive(Debug, Clone)]
pub struct SwitchRecord {
    /// Database primary key.
    pub id: i64,
    /// When the switch committed.
    pub time: DateTime<Utc>,
    /// Node whose upstream was replaced.
    pub node_id: String,
    /// Resulting upstream set, as JSON.
    pub payload: serde_json::Value,
}

/// Store interface used by the engine.
#[allow(missing_docs)]
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Create the relation if missing and mark it active in the registry.
    async fn register_relation(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
    ) -> Result<Registration, SyncError>;

    async fn is_active(&self, relation: &str) -> Result<bool, SyncError>;

    async fn deactivate_relation(&self, relation: &str) -> Result<(), SyncError>;

    /// Mark every registered relation inactive. Returns how many were active.
    async fn deactivate_all(&self) -> Result<u64, SyncError>;

    /// Remove the registry entry and drop the relation.
    async fn discard_relation(&self, relation: &str) -> Result<(), SyncError>;

    async fn insert_row(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
        time: Timestamp,
        row: &Row,
    ) -> Result<(), SyncError>;

    /// Most recent row matching `cutoff`, with values coerced to the column types.
    async fn row_as_of(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
        cutoff: Cutoff,
    ) -> Result<Option<StoredRow>, SyncError>;

    async fn latest_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError>;

    async fn first_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError>;

    /// Commit timestamps in `[from, to]`, ascending.
    async fn timestamps_between(
        &self,
        relation: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Timestamp>, SyncError>;

    /// Every commit timestamp, most recent first.
    async fn timestamps(&self, relation: &str) -> Result<Vec<Timestamp>, SyncError>;

    /// Delete every row of the relation.
    async fn clear_rows(&self, relation: &str) -> Result<(), SyncError>;

    async fn read_watermark(&self, relation: &str) -> Result<Option<Timestamp>, SyncError>;

    /// Set the checkpoint watermark. Returns the previous one.
    async fn advance_watermark(
        &self,
        relation: &str,
        to: Timestamp,
    ) -> Result<Option<Timestamp>, SyncError>;

    async fn record_switch(
        &self,
        time: Timestamp,
        node_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError>;

    /// Audit records, oldest first, optionally for one node.
    async fn list_switches(&self, node_id: Option<&str>) -> Result<Vec<SwitchRecord>, SyncError>;

    async fn health_check(&self) -> Result<(), SyncError>;
}

/// Build the `, "a", "b"` column list used by the SQL backends.
pub(crate) fn column_list(columns: &[ColumnSpec]) -> String {
    columns
        .iter()
        .map(|c| format!(", \"{}\"", c.name))
        .collect()
}

/// Values of `row` in column order, coerced to each column's type.
pub(crate) fn ordered_values(columns: &[ColumnSpec], row: &Row) -> Vec<crate::value::Value> {
    columns
        .iter()
        .map(|c| match row.get(&c.name) {
            Some(v) => v.clone().coerce(c.ty),
            None => c.ty.zero(),
        })
        .collect()
}
