// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::value::{ColumnSpec, Row, StoredRow, Timestamp};

use super::{Cutoff, Registration, SwitchRecord, TimeSeriesStore, ordered_values};

#[derive(Debug, Default)]
struct Relation {
    active: bool,
    watermark: Option<Timestamp>,
    /// Sorted by time; rows sharing a timestamp keep insertion order.
    rows: Vec<(Timestamp, Row)>,
}

#[derive(Debug, Default)]
struct State {
    relations: HashMap<String, Relation>,
    switches: Vec<SwitchRecord>,
}

/// Store keeping every relation in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, SyncError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::database("lock", "memory store lock poisoned"))?;
        Ok(f(&mut state))
    }

    fn with_relation<T>(
        &self,
        relation: &str,
        f: impl FnOnce(&mut Relation) -> T,
    ) -> Result<T, SyncError> {
        self.with_state(|state| state.relations.get_mut(relation).map(f))?
            .ok_or_else(|| {
                SyncError::database(
                    "lookup_relation",
                    format!("relation '{}' does not exist", relation),
                )
            })
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn register_relation(
        &self,
        relation: &str,
        _columns: &[ColumnSpec],
    ) -> Result<Registration, SyncError> {
        self.with_state(|state| match state.relations.get_mut(relation) {
            None => {
                state.relations.insert(
                    relation.to_string(),
                    Relation {
                        active: true,
                        ..Relation::default()
                    },
                );
                Registration::Created
            }
            Some(rel) if rel.active => Registration::AlreadyActive,
            Some(rel) => {
                rel.active = true;
                Registration::Reactivated
            }
        })
    }

    async fn is_active(&self, relation: &str) -> Result<bool, SyncError> {
        self.with_state(|state| state.relations.get(relation).is_some_and(|r| r.active))
    }

    async fn deactivate_relation(&self, relation: &str) -> Result<(), SyncError> {
        self.with_state(|state| {
            if let Some(rel) = state.relations.get_mut(relation) {
                rel.active = false;
            }
        })
    }

    async fn deactivate_all(&self) -> Result<u64, SyncError> {
        self.with_state(|state| {
            let mut count = 0;
            for rel in state.relations.values_mut().filter(|r| r.active) {
                rel.active = false;
                count += 1;
            }
            count
        })
    }

    async fn discard_relation(&self, relation: &str) -> Result<(), SyncError> {
        self.with_state(|state| {
            state.relations.remove(relation);
        })
    }

    async fn insert_row(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
        time: Timestamp,
        row: &Row,
    ) -> Result<(), SyncError> {
        let values: Row = columns
            .iter()
            .map(|c| c.name.clone())
            .zip(ordered_values(columns, row))
            .collect();
        self.with_relation(relation, |rel| {
            let at = rel.rows.partition_point(|(t, _)| *t <= time);
            rel.rows.insert(at, (time, values));
        })
    }

    async fn row_as_of(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
        cutoff: Cutoff,
    ) -> Result<Option<StoredRow>, SyncError> {
        self.with_relation(relation, |rel| {
            let end = match cutoff {
                Cutoff::Latest => rel.rows.len(),
                Cutoff::Before(ts) => rel.rows.partition_point(|(t, _)| *t < ts),
                Cutoff::AtOrBefore(ts) => rel.rows.partition_point(|(t, _)| *t <= ts),
            };
            end.checked_sub(1).map(|i| {
                let (time, row) = &rel.rows[i];
                StoredRow {
                    time: *time,
                    values: columns
                        .iter()
                        .map(|c| c.name.clone())
                        .zip(ordered_values(columns, row))
                        .collect(),
                }
            })
        })
    }

    async fn latest_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        self.with_relation(relation, |rel| rel.rows.last().map(|(t, _)| *t))
    }

    async fn first_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        self.with_relation(relation, |rel| rel.rows.first().map(|(t, _)| *t))
    }

    async fn timestamps_between(
        &self,
        relation: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Timestamp>, SyncError> {
        self.with_relation(relation, |rel| {
            rel.rows
                .iter()
                .map(|(t, _)| *t)
                .filter(|t| *t >= from && *t <= to)
                .collect()
        })
    }

    async fn timestamps(&self, relation: &str) -> Result<Vec<Timestamp>, SyncError> {
        self.with_relation(relation, |rel| {
            rel.rows.iter().rev().map(|(t, _)| *t).collect()
        })
    }

    async fn clear_rows(&self, relation: &str) -> Result<(), SyncError> {
        self.with_relation(relation, |rel| rel.rows.clear())
    }

    async fn read_watermark(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        self.with_relation(relation, |rel| rel.watermark)
    }

    async fn advance_watermark(
        &self,
        relation: &str,
        to: Timestamp,
    ) -> Result<Option<Timestamp>, SyncError> {
        self.with_relation(relation, |rel| rel.watermark.replace(to))
    }

    async fn record_switch(
        &self,
        time: Timestamp,
        node_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError> {
        self.with_state(|state| {
            let id = state.switches.len() as i64 + 1;
            state.switches.push(SwitchRecord {
                id,
                time,
                node_id: node_id.to_string(),
                payload: payload.clone(),
            });
        })
    }

    async fn list_switches(&self, node_id: Option<&str>) -> Result<Vec<SwitchRecord>, SyncError> {
        self.with_state(|state| {
            state
                .switches
                .iter()
                .filter(|r| node_id.is_none_or(|n| r.node_id == n))
                .cloned()
                .collect()
        })
    }

    async fn health_check(&self) -> Result<(), SyncError> {
        self.with_state(|_| ())
    }
}
