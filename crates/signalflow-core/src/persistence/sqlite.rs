// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed time-series store.
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqlitePool};

use crate::error::SyncError;
use crate::value::{
    ColumnSpec, ColumnType, Row, StoredRow, Timestamp, Value, from_micros, to_micros,
};

use super::{
    Cutoff, Registration, RegistryRecord, SwitchRecord, TimeSeriesStore, column_list,
    ordered_values,
};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, <Sqlite as sqlx::Database>::Arguments<'q>>;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs all
    /// migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/signals.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                SyncError::database(
                    "connect",
                    format!("Failed to connect to SQLite at {}: {}", url, e),
                )
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: Value) -> SqliteQuery<'q> {
    match value {
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
    }
}

fn decode_row(row: &SqliteRow, columns: &[ColumnSpec]) -> Result<StoredRow, SyncError> {
    let time: i64 = row.try_get("time")?;
    let values = columns
        .iter()
        .map(|c| {
            let name = c.name.as_str();
            let value = match c.ty {
                ColumnType::Boolean => row
                    .try_get::<Option<bool>, _>(name)
                    .ok()
                    .flatten()
                    .map(Value::Bool),
                ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt => {
                    row.try_get::<Option<i64>, _>(name).ok().flatten().map(Value::Int)
                }
                ColumnType::Real | ColumnType::Double => {
                    row.try_get::<Option<f64>, _>(name).ok().flatten().map(Value::Float)
                }
                ColumnType::Varchar => row
                    .try_get::<Option<String>, _>(name)
                    .ok()
                    .flatten()
                    .map(Value::Text),
            };
            (c.name.clone(), value.unwrap_or_else(|| c.ty.zero()))
        })
        .collect();
    Ok(StoredRow {
        time: from_micros(time),
        values,
    })
}

#[async_trait]
impl TimeSeriesStore for SqliteStore {
    async fn register_relation(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
    ) -> Result<Registration, SyncError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, RegistryRecord>(
            r#"
            SELECT relation_name, active
            FROM signal_registry
            WHERE relation_name = ?
            "#,
        )
        .bind(relation)
        .fetch_optional(&mut *tx)
        .await?;

        let column_ddl: String = columns
            .iter()
            .map(|c| format!(", \"{}\" {}", c.name, c.ty.sqlite_type()))
            .collect();
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{relation}" (id INTEGER PRIMARY KEY AUTOINCREMENT, time INTEGER NOT NULL{column_ddl})"#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS "{relation}_time_idx" ON "{relation}" (time)"#
        ))
        .execute(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO signal_registry (relation_name, active, created_at)
                    VALUES (?, 1, CURRENT_TIMESTAMP)
                    "#,
                )
                .bind(relation)
                .execute(&mut *tx)
                .await?;
                Registration::Created
            }
            Some(record) if record.active => Registration::AlreadyActive,
            Some(_) => {
                sqlx::query("UPDATE signal_registry SET active = 1 WHERE relation_name = ?")
                    .bind(relation)
                    .execute(&mut *tx)
                    .await?;
                Registration::Reactivated
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn is_active(&self, relation: &str) -> Result<bool, SyncError> {
        let active: Option<bool> =
            sqlx::query_scalar("SELECT active FROM signal_registry WHERE relation_name = ?")
                .bind(relation)
                .fetch_optional(&self.pool)
                .await?;
        Ok(active.unwrap_or(false))
    }

    async fn deactivate_relation(&self, relation: &str) -> Result<(), SyncError> {
        sqlx::query("UPDATE signal_registry SET active = 0 WHERE relation_name = ?")
            .bind(relation)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate_all(&self) -> Result<u64, SyncError> {
        let result = sqlx::query("UPDATE signal_registry SET active = 0 WHERE active = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn discard_relation(&self, relation: &str) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM signal_registry WHERE relation_name = ?")
            .bind(relation)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{relation}""#))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_row(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
        time: Timestamp,
        row: &Row,
    ) -> Result<(), SyncError> {
        let placeholders = ", ?".repeat(columns.len());
        let sql = format!(
            r#"INSERT INTO "{relation}" (time{}) VALUES (?{placeholders})"#,
            column_list(columns)
        );
        let mut query = sqlx::query(&sql).bind(to_micros(time));
        for value in ordered_values(columns, row) {
            query = bind_value(query, value);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn row_as_of(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
        cutoff: Cutoff,
    ) -> Result<Option<StoredRow>, SyncError> {
        let (filter, bound) = match cutoff {
            Cutoff::Latest => ("", None),
            Cutoff::Before(ts) => ("WHERE time < ?", Some(to_micros(ts))),
            Cutoff::AtOrBefore(ts) => ("WHERE time <= ?", Some(to_micros(ts))),
        };
        let sql = format!(
            r#"SELECT time{} FROM "{relation}" {filter} ORDER BY time DESC, id DESC LIMIT 1"#,
            column_list(columns)
        );
        let mut query = sqlx::query(&sql);
        if let Some(bound) = bound {
            query = query.bind(bound);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| decode_row(&r, columns)).transpose()
    }

    async fn latest_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        let micros: Option<i64> =
            sqlx::query_scalar(&format!(r#"SELECT MAX(time) FROM "{relation}""#))
                .fetch_one(&self.pool)
                .await?;
        Ok(micros.map(from_micros))
    }

    async fn first_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        let micros: Option<i64> =
            sqlx::query_scalar(&format!(r#"SELECT MIN(time) FROM "{relation}""#))
                .fetch_one(&self.pool)
                .await?;
        Ok(micros.map(from_micros))
    }

    async fn timestamps_between(
        &self,
        relation: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Timestamp>, SyncError> {
        let micros: Vec<i64> = sqlx::query_scalar(&format!(
            r#"SELECT time FROM "{relation}" WHERE time >= ? AND time <= ? ORDER BY time ASC, id ASC"#
        ))
        .bind(to_micros(from))
        .bind(to_micros(to))
        .fetch_all(&self.pool)
        .await?;
        Ok(micros.into_iter().map(from_micros).collect())
    }

    async fn timestamps(&self, relation: &str) -> Result<Vec<Timestamp>, SyncError> {
        let micros: Vec<i64> = sqlx::query_scalar(&format!(
            r#"SELECT time FROM "{relation}" ORDER BY time DESC, id DESC"#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(micros.into_iter().map(from_micros).collect())
    }

    async fn clear_rows(&self, relation: &str) -> Result<(), SyncError> {
        sqlx::query(&format!(r#"DELETE FROM "{relation}""#))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_watermark(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        let micros: Option<Option<i64>> =
            sqlx::query_scalar("SELECT watermark FROM signal_registry WHERE relation_name = ?")
                .bind(relation)
                .fetch_optional(&self.pool)
                .await?;
        Ok(micros.flatten().map(from_micros))
    }

    async fn advance_watermark(
        &self,
        relation: &str,
        to: Timestamp,
    ) -> Result<Option<Timestamp>, SyncError> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<Option<i64>> =
            sqlx::query_scalar("SELECT watermark FROM signal_registry WHERE relation_name = ?")
                .bind(relation)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query("UPDATE signal_registry SET watermark = ? WHERE relation_name = ?")
            .bind(to_micros(to))
            .bind(relation)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(previous.flatten().map(from_micros))
    }

    async fn record_switch(
        &self,
        time: Timestamp,
        node_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO switch_history (time, node_id, payload)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(to_micros(time))
        .bind(node_id)
        .bind(serde_json::to_string(payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_switches(&self, node_id: Option<&str>) -> Result<Vec<SwitchRecord>, SyncError> {
        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, time, node_id, payload
            FROM switch_history
            WHERE ? IS NULL OR node_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(node_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, time, node_id, payload)| {
                Ok(SwitchRecord {
                    id,
                    time: from_micros(time),
                    node_id,
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
