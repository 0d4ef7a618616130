// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed time-series store.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row as _};

use crate::error::SyncError;
use crate::value::{ColumnSpec, ColumnType, Row, StoredRow, Timestamp, Value};

use super::{
    Cutoff, Registration, RegistryRecord, SwitchRecord, TimeSeriesStore, column_list,
    ordered_values,
};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, <Postgres as sqlx::Database>::Arguments<'q>>;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing pool. Migrations must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a PostgreSQL URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                SyncError::database("connect", format!("Failed to connect to PostgreSQL: {}", e))
            })?;

        crate::migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_typed<'q>(query: PgQuery<'q>, ty: ColumnType, value: Value) -> PgQuery<'q> {
    match (ty, value) {
        (ColumnType::Boolean, Value::Bool(b)) => query.bind(b),
        (ColumnType::SmallInt, Value::Int(i)) => query.bind(i16::try_from(i).unwrap_or_default()),
        (ColumnType::Integer, Value::Int(i)) => query.bind(i32::try_from(i).unwrap_or_default()),
        (ColumnType::BigInt, Value::Int(i)) => query.bind(i),
        (ColumnType::Real, Value::Float(f)) => query.bind(f as f32),
        (ColumnType::Double, Value::Float(f)) => query.bind(f),
        (ColumnType::Varchar, Value::Text(s)) => query.bind(s),
        (ty, _) => bind_typed(query, ty, ty.zero()),
    }
}

fn decode_row(row: &PgRow, columns: &[ColumnSpec]) -> Result<StoredRow, SyncError> {
    let time: Timestamp = row.try_get("time")?;
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
                ColumnType::SmallInt => row
                    .try_get::<Option<i16>, _>(name)
                    .ok()
                    .flatten()
                    .map(|i| Value::Int(i.into())),
                ColumnType::Integer => row
                    .try_get::<Option<i32>, _>(name)
                    .ok()
                    .flatten()
                    .map(|i| Value::Int(i.into())),
                ColumnType::BigInt => row
                    .try_get::<Option<i64>, _>(name)
                    .ok()
                    .flatten()
                    .map(Value::Int),
                ColumnType::Real => row
                    .try_get::<Option<f32>, _>(name)
                    .ok()
                    .flatten()
                    .map(|f| Value::Float(f.into())),
                ColumnType::Double => row
                    .try_get::<Option<f64>, _>(name)
                    .ok()
                    .flatten()
                    .map(Value::Float),
                ColumnType::Varchar => row
                    .try_get::<Option<String>, _>(name)
                    .ok()
                    .flatten()
                    .map(Value::Text),
            };
            (c.name.clone(), value.unwrap_or_else(|| c.ty.zero()))
        })
        .collect();
    Ok(StoredRow { time, values })
}

#[async_trait]
impl TimeSeriesStore for PostgresStore {
    async fn register_relation(
        &self,
        relation: &str,
        columns: &[ColumnSpec],
    ) -> Result<Registration, SyncError> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent DDL on the same relation.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(relation)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, RegistryRecord>(
            r#"
            SELECT relation_name, active
            FROM signal_registry
            WHERE relation_name = $1
            FOR UPDATE
            "#,
        )
        .bind(relation)
        .fetch_optional(&mut *tx)
        .await?;

        let column_ddl: String = columns
            .iter()
            .map(|c| format!(", \"{}\" {}", c.name, c.ty.postgres_type()))
            .collect();
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{relation}" (id BIGSERIAL PRIMARY KEY, time TIMESTAMPTZ NOT NULL{column_ddl})"#
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
                    VALUES ($1, TRUE, NOW())
                    "#,
                )
                .bind(relation)
                .execute(&mut *tx)
                .await?;
                Registration::Created
            }
            Some(record) if record.active => Registration::AlreadyActive,
            Some(_) => {
                sqlx::query("UPDATE signal_registry SET active = TRUE WHERE relation_name = $1")
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
            sqlx::query_scalar("SELECT active FROM signal_registry WHERE relation_name = $1")
                .bind(relation)
                .fetch_optional(&self.pool)
                .await?;
        Ok(active.unwrap_or(false))
    }

    async fn deactivate_relation(&self, relation: &str) -> Result<(), SyncError> {
        sqlx::query("UPDATE signal_registry SET active = FALSE WHERE relation_name = $1")
            .bind(relation)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate_all(&self) -> Result<u64, SyncError> {
        let result = sqlx::query("UPDATE signal_registry SET active = FALSE WHERE active")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn discard_relation(&self, relation: &str) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM signal_registry WHERE relation_name = $1")
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
        let placeholders: String = (0..columns.len()).map(|i| format!(", ${}", i + 2)).collect();
        let sql = format!(
            r#"INSERT INTO "{relation}" (time{}) VALUES ($1{placeholders})"#,
            column_list(columns)
        );
        let mut query = sqlx::query(&sql).bind(time);
        for (column, value) in columns.iter().zip(ordered_values(columns, row)) {
            query = bind_typed(query, column.ty, value);
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
            Cutoff::Before(ts) => ("WHERE time < $1", Some(ts)),
            Cutoff::AtOrBefore(ts) => ("WHERE time <= $1", Some(ts)),
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
        let ts: Option<Timestamp> =
            sqlx::query_scalar(&format!(r#"SELECT MAX(time) FROM "{relation}""#))
                .fetch_one(&self.pool)
                .await?;
        Ok(ts)
    }

    async fn first_timestamp(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        let ts: Option<Timestamp> =
            sqlx::query_scalar(&format!(r#"SELECT MIN(time) FROM "{relation}""#))
                .fetch_one(&self.pool)
                .await?;
        Ok(ts)
    }

    async fn timestamps_between(
        &self,
        relation: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Timestamp>, SyncError> {
        let stamps = sqlx::query_scalar(&format!(
            r#"SELECT time FROM "{relation}" WHERE time >= $1 AND time <= $2 ORDER BY time ASC, id ASC"#
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(stamps)
    }

    async fn timestamps(&self, relation: &str) -> Result<Vec<Timestamp>, SyncError> {
        let stamps = sqlx::query_scalar(&format!(
            r#"SELECT time FROM "{relation}" ORDER BY time DESC, id DESC"#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(stamps)
    }

    async fn clear_rows(&self, relation: &str) -> Result<(), SyncError> {
        sqlx::query(&format!(r#"DELETE FROM "{relation}""#))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_watermark(&self, relation: &str) -> Result<Option<Timestamp>, SyncError> {
        let ts: Option<Option<Timestamp>> =
            sqlx::query_scalar("SELECT watermark FROM signal_registry WHERE relation_name = $1")
                .bind(relation)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts.flatten())
    }

    async fn advance_watermark(
        &self,
        relation: &str,
        to: Timestamp,
    ) -> Result<Option<Timestamp>, SyncError> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<Option<Timestamp>> = sqlx::query_scalar(
            "SELECT watermark FROM signal_registry WHERE relation_name = $1 FOR UPDATE",
        )
        .bind(relation)
        .fetch_optional(&mut *tx)
        .await?;
        sqlx::query("UPDATE signal_registry SET watermark = $2 WHERE relation_name = $1")
            .bind(relation)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(previous.flatten())
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
            VALUES ($1, $2, $3::jsonb)
            "#,
        )
        .bind(time)
        .bind(node_id)
        .bind(serde_json::to_string(payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_switches(&self, node_id: Option<&str>) -> Result<Vec<SwitchRecord>, SyncError> {
        let rows: Vec<(i64, Timestamp, String, String)> = sqlx::query_as(
            r#"
            SELECT id, time, node_id, payload::text
            FROM switch_history
            WHERE $1::text IS NULL OR node_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, time, node_id, payload)| {
                Ok(SwitchRecord {
                    id,
                    time,
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
