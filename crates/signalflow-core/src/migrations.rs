// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for signalflow-core.
//!
//! Embedded migrations creating the registry and audit relations. Node relations are
//! created on demand when a node is declared.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use signalflow_core::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with all migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Relation names owned by the migrations; node ids may not map onto them.
pub const RESERVED_RELATIONS: &[&str] = &["signal_registry", "switch_history"];

/// Run PostgreSQL migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}

/// Whether a relation name collides with a migration-owned relation.
pub fn is_reserved(relation: &str) -> bool {
    RESERVED_RELATIONS.contains(&relation) || relation.starts_with("_sqlx")
}
