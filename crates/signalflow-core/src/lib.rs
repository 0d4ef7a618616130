// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! signalflow-core - Synchronization and Recovery Engine for Signal Graphs
//!
//! This crate keeps a directed acyclic graph of time-stamped signals consistent. Every
//! node persists its values as rows of its own relation; a node re-evaluates when its
//! upstreams commit, checkpoints detect commits that were missed, and upstreams can be
//! replaced while the graph keeps running.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      Application / SignalRuntime                      │
//! │            declare · set · value · snapshot · set_upstream            │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Engine                                  │
//! │   Topology (arena)   Synchronizer per node   Gate per node            │
//! │   listener task per node        checkpoint timer per source           │
//! └──────────────────────────────────────────────────────────────────────┘
//!           │                                            │
//!           │ rows, registry, watermarks                 │ change / checkpoint
//!           ▼                                            ▼ notices
//! ┌───────────────────────┐                  ┌───────────────────────────┐
//! │    TimeSeriesStore    │                  │   NotificationTransport   │
//! │ Postgres·SQLite·Memory│                  │ LISTEN/NOTIFY · in-process│
//! └───────────────────────┘                  └───────────────────────────┘
//! ```
//!
//! # Merge Modes
//!
//! | Mode | Buffering | Commits at |
//! |------|-----------|------------|
//! | Union | Bufferless | max of the arrival and every upstream's latest commit |
//! | Union | Buffered | max of one queued timestamp per upstream, FIFO-paired |
//! | Difference | (ignored) | "now", on every single arrival |
//!
//! Multi-column nodes collect values in a commit buffer; the row commits once every
//! column has a value.
//!
//! # Recovery
//!
//! Source nodes tick a checkpoint timer. Each tick advances the source's watermark and
//! publishes it; downstream nodes compare their own commits inside the
//! `(previous, current)` window against their upstreams' (see [`compare_and_restore`])
//! and recompute what they missed.
//!
//! # Switch-over
//!
//! ```text
//!  Idle ──▶ Blocked ──▶ Draining ──▶ Committed
//! ```
//!
//! [`SignalNode::set_upstream`] blocks the sources of the node, waits for every sink to
//! catch up with the work already in flight and only then rebinds.
//!
//! # Configuration
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `SIGNALFLOW_DATABASE_URL` | (required) | `postgres://…` or `sqlite:…` |
//! | `SIGNALFLOW_CHECKPOINT_INTERVAL_SECS` | disabled | checkpoint timer interval |
//! | `SIGNALFLOW_MAX_CONNECTIONS` | 5 | pool size |
//! | `SIGNALFLOW_AUDIT_SWITCHES` | false | record switch-overs |
//! | `SIGNALFLOW_REJECT_ACTIVE_DUPLICATES` | false | refuse active relations |
//! | `SIGNALFLOW_FAILURE_POLICY` | continue | `continue` or `propagate` |

#![deny(missing_docs)]

/// Checkpoint timers, consistency checks and restore.
pub mod checkpoint;

/// Time source for commits and watermarks.
pub mod clock;

/// Configuration loaded from environment variables.
pub mod config;

/// The engine: node table, listeners, evaluation and commit.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Propagation gate used by switch-overs.
pub mod gate;

/// Arena-backed graph topology.
pub mod graph;

/// Embedded SQL migrations.
pub mod migrations;

/// Node declarations, compute functions and node handles.
pub mod node;

/// Time-series store trait and backends.
pub mod persistence;

/// Embeddable runtime with builder.
pub mod runtime;

/// Live upstream replacement.
pub mod switchover;

/// Merge modes, commit buffer and checkpoint bookkeeping.
pub mod synchronizer;

/// Tracing subscriber setup.
pub mod telemetry;

/// Change and checkpoint notification transports.
pub mod transport;

/// Column values, types and timestamps.
pub mod value;

/// Boundary to derived-signal generators.
pub mod view;

pub use checkpoint::compare_and_restore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, EngineConfig};
pub use engine::{Commit, CommitKind, Engine, FailureHook, FailurePolicy, TracingFailureHook};
pub use error::{Result, SyncError};
pub use graph::NodeId;
pub use node::{Assignments, Compute, Inputs, NodeSpec, SignalNode, SubscriberId};
pub use persistence::{MemoryStore, PostgresStore, SqliteStore, TimeSeriesStore};
pub use runtime::{SignalRuntime, SignalRuntimeBuilder, SignalRuntimeConfig};
pub use switchover::{SwitchHandle, SwitchOutcome, SwitchStatus};
pub use synchronizer::{Buffering, MergeMode, MergePolicy};
pub use transport::{LocalTransport, NotificationTransport, PgNotifyTransport};
pub use value::{ColumnSpec, ColumnType, Row, StoredRow, Timestamp, Value};
pub use view::{AnalyticOp, ViewFactory, ViewKind, ViewRequest};
