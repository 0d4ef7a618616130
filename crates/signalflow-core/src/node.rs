// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node declarations and the [`SignalNode`] handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::engine::{Commit, CommitKind, Engine, lock};
use crate::error::{Result, SyncError};
use crate::graph::NodeId;
use crate::persistence::Cutoff;
use crate::switchover::{SwitchHandle, SwitchStatus};
use crate::synchronizer::MergePolicy;
use crate::value::{ColumnSpec, ColumnType, Row, StoredRow, Timestamp, Value};

// ============================================================================
// Compute functions
// ============================================================================

/// Rows visible to a compute function.
#[derive(Debug, Clone)]
pub struct Inputs {
    at: Timestamp,
    upstreams: BTreeMap<String, Option<StoredRow>>,
    previous: Option<StoredRow>,
}

impl Inputs {
    pub(crate) fn new(
        at: Timestamp,
        upstreams: BTreeMap<String, Option<StoredRow>>,
        previous: Option<StoredRow>,
    ) -> Self {
        Self {
            at,
            upstreams,
            previous,
        }
    }

    /// Timestamp being evaluated.
    pub fn at(&self) -> Timestamp {
        self.at
    }

    /// Bound roles, sorted.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.upstreams.keys().map(String::as_str)
    }

    /// Row of the upstream bound as `role`, if it has committed anything.
    pub fn row(&self, role: &str) -> Option<&StoredRow> {
        self.upstreams.get(role)?.as_ref()
    }

    /// One column of an upstream row.
    pub fn get(&self, role: &str, column: &str) -> Option<&Value> {
        self.row(role)?.values.get(column)
    }

    /// One column of an upstream row, as a float.
    pub fn f64(&self, role: &str, column: &str) -> Option<f64> {
        self.get(role, column)?.as_f64()
    }

    /// Commit time of the upstream row that was read.
    pub fn time(&self, role: &str) -> Option<Timestamp> {
        self.row(role).map(|r| r.time)
    }

    /// This node's own previous row.
    pub fn previous(&self) -> Option<&StoredRow> {
        self.previous.as_ref()
    }

    /// Copy every column that an upstream row carries under the same name.
    pub(crate) fn copy_matching(&self, columns: &[ColumnSpec], out: &mut Assignments) {
        for column in columns {
            let found = self
                .upstreams
                .values()
                .flatten()
                .find_map(|row| row.values.get(&column.name));
            if let Some(value) = found {
                out.set(column.name.clone(), value.clone());
            }
        }
    }
}

/// Column values written by a compute function.
#[derive(Debug, Clone, Default)]
pub struct Assignments {
    values: Row,
}

impl Assignments {
    /// Assign a column.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// Value assigned so far.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Fill unassigned columns from `previous`, then with zero values.
    pub(crate) fn complete(mut self, columns: &[ColumnSpec], previous: Option<&StoredRow>) -> Row {
        columns
            .iter()
            .map(|c| {
                let value = self
                    .values
                    .remove(&c.name)
                    .or_else(|| previous.and_then(|p| p.values.get(&c.name).cloned()))
                    .map_or_else(|| c.ty.zero(), |v| v.coerce(c.ty));
                (c.name.clone(), value)
            })
            .collect()
    }
}

/// Computes a node's row from its inputs.
pub trait Compute: Send + Sync {
    /// Write the node's columns for `inputs.at()`.
    fn compute(&self, inputs: &Inputs, out: &mut Assignments);
}

impl<F> Compute for F
where
    F: Fn(&Inputs, &mut Assignments) + Send + Sync,
{
    fn compute(&self, inputs: &Inputs, out: &mut Assignments) {
        self(inputs, out)
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// Declaration of a node, passed to [`Engine::declare`].
///
/// ```ignore
/// let avg = engine
///     .declare(
///         NodeSpec::new("avg_temp")
///             .column("value", ColumnType::Double)
///             .upstream("left", "temp_a")
///             .upstream("right", "temp_b")
///             .compute(|inputs: &Inputs, out: &mut Assignments| {
///                 let l = inputs.f64("left", "value").unwrap_or_default();
///                 let r = inputs.f64("right", "value").unwrap_or_default();
///                 out.set("value", (l + r) / 2.0);
///             }),
///     )
///     .await?;
/// ```
#[derive(Clone)]
pub struct NodeSpec {
    pub(crate) id: String,
    pub(crate) columns: Vec<ColumnSpec>,
    pub(crate) policy: MergePolicy,
    pub(crate) checkpoint_interval: Option<Duration>,
    pub(crate) upstreams: Vec<(String, String)>,
    pub(crate) compute: Option<Arc<dyn Compute>>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("columns", &self.columns)
            .field("policy", &self.policy)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("upstreams", &self.upstreams)
            .field("compute", &self.compute.as_ref().map(|_| "..."))
            .finish()
    }
}

impl NodeSpec {
    /// Start a declaration for node `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            columns: Vec::new(),
            policy: MergePolicy::default(),
            checkpoint_interval: None,
            upstreams: Vec::new(),
            compute: None,
        }
    }

    /// Add a value column.
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnSpec::new(name, ty));
        self
    }

    /// Set the merge policy (default: union, bufferless).
    pub fn policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Checkpoint interval for the sources feeding this node.
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    /// Bind the node with id `upstream` under `role`.
    pub fn upstream(mut self, role: impl Into<String>, upstream: impl Into<String>) -> Self {
        self.upstreams.push((role.into(), upstream.into()));
        self
    }

    /// Compute function; without one, same-named upstream columns are copied.
    pub fn compute(mut self, compute: impl Compute + 'static) -> Self {
        self.compute = Some(Arc::new(compute));
        self
    }
}

// ============================================================================
// SignalNode
// ============================================================================

/// Identifier returned by [`SignalNode::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Handle to a declared node. Cloning is cheap.
#[derive(Clone)]
pub struct SignalNode {
    engine: Engine,
    node: NodeId,
    id: String,
    relation: String,
}

impl fmt::Debug for SignalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalNode")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}

impl PartialEq for SignalNode {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.id == other.id
    }
}

impl SignalNode {
    pub(crate) fn new(engine: Engine, node: NodeId, id: String, relation: String) -> Self {
        Self {
            engine,
            node,
            id,
            relation,
        }
    }

    /// Node id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name used by view generators; same as the id.
    pub fn name(&self) -> &str {
        &self.id
    }

    /// Relation backing the node.
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Arena handle.
    pub fn handle(&self) -> NodeId {
        self.node
    }

    /// The engine this node lives in.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Declared columns.
    pub fn columns(&self) -> Result<Vec<ColumnSpec>> {
        Ok(self.engine.runtime(self.node)?.columns.clone())
    }

    // ------------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------------

    /// Offer one column value. The row commits once every column has a value.
    pub async fn set(&self, column: &str, value: impl Into<Value>) -> Result<Option<Commit>> {
        let values = Row::from([(column.to_string(), value.into())]);
        self.set_row(values).await
    }

    /// Offer several column values at once.
    pub async fn set_row(&self, values: Row) -> Result<Option<Commit>> {
        let result = self.engine.set_values(self.node, values).await;
        self.engine.contain(&self.id, "set", result)
    }

    /// Set `column` only if the node has never committed.
    pub async fn set_if_not_initialized(
        &self,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Commit>> {
        if self.is_initialized().await? {
            return Ok(None);
        }
        self.set(column, value).await
    }

    /// Value of `column` in the current view: live, or the most recent row strictly
    /// before the snapshot cursor. A node without rows reads as the zero value.
    pub async fn value(&self, column: &str) -> Result<Value> {
        let rt = self.engine.runtime(self.node)?;
        let spec = rt.column(column).ok_or_else(|| SyncError::UnknownColumn {
            node_id: self.id.clone(),
            column: column.to_string(),
        })?;
        let zero = spec.ty.zero();
        Ok(self
            .row()
            .await?
            .and_then(|mut row| row.values.remove(column))
            .unwrap_or(zero))
    }

    /// Row in the current view.
    pub async fn row(&self) -> Result<Option<StoredRow>> {
        let rt = self.engine.runtime(self.node)?;
        let cutoff = match lock(&rt.view).cursor {
            Some(cursor) => Cutoff::Before(cursor),
            None => Cutoff::Latest,
        };
        self.engine
            .store()
            .row_as_of(&rt.relation, &rt.columns, cutoff)
            .await
    }

    /// Move the view cursor to `ts`. At or past the latest commit, return to live.
    pub async fn snapshot(&self, ts: Timestamp) -> Result<()> {
        let rt = self.engine.runtime(self.node)?;
        let latest = self.engine.store().latest_timestamp(&rt.relation).await?;
        let cursor = match latest {
            Some(latest) if ts < latest => Some(ts),
            _ => None,
        };
        lock(&rt.view).cursor = cursor;
        Ok(())
    }

    /// Current snapshot cursor; `None` means live.
    pub fn cursor(&self) -> Result<Option<Timestamp>> {
        Ok(lock(&self.engine.runtime(self.node)?.view).cursor)
    }

    /// Most recent commit timestamp.
    pub async fn latest_timestamp(&self) -> Result<Option<Timestamp>> {
        self.engine.store().latest_timestamp(&self.relation).await
    }

    /// Oldest commit timestamp.
    pub async fn first_timestamp(&self) -> Result<Option<Timestamp>> {
        self.engine.store().first_timestamp(&self.relation).await
    }

    /// Every commit timestamp, most recent first.
    pub async fn timestamp_list(&self) -> Result<Vec<Timestamp>> {
        self.engine.store().timestamps(&self.relation).await
    }

    /// Whether the node has committed at least once.
    pub async fn is_initialized(&self) -> Result<bool> {
        Ok(self.latest_timestamp().await?.is_some())
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    /// Call `callback` after every commit of this node, restores included.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Commit) + Send + Sync + 'static,
    ) -> Result<SubscriberId> {
        let rt = self.engine.runtime(self.node)?;
        let id = rt.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&rt.subscribers).push((id, Arc::new(callback)));
        Ok(SubscriberId(id))
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<bool> {
        let rt = self.engine.runtime(self.node)?;
        let mut subscribers = lock(&rt.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id.0);
        Ok(subscribers.len() != before)
    }

    /// Receiver of every commit of this node.
    pub fn commits(&self) -> Result<broadcast::Receiver<Commit>> {
        Ok(self.engine.runtime(self.node)?.commits.subscribe())
    }

    /// Fire the callbacks again with the latest row.
    pub async fn effect(&self) -> Result<()> {
        let result = self.emit_latest().await;
        self.engine.contain(&self.id, "effect", result)
    }

    async fn emit_latest(&self) -> Result<()> {
        let rt = self.engine.runtime(self.node)?;
        let latest = self
            .engine
            .store()
            .row_as_of(&rt.relation, &rt.columns, Cutoff::Latest)
            .await?;
        if let Some(row) = latest {
            let commit = Commit {
                node: rt.id.clone(),
                time: row.time,
                values: row.values,
                kind: CommitKind::Live,
            };
            self.engine.emit(&rt, &commit);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Delete every row and forget pending arrivals.
    pub async fn reset(&self) -> Result<()> {
        let rt = self.engine.runtime(self.node)?;
        let mut sync = rt.sync.lock().await;
        self.engine.store().clear_rows(&rt.relation).await?;
        sync.reset();
        *lock(&rt.view) = Default::default();
        Ok(())
    }

    /// Return to the live view and reload the latest row.
    pub async fn resume(&self) -> Result<Option<StoredRow>> {
        let rt = self.engine.runtime(self.node)?;
        let latest = self
            .engine
            .store()
            .row_as_of(&rt.relation, &rt.columns, Cutoff::Latest)
            .await?;
        {
            let mut view = lock(&rt.view);
            view.cursor = None;
            view.last_live = latest.as_ref().map(|r| r.time);
        }
        Ok(latest)
    }

    /// Stop the node and drop its relation.
    pub async fn discard(&self) -> Result<()> {
        self.engine.discard(self.node).await
    }

    // ------------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------------

    /// Bind `upstream` under `role`.
    pub async fn register_upstream(&self, role: &str, upstream: &SignalNode) -> Result<()> {
        crate::value::validate_identifier("role", role)?;
        let upstream = self.local(upstream)?;
        self.engine.connect(self.node, role, upstream).await
    }

    /// Feed an arrival from `from` at `ts`, as its listener would.
    pub async fn reval(&self, from: &SignalNode, ts: Timestamp) -> Result<usize> {
        let from = self.local(from)?;
        let result = self.engine.reval(self.node, from, ts).await;
        self.engine.contain(&self.id, "reval", result)
    }

    /// Restore every upstream commit in `[from, to]` this node is missing.
    pub async fn ensure_consistency(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Timestamp>> {
        let result = self.engine.ensure_consistency(self.node, from, to).await;
        self.engine.contain(&self.id, "ensure_consistency", result)
    }

    /// Recompute and write the row at a historical timestamp.
    pub async fn restore(&self, ts: Timestamp) -> Result<Option<Commit>> {
        let result = self.engine.restore(self.node, ts).await.map(Some);
        self.engine.contain(&self.id, "restore", result)
    }

    /// Record a checkpoint arrival for the window `[from, to]`.
    ///
    /// Recovery runs on every N-th arrival, N being the number of upstreams, and then
    /// continues downstream. Returns the number of restored rows.
    pub async fn push_checkpoint(&self, from: Timestamp, to: Timestamp) -> Result<usize> {
        let result = self.engine.recover(vec![self.node], (from, to)).await;
        self.engine.contain(&self.id, "push_checkpoint", result)
    }

    /// Run one checkpoint tick now. Returns the previous watermark.
    pub async fn checkpoint_tick(&self) -> Result<Option<Timestamp>> {
        let result = self.engine.checkpoint_tick(self.node).await;
        self.engine.contain(&self.id, "checkpoint_tick", result)
    }

    /// Last checkpoint window seen by this node.
    pub async fn checkpoint_window(&self) -> Result<(Option<Timestamp>, Option<Timestamp>)> {
        let rt = self.engine.runtime(self.node)?;
        let sync = rt.sync.lock().await;
        Ok(sync.checkpoint.window())
    }

    /// Replace the upstream bound as `role` with `upstream`.
    pub async fn set_upstream(&self, role: &str, upstream: &SignalNode) -> Result<SwitchHandle> {
        let upstream = self.local(upstream)?;
        self.engine.set_upstream(self.node, role, upstream).await
    }

    /// Arena handle of `other`, which must belong to the same engine.
    fn local(&self, other: &SignalNode) -> Result<NodeId> {
        if self.engine.same_engine(&other.engine) {
            Ok(other.node)
        } else {
            Err(SyncError::NodeNotFound {
                node_id: other.id.clone(),
            })
        }
    }

    /// Current switch-over state.
    pub fn switch_status(&self) -> Result<SwitchStatus> {
        Ok(*self.engine.runtime(self.node)?.status.borrow())
    }

    /// Whether propagation from this node is held by a switch-over.
    pub fn is_blocked(&self) -> Result<bool> {
        Ok(self.engine.runtime(self.node)?.gate.is_blocked())
    }

    // ------------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------------

    /// Upstream bindings as `(role, node)`.
    pub fn upstreams(&self) -> Vec<(String, SignalNode)> {
        let bindings = self.engine.graph().upstreams(self.node).to_vec();
        bindings
            .into_iter()
            .map(|(role, up)| (role, self.engine.signal(up)))
            .collect()
    }

    /// Nodes fed by this one.
    pub fn downstreams(&self) -> Vec<SignalNode> {
        let downs = self.engine.graph().downstreams(self.node).to_vec();
        downs.into_iter().map(|d| self.engine.signal(d)).collect()
    }
}
