// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The signal engine.
//!
//! [`Engine`] owns the store, the notification transport and the topology, and runs one
//! listener task per declared node. A listener wakes on its node's data topic and
//! re-evaluates every downstream node; on its checkpoint topic it starts recovery (see
//! [`crate::checkpoint`]).
//!
//! Lock order: topology, then node table, then per-node synchronizer. The topology and
//! node table are never held across an await.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::gate::Gate;
use crate::graph::{NodeId, Topology};
use crate::migrations;
use crate::node::{Assignments, Compute, Inputs, NodeSpec, SignalNode};
use crate::persistence::{Cutoff, Registration, TimeSeriesStore, ordered_values};
use crate::switchover::{PendingSwitch, SwitchStatus};
use crate::synchronizer::{Buffering, MergeMode, Offer, Synchronizer};
use crate::transport::{
    ChangeNotice, CheckpointNotice, NotificationTransport, Subscription, checkpoint_topic,
    data_topic,
};
use crate::value::{ColumnSpec, Row, Timestamp, relation_name, validate_identifier};

const COMMIT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Commits
// ============================================================================

/// Why a row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// Regular commit, published to downstream nodes.
    Live,
    /// Historical commit written by recovery. Not published.
    Restore,
}

/// A committed row, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Node id.
    pub node: String,
    /// Commit timestamp.
    pub time: Timestamp,
    /// Column values, coerced to the column types.
    pub values: Row,
    /// Live or restore.
    pub kind: CommitKind,
}

// ============================================================================
// Failure handling
// ============================================================================

/// What caller-facing operations do with store and transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Report to the hook and carry on; the next notification or tick is the retry.
    #[default]
    ContinueGraph,
    /// Return the error to the caller.
    Propagate,
}

impl FailurePolicy {
    /// Parse `continue` or `propagate`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" | "continue_graph" => Some(Self::ContinueGraph),
            "propagate" => Some(Self::Propagate),
            _ => None,
        }
    }
}

/// Observer for failures the engine contains instead of returning.
pub trait FailureHook: Send + Sync {
    /// Called with the node id, the failed operation and the error.
    fn on_failure(&self, node: &str, operation: &str, error: &SyncError);
}

/// Hook that logs failures with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureHook;

impl FailureHook for TracingFailureHook {
    fn on_failure(&self, node: &str, operation: &str, error: &SyncError) {
        error!(
            node = %node,
            operation = %operation,
            error_code = error.error_code(),
            error = %error,
            "Signal operation failed"
        );
    }
}

// ============================================================================
// Node runtime
// ============================================================================

pub(crate) type Callback = Arc<dyn Fn(&Commit) + Send + Sync>;

#[derive(Debug, Default)]
pub(crate) struct ViewState {
    /// Snapshot cursor; `None` is the live view.
    pub(crate) cursor: Option<Timestamp>,
    /// Timestamp of the last live commit.
    pub(crate) last_live: Option<Timestamp>,
}

/// Everything the engine keeps for one declared node.
pub(crate) struct NodeRuntime {
    pub(crate) node: NodeId,
    pub(crate) id: String,
    pub(crate) relation: String,
    pub(crate) columns: Vec<ColumnSpec>,
    pub(crate) compute: Option<Arc<dyn Compute>>,
    pub(crate) interval: Option<Duration>,
    pub(crate) gate: Gate,
    pub(crate) sync: tokio::sync::Mutex<Synchronizer>,
    pub(crate) view: Mutex<ViewState>,
    pub(crate) commits: broadcast::Sender<Commit>,
    pub(crate) subscribers: Mutex<Vec<(u64, Callback)>>,
    pub(crate) next_subscriber: AtomicU64,
    pub(crate) switch: tokio::sync::Mutex<Option<PendingSwitch>>,
    pub(crate) status: watch::Sender<SwitchStatus>,
    pub(crate) switch_listeners: Mutex<BTreeSet<NodeId>>,
    pub(crate) timer_started: AtomicBool,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    fn new(node: NodeId, relation: String, spec: NodeSpec, default_interval: Option<Duration>) -> Self {
        let names = spec.columns.iter().map(|c| c.name.clone()).collect();
        let mut sync = Synchronizer::new(spec.policy, names);
        let interval = spec.checkpoint_interval.or(default_interval);
        sync.checkpoint.interval = interval;
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        Self {
            node,
            id: spec.id,
            relation,
            columns: spec.columns,
            compute: spec.compute,
            interval,
            gate: Gate::new(),
            sync: tokio::sync::Mutex::new(sync),
            view: Mutex::new(ViewState::default()),
            commits,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            switch: tokio::sync::Mutex::new(None),
            status: watch::channel(SwitchStatus::Idle).0,
            switch_listeners: Mutex::new(BTreeSet::new()),
            timer_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    store: Arc<dyn TimeSeriesStore>,
    transport: Arc<dyn NotificationTransport>,
    clock: Arc<dyn Clock>,
    hook: Arc<dyn FailureHook>,
    config: EngineConfig,
    graph: RwLock<Topology>,
    nodes: RwLock<Vec<Arc<NodeRuntime>>>,
    shutdown: watch::Sender<bool>,
}

/// Shared handle to a running signal graph. Cloning is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("nodes", &self.graph().len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over the given store, transport, clock and failure hook.
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        transport: Arc<dyn NotificationTransport>,
        clock: Arc<dyn Clock>,
        hook: Arc<dyn FailureHook>,
        config: EngineConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                clock,
                hook,
                config,
                graph: RwLock::new(Topology::new()),
                nodes: RwLock::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.inner.store
    }

    pub(crate) fn transport(&self) -> &Arc<dyn NotificationTransport> {
        &self.inner.transport
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current time according to the engine's clock.
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub(crate) fn graph(&self) -> RwLockReadGuard<'_, Topology> {
        self.inner.graph.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn graph_mut(&self) -> RwLockWriteGuard<'_, Topology> {
        self.inner.graph.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub(crate) fn same_engine(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runtime of a live node.
    pub(crate) fn runtime(&self, node: NodeId) -> Result<Arc<NodeRuntime>> {
        {
            let graph = self.graph();
            match graph.entry(node) {
                Some(entry) if entry.discarded => {
                    return Err(SyncError::NodeNotFound {
                        node_id: entry.id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(SyncError::NodeNotFound {
                        node_id: node.to_string(),
                    });
                }
            }
        }
        self.runtime_of(node).ok_or_else(|| SyncError::NodeNotFound {
            node_id: node.to_string(),
        })
    }

    /// Runtime of any node ever declared, discarded ones included.
    pub(crate) fn runtime_of(&self, node: NodeId) -> Option<Arc<NodeRuntime>> {
        self.inner
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node.index())
            .cloned()
    }

    pub(crate) fn signal(&self, node: NodeId) -> SignalNode {
        let (id, relation) = {
            let graph = self.graph();
            (graph.name(node).to_string(), graph.relation(node).to_string())
        };
        SignalNode::new(self.clone(), node, id, relation)
    }

    /// Handle of a live node by id.
    pub fn node(&self, id: &str) -> Option<SignalNode> {
        let node = self.graph().lookup(id)?;
        Some(self.signal(node))
    }

    /// Handles of every live node, in declaration order.
    pub fn nodes(&self) -> Vec<SignalNode> {
        let live: Vec<NodeId> = {
            let graph = self.graph();
            (0..graph.len() as u32)
                .map(NodeId)
                .filter(|n| graph.entry(*n).is_some_and(|e| !e.discarded))
                .collect()
        };
        live.into_iter().map(|n| self.signal(n)).collect()
    }

    /// Check the store is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.inner.store.health_check().await
    }

    // ------------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------------

    pub(crate) fn report(&self, node: &str, operation: &str, error: &SyncError) {
        self.inner.hook.on_failure(node, operation, error);
    }

    /// Apply the failure policy to the result of a caller-facing operation.
    ///
    /// Only transient (store and transport) errors are contained.
    pub(crate) fn contain<T: Default>(
        &self,
        node: &str,
        operation: &'static str,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Err(e)
                if e.is_transient()
                    && self.inner.config.failure_policy == FailurePolicy::ContinueGraph =>
            {
                self.report(node, operation, &e);
                Ok(T::default())
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------------
    // Declaration
    // ------------------------------------------------------------------------

    /// Declare a node: register its relation, add it to the graph, wire its upstreams
    /// and start its listener.
    #[instrument(skip(self, spec), fields(node = %spec.id))]
    pub async fn declare(&self, spec: NodeSpec) -> Result<SignalNode> {
        validate_identifier("id", &spec.id)?;
        if spec.columns.is_empty() {
            return Err(SyncError::validation(
                "columns",
                "a node needs at least one column",
            ));
        }
        let mut seen = BTreeSet::new();
        for column in &spec.columns {
            validate_identifier("column", &column.name)?;
            if column.name == "id" || column.name == "time" || !seen.insert(column.name.as_str())
            {
                return Err(SyncError::validation(
                    "column",
                    format!("'{}' is reserved or declared twice", column.name),
                ));
            }
        }
        let mut roles = BTreeSet::new();
        for (role, _) in &spec.upstreams {
            validate_identifier("role", role)?;
            if !roles.insert(role.as_str()) {
                return Err(SyncError::validation(
                    "role",
                    format!("'{}' is bound twice", role),
                ));
            }
        }
        let relation = relation_name(&spec.id);
        if migrations::is_reserved(&relation) {
            return Err(SyncError::validation(
                "id",
                format!("'{}' is a reserved relation name", relation),
            ));
        }
        let upstreams: Vec<(String, NodeId)> = {
            let graph = self.graph();
            spec.upstreams
                .iter()
                .map(|(role, id)| {
                    graph
                        .lookup(id)
                        .map(|up| (role.clone(), up))
                        .ok_or_else(|| SyncError::NodeNotFound {
                            node_id: id.clone(),
                        })
                })
                .collect::<Result<_>>()?
        };

        let id = spec.id.clone();
        let columns = spec.columns.clone();
        let node = {
            let mut graph = self.graph_mut();
            let node = graph.insert(&id, &relation)?;
            let runtime = NodeRuntime::new(
                node,
                relation.clone(),
                spec,
                self.inner.config.checkpoint_interval,
            );
            self.inner
                .nodes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::new(runtime));
            node
        };

        let registration = match self.inner.store.register_relation(&relation, &columns).await {
            Ok(Registration::AlreadyActive) if self.inner.config.reject_active_duplicates => {
                self.graph_mut().remove(node);
                return Err(SyncError::DuplicateNode { node_id: id });
            }
            Ok(registration) => registration,
            Err(e) => {
                self.graph_mut().remove(node);
                return Err(e);
            }
        };
        match registration {
            Registration::AlreadyActive => {
                warn!(relation = %relation, "Relation already active, sharing it");
            }
            Registration::Reactivated => {
                info!(relation = %relation, "Reactivated existing relation");
            }
            Registration::Created => {
                debug!(relation = %relation, "Created relation");
            }
        }

        let rt = self.runtime(node)?;
        if let Err(e) = self.bring_up(&rt, upstreams).await {
            self.abandon_declare(&rt, registration).await;
            return Err(e);
        }

        info!(relation = %relation, columns = columns.len(), "Signal declared");
        Ok(SignalNode::new(self.clone(), node, id, relation))
    }

    /// Wire a freshly inserted node and start its tasks.
    async fn bring_up(
        &self,
        rt: &Arc<NodeRuntime>,
        upstreams: Vec<(String, NodeId)>,
    ) -> Result<()> {
        for (role, up) in upstreams {
            self.connect(rt.node, &role, up).await?;
        }
        let latest = self.inner.store.latest_timestamp(&rt.relation).await?;
        lock(&rt.view).last_live = latest;
        self.start_listener(rt).await?;
        if let Some(interval) = rt.interval
            && self.graph().is_source(rt.node)
        {
            self.start_timer(rt.node, interval);
        }
        Ok(())
    }

    /// Undo a declaration that failed after the node entered the graph.
    ///
    /// The id is freed, upstream edges are dropped and a relation this call activated is
    /// deactivated again. Rows already stored are kept.
    async fn abandon_declare(&self, rt: &NodeRuntime, registration: Registration) {
        self.graph_mut().remove(rt.node);
        for handle in lock(&rt.tasks).drain(..) {
            handle.abort();
        }
        if registration != Registration::AlreadyActive
            && let Err(e) = self.inner.store.deactivate_relation(&rt.relation).await
        {
            warn!(relation = %rt.relation, error = %e, "Failed to deactivate relation");
        }
        warn!(node = %rt.id, "Declaration abandoned");
    }

    /// Bind `upstream` under `role` and start tracking its arrivals.
    pub(crate) async fn connect(&self, node: NodeId, role: &str, upstream: NodeId) -> Result<()> {
        self.runtime(upstream)?;
        let rt = self.runtime(node)?;
        let (sources, closure) = {
            let mut graph = self.graph_mut();
            graph.connect(node, role, upstream)?;
            (graph.sources_of(upstream), graph.downstream_closure(node))
        };
        {
            let mut sync = rt.sync.lock().await;
            sync.register_upstream(upstream);
            sync.merge_sources(sources.iter().copied());
        }
        for down in closure {
            if let Some(down_rt) = self.runtime_of(down) {
                down_rt.sync.lock().await.merge_sources(sources.iter().copied());
            }
        }
        if let Some(interval) = rt.interval {
            for source in sources {
                self.start_timer(source, interval);
            }
        }
        debug!(node = %rt.id, role = %role, "Upstream registered");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------------

    async fn start_listener(&self, rt: &Arc<NodeRuntime>) -> Result<()> {
        let data = self
            .inner
            .transport
            .subscribe(&data_topic(&rt.relation))
            .await?;
        let checkpoints = self
            .inner
            .transport
            .subscribe(&checkpoint_topic(&rt.relation))
            .await?;
        let engine = self.clone();
        let node = rt.node;
        let handle = tokio::spawn(engine.run_listener(node, data, checkpoints));
        lock(&rt.tasks).push(handle);
        Ok(())
    }

    async fn run_listener(self, node: NodeId, mut data: Subscription, mut checkpoints: Subscription) {
        let Some(rt) = self.runtime_of(node) else {
            return;
        };
        let mut shutdown = self.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        debug!(node = %rt.id, "Listener started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(node = %rt.id, "Listener stopping");
                    break;
                }
                message = data.recv() => {
                    let Some(message) = message else {
                        warn!(node = %rt.id, topic = %data.topic(), "Data subscription closed");
                        break;
                    };
                    let notice: ChangeNotice = match serde_json::from_str(&message.payload) {
                        Ok(notice) => notice,
                        Err(e) => {
                            warn!(node = %rt.id, error = %e, "Ignoring malformed change notice");
                            continue;
                        }
                    };
                    tokio::select! {
                        _ = rt.gate.wait_open() => {}
                        _ = shutdown.changed() => break,
                    }
                    self.propagate(node, notice.time).await;
                }
                message = checkpoints.recv() => {
                    let Some(message) = message else {
                        warn!(node = %rt.id, topic = %checkpoints.topic(), "Checkpoint subscription closed");
                        break;
                    };
                    match serde_json::from_str::<CheckpointNotice>(&message.payload) {
                        Ok(notice) => {
                            if let Err(e) = self.on_checkpoint(node, notice.watermark).await {
                                self.report(&rt.id, "checkpoint", &e);
                            }
                        }
                        Err(e) => {
                            warn!(node = %rt.id, error = %e, "Ignoring malformed checkpoint notice");
                        }
                    }
                }
            }
        }
    }

    /// Re-evaluate every downstream of `node` after it committed at `ts`.
    pub(crate) async fn propagate(&self, node: NodeId, ts: Timestamp) {
        let downstreams = self.graph().downstreams(node).to_vec();
        for down in downstreams {
            if let Err(e) = self.reval(down, node, ts).await {
                let name = self.graph().name(down).to_string();
                self.report(&name, "reval", &e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Evaluation and commit
    // ------------------------------------------------------------------------

    /// Apply an arrival from `from` at `ts` and run the evaluations it releases.
    ///
    /// Returns how many rows were committed.
    pub(crate) async fn reval(&self, node: NodeId, from: NodeId, ts: Timestamp) -> Result<usize> {
        let rt = self.runtime(node)?;
        let mut sync = rt.sync.lock().await;

        let policy = sync.policy();
        let mut latest = BTreeMap::new();
        if policy.mode == MergeMode::Union && policy.buffering == Buffering::Bufferless {
            let relations: Vec<(NodeId, String)> = {
                let graph = self.graph();
                sync.upstreams()
                    .iter()
                    .map(|u| (*u, graph.relation(*u).to_string()))
                    .collect()
            };
            for (up, relation) in relations {
                if let Some(t) = self.inner.store.latest_timestamp(&relation).await? {
                    latest.insert(up, t);
                }
            }
        }

        let evaluations = sync.arrive(from, ts, &latest, self.now());
        let mut committed = 0;
        for evaluation in evaluations {
            let row = self.evaluate(&rt, &evaluation.cursors, evaluation.at).await?;
            if self.offer_row(&rt, &mut sync, evaluation.at, row).await?.is_some() {
                committed += 1;
            }
        }
        drop(sync);

        if committed > 0 {
            self.notify_switches(&rt).await;
        }
        Ok(committed)
    }

    /// Compute a full row for `rt` at `at`.
    ///
    /// Upstream rows are read at or before their cursor (default `at`); the node's own
    /// previous row is read through its view cursor.
    pub(crate) async fn evaluate(
        &self,
        rt: &NodeRuntime,
        cursors: &BTreeMap<NodeId, Timestamp>,
        at: Timestamp,
    ) -> Result<Row> {
        let bindings: Vec<(String, NodeId, String)> = {
            let graph = self.graph();
            graph
                .upstreams(rt.node)
                .iter()
                .map(|(role, up)| (role.clone(), *up, graph.relation(*up).to_string()))
                .collect()
        };

        let mut upstream_rows = BTreeMap::new();
        for (role, up, relation) in bindings {
            let Some(up_rt) = self.runtime_of(up) else {
                continue;
            };
            let cutoff = Cutoff::AtOrBefore(cursors.get(&up).copied().unwrap_or(at));
            let row = self
                .inner
                .store
                .row_as_of(&relation, &up_rt.columns, cutoff)
                .await?;
            upstream_rows.insert(role, row);
        }

        let own = match lock(&rt.view).cursor {
            Some(cursor) => Cutoff::Before(cursor),
            None => Cutoff::Latest,
        };
        let previous = self
            .inner
            .store
            .row_as_of(&rt.relation, &rt.columns, own)
            .await?;

        let inputs = Inputs::new(at, upstream_rows, previous);
        let mut out = Assignments::default();
        match &rt.compute {
            Some(compute) => compute.compute(&inputs, &mut out),
            None => inputs.copy_matching(&rt.columns, &mut out),
        }
        Ok(out.complete(&rt.columns, inputs.previous()))
    }

    /// Offer every column of `row` to the commit buffer and commit if it completes.
    pub(crate) async fn offer_row(
        &self,
        rt: &NodeRuntime,
        sync: &mut Synchronizer,
        at: Timestamp,
        row: Row,
    ) -> Result<Option<Commit>> {
        let mut complete = None;
        for column in &rt.columns {
            let value = row
                .get(&column.name)
                .cloned()
                .unwrap_or_else(|| column.ty.zero());
            if let Offer::Complete(values) = sync.buffer.offer(&column.name, value) {
                complete = Some(values);
            }
        }
        match complete {
            Some(values) => Ok(Some(self.commit_live(rt, at, values).await?)),
            None => Ok(None),
        }
    }

    /// Offer caller-supplied values, committing at "now" when the row completes.
    pub(crate) async fn set_values(&self, node: NodeId, values: Row) -> Result<Option<Commit>> {
        let rt = self.runtime(node)?;
        for column in values.keys() {
            if rt.column(column).is_none() {
                return Err(SyncError::UnknownColumn {
                    node_id: rt.id.clone(),
                    column: column.clone(),
                });
            }
        }

        let mut sync = rt.sync.lock().await;
        let mut committed = None;
        for (column, value) in values {
            if let Offer::Complete(row) = sync.buffer.offer(&column, value) {
                committed = Some(self.commit_live(&rt, self.now(), row).await?);
            }
        }
        drop(sync);

        if committed.is_some() {
            self.notify_switches(&rt).await;
        }
        Ok(committed)
    }

    /// Write a live row, fire callbacks and publish the change.
    ///
    /// The commit time never goes below the previous live commit.
    async fn commit_live(&self, rt: &NodeRuntime, at: Timestamp, values: Row) -> Result<Commit> {
        let time = lock(&rt.view).last_live.map_or(at, |last| last.max(at));
        let commit = self.write(rt, time, values, CommitKind::Live).await?;
        lock(&rt.view).last_live = Some(time);

        let notice = serde_json::to_string(&ChangeNotice {
            node: rt.id.clone(),
            time,
        })?;
        if let Err(e) = self
            .inner
            .transport
            .publish(&data_topic(&rt.relation), &notice)
            .await
        {
            self.report(&rt.id, "publish", &e);
        }
        debug!(node = %rt.id, time = %time, "Committed row");
        Ok(commit)
    }

    /// Write a historical row without publishing it.
    pub(crate) async fn commit_restore(
        &self,
        rt: &NodeRuntime,
        time: Timestamp,
        values: Row,
    ) -> Result<Commit> {
        let commit = self.write(rt, time, values, CommitKind::Restore).await?;
        info!(node = %rt.id, time = %time, "Restored row");
        Ok(commit)
    }

    async fn write(
        &self,
        rt: &NodeRuntime,
        time: Timestamp,
        values: Row,
        kind: CommitKind,
    ) -> Result<Commit> {
        let values: Row = rt
            .columns
            .iter()
            .map(|c| c.name.clone())
            .zip(ordered_values(&rt.columns, &values))
            .collect();
        self.inner
            .store
            .insert_row(&rt.relation, &rt.columns, time, &values)
            .await?;
        let commit = Commit {
            node: rt.id.clone(),
            time,
            values,
            kind,
        };
        self.emit(rt, &commit);
        Ok(commit)
    }

    /// Fire subscriber callbacks and the broadcast channel.
    pub(crate) fn emit(&self, rt: &NodeRuntime, commit: &Commit) {
        let callbacks: Vec<Callback> = lock(&rt.subscribers)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(commit);
        }
        // No receivers is fine.
        let _ = rt.commits.send(commit.clone());
    }

    /// Re-check every pending switch waiting on `rt`.
    pub(crate) async fn notify_switches(&self, rt: &NodeRuntime) {
        let waiting: Vec<NodeId> = lock(&rt.switch_listeners).iter().copied().collect();
        for node in waiting {
            if let Err(e) = self.poke_switch(node).await {
                let name = self.graph().name(node).to_string();
                self.report(&name, "switch", &e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop listening, drop the node's relation and remove it from the graph.
    ///
    /// Nodes that still feed a downstream cannot be discarded.
    pub(crate) async fn discard(&self, node: NodeId) -> Result<()> {
        let rt = self.runtime(node)?;
        {
            let mut graph = self.graph_mut();
            if let Some(down) = graph.downstreams(node).first() {
                return Err(SyncError::validation(
                    "node",
                    format!(
                        "'{}' still feeds '{}' and cannot be discarded",
                        rt.id,
                        graph.name(*down)
                    ),
                ));
            }
            graph.remove(node);
        }
        for handle in lock(&rt.tasks).drain(..) {
            handle.abort();
        }
        self.cancel_switch(&rt).await;
        rt.gate.release_all();
        self.inner.store.discard_relation(&rt.relation).await?;
        info!(node = %rt.id, "Signal discarded");
        Ok(())
    }

    /// Stop every listener and timer task and mark the declared relations inactive.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);

        let runtimes: Vec<Arc<NodeRuntime>> = self
            .inner
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for rt in &runtimes {
            rt.gate.release_all();
            let handles: Vec<JoinHandle<()>> = lock(&rt.tasks).drain(..).collect();
            for mut handle in handles {
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                    warn!(node = %rt.id, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        let live: Vec<String> = {
            let graph = self.graph();
            runtimes
                .iter()
                .filter(|rt| graph.entry(rt.node).is_some_and(|e| !e.discarded))
                .map(|rt| rt.relation.clone())
                .collect()
        };
        for relation in live {
            if let Err(e) = self.inner.store.deactivate_relation(&relation).await {
                warn!(relation = %relation, error = %e, "Failed to deactivate relation");
            }
        }
        info!(nodes = runtimes.len(), "Engine stopped");
    }
}
