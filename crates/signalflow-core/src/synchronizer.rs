// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-node synchronizer state.
//!
//! The [`Synchronizer`] decides *when* a node re-evaluates and at which timestamp, given
//! arrivals from its upstream producers. It holds no I/O: the engine reads the store,
//! feeds arrivals in, and executes the [`Evaluation`]s that come back.
//!
//! | Mode | Tracking | Evaluates when | Commit timestamp |
//! |------|----------|----------------|------------------|
//! | Union | Bufferless | every arrival | max latest of all upstreams |
//! | Union | Buffered | every queue non-empty | max of the popped round |
//! | Difference | - | every arrival | now |

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::NodeId;
use crate::value::{Row, Timestamp, Value};

/// How arrivals from several upstreams are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// All upstreams contribute to one commit.
    #[default]
    Union,
    /// Any single upstream arrival commits immediately at "now".
    Difference,
}

/// How union-mode arrivals are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Buffering {
    /// Latest value wins; one flag per upstream.
    #[default]
    Bufferless,
    /// FIFO queue of pending timestamps per upstream.
    Buffered,
}

/// Merge policy of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Union or difference.
    pub mode: MergeMode,
    /// Bufferless or buffered arrival tracking.
    pub buffering: Buffering,
}

impl MergePolicy {
    /// Union, latest value wins.
    pub const UNION_BUFFERLESS: Self = Self {
        mode: MergeMode::Union,
        buffering: Buffering::Bufferless,
    };

    /// Union, FIFO-paired arrivals.
    pub const UNION_BUFFERED: Self = Self {
        mode: MergeMode::Union,
        buffering: Buffering::Buffered,
    };

    /// Any single arrival triggers a commit.
    pub const DIFFERENCE: Self = Self {
        mode: MergeMode::Difference,
        buffering: Buffering::Bufferless,
    };
}

/// One re-evaluation the engine must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Commit timestamp of the evaluation.
    pub at: Timestamp,
    /// Time cursor per upstream: rows are read as of this timestamp.
    pub cursors: BTreeMap<NodeId, Timestamp>,
}

// ============================================================================
// Commit buffer
// ============================================================================

/// Result of offering a column value to the commit buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// The column already has a pending value; the offer was dropped.
    Ignored,
    /// Accepted; this many columns are still outstanding.
    Pending {
        /// Columns still missing.
        outstanding: usize,
    },
    /// The row is complete and must be committed. The buffer has been reset.
    Complete(Row),
}

/// Partial-commit buffer for multi-column rows.
#[derive(Debug, Clone)]
pub struct CommitBuffer {
    columns: Vec<String>,
    pending: BTreeMap<String, Value>,
}

impl CommitBuffer {
    /// Create a buffer awaiting one value per column.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            pending: BTreeMap::new(),
        }
    }

    /// Offer a value for `column`.
    pub fn offer(&mut self, column: &str, value: Value) -> Offer {
        if !self.columns.iter().any(|c| c == column) || self.pending.contains_key(column) {
            return Offer::Ignored;
        }
        self.pending.insert(column.to_string(), value);
        match self.outstanding() {
            0 => Offer::Complete(std::mem::take(&mut self.pending)),
            outstanding => Offer::Pending { outstanding },
        }
    }

    /// Number of columns still missing a value.
    pub fn outstanding(&self) -> usize {
        self.columns.len() - self.pending.len()
    }

    /// Drop every pending value.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// Checkpoint state
// ============================================================================

/// Checkpoint window bounds.
pub type CheckpointWindow = (Timestamp, Timestamp);

/// Checkpoint bookkeeping of one node.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    /// Timer interval; only used on source nodes.
    pub interval: Option<Duration>,
    last: Option<Timestamp>,
    current: Option<Timestamp>,
    proceed_count: Option<usize>,
}

impl CheckpointState {
    /// Shift the window: `last = current`, `current = watermark`.
    ///
    /// Returns the new window once both ends are known.
    pub fn advance(&mut self, watermark: Timestamp) -> Option<CheckpointWindow> {
        self.last = self.current.replace(watermark);
        self.last.map(|last| (last, watermark))
    }

    /// Record one upstream's checkpoint arrival.
    ///
    /// Returns `true` on every `upstreams`-th arrival, when the consistency check must run.
    pub fn arrive(&mut self, upstreams: usize) -> bool {
        let remaining = self
            .proceed_count
            .unwrap_or_else(|| upstreams.saturating_sub(1));
        if remaining == 0 {
            self.proceed_count = None;
            true
        } else {
            self.proceed_count = Some(remaining - 1);
            false
        }
    }

    /// Adopt a window received from upstream.
    pub fn observe(&mut self, window: CheckpointWindow) {
        self.last = Some(window.0);
        self.current = Some(window.1);
    }

    /// Last known window bounds.
    pub fn window(&self) -> (Option<Timestamp>, Option<Timestamp>) {
        (self.last, self.current)
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

/// Merge, buffering and checkpoint state owned by exactly one node.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    policy: MergePolicy,
    upstreams: Vec<NodeId>,
    flags: BTreeMap<NodeId, bool>,
    queues: BTreeMap<NodeId, VecDeque<Timestamp>>,
    pub(crate) buffer: CommitBuffer,
    pub(crate) checkpoint: CheckpointState,
    original_sources: BTreeSet<NodeId>,
}

impl Synchronizer {
    /// Create a synchronizer for a node with the given columns.
    pub fn new(policy: MergePolicy, columns: Vec<String>) -> Self {
        Self {
            policy,
            upstreams: Vec::new(),
            flags: BTreeMap::new(),
            queues: BTreeMap::new(),
            buffer: CommitBuffer::new(columns),
            checkpoint: CheckpointState::default(),
            original_sources: BTreeSet::new(),
        }
    }

    /// The merge policy.
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Tracked upstreams in registration order.
    pub fn upstreams(&self) -> &[NodeId] {
        &self.upstreams
    }

    /// Whether `node` is a tracked upstream.
    pub fn has_upstream(&self, node: NodeId) -> bool {
        self.upstreams.contains(&node)
    }

    /// Start tracking arrivals from `node`. Returns `false` if already tracked.
    pub fn register_upstream(&mut self, node: NodeId) -> bool {
        if self.has_upstream(node) {
            return false;
        }
        self.upstreams.push(node);
        self.track(node);
        true
    }

    /// Swap `old` for `new` in place, dropping everything queued for `old`.
    pub fn replace_upstream(&mut self, old: NodeId, new: NodeId) {
        self.flags.remove(&old);
        self.queues.remove(&old);
        if self.has_upstream(new) {
            self.upstreams.retain(|u| *u != old);
            return;
        }
        match self.upstreams.iter_mut().find(|u| **u == old) {
            Some(slot) => *slot = new,
            None => self.upstreams.push(new),
        }
        self.track(new);
    }

    fn track(&mut self, node: NodeId) {
        if self.policy.mode == MergeMode::Union {
            match self.policy.buffering {
                Buffering::Bufferless => {
                    self.flags.insert(node, false);
                }
                Buffering::Buffered => {
                    self.queues.insert(node, VecDeque::new());
                }
            }
        }
    }

    /// Timestamps queued for `node` in buffered mode.
    pub fn queued(&self, node: NodeId) -> usize {
        self.queues.get(&node).map_or(0, VecDeque::len)
    }

    /// Whether `node` has arrived since the last bufferless commit.
    pub fn has_arrived(&self, node: NodeId) -> bool {
        self.flags.get(&node).copied().unwrap_or(false)
    }

    /// Apply an arrival from `from`, committed at `ts`.
    ///
    /// `upstream_latest` holds the latest committed timestamp of each upstream that has
    /// one; it is only consulted in union-bufferless mode. Arrivals from nodes that are
    /// not (or no longer) upstreams produce no evaluation.
    pub fn arrive(
        &mut self,
        from: NodeId,
        ts: Timestamp,
        upstream_latest: &BTreeMap<NodeId, Timestamp>,
        now: Timestamp,
    ) -> Vec<Evaluation> {
        if !self.has_upstream(from) {
            return Vec::new();
        }
        match (self.policy.mode, self.policy.buffering) {
            (MergeMode::Union, Buffering::Bufferless) => {
                self.flags.insert(from, true);
                let at = self
                    .upstreams
                    .iter()
                    .filter_map(|u| upstream_latest.get(u))
                    .copied()
                    .fold(ts, Timestamp::max);
                let cursors = self.upstreams.iter().map(|u| (*u, at)).collect();
                self.flags.values_mut().for_each(|f| *f = false);
                vec![Evaluation { at, cursors }]
            }
            (MergeMode::Union, Buffering::Buffered) => {
                self.queues.entry(from).or_default().push_back(ts);
                let mut rounds = Vec::new();
                while !self.queues.is_empty() && self.queues.values().all(|q| !q.is_empty()) {
                    let cursors: BTreeMap<NodeId, Timestamp> = self
                        .queues
                        .iter_mut()
                        .filter_map(|(u, q)| q.pop_front().map(|t| (*u, t)))
                        .collect();
                    let at = cursors.values().copied().max().unwrap_or(ts);
                    rounds.push(Evaluation { at, cursors });
                }
                rounds
            }
            (MergeMode::Difference, _) => {
                let cursors = self.upstreams.iter().map(|u| (*u, now)).collect();
                vec![Evaluation { at: now, cursors }]
            }
        }
    }

    /// Forget pending arrivals and buffered column values.
    pub fn reset(&mut self) {
        self.flags.values_mut().for_each(|f| *f = false);
        self.queues.values_mut().for_each(VecDeque::clear);
        self.buffer.clear();
    }

    /// Sources this node has ever been fed from.
    pub fn original_sources(&self) -> &BTreeSet<NodeId> {
        &self.original_sources
    }

    /// Merge `sources` into the original source set.
    pub fn merge_sources(&mut self, sources: impl IntoIterator<Item = NodeId>) {
        self.original_sources.extend(sources);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::from_micros;

    const A: NodeId = NodeId(0);
    const B: NodeId = NodeId(1);
    const C: NodeId = NodeId(2);

    fn ts(secs: i64) -> Timestamp {
        from_micros(secs * 1_000_000)
    }

    fn sync(policy: MergePolicy) -> Synchronizer {
        let mut s = Synchronizer::new(policy, vec!["value".to_string()]);
        s.register_upstream(A);
        s.register_upstream(B);
        s
    }

    #[test]
    fn test_bufferless_commits_at_max_latest() {
        let mut s = sync(MergePolicy::UNION_BUFFERLESS);
        let latest = BTreeMap::from([(A, ts(5)), (B, ts(9))]);

        let evals = s.arrive(A, ts(5), &latest, ts(100));
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].at, ts(9));
        assert_eq!(evals[0].cursors[&A], ts(9));
        assert_eq!(evals[0].cursors[&B], ts(9));
        assert!(!s.has_arrived(A));
    }

    #[test]
    fn test_bufferless_ignores_upstreams_without_commits() {
        let mut s = sync(MergePolicy::UNION_BUFFERLESS);
        let latest = BTreeMap::from([(A, ts(5))]);
        let evals = s.arrive(A, ts(5), &latest, ts(100));
        assert_eq!(evals[0].at, ts(5));
    }

    #[test]
    fn test_buffered_pairs_arrivals_fifo() {
        let mut s = sync(MergePolicy::UNION_BUFFERED);
        let none = BTreeMap::new();
        let mut commits = Vec::new();

        for t in [1, 2, 3] {
            commits.extend(s.arrive(A, ts(t), &none, ts(100)));
        }
        assert!(commits.is_empty());
        assert_eq!(s.queued(A), 3);

        commits.extend(s.arrive(B, ts(2), &none, ts(100)));
        commits.extend(s.arrive(B, ts(3), &none, ts(100)));

        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].at, ts(2));
        assert_eq!(commits[0].cursors[&A], ts(1));
        assert_eq!(commits[0].cursors[&B], ts(2));
        assert_eq!(commits[1].at, ts(3));
        assert_eq!(commits[1].cursors[&A], ts(2));
        assert_eq!(commits[1].cursors[&B], ts(3));
        assert_eq!(s.queued(A), 1);
        assert_eq!(s.queued(B), 0);
    }

    #[test]
    fn test_difference_commits_at_now() {
        let mut s = sync(MergePolicy::DIFFERENCE);
        let evals = s.arrive(B, ts(3), &BTreeMap::new(), ts(42));
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].at, ts(42));
        assert_eq!(evals[0].cursors[&A], ts(42));
    }

    #[test]
    fn test_arrival_from_unknown_upstream_is_ignored() {
        let mut s = sync(MergePolicy::UNION_BUFFERLESS);
        assert!(s.arrive(C, ts(1), &BTreeMap::new(), ts(2)).is_empty());
    }

    #[test]
    fn test_replace_upstream_drops_old_queue() {
        let mut s = sync(MergePolicy::UNION_BUFFERED);
        s.arrive(A, ts(1), &BTreeMap::new(), ts(2));
        s.replace_upstream(A, C);
        assert_eq!(s.upstreams(), &[C, B]);
        assert_eq!(s.queued(A), 0);
        assert!(s.arrive(A, ts(3), &BTreeMap::new(), ts(4)).is_empty());

        let evals = s.arrive(C, ts(5), &BTreeMap::new(), ts(6));
        assert!(evals.is_empty());
        let evals = s.arrive(B, ts(4), &BTreeMap::new(), ts(6));
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].at, ts(5));
    }

    #[test]
    fn test_commit_buffer_fires_once_per_full_set() {
        let mut buf = CommitBuffer::new(vec!["x".to_string(), "y".to_string()]);
        assert_eq!(
            buf.offer("x", Value::Int(1)),
            Offer::Pending { outstanding: 1 }
        );
        assert_eq!(buf.offer("x", Value::Int(7)), Offer::Ignored);
        assert_eq!(buf.outstanding(), 1);

        let Offer::Complete(row) = buf.offer("y", Value::Int(2)) else {
            panic!("row should be complete");
        };
        assert_eq!(row["x"], Value::Int(1));
        assert_eq!(row["y"], Value::Int(2));
        assert_eq!(buf.outstanding(), 2);

        assert_eq!(
            buf.offer("y", Value::Int(3)),
            Offer::Pending { outstanding: 1 }
        );
        assert_eq!(buf.offer("z", Value::Int(3)), Offer::Ignored);
    }

    #[test]
    fn test_checkpoint_fires_on_every_nth_arrival() {
        let mut cp = CheckpointState::default();
        let fired: Vec<bool> = (0..6).map(|_| cp.arrive(3)).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true]);

        let mut single = CheckpointState::default();
        assert!(single.arrive(1));
        assert!(single.arrive(1));
    }

    #[test]
    fn test_checkpoint_window_needs_two_watermarks() {
        let mut cp = CheckpointState::default();
        assert_eq!(cp.advance(ts(10)), None);
        assert_eq!(cp.advance(ts(20)), Some((ts(10), ts(20))));
        assert_eq!(cp.window(), (Some(ts(10)), Some(ts(20))));
    }
}
