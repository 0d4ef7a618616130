// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint timers and recovery.
//!
//! Source nodes run a timer. Each tick advances the source's watermark to "now" and
//! publishes it on the checkpoint topic. When the listener receives it, the source shifts
//! its window to `(previous watermark, new watermark)` and recovery walks the graph:
//! every downstream node runs [`compare_and_restore`] over the window on the N-th
//! checkpoint arrival from its N upstreams, restores what it is missing, and passes the
//! window on.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::{Commit, Engine, lock};
use crate::error::Result;
use crate::graph::NodeId;
use crate::synchronizer::{CheckpointWindow, MergeMode};
use crate::transport::{CheckpointNotice, checkpoint_topic};
use crate::value::Timestamp;

/// Timestamps a node must restore, ascending.
///
/// `upstreams` holds each upstream's commit timestamps inside the window (ascending, in
/// binding order) and `own` the node's own.
///
/// * Union: slot `i` pairs the `i`-th timestamp of every upstream. A slot none of whose
///   timestamps the node committed yields the slot minimum.
/// * Difference: every upstream timestamp the node did not commit.
pub fn compare_and_restore(
    mode: MergeMode,
    upstreams: &[Vec<Timestamp>],
    own: &[Timestamp],
) -> Vec<Timestamp> {
    let own: BTreeSet<Timestamp> = own.iter().copied().collect();
    let candidates: BTreeSet<Timestamp> = match mode {
        MergeMode::Difference => upstreams
            .iter()
            .flatten()
            .copied()
            .filter(|t| !own.contains(t))
            .collect(),
        MergeMode::Union => {
            let slots = upstreams.iter().map(Vec::len).min().unwrap_or(0);
            (0..slots)
                .filter_map(|i| {
                    let slot: Vec<Timestamp> = upstreams.iter().map(|u| u[i]).collect();
                    if slot.iter().any(|t| own.contains(t)) {
                        None
                    } else {
                        slot.into_iter().min()
                    }
                })
                .collect()
        }
    };
    candidates.into_iter().collect()
}

impl Engine {
    /// Start the checkpoint timer of `node` unless it already runs.
    pub(crate) fn start_timer(&self, node: NodeId, interval: Duration) {
        let Some(rt) = self.runtime_of(node) else {
            return;
        };
        if interval.is_zero() || rt.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let handle = tokio::spawn(engine.run_checkpoint_timer(node, interval));
        lock(&rt.tasks).push(handle);
    }

    async fn run_checkpoint_timer(self, node: NodeId, interval: Duration) {
        let name = self.graph().name(node).to_string();
        let mut shutdown = self.shutdown_signal();
        if *shutdown.borrow() {
            return;
        }
        info!(
            node = %name,
            interval_ms = interval.as_millis() as u64,
            "Checkpoint timer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(node = %name, "Checkpoint timer shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.checkpoint_tick(node).await {
                        self.report(&name, "checkpoint_tick", &e);
                    }
                }
            }
        }
    }

    /// Advance the watermark of a source to now and publish it.
    ///
    /// Returns the previous watermark. Non-source nodes are skipped.
    pub(crate) async fn checkpoint_tick(&self, node: NodeId) -> Result<Option<Timestamp>> {
        let rt = self.runtime(node)?;
        if !self.graph().is_source(node) {
            debug!(node = %rt.id, "Not a source, skipping checkpoint tick");
            return Ok(None);
        }
        let now = self.now();
        let previous = self.store().advance_watermark(&rt.relation, now).await?;
        let notice = serde_json::to_string(&CheckpointNotice {
            node: rt.id.clone(),
            watermark: now,
        })?;
        self.transport()
            .publish(&checkpoint_topic(&rt.relation), &notice)
            .await?;
        debug!(node = %rt.id, watermark = %now, "Checkpoint tick");
        Ok(previous)
    }

    /// Handle a checkpoint notice received by a source.
    pub(crate) async fn on_checkpoint(&self, node: NodeId, watermark: Timestamp) -> Result<usize> {
        let rt = self.runtime(node)?;
        let window = rt.sync.lock().await.checkpoint.advance(watermark);
        let Some(window) = window else {
            debug!(node = %rt.id, "First watermark, window not complete yet");
            return Ok(0);
        };
        let downstreams = self.graph().downstreams(node).to_vec();
        self.recover(downstreams, window).await
    }

    /// Walk the graph from `start`, running the consistency check on each node's N-th
    /// arrival and continuing to its downstreams.
    ///
    /// Returns how many rows were restored. Failures on one node are reported and do not
    /// stop the walk.
    pub(crate) async fn recover(&self, start: Vec<NodeId>, window: CheckpointWindow) -> Result<usize> {
        let mut work: VecDeque<NodeId> = start.into();
        let mut restored = 0;
        while let Some(node) = work.pop_front() {
            let Ok(rt) = self.runtime(node) else {
                continue;
            };
            let fire = {
                let mut sync = rt.sync.lock().await;
                let upstreams = sync.upstreams().len();
                let fire = sync.checkpoint.arrive(upstreams);
                if fire {
                    sync.checkpoint.observe(window);
                }
                fire
            };
            if !fire {
                continue;
            }
            match self.ensure_consistency(node, window.0, window.1).await {
                Ok(list) => restored += list.len(),
                Err(e) => self.report(&rt.id, "ensure_consistency", &e),
            }
            let downstreams = self.graph().downstreams(node).to_vec();
            work.extend(downstreams);
        }
        Ok(restored)
    }

    /// Restore every upstream commit in `[from, to]` that `node` is missing.
    pub(crate) async fn ensure_consistency(
        &self,
        node: NodeId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Timestamp>> {
        let rt = self.runtime(node)?;
        let mode = rt.sync.lock().await.policy().mode;
        let relations: Vec<String> = {
            let graph = self.graph();
            graph
                .upstream_ids(node)
                .into_iter()
                .map(|up| graph.relation(up).to_string())
                .collect()
        };

        let own = self.store().timestamps_between(&rt.relation, from, to).await?;
        let mut upstreams = Vec::with_capacity(relations.len());
        for relation in &relations {
            upstreams.push(self.store().timestamps_between(relation, from, to).await?);
        }

        let candidates = compare_and_restore(mode, &upstreams, &own);
        for ts in &candidates {
            self.restore(node, *ts).await?;
        }
        if !candidates.is_empty() {
            info!(
                node = %rt.id,
                from = %from,
                to = %to,
                restored = candidates.len(),
                "Restored missed commits"
            );
        }
        Ok(candidates)
    }

    /// Recompute `node` at `ts` and write the row there.
    ///
    /// The view cursor is moved to `ts` for the evaluation and put back afterwards.
    /// A restored row can close the last gap of a pending switch, so waiting switches
    /// are re-checked once it is written.
    pub(crate) async fn restore(&self, node: NodeId, ts: Timestamp) -> Result<Commit> {
        let rt = self.runtime(node)?;
        let commit = {
            let _sync = rt.sync.lock().await;
            let saved = lock(&rt.view).cursor.replace(ts);
            let result = match self.evaluate(&rt, &BTreeMap::new(), ts).await {
                Ok(row) => self.commit_restore(&rt, ts, row).await,
                Err(e) => Err(e),
            };
            lock(&rt.view).cursor = saved;
            result?
        };
        self.notify_switches(&rt).await;
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::from_micros;

    fn ts(secs: i64) -> Timestamp {
        from_micros(secs * 1_000_000)
    }

    fn list(secs: &[i64]) -> Vec<Timestamp> {
        secs.iter().map(|s| ts(*s)).collect()
    }

    #[test]
    fn test_single_gap_restores_exactly_it() {
        let restore = compare_and_restore(
            MergeMode::Union,
            &[list(&[10, 20, 30])],
            &list(&[10, 30]),
        );
        assert_eq!(restore, list(&[20]));
    }

    #[test]
    fn test_union_restores_slot_minimum() {
        let restore = compare_and_restore(
            MergeMode::Union,
            &[list(&[10, 20, 30]), list(&[12, 25])],
            &list(&[12]),
        );
        assert_eq!(restore, list(&[20]));
    }

    #[test]
    fn test_union_restores_every_gap_slot() {
        let restore = compare_and_restore(
            MergeMode::Union,
            &[list(&[10, 20, 30, 40])],
            &list(&[10, 30]),
        );
        assert_eq!(restore, list(&[20, 40]));
    }

    #[test]
    fn test_difference_restores_every_missing_timestamp() {
        let restore = compare_and_restore(
            MergeMode::Difference,
            &[list(&[10, 20]), list(&[15, 20])],
            &list(&[20]),
        );
        assert_eq!(restore, list(&[10, 15]));
    }

    #[test]
    fn test_consistent_window_restores_nothing() {
        assert!(compare_and_restore(MergeMode::Union, &[list(&[1, 2])], &list(&[1, 2])).is_empty());
        assert!(compare_and_restore(MergeMode::Union, &[], &[]).is_empty());
    }
}
