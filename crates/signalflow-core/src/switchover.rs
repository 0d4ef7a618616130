// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live replacement of an upstream.
//!
//! ```text
//!  Idle ──block sources──▶ Blocked ──collect in-flight──▶ Draining ──waits empty──▶ Committed
//!                                                           ▲    │
//!                                                           └────┘ sink commits
//! ```
//!
//! A switch first blocks every source feeding the node, so no new work enters the graph.
//! It then records, for each timestamp still in flight, the sinks that have not reached
//! it yet. The rebind happens only once every such sink has committed at or past its
//! timestamp; each of those sink commits re-checks the pending switch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::engine::{Engine, NodeRuntime, lock};
use crate::error::{Result, SyncError};
use crate::graph::NodeId;
use crate::value::Timestamp;

/// Observable state of a node's switch-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchStatus {
    /// No switch has been requested.
    #[default]
    Idle,
    /// Sources are blocked; in-flight work is being collected.
    Blocked,
    /// Waiting for sinks to catch up.
    Draining {
        /// Sink/timestamp pairs still outstanding.
        outstanding: usize,
    },
    /// The last switch was applied.
    Committed,
}

/// Result of a `set_upstream` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The upstream was replaced.
    Committed,
    /// The switch waits for in-flight work; it commits on its own once that drains.
    Deferred {
        /// Sink/timestamp pairs still outstanding.
        outstanding: usize,
    },
}

/// Handle returned by `set_upstream`.
#[derive(Debug, Clone)]
pub struct SwitchHandle {
    node_id: String,
    outcome: SwitchOutcome,
    status: watch::Receiver<SwitchStatus>,
}

impl SwitchHandle {
    /// Outcome at the time of the call.
    pub fn outcome(&self) -> SwitchOutcome {
        self.outcome
    }

    /// Current state of the switch.
    pub fn status(&self) -> SwitchStatus {
        *self.status.borrow()
    }

    /// Wait until the switch commits. There is no timeout; wrap in
    /// `tokio::time::timeout` if needed.
    pub async fn wait(mut self) -> Result<()> {
        self.status
            .wait_for(|s| *s == SwitchStatus::Committed)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::NodeNotFound {
                node_id: self.node_id.clone(),
            })
    }
}

/// A deferred switch.
#[derive(Debug, Clone)]
pub(crate) struct PendingSwitch {
    role: String,
    target: NodeId,
    /// Sources this switch holds closed; its holds are released on commit.
    blocked: Vec<NodeId>,
    /// Outstanding timestamp -> sinks still behind it.
    waits: BTreeMap<Timestamp, BTreeSet<NodeId>>,
    /// Sinks this switch registered itself on.
    listening: BTreeSet<NodeId>,
}

impl PendingSwitch {
    fn outstanding(&self) -> usize {
        self.waits.values().map(BTreeSet::len).sum()
    }
}

#[derive(Serialize)]
struct SwitchAudit<'a> {
    id: &'a str,
    upstreams: Vec<AuditBinding<'a>>,
}

#[derive(Serialize)]
struct AuditBinding<'a> {
    role: &'a str,
    node: &'a str,
}

impl Engine {
    /// Replace the upstream bound as `role` of `node` with `target`.
    #[instrument(skip(self, node, target), fields(node = %node, target = %target))]
    pub(crate) async fn set_upstream(
        &self,
        node: NodeId,
        role: &str,
        target: NodeId,
    ) -> Result<SwitchHandle> {
        let rt = self.runtime(node)?;
        self.runtime(target)?;
        let handle = |outcome| SwitchHandle {
            node_id: rt.id.clone(),
            outcome,
            status: rt.status.subscribe(),
        };

        let mut pending = rt.switch.lock().await;
        let current = {
            let graph = self.graph();
            let current = graph
                .upstream(node, role)
                .ok_or_else(|| SyncError::UnknownUpstream {
                    node_id: rt.id.clone(),
                    role: role.to_string(),
                })?;
            if current != target && graph.would_cycle(node, target) {
                return Err(SyncError::CycleDetected {
                    node_id: rt.id.clone(),
                    upstream: graph.name(target).to_string(),
                });
            }
            current
        };

        let existing = pending.as_ref().map(|p| (p.role.clone(), p.target));
        match existing {
            Some((pending_role, pending_target))
                if pending_role != role || pending_target != target =>
            {
                let pending_target = self.graph().name(pending_target).to_string();
                return Err(SyncError::SwitchInProgress {
                    node_id: rt.id.clone(),
                    pending: pending_target,
                });
            }
            Some(_) => {
                debug!(node = %rt.id, "Re-checking pending switch");
                if let Some(p) = pending.as_mut() {
                    self.refresh_waits(p).await?;
                }
            }
            None if current == target => {
                rt.status.send_replace(SwitchStatus::Committed);
                return Ok(handle(SwitchOutcome::Committed));
            }
            None => {
                let blocked = self.block_sources(node);
                rt.status.send_replace(SwitchStatus::Blocked);
                let waits = match self.collect_waits(node, target).await {
                    Ok(waits) => waits,
                    Err(e) => {
                        self.unblock(&blocked, node);
                        rt.status.send_replace(SwitchStatus::Idle);
                        return Err(e);
                    }
                };
                let listening: BTreeSet<NodeId> = waits.values().flatten().copied().collect();
                for sink in &listening {
                    if let Some(sink_rt) = self.runtime_of(*sink) {
                        lock(&sink_rt.switch_listeners).insert(node);
                    }
                }
                let mut p = PendingSwitch {
                    role: role.to_string(),
                    target,
                    blocked,
                    waits,
                    listening,
                };
                // A sink may have committed before it had a listener.
                if let Err(e) = self.refresh_waits(&mut p).await {
                    self.report(&rt.id, "switch", &e);
                }
                *pending = Some(p);
            }
        }

        let outstanding = pending.as_ref().map_or(0, PendingSwitch::outstanding);
        if outstanding == 0 {
            if let Some(p) = pending.take() {
                self.commit_switch(&rt, p).await?;
            }
            return Ok(handle(SwitchOutcome::Committed));
        }

        rt.status
            .send_replace(SwitchStatus::Draining { outstanding });
        info!(node = %rt.id, role = %role, outstanding, "Switch-over deferred");
        Ok(handle(SwitchOutcome::Deferred { outstanding }))
    }

    /// Re-check a pending switch of `node` after one of its sinks committed.
    pub(crate) async fn poke_switch(&self, node: NodeId) -> Result<()> {
        let rt = self.runtime(node)?;
        let mut pending = rt.switch.lock().await;
        let Some(p) = pending.as_mut() else {
            return Ok(());
        };
        self.refresh_waits(p).await?;
        match p.outstanding() {
            0 => {
                if let Some(p) = pending.take() {
                    self.commit_switch(&rt, p).await?;
                }
            }
            outstanding => {
                rt.status.send_replace(SwitchStatus::Draining { outstanding });
            }
        }
        Ok(())
    }

    /// Hold every source feeding `node` closed on its behalf.
    fn block_sources(&self, node: NodeId) -> Vec<NodeId> {
        let sources = self.graph().sources_of(node);
        sources
            .into_iter()
            .filter(|s| self.runtime_of(*s).is_some_and(|rt| rt.gate.block(node)))
            .collect()
    }

    /// Release `holder`'s hold on `sources`.
    fn unblock(&self, sources: &[NodeId], holder: NodeId) {
        for source in sources {
            if let Some(rt) = self.runtime_of(*source) {
                rt.gate.unblock(holder);
            }
        }
    }

    /// Abandon a pending switch of `rt`, releasing its holds and sink registrations.
    pub(crate) async fn cancel_switch(&self, rt: &NodeRuntime) {
        let Some(pending) = rt.switch.lock().await.take() else {
            return;
        };
        self.unblock(&pending.blocked, rt.node);
        for sink in &pending.listening {
            if let Some(sink_rt) = self.runtime_of(*sink) {
                lock(&sink_rt.switch_listeners).remove(&rt.node);
            }
        }
        rt.status.send_replace(SwitchStatus::Idle);
        debug!(node = %rt.id, "Pending switch abandoned");
    }

    /// Timestamps still in flight in the node's component, and the sinks behind each.
    async fn collect_waits(
        &self,
        node: NodeId,
        target: NodeId,
    ) -> Result<BTreeMap<Timestamp, BTreeSet<NodeId>>> {
        let (component, target_relation) = {
            let graph = self.graph();
            let component: Vec<(NodeId, String)> = graph
                .component(node)
                .into_iter()
                .map(|n| (n, graph.relation(n).to_string()))
                .collect();
            (component, graph.relation(target).to_string())
        };
        let target_latest = self.store().latest_timestamp(&target_relation).await?;

        let mut in_flight: BTreeMap<Timestamp, BTreeSet<NodeId>> = BTreeMap::new();
        for (n, relation) in component {
            if self.runtime_of(n).is_none_or(|rt| rt.gate.is_blocked()) {
                continue;
            }
            if let Some(t) = self.store().latest_timestamp(&relation).await?
                && Some(t) != target_latest
            {
                in_flight.entry(t).or_default().insert(n);
            }
        }

        let mut waits: BTreeMap<Timestamp, BTreeSet<NodeId>> = BTreeMap::new();
        for (t, producers) in in_flight {
            let sinks: Vec<(NodeId, String)> = {
                let graph = self.graph();
                producers
                    .iter()
                    .flat_map(|p| graph.reachable_sinks(*p))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .map(|s| (s, graph.relation(s).to_string()))
                    .collect()
            };
            for (sink, relation) in sinks {
                let latest = self.store().latest_timestamp(&relation).await?;
                if latest.is_none_or(|l| l < t) {
                    waits.entry(t).or_default().insert(sink);
                }
            }
        }
        Ok(waits)
    }

    /// Drop every wait whose sink has reached its timestamp.
    async fn refresh_waits(&self, pending: &mut PendingSwitch) -> Result<()> {
        let sinks: Vec<(NodeId, String)> = {
            let graph = self.graph();
            pending
                .waits
                .values()
                .flatten()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|s| (s, graph.relation(s).to_string()))
                .collect()
        };
        let mut latest = BTreeMap::new();
        for (sink, relation) in sinks {
            latest.insert(sink, self.store().latest_timestamp(&relation).await?);
        }
        for (t, behind) in pending.waits.iter_mut() {
            behind.retain(|sink| latest.get(sink).copied().flatten().is_none_or(|l| l < *t));
        }
        pending.waits.retain(|_, behind| !behind.is_empty());
        Ok(())
    }

    /// Rebind, propagate the new source set, unblock and audit.
    async fn commit_switch(&self, rt: &Arc<NodeRuntime>, pending: PendingSwitch) -> Result<()> {
        let node = rt.node;
        let (previous, still_bound, sources, closure) = {
            let mut graph = self.graph_mut();
            let previous = graph.rebind(node, &pending.role, pending.target)?;
            (
                previous,
                graph.upstream_ids(node).contains(&previous),
                graph.sources_of(pending.target),
                graph.downstream_closure(node),
            )
        };

        {
            let mut sync = rt.sync.lock().await;
            if still_bound {
                sync.register_upstream(pending.target);
            } else {
                sync.replace_upstream(previous, pending.target);
            }
            sync.merge_sources(sources.iter().copied());
        }
        for down in closure {
            if let Some(down_rt) = self.runtime_of(down) {
                down_rt.sync.lock().await.merge_sources(sources.iter().copied());
            }
        }

        self.unblock(&pending.blocked, node);
        for sink in &pending.listening {
            if let Some(sink_rt) = self.runtime_of(*sink) {
                lock(&sink_rt.switch_listeners).remove(&node);
            }
        }
        if let Some(interval) = rt.interval {
            for source in &sources {
                self.start_timer(*source, interval);
            }
        }

        if self.config().audit_switches {
            let payload = {
                let graph = self.graph();
                let bindings = graph.upstreams(node);
                serde_json::to_value(SwitchAudit {
                    id: &rt.id,
                    upstreams: bindings
                        .iter()
                        .map(|(role, up)| AuditBinding {
                            role,
                            node: graph.name(*up),
                        })
                        .collect(),
                })?
            };
            if let Err(e) = self.store().record_switch(self.now(), &rt.id, &payload).await {
                warn!(node = %rt.id, error = %e, "Failed to record switch-over");
            }
        }

        rt.status.send_replace(SwitchStatus::Committed);
        let (from, to) = {
            let graph = self.graph();
            (
                graph.name(previous).to_string(),
                graph.name(pending.target).to_string(),
            )
        };
        info!(
            node = %rt.id,
            role = %pending.role,
            from = %from,
            to = %to,
            "Switch-over committed"
        );
        Ok(())
    }
}
