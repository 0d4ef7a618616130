// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Arena-backed signal topology.
//!
//! Nodes are addressed by [`NodeId`] handles into a flat arena. Upstream bindings are
//! an explicit `role -> NodeId` table, so rebinding an upstream is a key lookup.
//! All traversals use explicit worklists over the arena.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use crate::error::{Result, SyncError};

/// Stable handle of a node inside the topology arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub(crate) id: String,
    pub(crate) relation: String,
    pub(crate) upstreams: Vec<(String, NodeId)>,
    pub(crate) downstreams: Vec<NodeId>,
    pub(crate) discarded: bool,
}

/// The signal graph: node arena plus id index.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<NodeEntry>,
    index: HashMap<String, NodeId>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Fails if a live node already uses the id or relation name.
    pub fn insert(&mut self, id: &str, relation: &str) -> Result<NodeId> {
        let clash = self.index.contains_key(id)
            || self
                .nodes
                .iter()
                .any(|n| !n.discarded && n.relation == relation);
        if clash {
            return Err(SyncError::DuplicateNode {
                node_id: id.to_string(),
            });
        }
        let node = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeEntry {
            id: id.to_string(),
            relation: relation.to_string(),
            upstreams: Vec::new(),
            downstreams: Vec::new(),
            discarded: false,
        });
        self.index.insert(id.to_string(), node);
        Ok(node)
    }

    /// Find a live node by id.
    pub fn lookup(&self, id: &str) -> Option<NodeId> {
        self.index.get(id).copied()
    }

    /// Arena entry of a handle, `None` for a handle this topology never issued.
    pub(crate) fn entry(&self, node: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(node.index())
    }

    /// Whether `node` was issued by this topology and is not discarded.
    pub fn contains(&self, node: NodeId) -> bool {
        self.entry(node).is_some_and(|e| !e.discarded)
    }

    /// Node id string of a handle issued by this topology.
    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.index()].id
    }

    /// Relation backing a handle issued by this topology.
    pub fn relation(&self, node: NodeId) -> &str {
        &self.nodes[node.index()].relation
    }

    /// Number of nodes ever inserted, discarded ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node was ever inserted.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Upstream bindings in declaration order.
    pub fn upstreams(&self, node: NodeId) -> &[(String, NodeId)] {
        &self.nodes[node.index()].upstreams
    }

    /// Distinct upstream handles in declaration order.
    pub fn upstream_ids(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        self.upstreams(node)
            .iter()
            .map(|(_, up)| *up)
            .filter(|up| seen.insert(*up))
            .collect()
    }

    /// Upstream bound under `role`.
    pub fn upstream(&self, node: NodeId, role: &str) -> Option<NodeId> {
        self.upstreams(node)
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, up)| *up)
    }

    /// Downstream handles.
    pub fn downstreams(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.index()].downstreams
    }

    /// A node with no upstream is a source.
    pub fn is_source(&self, node: NodeId) -> bool {
        self.upstreams(node).is_empty()
    }

    /// Whether making `upstream` feed `node` would close a cycle.
    pub fn would_cycle(&self, node: NodeId, upstream: NodeId) -> bool {
        upstream == node || self.downstream_closure(node).contains(&upstream)
    }

    /// Bind `upstream` under `role` of `node`.
    pub fn connect(&mut self, node: NodeId, role: &str, upstream: NodeId) -> Result<()> {
        if self.upstream(node, role).is_some() {
            return Err(SyncError::validation(
                "role",
                format!("'{}' already has an upstream bound as '{}'", self.name(node), role),
            ));
        }
        if self.would_cycle(node, upstream) {
            return Err(SyncError::CycleDetected {
                node_id: self.name(node).to_string(),
                upstream: self.name(upstream).to_string(),
            });
        }
        self.nodes[node.index()]
            .upstreams
            .push((role.to_string(), upstream));
        let downs = &mut self.nodes[upstream.index()].downstreams;
        if !downs.contains(&node) {
            downs.push(node);
        }
        Ok(())
    }

    /// Replace the upstream bound under `role`, fixing adjacency in both directions.
    ///
    /// Returns the previous upstream.
    pub fn rebind(&mut self, node: NodeId, role: &str, upstream: NodeId) -> Result<NodeId> {
        let previous = self
            .upstream(node, role)
            .ok_or_else(|| SyncError::UnknownUpstream {
                node_id: self.name(node).to_string(),
                role: role.to_string(),
            })?;
        if previous == upstream {
            return Ok(previous);
        }
        if self.would_cycle(node, upstream) {
            return Err(SyncError::CycleDetected {
                node_id: self.name(node).to_string(),
                upstream: self.name(upstream).to_string(),
            });
        }
        for (r, up) in self.nodes[node.index()].upstreams.iter_mut() {
            if r.as_str() == role {
                *up = upstream;
            }
        }
        if !self.upstream_ids(node).contains(&previous) {
            self.nodes[previous.index()]
                .downstreams
                .retain(|d| *d != node);
        }
        let downs = &mut self.nodes[upstream.index()].downstreams;
        if !downs.contains(&node) {
            downs.push(node);
        }
        Ok(previous)
    }

    /// Detach a node from the graph and free its id.
    pub fn remove(&mut self, node: NodeId) {
        let ups = self.upstream_ids(node);
        for up in ups {
            self.nodes[up.index()].downstreams.retain(|d| *d != node);
        }
        let entry = &mut self.nodes[node.index()];
        entry.upstreams.clear();
        entry.discarded = true;
        let id = entry.id.clone();
        self.index.remove(&id);
    }

    /// Source nodes transitively feeding `node` (the node itself if it is a source).
    pub fn sources_of(&self, node: NodeId) -> BTreeSet<NodeId> {
        let mut sources = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut work = vec![node];
        while let Some(n) = work.pop() {
            if !visited.insert(n) {
                continue;
            }
            let ups = self.upstream_ids(n);
            if ups.is_empty() {
                sources.insert(n);
            }
            work.extend(ups);
        }
        sources
    }

    /// Every node reachable from `node` following edges in either direction.
    pub fn component(&self, node: NodeId) -> Vec<NodeId> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        let mut work = vec![node];
        while let Some(n) = work.pop() {
            if !visited.insert(n) {
                continue;
            }
            order.push(n);
            work.extend(self.upstream_ids(n));
            work.extend(self.downstreams(n).iter().copied());
        }
        order
    }

    /// Nodes strictly downstream of `node`, breadth first.
    pub fn downstream_closure(&self, node: NodeId) -> Vec<NodeId> {
        let mut visited = BTreeSet::from([node]);
        let mut order = Vec::new();
        let mut work: VecDeque<NodeId> = self.downstreams(node).iter().copied().collect();
        while let Some(n) = work.pop_front() {
            if !visited.insert(n) {
                continue;
            }
            order.push(n);
            work.extend(self.downstreams(n).iter().copied());
        }
        order
    }

    /// Most-downstream nodes (no downstream of their own) reachable from `node`.
    pub fn reachable_sinks(&self, node: NodeId) -> BTreeSet<NodeId> {
        std::iter::once(node)
            .chain(self.downstream_closure(node))
            .filter(|n| self.downstreams(*n).is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a -> b -> d, a -> c -> d, e isolated
    fn diamond() -> (Topology, [NodeId; 5]) {
        let mut t = Topology::new();
        let a = t.insert("a", "a").unwrap();
        let b = t.insert("b", "b").unwrap();
        let c = t.insert("c", "c").unwrap();
        let d = t.insert("d", "d").unwrap();
        let e = t.insert("e", "e").unwrap();
        t.connect(b, "in", a).unwrap();
        t.connect(c, "in", a).unwrap();
        t.connect(d, "left", b).unwrap();
        t.connect(d, "right", c).unwrap();
        (t, [a, b, c, d, e])
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut t = Topology::new();
        t.insert("Temp", "temp").unwrap();
        assert!(matches!(
            t.insert("Temp", "temp"),
            Err(SyncError::DuplicateNode { .. })
        ));
        assert!(matches!(
            t.insert("TEMP", "temp"),
            Err(SyncError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn test_foreign_handle_is_not_contained() {
        let (mut t, [a, ..]) = diamond();
        let foreign = NodeId(42);
        assert!(t.entry(foreign).is_none());
        assert!(!t.contains(foreign));
        assert!(t.contains(a));
        t.remove(a);
        assert!(!t.contains(a));
        assert!(t.entry(a).is_some());
    }

    #[test]
    fn test_sources_and_sinks() {
        let (t, [a, b, c, d, e]) = diamond();
        assert_eq!(t.sources_of(d), BTreeSet::from([a]));
        assert_eq!(t.sources_of(a), BTreeSet::from([a]));
        assert_eq!(t.reachable_sinks(a), BTreeSet::from([d]));
        assert_eq!(t.reachable_sinks(e), BTreeSet::from([e]));
        assert!(t.is_source(a));
        assert!(!t.is_source(b));
        assert_eq!(t.upstream_ids(d), vec![b, c]);
        assert_eq!(t.downstream_closure(a).len(), 3);
        assert!(t.downstream_closure(a).contains(&d));
        assert!(!t.downstream_closure(b).contains(&c));
    }

    #[test]
    fn test_component_visits_diamond_once() {
        let (t, [a, _, _, d, e]) = diamond();
        let comp = t.component(d);
        assert_eq!(comp.len(), 4);
        assert!(comp.contains(&a));
        assert!(!comp.contains(&e));
    }

    #[test]
    fn test_connect_rejects_cycles() {
        let (mut t, [a, _, _, d, _]) = diamond();
        let err = t.connect(a, "back", d).unwrap_err();
        assert_eq!(err.error_code(), "CYCLE_DETECTED");
        assert!(t.would_cycle(a, a));
    }

    #[test]
    fn test_rebind_updates_both_directions() {
        let (mut t, [a, b, c, d, e]) = diamond();
        let old = t.rebind(d, "left", e).unwrap();
        assert_eq!(old, b);
        assert_eq!(t.upstream(d, "left"), Some(e));
        assert!(!t.downstreams(b).contains(&d));
        assert!(t.downstreams(e).contains(&d));
        assert_eq!(t.sources_of(d), BTreeSet::from([a, e]));
        assert!(t.downstreams(c).contains(&d));

        let err = t.rebind(d, "middle", a).unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_UPSTREAM");
    }

    #[test]
    fn test_rebind_keeps_edge_when_bound_under_another_role() {
        let mut t = Topology::new();
        let a = t.insert("a", "a").unwrap();
        let b = t.insert("b", "b").unwrap();
        let c = t.insert("c", "c").unwrap();
        t.connect(c, "x", a).unwrap();
        t.connect(c, "y", a).unwrap();
        t.rebind(c, "x", b).unwrap();
        assert!(t.downstreams(a).contains(&c));
        assert_eq!(t.upstream_ids(c), vec![b, a]);
    }

    #[test]
    fn test_remove_frees_id() {
        let (mut t, [_, b, _, d, _]) = diamond();
        t.remove(d);
        assert!(t.lookup("d").is_none());
        assert!(t.downstreams(b).is_empty());
        assert!(t.insert("d", "d").is_ok());
    }
}
