// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Open/closed gate that propagation awaits while a source is blocked.
//!
//! A gate is closed while at least one holder keeps it closed. Holders are the nodes
//! whose switch-over needs the source quiet, so overlapping switches sharing a source
//! each keep it closed until they release it.

use std::collections::BTreeSet;

use tokio::sync::watch;

use crate::graph::NodeId;

/// A gate tasks can await until every holder has released it.
#[derive(Debug)]
pub struct Gate {
    holders: watch::Sender<BTreeSet<NodeId>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (holders, _) = watch::channel(BTreeSet::new());
        Self { holders }
    }

    /// Close the gate on behalf of `holder`. Returns `false` if `holder` already held it.
    pub fn block(&self, holder: NodeId) -> bool {
        self.holders.send_if_modified(|h| h.insert(holder))
    }

    /// Release `holder`'s hold. The gate opens, waking every waiter, once no holder is left.
    pub fn unblock(&self, holder: NodeId) {
        self.holders.send_if_modified(|h| h.remove(&holder));
    }

    /// Drop every hold and open the gate.
    pub fn release_all(&self) {
        self.holders.send_if_modified(|h| {
            let held = !h.is_empty();
            h.clear();
            held
        });
    }

    /// Whether the gate is currently closed.
    pub fn is_blocked(&self) -> bool {
        !self.holders.borrow().is_empty()
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.holders.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(BTreeSet::is_empty).await;
    }
}
