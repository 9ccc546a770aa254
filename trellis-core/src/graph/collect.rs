//! Reference-Counted Collection
//!
//! Queries and events are removed as soon as nothing observes them. The
//! collector is a worklist run to a fixed point after every commit and every
//! released subscription:
//!
//! 1. Drain the node worklist. A node that still satisfies its collection
//!    predicate is cleared; clearing removes it from its upstream nodes'
//!    downstream sets and queues each upstream query that became
//!    collectable.
//! 2. Once no node work is left, check one queued domain. A collectable
//!    domain is torn down, which may queue more nodes and its upstream
//!    domains, so the loop goes back to step 1.
//!
//! State and entities are never collected on their own; they go with their
//! domain.

use crate::runtime::Runtime;
use crate::store::LifecycleEvent;

use super::node::{NodeId, Storage};

impl Runtime {
    /// Run the collector until both worklists are empty.
    pub(crate) fn collect(&mut self) {
        loop {
            while let Some(id) = self.pending.collect.pop() {
                let collectable = self
                    .nodes
                    .get(&id)
                    .is_some_and(|storage| storage.is_collectable());
                if collectable {
                    self.clear_node(id);
                }
            }

            let Some(domain) = self.pending.domains.pop() else {
                break;
            };
            if self.domain_collectable(&domain) {
                self.teardown_domain(&domain);
            }
        }
    }

    /// Remove a storage from the arena, its namespace and all edges.
    pub(crate) fn clear_node(&mut self, id: NodeId) -> Option<Storage> {
        let storage = self.nodes.remove(&id)?;

        if let Some(container) = self.domains.get_mut(&storage.domain) {
            if container.namespace.get(&storage.key) == Some(&id) {
                container.namespace.shift_remove(&storage.key);
            }
        }

        for up in &storage.upstream {
            let Some(node) = self.nodes.get_mut(up) else {
                continue;
            };
            node.downstream.shift_remove(&id);
            if node.is_collectable() {
                self.pending.collect.insert(*up);
            }
            // A read into another domain was keeping that domain alive.
            if node.domain != storage.domain {
                self.pending.domains.insert(node.domain.clone());
            }
        }
        for down in &storage.downstream {
            if let Some(node) = self.nodes.get_mut(down) {
                node.upstream.shift_remove(&id);
            }
        }
        self.pending.updated.shift_remove(&id);

        tracing::trace!(key = %storage.key, "cleared node");
        self.record(LifecycleEvent::NodeDiscarded {
            key: storage.key.clone(),
        });
        Some(storage)
    }
}
