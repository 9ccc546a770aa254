//! Update Propagation
//!
//! The propagator determines which queries must recompute after a batch of
//! direct writes, and recomputes them in dependency order.
//!
//! # Algorithm
//!
//! We use a push-pull approach:
//!
//! 1. Written nodes whose value changed are recorded as pass sources.
//! 2. Starting from the sources, walk downstream edges depth-first and mark
//!    every reached query `Pending`. A node already pending is not walked
//!    again, so each node is visited once per pass.
//! 3. Queries with no downstream become the frontier of the pass.
//! 4. Settle each frontier node. Settling a pending node first settles all of
//!    its pending upstream nodes, then:
//!    - if none of its upstream changed in this pass, it returns to
//!      `Default` without evaluating
//!    - otherwise it re-evaluates; an equal result (by compare) settles to
//!      `Default`, a different result marks it `Updated` and queues it for
//!      notification
//!
//! Because a node only settles after all its inputs have, a shared input in
//! a diamond is evaluated once and the join node is evaluated last.
//!
//! Passes never nest. Writes made while a pass is settling or a query is
//! evaluating (hydration of a domain revived by a read) become the sources
//! of the next round.

use std::collections::HashSet;

use indexmap::IndexSet;

use crate::error::Result;
use crate::runtime::Runtime;
use crate::store::LifecycleEvent;

use super::node::{NodeId, Status};

/// Bookkeeping for the propagation pass in flight.
#[derive(Debug, Default)]
pub(crate) struct Pass {
    /// Written nodes whose value changed and are not yet propagated.
    sources: IndexSet<NodeId>,

    /// Nodes whose value changed in the current pass.
    changed: HashSet<NodeId>,

    /// Every node marked pending since the transaction began.
    pub(crate) marked: Vec<NodeId>,

    /// A pass is settling.
    active: bool,
}

impl Pass {
    pub(crate) fn reset(&mut self) {
        self.sources.clear();
        self.changed.clear();
        self.marked.clear();
        self.active = false;
    }
}

impl Runtime {
    /// Record a direct write that changed a node's value.
    pub(crate) fn mark_changed(&mut self, id: NodeId) {
        self.pass.sources.insert(id);
    }

    /// Propagate all recorded writes through the graph.
    pub(crate) fn propagate(&mut self) -> Result<()> {
        if self.pass.active || !self.evaluating.is_empty() {
            return Ok(());
        }
        self.pass.active = true;
        let mut result = Ok(());
        while result.is_ok() && !self.pass.sources.is_empty() {
            result = self.propagate_round();
        }
        self.pass.active = false;
        result
    }

    fn propagate_round(&mut self) -> Result<()> {
        let sources: Vec<NodeId> = self.pass.sources.drain(..).collect();
        self.pass.changed.clear();
        self.pass.changed.extend(sources.iter().copied());

        let first = self.pass.marked.len();
        let frontier = self.mark_pending(&sources);
        tracing::trace!(
            sources = sources.len(),
            marked = self.pass.marked.len() - first,
            frontier = frontier.len(),
            "propagating"
        );

        for id in frontier {
            self.settle(id)?;
        }
        // Settling is idempotent; this catches anything the frontier missed.
        let stragglers: Vec<NodeId> = self.pass.marked[first..].to_vec();
        for id in stragglers {
            self.settle(id)?;
        }
        Ok(())
    }

    /// Depth-first marking. Returns the frontier of the walk.
    fn mark_pending(&mut self, sources: &[NodeId]) -> Vec<NodeId> {
        let mut frontier = Vec::new();
        let mut stack: Vec<NodeId> = sources
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|storage| storage.downstream.iter().copied())
            .collect();

        while let Some(id) = stack.pop() {
            let Some(storage) = self.nodes.get_mut(&id) else {
                continue;
            };
            if storage.status == Status::Pending {
                continue;
            }
            storage.status = Status::Pending;
            self.pass.marked.push(id);

            if storage.downstream.is_empty() {
                frontier.push(id);
            } else {
                stack.extend(storage.downstream.iter().copied());
            }
        }
        frontier
    }

    /// Bring a node up to date if it is pending in the current pass.
    pub(crate) fn settle(&mut self, id: NodeId) -> Result<()> {
        let upstream = match self.nodes.get(&id) {
            Some(storage) if storage.status == Status::Pending => storage.upstream.clone(),
            _ => return Ok(()),
        };

        let mut stale = false;
        for up in &upstream {
            self.settle(*up)?;
            stale |= self.pass.changed.contains(up);
        }

        let changed = stale && self.recompute(id)?;
        let Some(storage) = self.nodes.get_mut(&id) else {
            return Ok(());
        };
        if !changed {
            storage.status = Status::Default;
            return Ok(());
        }

        storage.status = Status::Updated;
        let key = storage.key.clone();
        self.pass.changed.insert(id);
        self.pending.updated.insert(id);
        self.record(LifecycleEvent::NodeUpdated { key });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::graph::Value;
    use crate::reactive::{AsNode, QueryDecl, StateDecl};
    use crate::store::StoreOptions;

    fn counted<T, F>(name: &str, calls: &Arc<AtomicUsize>, f: F) -> QueryDecl<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&mut crate::graph::Reader<'_>) -> Result<T> + Send + Sync + 'static,
    {
        let calls = calls.clone();
        QueryDecl::new(name, move |r| {
            calls.fetch_add(1, Ordering::SeqCst);
            f(r)
        })
    }

    fn set(rt: &mut Runtime, id: NodeId, value: Value) {
        rt.nodes.get_mut(&id).unwrap().value = Some(value);
        rt.mark_changed(id);
    }

    #[test]
    fn diamond_evaluates_each_node_once() {
        let mut rt = Runtime::new(&StoreOptions::default());
        let a = StateDecl::new("A", 1i64);
        let calls = Arc::new(AtomicUsize::new(0));
        let b = {
            let a = a.clone();
            counted("B", &calls, move |r| Ok(r.get(&a)? + 1))
        };
        let c = {
            let a = a.clone();
            counted("C", &calls, move |r| Ok(r.get(&a)? * 10))
        };
        let d = {
            let (b, c) = (b.clone(), c.clone());
            counted("D", &calls, move |r| Ok(r.get(&b)? + r.get(&c)?))
        };

        let (d_id, _) = rt.ensure_node(&d.node()).unwrap();
        let (a_id, _) = rt.ensure_node(&a.node()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        set(&mut rt, a_id, Arc::new(2i64));
        rt.propagate().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        let value = rt.nodes[&d_id].value.clone().unwrap();
        assert_eq!(value.downcast_ref::<i64>(), Some(&23));
        assert!(rt.pending.updated.contains(&d_id));
    }

    #[test]
    fn equal_result_stops_propagation() {
        let mut rt = Runtime::new(&StoreOptions::default());
        let n = StateDecl::new("N", 2i64);
        let calls = Arc::new(AtomicUsize::new(0));
        let parity = {
            let n = n.clone();
            QueryDecl::new("Parity", move |r| Ok(r.get(&n)? % 2))
        };
        let label = {
            let parity = parity.clone();
            counted("Label", &calls, move |r| Ok(format!("parity {}", r.get(&parity)?)))
        };

        let (label_id, _) = rt.ensure_node(&label.node()).unwrap();
        let (n_id, _) = rt.ensure_node(&n.node()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        set(&mut rt, n_id, Arc::new(4i64));
        rt.propagate().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rt.nodes[&label_id].status, Status::Default);
        assert!(rt.pending.updated.is_empty());
    }

    #[test]
    fn unchanged_sources_do_nothing() {
        let mut rt = Runtime::new(&StoreOptions::default());
        rt.propagate().unwrap();
        assert!(rt.pass.marked.is_empty());
    }
}
