//! Store Runtime
//!
//! The runtime is the central coordinator that connects storages, domains and
//! subscribers. It owns the node arena and every worklist, and it is only
//! ever touched behind the store's lock.
//!
//! # How It Works
//!
//! 1. Every dispatch runs inside a transaction: outputs are applied as
//!    direct writes, then the writes are propagated through the graph.
//!
//! 2. If anything fails, the undo journal restores the last committed
//!    state and the pending notifications of the failed dispatch are
//!    dropped.
//!
//! 3. Domains created or revived along the way replay their preloaded data
//!    as part of the same transaction.
//!
//! 4. On success, the collector runs and changed queries and emitted events
//!    wait in the pending lists until the next flush.
//!
//! 5. A flush turns the pending lists into [`Notification`]s, which the
//!    store delivers after releasing the lock.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::domain::{DomainContainer, DomainRef, DormantDomain, PreloadedState};
use crate::error::{Result, StoreError};
use crate::externs::ExternRegistry;
use crate::graph::{
    Callback, Journal, NodeId, Pass, Reader, Status, Storage, Subscriber, Undo, Value,
};
use crate::reactive::output::{Call, Emit, Output};
use crate::reactive::NodeRef;
use crate::store::{LifecycleEvent, StoreOptions, SubscriberId};

/// Work queued for the next flush or collection.
#[derive(Default)]
pub(crate) struct Pending {
    /// Queries whose value changed since the last flush.
    pub(crate) updated: IndexSet<NodeId>,
    /// Emitted events and their payloads, in emission order.
    pub(crate) events: Vec<(NodeId, Value)>,
    /// Nodes to re-check against their collection predicate.
    pub(crate) collect: IndexSet<NodeId>,
    /// Domains to re-check against the domain collection predicate.
    pub(crate) domains: IndexSet<Arc<str>>,
}

impl Pending {
    fn has_notifications(&self) -> bool {
        !self.updated.is_empty() || !self.events.is_empty()
    }
}

/// One delivery to every subscriber of a node.
pub(crate) struct Notification {
    callbacks: Vec<Callback>,
    value: Value,
}

impl Notification {
    pub(crate) fn deliver(self) {
        for callback in &self.callbacks {
            callback(&self.value);
        }
    }
}

/// Everything removed by [`Runtime::discard_all`], dropped by the caller once
/// the store lock is released.
pub(crate) struct Discarded {
    _nodes: HashMap<NodeId, Storage>,
    _domains: Vec<DomainContainer>,
}

/// The store engine.
pub(crate) struct Runtime {
    pub(crate) nodes: HashMap<NodeId, Storage>,
    pub(crate) domains: IndexMap<Arc<str>, DomainContainer>,
    /// Torn-down domains, kept by key so a later reference revives them with
    /// the same declarations.
    pub(crate) dormant: HashMap<Arc<str>, DormantDomain>,
    /// Domains whose declaration function is running.
    pub(crate) constructing: Vec<Arc<str>>,
    pub(crate) externs: ExternRegistry,
    pub(crate) journal: Journal,
    pub(crate) pass: Pass,
    pub(crate) pending: Pending,
    /// Queries whose evaluation function is on the stack.
    pub(crate) evaluating: Vec<(NodeId, Arc<str>)>,
    pub(crate) preloaded: PreloadedState,
    lifecycle: Vec<LifecycleEvent>,
    inspecting: bool,
}

impl Runtime {
    pub(crate) fn new(options: &StoreOptions) -> Self {
        Self {
            nodes: HashMap::new(),
            domains: IndexMap::new(),
            dormant: HashMap::new(),
            constructing: Vec::new(),
            externs: ExternRegistry::new(options.externs.clone()),
            journal: Journal::default(),
            pass: Pass::default(),
            pending: Pending::default(),
            evaluating: Vec::new(),
            preloaded: options.preloaded_state.clone().unwrap_or_default(),
            lifecycle: Vec::new(),
            inspecting: !options.inspectors.is_empty(),
        }
    }

    /// Log a lifecycle event and buffer it for inspectors.
    pub(crate) fn record(&mut self, event: LifecycleEvent) {
        tracing::debug!(event = %event, "lifecycle");
        if self.inspecting {
            self.lifecycle.push(event);
        }
    }

    pub(crate) fn take_lifecycle(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.lifecycle)
    }

    /// Run `f` as one all-or-nothing unit.
    ///
    /// Nested calls join the outer transaction.
    pub(crate) fn transact<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.journal.is_active() {
            return f(self);
        }

        self.journal.begin();
        let updated = self.pending.updated.len();
        let events = self.pending.events.len();

        let result = f(self).and_then(|value| {
            self.propagate()?;
            Ok(value)
        });
        let entries = self.journal.finish();

        match result {
            Ok(value) => {
                self.pass.reset();
                self.collect();
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(error = %err, undo = entries.len(), "rolling back");
                self.rollback(entries);
                for id in std::mem::take(&mut self.pass.marked) {
                    if let Some(storage) = self.nodes.get_mut(&id) {
                        storage.status = Status::Default;
                    }
                }
                self.pending.updated.truncate(updated);
                self.pending.events.truncate(events);
                for id in &self.pending.updated {
                    if let Some(storage) = self.nodes.get_mut(id) {
                        storage.status = Status::Updated;
                    }
                }
                self.pass.reset();
                self.evaluating.clear();
                self.constructing.clear();
                self.collect();
                Err(err)
            }
        }
    }

    /// Apply a dispatched output.
    pub(crate) fn apply(&mut self, output: Output) -> Result<()> {
        match output {
            Output::None => Ok(()),
            Output::Batch(outputs) => {
                for output in outputs {
                    self.apply(output)?;
                }
                Ok(())
            }
            Output::State(write) | Output::Entity(write) => {
                self.write(&write.node, Some(write.value))
            }
            Output::EntityDelete(node) => self.write(&node, None),
            Output::Event(emit) => self.emit(emit),
            Output::Command(call) => self.call(call),
        }
    }

    /// Assign a value to a state or entity storage.
    ///
    /// Writes that compare equal to the current value are dropped here, so
    /// they never reach the propagator.
    fn write(&mut self, node: &NodeRef, value: Option<Value>) -> Result<()> {
        let (id, _) = self.ensure_node(node)?;
        let storage = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::Detached(node.display_key()))?;

        let same = match (&storage.value, &value) {
            (None, None) => true,
            (Some(current), Some(next)) => storage.same(current, next),
            _ => false,
        };
        if same {
            return Ok(());
        }

        tracing::trace!(key = %storage.key, deleted = value.is_none(), "write");
        let previous = std::mem::replace(&mut storage.value, value);
        self.journal.record(Undo::Value { id, previous });
        self.mark_changed(id);
        Ok(())
    }

    fn emit(&mut self, emit: Emit) -> Result<()> {
        // Transforms read the graph, so earlier writes must be visible.
        self.propagate()?;
        let (id, _) = self.ensure_node(&emit.node)?;
        let payload = (emit.payload)(&mut Reader::untracked(self))?;

        let key = emit.node.key()?;
        self.pending.events.push((id, payload));
        self.pending.collect.insert(id);
        self.record(LifecycleEvent::EventEmitted { key });
        Ok(())
    }

    fn call(&mut self, call: Call) -> Result<()> {
        self.propagate()?;
        self.get_or_create_domain(&call.owner)?;
        self.record(LifecycleEvent::CommandReceived {
            key: call.key.clone(),
        });
        let output = (call.run)(&mut Reader::untracked(self))?;
        self.apply(output)
    }

    /// Whether a flush would deliver anything.
    pub(crate) fn has_pending(&self) -> bool {
        self.pending.has_notifications()
    }

    /// Close the current commit: hand out notifications for every query
    /// whose value differs from what its subscribers last saw, then every
    /// emitted event.
    pub(crate) fn take_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();

        for id in std::mem::take(&mut self.pending.updated) {
            let Some(storage) = self.nodes.get_mut(&id) else {
                continue;
            };
            storage.status = Status::Default;
            let Some(value) = storage.value.clone() else {
                continue;
            };
            let seen = storage
                .committed
                .as_ref()
                .is_some_and(|committed| storage.same(committed, &value));
            if seen {
                continue;
            }
            storage.committed = Some(value.clone());
            if !storage.subscribers.is_empty() {
                out.push(Notification {
                    callbacks: storage.callbacks(),
                    value,
                });
            }
        }

        for (id, payload) in std::mem::take(&mut self.pending.events) {
            if let Some(storage) = self.nodes.get(&id) {
                if !storage.subscribers.is_empty() {
                    out.push(Notification {
                        callbacks: storage.callbacks(),
                        value: payload,
                    });
                }
            }
        }

        self.collect();
        out
    }

    /// Attach a subscriber to a query or event, creating it if needed.
    ///
    /// Returns the owning domain key and the node key, which together
    /// address the storage for the later unsubscribe.
    pub(crate) fn subscribe(
        &mut self,
        node: &NodeRef,
        id: SubscriberId,
        callback: Callback,
        internal: bool,
    ) -> Result<(Arc<str>, Arc<str>)> {
        let (node_id, _) = self.transact(|rt| rt.ensure_node(node))?;
        let storage = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| StoreError::Detached(node.display_key()))?;
        storage
            .subscribers
            .insert(id, Subscriber { callback, internal });
        tracing::trace!(key = %storage.key, subscribers = storage.refcount(), "subscribed");
        Ok((storage.domain.clone(), storage.key.clone()))
    }

    /// Detach a subscriber and collect whatever it was keeping alive.
    pub(crate) fn unsubscribe(&mut self, domain: &str, key: &str, id: SubscriberId) {
        self.detach(domain, key, id);
        self.collect();
    }

    /// Detach without collecting.
    pub(crate) fn detach(&mut self, domain: &str, key: &str, id: SubscriberId) {
        let Some(node_id) = self.lookup(domain, key) else {
            return;
        };
        let Some(storage) = self.nodes.get_mut(&node_id) else {
            return;
        };
        if storage.subscribers.shift_remove(&id).is_some() {
            tracing::trace!(key = %storage.key, subscribers = storage.refcount(), "unsubscribed");
            self.pending.collect.insert(node_id);
            self.pending.domains.insert(storage.domain.clone());
        }
    }

    /// Tear everything down regardless of reference counts.
    pub(crate) fn discard_all(&mut self, seed: PreloadedState) -> Discarded {
        let mut domains = Vec::with_capacity(self.domains.len());
        for (key, mut container) in std::mem::take(&mut self.domains) {
            for task in container.tasks.drain(..) {
                task.abort();
            }
            self.record(LifecycleEvent::DomainDiscarded { key });
            domains.push(container);
        }
        self.dormant.clear();
        self.constructing.clear();
        self.evaluating.clear();
        self.pending = Pending::default();
        self.pass.reset();
        self.preloaded = seed;
        tracing::debug!(domains = domains.len(), nodes = self.nodes.len(), "discarded store");

        Discarded {
            _nodes: std::mem::take(&mut self.nodes),
            _domains: domains,
        }
    }

    /// Canonical key of a domain, creating or reviving it.
    pub(crate) fn domain_key(&mut self, domain: &DomainRef) -> Result<Arc<str>> {
        self.transact(|rt| rt.get_or_create_domain(domain))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::reactive::{AsNode, CommandDecl, QueryDecl, StateDecl};

    fn runtime() -> Runtime {
        Runtime::new(&StoreOptions::default())
    }

    fn dispatch(rt: &mut Runtime, output: impl Into<Output>) -> Result<()> {
        rt.transact(|rt| rt.apply(output.into()))
    }

    #[test]
    fn equal_write_is_not_a_change() {
        let mut rt = runtime();
        let count = StateDecl::new("Count", 1u32);
        let (id, _) = rt.ensure_node(&count.node()).unwrap();

        dispatch(&mut rt, count.set(1)).unwrap();
        assert!(!rt.has_pending());
        assert_eq!(rt.nodes[&id].status, Status::Default);
    }

    #[test]
    fn failed_dispatch_rolls_back() {
        let mut rt = runtime();
        let count = StateDecl::new("Count", 1u32);
        let guarded = {
            let count = count.clone();
            QueryDecl::new("Guarded", move |r| {
                let n = r.get(&count)?;
                if n > 5 {
                    Err(StoreError::evaluation("too large"))
                } else {
                    Ok(n)
                }
            })
        };
        let (guarded_id, _) = rt.transact(|rt| rt.ensure_node(&guarded.node())).unwrap();
        rt.nodes
            .get_mut(&guarded_id)
            .unwrap()
            .subscribers
            .insert(SubscriberId::new(), Subscriber {
                callback: Arc::new(|_| {}),
                internal: false,
            });

        let err = dispatch(&mut rt, count.set(9)).unwrap_err();
        assert_eq!(err, StoreError::evaluation("too large"));

        let value = rt.peek(&count.node()).unwrap().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&1));
        assert_eq!(rt.nodes[&guarded_id].status, Status::Default);
        assert!(!rt.has_pending());
        assert!(!rt.journal.is_active());
    }

    #[test]
    fn commands_see_earlier_writes() {
        let mut rt = runtime();
        let count = StateDecl::new("Count", 0u32);
        let increase = {
            let count = count.clone();
            CommandDecl::new("Increase", move |r, ()| Ok(count.set(r.get(&count)? + 1)))
        };

        dispatch(&mut rt, vec![increase.call(()), increase.call(()), increase.call(())]).unwrap();
        let value = rt.peek(&count.node()).unwrap().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&3));
    }

    #[test]
    fn notifications_skip_round_trips() {
        let mut rt = runtime();
        let count = StateDecl::new("Count", 0u32);
        let doubled = {
            let count = count.clone();
            QueryDecl::new("Doubled", move |r| Ok(r.get(&count)? * 2))
        };
        let hits = Arc::new(AtomicUsize::new(0));
        let callback: Callback = {
            let hits = hits.clone();
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        rt.subscribe(&doubled.node(), SubscriberId::new(), callback, false)
            .unwrap();

        dispatch(&mut rt, count.set(4)).unwrap();
        dispatch(&mut rt, count.set(0)).unwrap();
        for notification in rt.take_notifications() {
            notification.deliver();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        dispatch(&mut rt, count.set(2)).unwrap();
        for notification in rt.take_notifications() {
            notification.deliver();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
