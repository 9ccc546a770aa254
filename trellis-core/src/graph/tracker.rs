//! Dependency Tracker
//!
//! Query evaluation functions never touch storages directly. They receive a
//! [`Reader`], and every read goes through it:
//!
//! 1. The read instance is resolved to its storage, creating it if absent
//!    (a query read for the first time is evaluated on the spot).
//!
//! 2. If the storage is a query that is still pending in the current
//!    propagation pass, it is settled first.
//!
//! 3. The storage is recorded in the reader's frame and its value returned.
//!
//! When the evaluation function returns, the frame's read set becomes the
//! query's new upstream set in one step, with the old edges removed and new
//! ones added together. Nothing is wired while the evaluation is still
//! running, so a node that briefly loses its last reader during the swap is
//! only queued for collection, never collected mid-transaction.
//!
//! Commands, event transforms and preload writes get an untracked reader:
//! same accessors, no frame.

use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::error::{Result, StoreError};
use crate::externs::ExternDecl;
use crate::reactive::{AsNode, NodeRef, Readable};
use crate::runtime::Runtime;
use crate::store::LifecycleEvent;

use super::journal::Undo;
use super::node::{NodeId, NodeKind, Storage};
use super::Value;

type Reads = SmallVec<[NodeId; 8]>;

/// The nodes read by one evaluation.
struct Frame {
    node: NodeId,
    reads: Reads,
}

/// Read access to the graph handed to evaluation functions.
///
/// Inside a query evaluation every read becomes a dependency of that query.
/// Inside commands and event transforms reads are plain lookups.
pub struct Reader<'a> {
    runtime: &'a mut Runtime,
    frame: Option<Frame>,
}

impl<'a> Reader<'a> {
    pub(crate) fn untracked(runtime: &'a mut Runtime) -> Self {
        Self {
            runtime,
            frame: None,
        }
    }

    pub(crate) fn tracking(runtime: &'a mut Runtime, node: NodeId) -> Self {
        Self {
            runtime,
            frame: Some(Frame {
                node,
                reads: Reads::new(),
            }),
        }
    }

    fn into_reads(self) -> Reads {
        self.frame.map(|frame| frame.reads).unwrap_or_default()
    }

    /// Read the current value of a state, entity or query.
    ///
    /// Reading an entity that has not been created fails with
    /// [`StoreError::EntityNotCreated`].
    pub fn get<K: Readable>(&mut self, key: &K) -> Result<K::Value> {
        let node = key.node();
        match self.read(&node)? {
            Some(value) => downcast(&value, || node.display_key()),
            None => Err(StoreError::EntityNotCreated(node.display_key())),
        }
    }

    /// Whether the instance currently holds a value.
    ///
    /// Always true for state and queries. For entities this is the safe way
    /// to check for existence; the read is tracked like any other.
    pub fn has<K: Readable>(&mut self, key: &K) -> Result<bool> {
        Ok(self.read(&key.node())?.is_some())
    }

    /// Resolve an extern value.
    pub fn get_extern<T>(&mut self, decl: &ExternDecl<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.runtime.externs.resolve(decl)
    }

    fn read(&mut self, node: &NodeRef) -> Result<Option<Value>> {
        let (id, created) = self.runtime.ensure_node(node)?;
        if created && self.frame.is_none() && node.kind() == NodeKind::Query {
            // Nothing reads it yet; drop it again unless a subscriber shows up.
            self.runtime.pending.collect.insert(id);
        }
        if self.runtime.is_evaluating(id) {
            return Err(StoreError::Cycle(node.display_key()));
        }
        self.runtime.settle(id)?;

        let storage = self
            .runtime
            .nodes
            .get(&id)
            .ok_or_else(|| StoreError::Detached(node.display_key()))?;
        let value = storage.value.clone();

        if let Some(frame) = &mut self.frame {
            debug_assert_ne!(frame.node, id);
            if !frame.reads.contains(&id) {
                frame.reads.push(id);
            }
        }
        Ok(value)
    }
}

pub(crate) fn downcast<T: Clone + 'static>(
    value: &Value,
    describe: impl FnOnce() -> String,
) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| StoreError::TypeMismatch(describe()))
}

impl Runtime {
    pub(crate) fn is_evaluating(&self, id: NodeId) -> bool {
        self.evaluating.iter().any(|(node, _)| *node == id)
    }

    /// Resolve an instance to its storage, creating it on first access.
    ///
    /// Returns the node id and whether the storage was created by this call.
    pub(crate) fn ensure_node(&mut self, node: &NodeRef) -> Result<(NodeId, bool)> {
        let key = node.key()?;
        let domain = self.get_or_create_domain(node.owner())?;
        if let Some(id) = self.lookup(&domain, &key) {
            return Ok((id, false));
        }
        if self.evaluating.iter().any(|(_, evaluating)| *evaluating == key) {
            return Err(StoreError::Cycle(key.to_string()));
        }

        let id = NodeId::new();
        let kind = node.kind();
        let (value, reads) = match kind {
            NodeKind::Query => {
                let (value, reads) = self.evaluate(id, &key, node)?;
                (Some(value), reads)
            }
            _ => (node.0.initial(), Reads::new()),
        };

        let mut storage = Storage::new(id, key.clone(), domain.clone(), node.clone(), value);
        for up in &reads {
            if let Some(upstream) = self.nodes.get_mut(up) {
                upstream.downstream.insert(id);
                storage.upstream.insert(*up);
            }
        }
        self.nodes.insert(id, storage);
        if let Some(container) = self.domains.get_mut(&domain) {
            container.namespace.insert(key.clone(), id);
        }
        self.journal.record(Undo::Created { id });
        self.record(LifecycleEvent::NodeCreated { key, kind });
        Ok((id, true))
    }

    /// Find a live storage by domain and canonical key.
    pub(crate) fn lookup(&self, domain: &str, key: &str) -> Option<NodeId> {
        self.domains
            .get(domain)
            .and_then(|container| container.namespace.get(key))
            .copied()
    }

    /// Run a query's evaluation function under a fresh frame.
    fn evaluate(&mut self, id: NodeId, key: &Arc<str>, node: &NodeRef) -> Result<(Value, Reads)> {
        self.evaluating.push((id, key.clone()));
        let mut reader = Reader::tracking(self, id);
        let result = node.0.evaluate(&mut reader);
        let reads = reader.into_reads();
        self.evaluating.pop();
        Ok((result?, reads))
    }

    /// Re-evaluate an existing query and swap in its new read set.
    ///
    /// Returns whether the value changed under the declared compare function.
    pub(crate) fn recompute(&mut self, id: NodeId) -> Result<bool> {
        let (key, source) = match self.nodes.get(&id) {
            Some(storage) => (storage.key.clone(), storage.source.clone()),
            None => return Ok(false),
        };
        let (value, reads) = self.evaluate(id, &key, &source)?;
        self.replace_upstream(id, reads);

        let storage = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::Detached(key.to_string()))?;
        let unchanged = storage
            .value
            .as_ref()
            .is_some_and(|previous| storage.same(previous, &value));
        if unchanged {
            return Ok(false);
        }
        let previous = storage.value.replace(value);
        self.journal.record(Undo::Value { id, previous });
        Ok(true)
    }

    /// Replace a query's upstream set with the nodes read by its latest
    /// evaluation, keeping both edge directions in sync.
    fn replace_upstream(&mut self, id: NodeId, reads: Reads) {
        let next: IndexSet<NodeId> = reads
            .into_iter()
            .filter(|up| self.nodes.contains_key(up))
            .collect();
        let Some(storage) = self.nodes.get_mut(&id) else {
            return;
        };
        if storage.upstream == next {
            return;
        }
        let previous = std::mem::replace(&mut storage.upstream, next.clone());

        for up in previous.difference(&next) {
            if let Some(node) = self.nodes.get_mut(up) {
                node.downstream.shift_remove(&id);
                if node.is_collectable() {
                    self.pending.collect.insert(*up);
                }
            }
        }
        for up in next.difference(&previous) {
            if let Some(node) = self.nodes.get_mut(up) {
                node.downstream.insert(id);
            }
        }
        self.journal.record(Undo::Upstream { id, previous });
    }

    /// Read the current value of an instance outside of any evaluation.
    ///
    /// Queries created only to answer this read are queued for collection.
    pub(crate) fn peek(&mut self, node: &NodeRef) -> Result<Option<Value>> {
        Reader::untracked(self).read(node)
    }
}
