//! Graph Nodes
//!
//! This module defines the storage record that lives in the dependency graph
//! for every state, entity, query and event instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::reactive::NodeRef;
use crate::store::SubscriberId;

use super::Value;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of a declaration, and the prefix of its canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Plain mutable state with a default value.
    State,

    /// Addressable record that starts unset and can be deleted.
    Entity,

    /// Memoized derived value.
    Query,

    /// Fire-and-forget notification channel.
    Event,

    /// Write-only entry point producing outputs. Commands have no storage.
    Command,

    /// Domain container. Domains have no storage in the node arena.
    Domain,
}

impl NodeKind {
    /// The canonical key prefix for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::State => "State",
            NodeKind::Entity => "Entity",
            NodeKind::Query => "Query",
            NodeKind::Event => "Event",
            NodeKind::Command => "Command",
            NodeKind::Domain => "Domain",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Propagation status of a query storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Settled; the cached value is current.
    #[default]
    Default,

    /// An upstream value changed in the current pass; not yet re-checked.
    Pending,

    /// Recomputed to a new value since the last commit flush.
    Updated,
}

pub(crate) type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// A registered subscriber on a query or event storage.
pub(crate) struct Subscriber {
    pub(crate) callback: Callback,
    /// Set for subscriptions an effect holds on its own domain's nodes.
    /// Those do not keep the domain alive.
    pub(crate) internal: bool,
}

/// The live record backing one node instance.
pub(crate) struct Storage {
    pub(crate) id: NodeId,
    pub(crate) key: Arc<str>,
    pub(crate) kind: NodeKind,
    /// Canonical key of the owning domain.
    pub(crate) domain: Arc<str>,
    pub(crate) source: NodeRef,

    /// `None` for entities that are not created (or deleted) and for events.
    pub(crate) value: Option<Value>,

    /// Last query value handed to subscribers.
    pub(crate) committed: Option<Value>,

    /// Nodes this node read during its most recent evaluation.
    pub(crate) upstream: IndexSet<NodeId>,

    /// Queries that read this node.
    pub(crate) downstream: IndexSet<NodeId>,

    pub(crate) status: Status,
    pub(crate) subscribers: IndexMap<SubscriberId, Subscriber>,
}

impl Storage {
    pub(crate) fn new(
        id: NodeId,
        key: Arc<str>,
        domain: Arc<str>,
        source: NodeRef,
        value: Option<Value>,
    ) -> Self {
        let kind = source.kind();
        let committed = match kind {
            NodeKind::Query => value.clone(),
            _ => None,
        };
        Self {
            id,
            key,
            kind,
            domain,
            source,
            value,
            committed,
            upstream: IndexSet::new(),
            downstream: IndexSet::new(),
            status: Status::Default,
            subscribers: IndexMap::new(),
        }
    }

    /// Number of live subscriptions, internal ones included.
    pub(crate) fn refcount(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of subscriptions held from outside the owning domain.
    pub(crate) fn external_refcount(&self) -> usize {
        self.subscribers.values().filter(|s| !s.internal).count()
    }

    /// Collection predicate for a single node.
    ///
    /// Queries go once nothing subscribes and no query reads them; events go
    /// once nothing subscribes. State and entities are only discarded with
    /// their domain.
    pub(crate) fn is_collectable(&self) -> bool {
        match self.kind {
            NodeKind::Query => self.refcount() == 0 && self.downstream.is_empty(),
            NodeKind::Event => self.refcount() == 0,
            _ => false,
        }
    }

    pub(crate) fn callbacks(&self) -> Vec<Callback> {
        self.subscribers.values().map(|s| s.callback.clone()).collect()
    }

    /// Compare two values with the declaration's compare function.
    pub(crate) fn same(&self, previous: &Value, next: &Value) -> bool {
        self.source.0.same(previous, next)
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status)
            .field("has_value", &self.value.is_some())
            .field("upstream", &self.upstream.len())
            .field("downstream", &self.downstream.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}
