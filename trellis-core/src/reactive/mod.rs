//! Reactive Declarations
//!
//! This module implements the typed declarations users build stores from:
//! state, entities, queries, events and commands.
//!
//! # Concepts
//!
//! ## State
//!
//! A [`StateDecl`] is a container for mutable state with a default value.
//! Writing it is done by dispatching the [`Output`] returned by `set`.
//!
//! ## Entities
//!
//! An [`EntityDecl`] is an addressable record. It starts unset; reading it
//! before something created it is an error, and deleting it clears the value
//! while keeping its slot in the graph.
//!
//! ## Queries
//!
//! A [`QueryDecl`] is a derived value that caches its result. Its evaluation
//! function reads other nodes through a [`Reader`](crate::graph::Reader),
//! which records the dependencies automatically. It re-evaluates only when
//! one of those dependencies changes.
//!
//! ## Events and Commands
//!
//! An [`EventDecl`] is a notification channel that carries a payload to its
//! subscribers and is never read as state. A [`CommandDecl`] is a write-only
//! entry point: dispatching a call runs its function, which returns further
//! outputs.
//!
//! # Implementation Notes
//!
//! Declarations are cheap handles around an `Arc`. Each one carries a
//! [`DeclId`](crate::identity::DeclId), so two declarations with the same
//! name never share storage, while two instances of one declaration with
//! equal arguments always do.

use std::fmt;
use std::sync::Arc;

use crate::domain::DomainRef;
use crate::error::{Result, StoreError};
use crate::graph::{NodeKind, Reader, Value};

mod command;
mod entity;
mod event;
pub(crate) mod output;
mod query;
mod state;

pub use command::CommandDecl;
pub use entity::{EntityDecl, EntityKey};
pub use event::EventDecl;
pub use output::Output;
pub use query::{QueryDecl, QueryKey};
pub use state::{StateDecl, StateKey};

/// A node instance as the graph sees it.
pub(crate) trait Instance: Send + Sync {
    fn key(&self) -> Result<Arc<str>>;

    fn kind(&self) -> NodeKind;

    fn name(&self) -> &str;

    fn owner(&self) -> &DomainRef;

    /// Value a fresh storage starts with.
    fn initial(&self) -> Option<Value> {
        None
    }

    /// Run the evaluation function of a derived node.
    fn evaluate(&self, _reader: &mut Reader<'_>) -> Result<Value> {
        Err(StoreError::evaluation(format!(
            "{} `{}` has no evaluation function",
            self.kind(),
            self.name()
        )))
    }

    /// Compare two values of this instance.
    fn same(&self, previous: &Value, next: &Value) -> bool;
}

/// Type-erased handle to a node instance.
#[derive(Clone)]
pub struct NodeRef(pub(crate) Arc<dyn Instance>);

impl NodeRef {
    /// The canonical key of the instance.
    pub fn key(&self) -> Result<Arc<str>> {
        self.0.key()
    }

    pub fn kind(&self) -> NodeKind {
        self.0.kind()
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub(crate) fn owner(&self) -> &DomainRef {
        self.0.owner()
    }

    /// Key for error messages; falls back to kind and name when the
    /// argument cannot be encoded.
    pub(crate) fn display_key(&self) -> String {
        match self.key() {
            Ok(key) => key.to_string(),
            Err(_) => format!("{}/{}", self.kind(), self.name()),
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({})", self.display_key())
    }
}

/// Anything that addresses a node instance.
pub trait AsNode {
    fn node(&self) -> NodeRef;
}

/// An instance whose value can be read: state, entities and queries.
pub trait Readable: AsNode {
    type Value: Clone + Send + Sync + 'static;
}

/// A derived instance that can be subscribed to.
pub trait Derived: Readable {}

pub(crate) type Compare<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub(crate) fn eq_compare<T: PartialEq + 'static>() -> Compare<T> {
    Arc::new(|a: &T, b: &T| a == b)
}

/// Apply a typed compare function to two erased values.
pub(crate) fn same_as<T: 'static>(compare: &Compare<T>, previous: &Value, next: &Value) -> bool {
    match (previous.downcast_ref::<T>(), next.downcast_ref::<T>()) {
        (Some(previous), Some(next)) => compare(previous, next),
        _ => false,
    }
}
