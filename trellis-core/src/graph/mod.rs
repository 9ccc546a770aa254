//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between state, entities, queries and events.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are storages, one per node instance, kept in an arena indexed by
//!   [`NodeId`]
//! - Edges are dependencies: if query A read B during its last evaluation,
//!   B is in A's upstream set and A is in B's downstream set
//!
//! When state changes, we walk the downstream edges to mark every affected
//! query as pending, then settle pending queries upstream-first, only
//! re-evaluating those whose inputs actually changed.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a central arena rather than owning each other. Edges are
//!    index sets, so teardown never has to untangle reference cycles.
//!
//! 2. Both edge directions are stored and always updated together.
//!
//! 3. Every mutation made while a dispatch is in flight is journaled, so a
//!    failing evaluation rolls the whole pass back.

use std::any::Any;
use std::sync::Arc;

mod collect;
mod journal;
mod node;
mod propagate;
mod tracker;

pub(crate) use journal::{Journal, Undo};
pub(crate) use node::{Callback, Storage, Subscriber};
pub use node::{NodeId, NodeKind, Status};
pub(crate) use propagate::Pass;
pub(crate) use tracker::downcast;
pub use tracker::Reader;

/// Type-erased node value.
pub type Value = Arc<dyn Any + Send + Sync>;
