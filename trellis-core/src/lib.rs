//! Trellis Core
//!
//! This crate provides the engine of the Trellis reactive store. It
//! implements:
//!
//! - Typed declarations (state, entities, queries, events, commands)
//! - Incremental push-pull propagation with automatic dependency tracking
//! - Reference-counted collection of unobserved nodes
//! - Domains: namespaced groups of declarations with preload, effects and
//!   teardown
//! - A preloaded-state snapshot for hydrating a fresh store
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `identity`: declaration ids and canonical instance keys
//! - `externs`: injected constants with defaults
//! - `reactive`: the typed declarations and dispatchable outputs
//! - `graph`: storages, dependency tracking, propagation and collection
//! - `domain`: domain declarations, preload and effects
//! - `store`: the thread-safe façade applications talk to
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{CommandDecl, QueryDecl, StateDecl, Store};
//!
//! // Create some state
//! let count = StateDecl::new("Count", 0u32);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     QueryDecl::new("Doubled", move |r| Ok(r.get(&count)? * 2))
//! };
//!
//! // Create a command
//! let increase = {
//!     let count = count.clone();
//!     CommandDecl::new("Increase", move |r, by: u32| Ok(count.set(r.get(&count)? + by)))
//! };
//!
//! let store = Store::new();
//! let _sub = store.subscribe_query(&doubled, |n| println!("Doubled: {n}"))?;
//!
//! store.dispatch(increase.call(5))?;
//! // Subscriber runs, prints: "Doubled: 10"
//! ```

pub mod domain;
pub mod error;
pub mod externs;
pub mod graph;
pub mod identity;
pub mod reactive;
mod runtime;
pub mod store;

pub use domain::{
    DomainContext, DomainDecl, DomainKey, EffectContext, EffectStream, PreloadContext,
    PreloadedState,
};
pub use error::{Result, StoreError};
pub use externs::{ExternDecl, ExternImpl};
pub use graph::{NodeKind, Reader};
pub use reactive::{
    AsNode, CommandDecl, Derived, EntityDecl, EntityKey, EventDecl, Output, QueryDecl, QueryKey,
    Readable, StateDecl, StateKey,
};
pub use store::{
    CommitMode, DomainSubscription, Inspector, LifecycleEvent, Store, StoreOptions, Subscription,
};
