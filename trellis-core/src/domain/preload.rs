//! Preload and hydration.
//!
//! A preload step fetches data for a domain before its effects start. The
//! fetched data is recorded in a [`PreloadedState`] snapshot under the
//! step's key; a store created from that snapshot replays the write step as
//! soon as the domain is created and never runs the read step for it.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::Result;
use crate::externs::ExternDecl;
use crate::graph::Reader;
use crate::reactive::output::{Call, Output};
use crate::reactive::Readable;
use crate::store::Store;

use super::DomainRef;

type ReadFn = dyn Fn(PreloadContext) -> BoxFuture<'static, Result<Json>> + Send + Sync;
type WriteFn = dyn Fn(&mut Reader<'_>, Json) -> Result<Output> + Send + Sync;

/// One registered preload step.
pub(crate) struct PreloadDescriptor {
    pub(crate) key: String,
    pub(crate) owner: DomainRef,
    pub(crate) read: Arc<ReadFn>,
    pub(crate) write: Arc<WriteFn>,
}

impl PreloadDescriptor {
    /// Fetch the data.
    pub(crate) fn read(&self, ctx: PreloadContext) -> BoxFuture<'static, Result<Json>> {
        (self.read)(ctx)
    }

    /// Turn fetched data into a dispatchable command call.
    pub(crate) fn write(&self, data: Json) -> Output {
        let write = self.write.clone();
        Output::Command(Call {
            key: Arc::from(format!("Preload/{}", self.key)),
            owner: self.owner.clone(),
            run: Box::new(move |reader: &mut Reader<'_>| write(reader, data)),
        })
    }
}

/// Store access for preload read steps.
///
/// Reads happen outside of the graph lock, between dispatches.
#[derive(Clone)]
pub struct PreloadContext {
    store: Store,
}

impl PreloadContext {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Current value of a state, entity or query.
    pub fn get<K: Readable>(&self, key: &K) -> Result<K::Value> {
        self.store.get(key)
    }

    pub fn get_extern<T>(&self, decl: &ExternDecl<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.store.get_extern(decl)
    }

    /// The store running the preload.
    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Serializable snapshot of preloaded data, keyed by preload key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreloadedState {
    entries: IndexMap<String, Json>,
}

impl PreloadedState {
    /// Creates a new empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Json) {
        self.entries.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Json)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Serializes the snapshot to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the snapshot to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes a snapshot from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
