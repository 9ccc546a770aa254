//! Extern values.
//!
//! An extern is a constant injected from outside the graph: a configuration
//! value, a client handle, a clock. Declarations carry a default; a store can
//! override any of them through
//! [`StoreOptions::with_extern`](crate::store::StoreOptions::with_extern).
//! Once resolved, a value is memoized for the life of the store.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::{downcast, Value};
use crate::identity::DeclId;

/// Declaration of an extern value of type `T`.
pub struct ExternDecl<T> {
    id: DeclId,
    name: Arc<str>,
    default: Value,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ExternDecl<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> ExternDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Arc<str>>, default: T) -> Self {
        Self {
            id: DeclId::new(),
            name: name.into(),
            default: Arc::new(default),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the default for one store.
    pub fn provide(&self, value: T) -> ExternImpl {
        ExternImpl {
            id: self.id,
            name: self.name.clone(),
            value: Arc::new(value),
        }
    }
}

impl<T> fmt::Debug for ExternDecl<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternDecl")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A value provided for an [`ExternDecl`].
#[derive(Clone)]
pub struct ExternImpl {
    id: DeclId,
    name: Arc<str>,
    value: Value,
}

impl fmt::Debug for ExternImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternImpl")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Resolves externs against the overrides a store was built with.
#[derive(Default)]
pub(crate) struct ExternRegistry {
    provided: Vec<ExternImpl>,
    resolved: HashMap<DeclId, Value>,
}

impl ExternRegistry {
    pub(crate) fn new(provided: Vec<ExternImpl>) -> Self {
        Self {
            provided,
            resolved: HashMap::new(),
        }
    }

    pub(crate) fn resolve<T>(&mut self, decl: &ExternDecl<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let value = match self.resolved.get(&decl.id) {
            Some(value) => value.clone(),
            None => {
                // Later overrides win.
                let value = self
                    .provided
                    .iter()
                    .rev()
                    .find(|provided| provided.id == decl.id)
                    .map_or_else(|| decl.default.clone(), |provided| provided.value.clone());
                tracing::trace!(name = %decl.name, "resolved extern");
                self.resolved.insert(decl.id, value.clone());
                value
            }
        };
        downcast(&value, || format!("Extern/{}/{}", decl.id, decl.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default() {
        let endpoint = ExternDecl::new("Endpoint", "https://localhost".to_string());
        let mut registry = ExternRegistry::default();
        assert_eq!(registry.resolve(&endpoint).unwrap(), "https://localhost");
    }

    #[test]
    fn overrides_match_by_declaration() {
        let retries = ExternDecl::new("Retries", 3u32);
        let other = ExternDecl::new("Retries", 3u32);
        let mut registry = ExternRegistry::new(vec![retries.provide(5), retries.provide(7)]);
        assert_eq!(registry.resolve(&retries).unwrap(), 7);
        assert_eq!(registry.resolve(&other).unwrap(), 3);
    }

    #[test]
    fn resolution_is_memoized() {
        let clock = ExternDecl::new("Clock", 0u64);
        let mut registry = ExternRegistry::new(vec![clock.provide(42)]);
        assert_eq!(registry.resolve(&clock).unwrap(), 42);
        registry.provided.clear();
        assert_eq!(registry.resolve(&clock).unwrap(), 42);
    }
}
