//! Query Implementation
//!
//! A query is a derived value that caches its result. It only re-evaluates
//! when one of its dependencies changes.
//!
//! # How Queries Work
//!
//! 1. The first read or subscription evaluates the function through a
//!    tracking [`Reader`]. Every node it reads becomes a dependency.
//!
//! 2. When a dependency changes, the query is marked pending and settled
//!    later in the same pass, after all of its own dependencies.
//!
//! 3. The new value replaces the cached one only if the compare function
//!    says it differs; otherwise nothing downstream is disturbed.
//!
//! Evaluation functions must be pure and read only through the reader.
//!
//! # Lifecycle
//!
//! A query storage lives while it has subscribers or another query reads it.
//! Once neither holds, it is collected. The next read evaluates it afresh.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::domain::DomainRef;
use crate::error::Result;
use crate::graph::{NodeKind, Reader, Value};
use crate::identity::{canonical_key, encode_arg, DeclId, KeyCell};

use super::{eq_compare, same_as, AsNode, Compare, Derived, Instance, NodeRef, Readable};

type EvalFn<T, A> = Arc<dyn Fn(&mut Reader<'_>, &A) -> Result<T> + Send + Sync>;

struct QueryDef<T, A> {
    id: DeclId,
    name: Arc<str>,
    owner: DomainRef,
    eval: EvalFn<T, A>,
    compare: Compare<T>,
}

impl<T, A> Clone for QueryDef<T, A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner.clone(),
            eval: self.eval.clone(),
            compare: self.compare.clone(),
        }
    }
}

/// Declaration of a derived value.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateDecl::new("Count", 1u32);
/// let doubled = {
///     let count = count.clone();
///     QueryDecl::new("Doubled", move |r| Ok(r.get(&count)? * 2))
/// };
/// assert_eq!(store.get(&doubled)?, 2);
/// ```
pub struct QueryDecl<T, A = ()> {
    def: Arc<QueryDef<T, A>>,
    singleton: Arc<OnceLock<NodeRef>>,
}

impl<T, A> Clone for QueryDecl<T, A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            singleton: self.singleton.clone(),
        }
    }
}

impl<T> QueryDecl<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Declare a root-domain query.
    pub fn new<F>(name: impl Into<Arc<str>>, eval: F) -> Self
    where
        F: Fn(&mut Reader<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::owned_by(
            DomainRef::root(),
            name.into(),
            Arc::new(move |r: &mut Reader<'_>, _: &()| eval(r)),
            eq_compare(),
        )
    }
}

impl<T, A> QueryDecl<T, A>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    /// Declare a root-domain query family, evaluated per argument.
    pub fn family<F>(name: impl Into<Arc<str>>, eval: F) -> Self
    where
        F: Fn(&mut Reader<'_>, &A) -> Result<T> + Send + Sync + 'static,
    {
        Self::owned_by(DomainRef::root(), name.into(), Arc::new(eval), eq_compare())
    }
}

impl<T, A> QueryDecl<T, A>
where
    T: Clone + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    pub(crate) fn owned_by(
        owner: DomainRef,
        name: Arc<str>,
        eval: EvalFn<T, A>,
        compare: Compare<T>,
    ) -> Self {
        Self {
            def: Arc::new(QueryDef {
                id: DeclId::new(),
                name,
                owner,
                eval,
                compare,
            }),
            singleton: Arc::default(),
        }
    }

    /// Replace the compare function gating propagation.
    pub fn with_compare<F>(self, compare: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let mut def = (*self.def).clone();
        def.compare = Arc::new(compare);
        Self {
            def: Arc::new(def),
            singleton: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Address the instance for `arg`.
    pub fn key(&self, arg: A) -> QueryKey<T, A> {
        QueryKey {
            node: NodeRef(Arc::new(QueryInstance {
                def: self.def.clone(),
                arg,
                key: KeyCell::default(),
            })),
            _marker: PhantomData,
        }
    }
}

impl<T> AsNode for QueryDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node(&self) -> NodeRef {
        self.singleton.get_or_init(|| self.key(()).node).clone()
    }
}

impl<T> Readable for QueryDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;
}

impl<T> Derived for QueryDecl<T> where T: Clone + Send + Sync + 'static {}

/// One query instance.
pub struct QueryKey<T, A = ()> {
    node: NodeRef,
    _marker: PhantomData<fn() -> (T, A)>,
}

impl<T, A> Clone for QueryKey<T, A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, A> QueryKey<T, A> {
    pub fn key(&self) -> Result<Arc<str>> {
        self.node.key()
    }
}

impl<T, A> AsNode for QueryKey<T, A> {
    fn node(&self) -> NodeRef {
        self.node.clone()
    }
}

impl<T, A> Readable for QueryKey<T, A>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;
}

impl<T, A> Derived for QueryKey<T, A> where T: Clone + Send + Sync + 'static {}

struct QueryInstance<T, A> {
    def: Arc<QueryDef<T, A>>,
    arg: A,
    key: KeyCell,
}

impl<T, A> Instance for QueryInstance<T, A>
where
    T: Send + Sync + 'static,
    A: Serialize + Send + Sync + 'static,
{
    fn key(&self) -> Result<Arc<str>> {
        self.key.resolve(|| {
            let arg = encode_arg(&self.arg)?;
            Ok(canonical_key(NodeKind::Query, self.def.id, &self.def.name, &arg))
        })
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Query
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn owner(&self) -> &DomainRef {
        &self.def.owner
    }

    fn evaluate(&self, reader: &mut Reader<'_>) -> Result<Value> {
        let value = (self.def.eval)(reader, &self.arg)?;
        Ok(Arc::new(value))
    }

    fn same(&self, previous: &Value, next: &Value) -> bool {
        same_as(&self.def.compare, previous, next)
    }
}
