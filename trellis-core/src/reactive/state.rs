//! State Implementation
//!
//! State is plain mutable data with a default value. A state storage exists
//! as soon as anything reads or writes it, starts at the declared default and
//! only goes away with its domain.
//!
//! # Families
//!
//! `StateDecl::family` declares one state per argument; the default is
//! computed from the argument when the instance is first touched.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::domain::DomainRef;
use crate::error::Result;
use crate::graph::{NodeKind, Value};
use crate::identity::{canonical_key, encode_arg, DeclId, KeyCell};

use super::output::{Output, Write};
use super::{eq_compare, same_as, AsNode, Compare, Instance, NodeRef, Readable};

type DefaultFn<T, A> = Arc<dyn Fn(&A) -> T + Send + Sync>;

struct StateDef<T, A> {
    id: DeclId,
    name: Arc<str>,
    owner: DomainRef,
    default: DefaultFn<T, A>,
    compare: Compare<T>,
}

impl<T, A> Clone for StateDef<T, A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner.clone(),
            default: self.default.clone(),
            compare: self.compare.clone(),
        }
    }
}

/// Declaration of a piece of state.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateDecl::new("Count", 0u32);
/// store.dispatch(count.set(5))?;
/// assert_eq!(store.get(&count)?, 5);
/// ```
pub struct StateDecl<T, A = ()> {
    def: Arc<StateDef<T, A>>,
    singleton: Arc<OnceLock<NodeRef>>,
}

impl<T, A> Clone for StateDecl<T, A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            singleton: self.singleton.clone(),
        }
    }
}

impl<T> StateDecl<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Declare a root-domain state with an initial value.
    pub fn new(name: impl Into<Arc<str>>, initial: T) -> Self {
        Self::owned_by(
            DomainRef::root(),
            name.into(),
            Arc::new(move |_: &()| initial.clone()),
            eq_compare(),
        )
    }

    /// Write a new value.
    pub fn set(&self, value: T) -> Output {
        write(self.node(), value)
    }
}

impl<T, A> StateDecl<T, A>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    /// Declare a root-domain state family with a default per argument.
    pub fn family<F>(name: impl Into<Arc<str>>, default: F) -> Self
    where
        F: Fn(&A) -> T + Send + Sync + 'static,
    {
        Self::owned_by(DomainRef::root(), name.into(), Arc::new(default), eq_compare())
    }
}

impl<T, A> StateDecl<T, A>
where
    T: Clone + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    pub(crate) fn owned_by(
        owner: DomainRef,
        name: Arc<str>,
        default: DefaultFn<T, A>,
        compare: Compare<T>,
    ) -> Self {
        Self {
            def: Arc::new(StateDef {
                id: DeclId::new(),
                name,
                owner,
                default,
                compare,
            }),
            singleton: Arc::default(),
        }
    }

    /// Replace the compare function deciding whether a write is a change.
    ///
    /// The declaration keeps its identity, so this must happen before the
    /// state is first used.
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
    pub fn key(&self, arg: A) -> StateKey<T, A> {
        StateKey {
            node: NodeRef(Arc::new(StateInstance {
                def: self.def.clone(),
                arg,
                key: KeyCell::default(),
            })),
            _marker: PhantomData,
        }
    }
}

impl<T> AsNode for StateDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node(&self) -> NodeRef {
        self.singleton
            .get_or_init(|| self.key(()).node)
            .clone()
    }
}

impl<T> Readable for StateDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;
}

/// One state instance.
pub struct StateKey<T, A = ()> {
    node: NodeRef,
    _marker: PhantomData<fn() -> (T, A)>,
}

impl<T, A> Clone for StateKey<T, A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, A> StateKey<T, A>
where
    T: Send + Sync + 'static,
{
    /// Write a new value.
    pub fn set(&self, value: T) -> Output {
        write(self.node.clone(), value)
    }

    pub fn key(&self) -> Result<Arc<str>> {
        self.node.key()
    }
}

impl<T, A> AsNode for StateKey<T, A> {
    fn node(&self) -> NodeRef {
        self.node.clone()
    }
}

impl<T, A> Readable for StateKey<T, A>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;
}

fn write<T: Send + Sync + 'static>(node: NodeRef, value: T) -> Output {
    Output::State(Write {
        node,
        value: Arc::new(value),
    })
}

struct StateInstance<T, A> {
    def: Arc<StateDef<T, A>>,
    arg: A,
    key: KeyCell,
}

impl<T, A> Instance for StateInstance<T, A>
where
    T: Send + Sync + 'static,
    A: Serialize + Send + Sync + 'static,
{
    fn key(&self) -> Result<Arc<str>> {
        self.key.resolve(|| {
            let arg = encode_arg(&self.arg)?;
            Ok(canonical_key(NodeKind::State, self.def.id, &self.def.name, &arg))
        })
    }

    fn kind(&self) -> NodeKind {
        NodeKind::State
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn owner(&self) -> &DomainRef {
        &self.def.owner
    }

    fn initial(&self) -> Option<Value> {
        Some(Arc::new((self.def.default)(&self.arg)))
    }

    fn same(&self, previous: &Value, next: &Value) -> bool {
        same_as(&self.def.compare, previous, next)
    }
}
