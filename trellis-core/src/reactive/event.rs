//! Event Implementation
//!
//! Events carry a payload to their subscribers at commit time and are never
//! read as state. A mapped event runs a transform on the emitted input when
//! the emission is applied; the transform may read the graph.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::domain::DomainRef;
use crate::error::Result;
use crate::graph::{NodeKind, Reader, Value};
use crate::identity::{canonical_key, DeclId};

use super::output::{Emit, Output};
use super::{AsNode, Instance, NodeRef};

type TransformFn<T, I> = dyn Fn(&mut Reader<'_>, I) -> Result<T> + Send + Sync;

/// Declaration of an event with payload `T`, emitted with input `I`.
///
/// # Example
///
/// ```rust,ignore
/// let saved = EventDecl::<String>::new("Saved");
/// let _sub = store.subscribe_event(&saved, |path| println!("saved {path}"))?;
/// store.dispatch(saved.emit("notes.md".into()))?;
/// ```
pub struct EventDecl<T, I = T> {
    node: NodeRef,
    transform: Arc<TransformFn<T, I>>,
}

impl<T, I> Clone for EventDecl<T, I> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<T> EventDecl<T>
where
    T: Send + Sync + 'static,
{
    /// Declare a root-domain event whose payload is the emitted value.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::owned_by(DomainRef::root(), name.into(), Arc::new(|_, input| Ok(input)))
    }
}

impl<T, I> EventDecl<T, I>
where
    T: Send + Sync + 'static,
    I: Send + 'static,
{
    /// Declare a root-domain event with a transform applied at emit time.
    pub fn mapped<F>(name: impl Into<Arc<str>>, transform: F) -> Self
    where
        F: Fn(&mut Reader<'_>, I) -> Result<T> + Send + Sync + 'static,
    {
        Self::owned_by(DomainRef::root(), name.into(), Arc::new(transform))
    }

    pub(crate) fn owned_by(
        owner: DomainRef,
        name: Arc<str>,
        transform: Arc<TransformFn<T, I>>,
    ) -> Self {
        let id = DeclId::new();
        let instance = EventInstance::<T> {
            key: canonical_key(NodeKind::Event, id, &name, ""),
            name,
            owner,
            _marker: PhantomData,
        };
        Self {
            node: NodeRef(Arc::new(instance)),
            transform,
        }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Emit the event.
    pub fn emit(&self, input: I) -> Output {
        let transform = self.transform.clone();
        Output::Event(Emit {
            node: self.node.clone(),
            payload: Box::new(move |reader: &mut Reader<'_>| {
                let payload = transform(reader, input)?;
                Ok(Arc::new(payload) as Value)
            }),
        })
    }
}

impl<T, I> AsNode for EventDecl<T, I> {
    fn node(&self) -> NodeRef {
        self.node.clone()
    }
}

struct EventInstance<T> {
    key: Arc<str>,
    name: Arc<str>,
    owner: DomainRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Instance for EventInstance<T> {
    fn key(&self) -> Result<Arc<str>> {
        Ok(self.key.clone())
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Event
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn owner(&self) -> &DomainRef {
        &self.owner
    }

    // Every emission is delivered.
    fn same(&self, _previous: &Value, _next: &Value) -> bool {
        false
    }
}
