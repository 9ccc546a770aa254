//! Entity Implementation
//!
//! Entities are addressable records. Unlike state they have no default: the
//! storage starts unset, and reading it before a `set` fails with
//! [`StoreError::EntityNotCreated`](crate::error::StoreError::EntityNotCreated).
//! Deleting an entity clears its value and invalidates its readers, but the
//! storage slot stays so the record can be created again under the same key.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::domain::DomainRef;
use crate::error::Result;
use crate::graph::{NodeKind, Value};
use crate::identity::{canonical_key, encode_arg, DeclId, KeyCell};

use super::output::{Output, Write};
use super::{eq_compare, same_as, AsNode, Compare, Instance, NodeRef, Readable};

struct EntityDef<T> {
    id: DeclId,
    name: Arc<str>,
    owner: DomainRef,
    compare: Compare<T>,
}

/// Declaration of an entity family.
///
/// # Example
///
/// ```rust,ignore
/// let todo = EntityDecl::<String, u32>::new("Todo");
/// store.dispatch(todo.key(1).set("write docs".into()))?;
/// store.dispatch(todo.key(1).delete())?;
/// ```
pub struct EntityDecl<T, A = ()> {
    def: Arc<EntityDef<T>>,
    singleton: Arc<OnceLock<NodeRef>>,
    _marker: PhantomData<fn(A)>,
}

impl<T, A> Clone for EntityDecl<T, A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            singleton: self.singleton.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, A> EntityDecl<T, A>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    /// Declare a root-domain entity family.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::owned_by(DomainRef::root(), name.into(), eq_compare())
    }
}

impl<T, A> EntityDecl<T, A>
where
    T: Clone + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    pub(crate) fn owned_by(owner: DomainRef, name: Arc<str>, compare: Compare<T>) -> Self {
        Self {
            def: Arc::new(EntityDef {
                id: DeclId::new(),
                name,
                owner,
                compare,
            }),
            singleton: Arc::default(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Address the record for `arg`.
    pub fn key(&self, arg: A) -> EntityKey<T, A> {
        EntityKey {
            node: NodeRef(Arc::new(EntityInstance {
                def: self.def.clone(),
                arg,
                key: KeyCell::default(),
            })),
            _marker: PhantomData,
        }
    }
}

impl<T> EntityDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn set(&self, value: T) -> Output {
        create(self.node(), value)
    }

    pub fn delete(&self) -> Output {
        Output::EntityDelete(self.node())
    }
}

impl<T> AsNode for EntityDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node(&self) -> NodeRef {
        self.singleton.get_or_init(|| self.key(()).node).clone()
    }
}

impl<T> Readable for EntityDecl<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;
}

/// One entity record.
pub struct EntityKey<T, A = ()> {
    node: NodeRef,
    _marker: PhantomData<fn() -> (T, A)>,
}

impl<T, A> Clone for EntityKey<T, A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, A> EntityKey<T, A>
where
    T: Send + Sync + 'static,
{
    /// Create or update the record.
    pub fn set(&self, value: T) -> Output {
        create(self.node.clone(), value)
    }

    /// Delete the record. Its readers see it as not created again.
    pub fn delete(&self) -> Output {
        Output::EntityDelete(self.node.clone())
    }

    pub fn key(&self) -> Result<Arc<str>> {
        self.node.key()
    }
}

impl<T, A> AsNode for EntityKey<T, A> {
    fn node(&self) -> NodeRef {
        self.node.clone()
    }
}

impl<T, A> Readable for EntityKey<T, A>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;
}

fn create<T: Send + Sync + 'static>(node: NodeRef, value: T) -> Output {
    Output::Entity(Write {
        node,
        value: Arc::new(value),
    })
}

struct EntityInstance<T, A> {
    def: Arc<EntityDef<T>>,
    arg: A,
    key: KeyCell,
}

impl<T, A> Instance for EntityInstance<T, A>
where
    T: Send + Sync + 'static,
    A: Serialize + Send + Sync + 'static,
{
    fn key(&self) -> Result<Arc<str>> {
        self.key.resolve(|| {
            let arg = encode_arg(&self.arg)?;
            Ok(canonical_key(NodeKind::Entity, self.def.id, &self.def.name, &arg))
        })
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Entity
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn owner(&self) -> &DomainRef {
        &self.def.owner
    }

    fn same(&self, previous: &Value, next: &Value) -> bool {
        same_as(&self.def.compare, previous, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Cell {
        row: u32,
        col: u32,
    }

    #[test]
    fn entities_start_unset() {
        let todo = EntityDecl::<String, u32>::new("Todo");
        let node = todo.key(7).node();
        assert_eq!(node.kind(), NodeKind::Entity);
        assert!(node.0.initial().is_none());
    }

    #[test]
    fn struct_arguments_key_canonically() {
        let sheet = EntityDecl::<f64, Cell>::new("Sheet");
        let key = sheet.key(Cell { row: 2, col: 1 }).key().unwrap();
        assert!(key.starts_with("Entity/"));
        assert!(key.ends_with(r#"/Sheet:{"col":1,"row":2}"#));
    }

    #[test]
    fn delete_targets_the_same_node() {
        let todo = EntityDecl::<String, u32>::new("Todo");
        let Output::EntityDelete(node) = todo.key(1).delete() else {
            panic!("expected a delete output");
        };
        assert_eq!(node.key().unwrap(), todo.key(1).key().unwrap());
    }
}
