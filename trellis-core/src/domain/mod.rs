//! Domains
//!
//! A domain is an isolated namespace of declarations that is created, preloaded,
//! ignited and torn down as a unit.
//!
//! # Concepts
//!
//! ## Declaration Function
//!
//! A [`DomainDecl`] wraps a function that runs once per domain instance. It
//! receives a [`DomainContext`] and declares the domain's state, entities,
//! queries, events and commands, its preload steps and its effects. Whatever
//! the function returns is the domain's output, typically a struct of the
//! declarations it made, handed back by `Store::get_domain`.
//!
//! ## Ownership
//!
//! Every declaration made through a context is stamped with its domain.
//! Storages of those declarations live in the domain's namespace, and reading
//! one of them from anywhere brings the domain back to life if it was torn
//! down. Declarations built outside any domain belong to the implicit root
//! domain, which lives as long as the store.
//!
//! ## Composition
//!
//! A domain may fetch other domains from its context. The fetched domains
//! become its upstream: they are created (and preloaded, and ignited) first,
//! and they are not torn down while a downstream domain is alive.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::error::Result;
use crate::graph::{NodeKind, Value};
use crate::identity::{canonical_key, encode_arg, DeclId, KeyCell};

mod container;
mod context;
mod effect;
mod preload;

pub(crate) use container::{DomainContainer, DormantDomain};
pub use context::DomainContext;
pub(crate) use effect::EffectTicket;
pub use effect::{EffectContext, EffectStream};
pub use preload::{PreloadContext, PreloadedState};

/// Builds one domain instance.
pub(crate) trait DomainFactory: Send + Sync {
    fn key(&self) -> Result<Arc<str>>;

    fn name(&self) -> &str;

    fn build(&self, ctx: &mut DomainContext<'_>) -> Result<Value>;
}

/// Type-erased handle to a domain instance.
#[derive(Clone)]
pub(crate) struct DomainRef(Arc<dyn DomainFactory>);

impl DomainRef {
    /// The store-wide root domain.
    pub(crate) fn root() -> Self {
        static ROOT: OnceLock<DomainRef> = OnceLock::new();
        ROOT.get_or_init(|| DomainRef(Arc::new(RootDomain))).clone()
    }

    pub(crate) fn key(&self) -> Result<Arc<str>> {
        self.0.key()
    }

    pub(crate) fn name(&self) -> &str {
        self.0.name()
    }

    pub(crate) fn build(&self, ctx: &mut DomainContext<'_>) -> Result<Value> {
        self.0.build(ctx)
    }

    pub(crate) fn is_root(&self) -> bool {
        self.key().is_ok_and(|key| key == root_key())
    }
}

impl std::fmt::Debug for DomainRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.key() {
            Ok(key) => write!(f, "DomainRef({key})"),
            Err(_) => write!(f, "DomainRef({})", self.name()),
        }
    }
}

const ROOT_NAME: &str = "Root";

fn root_key() -> Arc<str> {
    static KEY: OnceLock<Arc<str>> = OnceLock::new();
    KEY.get_or_init(|| canonical_key(NodeKind::Domain, DeclId::ROOT, ROOT_NAME, ""))
        .clone()
}

struct RootDomain;

impl DomainFactory for RootDomain {
    fn key(&self) -> Result<Arc<str>> {
        Ok(root_key())
    }

    fn name(&self) -> &str {
        ROOT_NAME
    }

    fn build(&self, _ctx: &mut DomainContext<'_>) -> Result<Value> {
        Ok(Arc::new(()))
    }
}

type BuildFn<O, A> = dyn Fn(&mut DomainContext<'_>, &A) -> Result<O> + Send + Sync;

struct DomainDef<O, A> {
    id: DeclId,
    name: Arc<str>,
    build: Arc<BuildFn<O, A>>,
}

/// Declaration of a family of domains, one instance per argument.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone)]
/// struct Counter {
///     count: StateDecl<u32>,
///     increase: CommandDecl,
/// }
///
/// let counter = DomainDecl::new("Counter", |ctx, _: &()| {
///     let count = ctx.state("Count", 0u32);
///     let increase = {
///         let count = count.clone();
///         ctx.command("Increase", move |r, ()| Ok(count.set(r.get(&count)? + 1)))
///     };
///     Ok(Counter { count, increase })
/// });
///
/// let domain = store.get_domain(&counter.key(()))?;
/// store.dispatch(domain.increase.call(()))?;
/// ```
pub struct DomainDecl<O, A = ()> {
    def: Arc<DomainDef<O, A>>,
}

impl<O, A> Clone for DomainDecl<O, A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<O, A> DomainDecl<O, A>
where
    O: Clone + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
{
    /// Declare a domain with its declaration function.
    pub fn new<F>(name: impl Into<Arc<str>>, build: F) -> Self
    where
        F: Fn(&mut DomainContext<'_>, &A) -> Result<O> + Send + Sync + 'static,
    {
        Self {
            def: Arc::new(DomainDef {
                id: DeclId::new(),
                name: name.into(),
                build: Arc::new(build),
            }),
        }
    }

    /// The declaration's name.
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Address the domain instance for `arg`.
    pub fn key(&self, arg: A) -> DomainKey<O, A> {
        DomainKey {
            domain: DomainRef(Arc::new(DomainInstance {
                def: self.def.clone(),
                arg,
                key: KeyCell::default(),
            })),
            _marker: PhantomData,
        }
    }
}

/// A domain instance.
pub struct DomainKey<O, A = ()> {
    pub(crate) domain: DomainRef,
    _marker: PhantomData<fn() -> (O, A)>,
}

impl<O, A> Clone for DomainKey<O, A> {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            _marker: PhantomData,
        }
    }
}

impl<O, A> DomainKey<O, A> {
    /// The canonical key of this domain instance.
    pub fn key(&self) -> Result<Arc<str>> {
        self.domain.key()
    }
}

impl<O, A> std::fmt::Debug for DomainKey<O, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.domain.fmt(f)
    }
}

struct DomainInstance<O, A> {
    def: Arc<DomainDef<O, A>>,
    arg: A,
    key: KeyCell,
}

impl<O, A> DomainFactory for DomainInstance<O, A>
where
    O: Clone + Send + Sync + 'static,
    A: Serialize + Send + Sync + 'static,
{
    fn key(&self) -> Result<Arc<str>> {
        self.key.resolve(|| {
            let arg = encode_arg(&self.arg)?;
            Ok(canonical_key(
                NodeKind::Domain,
                self.def.id,
                &self.def.name,
                &arg,
            ))
        })
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn build(&self, ctx: &mut DomainContext<'_>) -> Result<Value> {
        let output = (self.def.build)(ctx, &self.arg)?;
        Ok(Arc::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_recognized() {
        let root = DomainRef::root();
        assert!(root.is_root());
        assert_eq!(&*root.key().unwrap(), "Domain/0/Root:");
    }

    #[test]
    fn equal_arguments_share_a_key() {
        let decl = DomainDecl::<(), String>::new("Board", |_, _| Ok(()));
        let a = decl.key("left".to_string());
        let b = decl.key("left".to_string());
        let c = decl.key("right".to_string());
        assert_eq!(a.key().unwrap(), b.key().unwrap());
        assert_ne!(a.key().unwrap(), c.key().unwrap());
        assert!(a.key().unwrap().starts_with("Domain/"));
        assert!(!a.domain.is_root());
    }

    #[test]
    fn user_domain_named_root_is_not_the_root() {
        let decl = DomainDecl::<(), ()>::new("Root", |_, _| Ok(()));
        assert!(!decl.key(()).domain.is_root());
    }
}
