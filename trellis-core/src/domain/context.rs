//! Domain declaration context.
//!
//! The declaration function of a domain receives a [`DomainContext`]. Every
//! declaration made through it is owned by the domain under construction;
//! preload steps and effects are collected and handed to the domain's
//! container once the function returns.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::{Result, StoreError};
use crate::externs::ExternDecl;
use crate::graph::{downcast, Reader};
use crate::reactive::{
    eq_compare, CommandDecl, EntityDecl, EventDecl, Output, QueryDecl, StateDecl,
};
use crate::runtime::Runtime;

use super::effect::{EffectContext, EffectDescriptor, EffectStream};
use super::preload::{PreloadContext, PreloadDescriptor};
use super::{DomainKey, DomainRef};

/// Declaration context of one domain instance.
pub struct DomainContext<'a> {
    runtime: &'a mut Runtime,
    domain: DomainRef,
    key: Arc<str>,
    pub(crate) upstream: IndexMap<Arc<str>, DomainRef>,
    pub(crate) preloads: Vec<Arc<PreloadDescriptor>>,
    pub(crate) effects: Vec<Arc<EffectDescriptor>>,
}

impl<'a> DomainContext<'a> {
    pub(crate) fn new(runtime: &'a mut Runtime, domain: DomainRef, key: Arc<str>) -> Self {
        Self {
            runtime,
            domain,
            key,
            upstream: IndexMap::new(),
            preloads: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Canonical key of the domain being built.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Declare a state owned by this domain.
    pub fn state<T>(&mut self, name: impl Into<Arc<str>>, initial: T) -> StateDecl<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        StateDecl::owned_by(
            self.domain.clone(),
            name.into(),
            Arc::new(move |_: &()| initial.clone()),
            eq_compare(),
        )
    }

    /// Declare a state family owned by this domain.
    pub fn state_family<T, A, F>(
        &mut self,
        name: impl Into<Arc<str>>,
        default: F,
    ) -> StateDecl<T, A>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(&A) -> T + Send + Sync + 'static,
    {
        StateDecl::owned_by(self.domain.clone(), name.into(), Arc::new(default), eq_compare())
    }

    /// Declare an entity family owned by this domain.
    pub fn entity<T, A>(&mut self, name: impl Into<Arc<str>>) -> EntityDecl<T, A>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
    {
        EntityDecl::owned_by(self.domain.clone(), name.into(), eq_compare())
    }

    /// Declare a query owned by this domain.
    pub fn query<T, F>(&mut self, name: impl Into<Arc<str>>, eval: F) -> QueryDecl<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&mut Reader<'_>) -> Result<T> + Send + Sync + 'static,
    {
        QueryDecl::owned_by(
            self.domain.clone(),
            name.into(),
            Arc::new(move |r: &mut Reader<'_>, _: &()| eval(r)),
            eq_compare(),
        )
    }

    /// Declare a query family owned by this domain.
    pub fn query_family<T, A, F>(
        &mut self,
        name: impl Into<Arc<str>>,
        eval: F,
    ) -> QueryDecl<T, A>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        F: Fn(&mut Reader<'_>, &A) -> Result<T> + Send + Sync + 'static,
    {
        QueryDecl::owned_by(self.domain.clone(), name.into(), Arc::new(eval), eq_compare())
    }

    /// Declare a command owned by this domain.
    pub fn command<A, F>(&mut self, name: impl Into<Arc<str>>, run: F) -> CommandDecl<A>
    where
        A: Send + 'static,
        F: Fn(&mut Reader<'_>, A) -> Result<Output> + Send + Sync + 'static,
    {
        CommandDecl::owned_by(self.domain.clone(), name.into(), Arc::new(run))
    }

    /// Declare an event owned by this domain.
    pub fn event<T>(&mut self, name: impl Into<Arc<str>>) -> EventDecl<T>
    where
        T: Send + Sync + 'static,
    {
        EventDecl::owned_by(
            self.domain.clone(),
            name.into(),
            Arc::new(|_: &mut Reader<'_>, input: T| Ok(input)),
        )
    }

    /// Declare an event with a transform, owned by this domain.
    pub fn mapped_event<T, I, F>(
        &mut self,
        name: impl Into<Arc<str>>,
        transform: F,
    ) -> EventDecl<T, I>
    where
        T: Send + Sync + 'static,
        I: Send + 'static,
        F: Fn(&mut Reader<'_>, I) -> Result<T> + Send + Sync + 'static,
    {
        EventDecl::owned_by(self.domain.clone(), name.into(), Arc::new(transform))
    }

    /// Register an effect, started when the domain is ignited.
    ///
    /// The function runs once per ignition and returns a stream of outputs;
    /// each output is dispatched as it arrives.
    pub fn effect<F>(&mut self, name: impl Into<Arc<str>>, run: F)
    where
        F: Fn(&mut EffectContext) -> Result<EffectStream> + Send + Sync + 'static,
    {
        self.effects.push(Arc::new(EffectDescriptor {
            name: name.into(),
            run: Arc::new(run),
        }));
    }

    /// Register a preload step under a snapshot key.
    ///
    /// `read` fetches the data (asynchronously, outside the graph), `write`
    /// turns it into outputs. The data is recorded in the preloaded-state
    /// snapshot, so a store seeded with that snapshot replays `write` without
    /// running `read` again.
    pub fn preload<J, R, Fut, W>(&mut self, key: impl Into<String>, read: R, write: W)
    where
        J: Serialize + DeserializeOwned + Send + 'static,
        R: Fn(PreloadContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<J>> + Send + 'static,
        W: Fn(&mut Reader<'_>, J) -> Result<Output> + Send + Sync + 'static,
    {
        let read = Arc::new(read);
        let write = Arc::new(write);
        self.preloads.push(Arc::new(PreloadDescriptor {
            key: key.into(),
            owner: self.domain.clone(),
            read: Arc::new(move |ctx: PreloadContext| {
                let read = read.clone();
                async move {
                    let data = read(ctx).await?;
                    let json = serde_json::to_value(data)?;
                    Ok::<Json, StoreError>(json)
                }
                .boxed()
            }),
            write: Arc::new(move |reader: &mut Reader<'_>, data: Json| {
                let data: J = serde_json::from_value(data)?;
                write(reader, data)
            }),
        }));
    }

    /// Fetch another domain's output. The fetched domain becomes upstream of
    /// this one.
    pub fn get_domain<O, A>(&mut self, domain: &DomainKey<O, A>) -> Result<O>
    where
        O: Clone + 'static,
    {
        let key = self.runtime.get_or_create_domain(&domain.domain)?;
        self.upstream.insert(key.clone(), domain.domain.clone());
        let output = self.runtime.domain_output(&key)?;
        downcast(&output, || key.to_string())
    }

    /// Resolve an extern value.
    pub fn get_extern<T>(&mut self, decl: &ExternDecl<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.runtime.externs.resolve(decl)
    }
}
