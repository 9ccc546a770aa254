//! Domain Lifecycle
//!
//! Live domains are kept in the runtime by canonical key. A domain goes
//! through these stages:
//!
//! 1. **Created**: the declaration function ran, its upstream domains are
//!    linked, and any preload data present in the snapshot is written before
//!    anything reads the domain.
//! 2. **Preloaded** (optional): the preload steps ran once; the completion
//!    is shared by every caller.
//! 3. **Running**: effects were started by ignition. A domain cannot be
//!    ignited while its preload is in flight.
//! 4. **Dormant**: nothing referenced the domain any more, so its storages
//!    were discarded and its tasks aborted. The declarations are kept, so a
//!    later reference revives the domain under the same keys.
//!
//! A domain is collectable when it is not the root, nothing subscribed to it
//! directly, no live domain lists it upstream, no ignition is in progress,
//! and none of its nodes is observed from outside: no external subscriber,
//! and no query of another domain reading it.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::error::{Result, StoreError};
use crate::graph::{NodeId, Undo, Value};
use crate::runtime::Runtime;
use crate::store::LifecycleEvent;

use super::context::DomainContext;
use super::effect::{EffectDescriptor, EffectTicket};
use super::preload::PreloadDescriptor;
use super::DomainRef;

pub(crate) type PreloadCell = Arc<OnceCell<Result<()>>>;

/// A live domain.
pub(crate) struct DomainContainer {
    pub(crate) key: Arc<str>,
    pub(crate) domain: DomainRef,
    pub(crate) output: Value,
    pub(crate) namespace: IndexMap<Arc<str>, NodeId>,
    pub(crate) upstream: IndexMap<Arc<str>, DomainRef>,
    pub(crate) downstream: IndexSet<Arc<str>>,
    pub(crate) preloads: Vec<Arc<PreloadDescriptor>>,
    pub(crate) effects: Vec<Arc<EffectDescriptor>>,
    pub(crate) preload: PreloadCell,
    /// Direct references held through `Store::subscribe_domain`.
    pub(crate) refcount: usize,
    /// Preload steps of this domain are running.
    pub(crate) preloading: bool,
    pub(crate) running: bool,
    pub(crate) igniting: bool,
    pub(crate) tasks: Vec<JoinHandle<()>>,
    pub(crate) tickets: Vec<EffectTicket>,
}

/// What survives a teardown.
pub(crate) struct DormantDomain {
    output: Value,
    upstream: IndexMap<Arc<str>, DomainRef>,
    preloads: Vec<Arc<PreloadDescriptor>>,
    effects: Vec<Arc<EffectDescriptor>>,
    preload: PreloadCell,
}

/// Work handed out by [`Runtime::begin_ignition`].
pub(crate) struct IgnitionPlan {
    pub(crate) key: Arc<str>,
    pub(crate) upstream: Vec<DomainRef>,
    pub(crate) effects: Vec<Arc<EffectDescriptor>>,
}

/// Work handed out by [`Runtime::preload_plan`].
pub(crate) struct PreloadPlan {
    pub(crate) key: Arc<str>,
    pub(crate) upstream: Vec<DomainRef>,
    pub(crate) preloads: Vec<Arc<PreloadDescriptor>>,
}

impl DomainContainer {
    fn new(key: Arc<str>, domain: DomainRef, dormant: DormantDomain) -> Self {
        Self {
            key,
            domain,
            output: dormant.output,
            namespace: IndexMap::new(),
            upstream: dormant.upstream,
            downstream: IndexSet::new(),
            preloads: dormant.preloads,
            effects: dormant.effects,
            preload: dormant.preload,
            refcount: 0,
            preloading: false,
            running: false,
            igniting: false,
            tasks: Vec::new(),
            tickets: Vec::new(),
        }
    }

    fn into_dormant(self) -> DormantDomain {
        DormantDomain {
            output: self.output,
            upstream: self.upstream,
            preloads: self.preloads,
            effects: self.effects,
            preload: self.preload,
        }
    }
}

impl Runtime {
    /// Canonical key of a live domain, creating or reviving it first.
    pub(crate) fn get_or_create_domain(&mut self, domain: &DomainRef) -> Result<Arc<str>> {
        let key = domain.key()?;
        if self.domains.contains_key(&key) {
            return Ok(key);
        }
        if self.constructing.contains(&key) {
            return Err(StoreError::Cycle(key.to_string()));
        }

        let (dormant, revived) = match self.dormant.remove(&key) {
            Some(dormant) => (dormant, true),
            None => (self.construct(&key, domain)?, false),
        };

        for (up_key, up) in &dormant.upstream {
            if revived {
                self.get_or_create_domain(up)?;
            }
            if let Some(container) = self.domains.get_mut(up_key) {
                container.downstream.insert(key.clone());
            }
        }

        let container = DomainContainer::new(key.clone(), domain.clone(), dormant);
        self.domains.insert(key.clone(), container);
        self.journal.record(Undo::Domain { key: key.clone() });

        if revived {
            self.record(LifecycleEvent::DomainReused { key: key.clone() });
        } else {
            self.record(LifecycleEvent::DomainCreated { key: key.clone() });
        }
        self.hydrate(&key)?;
        Ok(key)
    }

    /// Run a domain's declaration function.
    fn construct(&mut self, key: &Arc<str>, domain: &DomainRef) -> Result<DormantDomain> {
        self.constructing.push(key.clone());
        let mut ctx = DomainContext::new(self, domain.clone(), key.clone());
        let built = domain.build(&mut ctx);
        let DomainContext {
            upstream,
            preloads,
            effects,
            ..
        } = ctx;
        self.constructing.pop();

        let released = |rt: &mut Runtime| {
            for up in upstream.keys() {
                rt.pending.domains.insert(up.clone());
            }
        };
        let output = match built {
            Ok(output) => output,
            Err(err) => {
                released(self);
                return Err(err);
            }
        };

        let mut seen = IndexSet::new();
        for preload in &preloads {
            if !seen.insert(preload.key.as_str()) {
                released(self);
                return Err(StoreError::DuplicatePreloadKey {
                    domain: key.to_string(),
                    key: preload.key.clone(),
                });
            }
        }

        tracing::debug!(
            domain = %key,
            upstream = upstream.len(),
            preloads = preloads.len(),
            effects = effects.len(),
            "constructed domain"
        );
        Ok(DormantDomain {
            output,
            upstream,
            preloads,
            effects,
            preload: PreloadCell::default(),
        })
    }

    /// Apply the write step of every preload whose data is in the snapshot.
    ///
    /// Runs as part of the operation that created or revived the domain, so
    /// the first read already sees the preloaded values.
    fn hydrate(&mut self, key: &str) -> Result<()> {
        let Some(container) = self.domains.get(key) else {
            return Ok(());
        };
        let writes: Vec<_> = container
            .preloads
            .iter()
            .filter_map(|preload| {
                let data = self.preloaded.get(&preload.key)?;
                Some((preload.key.clone(), preload.write(data.clone())))
            })
            .collect();
        for (preload, output) in writes {
            tracing::debug!(domain = %key, preload = %preload, "hydrating");
            self.apply(output)?;
        }
        Ok(())
    }

    pub(crate) fn domain_output(&self, key: &str) -> Result<Value> {
        self.domains
            .get(key)
            .map(|container| container.output.clone())
            .ok_or_else(|| StoreError::Detached(key.to_string()))
    }

    /// Domain collection predicate.
    pub(crate) fn domain_collectable(&self, key: &str) -> bool {
        let Some(container) = self.domains.get(key) else {
            return false;
        };
        if container.domain.is_root()
            || container.refcount > 0
            || container.igniting
            || !container.downstream.is_empty()
        {
            return false;
        }
        container.namespace.values().all(|id| {
            let Some(storage) = self.nodes.get(id) else {
                return true;
            };
            storage.external_refcount() == 0
                && storage.downstream.iter().all(|down| {
                    self.nodes
                        .get(down)
                        .map_or(true, |reader| reader.domain == storage.domain)
                })
        })
    }

    /// Discard a domain's storages and tasks, keeping its declarations.
    pub(crate) fn teardown_domain(&mut self, key: &Arc<str>) {
        let Some(mut container) = self.domains.shift_remove(key) else {
            return;
        };

        for task in container.tasks.drain(..) {
            task.abort();
        }
        for ticket in container.tickets.drain(..) {
            self.detach(&ticket.domain, &ticket.key, ticket.id);
        }

        let ids: Vec<NodeId> = container.namespace.values().copied().collect();
        for id in ids {
            self.clear_node(id);
        }

        for up in container.upstream.keys() {
            if let Some(upstream) = self.domains.get_mut(up) {
                upstream.downstream.shift_remove(key);
            }
            self.pending.domains.insert(up.clone());
        }

        tracing::debug!(domain = %key, nodes = container.namespace.len(), "tore down domain");
        self.record(LifecycleEvent::DomainDiscarded { key: key.clone() });
        container.running = false;
        self.dormant.insert(key.clone(), container.into_dormant());
    }

    /// Take a direct reference on a domain.
    pub(crate) fn retain_domain(&mut self, domain: &DomainRef) -> Result<Arc<str>> {
        let key = self.domain_key(domain)?;
        if let Some(container) = self.domains.get_mut(&key) {
            container.refcount += 1;
        }
        Ok(key)
    }

    /// Drop a direct reference on a domain and collect.
    pub(crate) fn release_domain(&mut self, key: &Arc<str>) {
        if let Some(container) = self.domains.get_mut(key) {
            container.refcount = container.refcount.saturating_sub(1);
            self.pending.domains.insert(key.clone());
        }
        self.collect();
    }

    /// Mark a domain as igniting and hand out its effects.
    ///
    /// Returns `None` when the domain is already running.
    pub(crate) fn begin_ignition(&mut self, domain: &DomainRef) -> Result<Option<IgnitionPlan>> {
        let key = self.domain_key(domain)?;
        let container = self
            .domains
            .get_mut(&key)
            .ok_or_else(|| StoreError::Detached(key.to_string()))?;
        if container.running {
            return Ok(None);
        }
        if container.igniting {
            return Err(StoreError::AlreadyIgniting(key.to_string()));
        }
        if container.preloading {
            return Err(StoreError::IgniteWhilePreloading(key.to_string()));
        }
        container.igniting = true;
        Ok(Some(IgnitionPlan {
            key: key.clone(),
            upstream: container.upstream.values().cloned().collect(),
            effects: container.effects.clone(),
        }))
    }

    /// Record the started effects and mark the domain running.
    pub(crate) fn finish_ignition(
        &mut self,
        key: &Arc<str>,
        tasks: Vec<JoinHandle<()>>,
        tickets: Vec<EffectTicket>,
    ) {
        match self.domains.get_mut(key) {
            Some(container) => {
                container.igniting = false;
                container.running = true;
                container.tasks.extend(tasks);
                container.tickets.extend(tickets);
                tracing::debug!(domain = %key, tasks = container.tasks.len(), "ignited");
            }
            None => {
                for task in tasks {
                    task.abort();
                }
                for ticket in tickets {
                    self.detach(&ticket.domain, &ticket.key, ticket.id);
                }
            }
        }
        self.collect();
    }

    /// Undo a failed ignition.
    pub(crate) fn abort_ignition(&mut self, key: &Arc<str>, tickets: Vec<EffectTicket>) {
        if let Some(container) = self.domains.get_mut(key) {
            container.igniting = false;
        }
        for ticket in tickets {
            self.detach(&ticket.domain, &ticket.key, ticket.id);
        }
        self.collect();
    }

    /// The shared preload completion of a domain.
    pub(crate) fn preload_cell(&mut self, domain: &DomainRef) -> Result<PreloadCell> {
        let key = self.domain_key(domain)?;
        let container = self
            .domains
            .get(&key)
            .ok_or_else(|| StoreError::Detached(key.to_string()))?;
        if container.running {
            return Err(StoreError::PreloadWhileRunning(key.to_string()));
        }
        Ok(container.preload.clone())
    }

    /// Upstream domains and the preload steps whose data is not yet in the
    /// snapshot. Marks the domain as preloading until
    /// [`Runtime::end_preload`].
    pub(crate) fn preload_plan(&mut self, domain: &DomainRef) -> Result<PreloadPlan> {
        let key = self.domain_key(domain)?;
        let container = self
            .domains
            .get_mut(&key)
            .ok_or_else(|| StoreError::Detached(key.to_string()))?;
        if container.running {
            return Err(StoreError::PreloadWhileRunning(key.to_string()));
        }
        container.preloading = true;
        let container = &self.domains[&key];
        Ok(PreloadPlan {
            key: key.clone(),
            upstream: container.upstream.values().cloned().collect(),
            preloads: container
                .preloads
                .iter()
                .filter(|preload| !self.preloaded.contains_key(&preload.key))
                .cloned()
                .collect(),
        })
    }

    pub(crate) fn end_preload(&mut self, key: &str) {
        if let Some(container) = self.domains.get_mut(key) {
            container.preloading = false;
        }
    }
}
