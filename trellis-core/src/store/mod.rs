//! Store Façade
//!
//! [`Store`] is the handle applications hold. It is cheap to clone and can be
//! shared across threads; every clone addresses the same engine.
//!
//! # Locking
//!
//! The whole engine sits behind one `parking_lot` mutex, the single write
//! section every graph mutation goes through. Each public operation takes the
//! lock once, does its work, and releases it before any user callback runs:
//!
//! 1. The operation runs against the runtime.
//! 2. The collector runs.
//! 3. In immediate mode, pending notifications are taken.
//! 4. The lock is released; lifecycle events go to the inspectors and the
//!    notifications to their subscribers.
//!
//! Subscriber callbacks may therefore call back into the store. Query,
//! command and event functions run under the lock and must not.
//!
//! # Effects
//!
//! Effect streams are driven by tasks spawned on the tokio runtime that was
//! current when the domain was ignited. Every output an effect yields is
//! dispatched in deferred mode, so bursts coalesce into one commit.

use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::domain::{
    DomainKey, DomainRef, EffectContext, EffectStream, EffectTicket, PreloadContext,
    PreloadedState,
};
use crate::error::{Result, StoreError};
use crate::externs::ExternDecl;
use crate::graph::{downcast, Callback, NodeKind, Reader, Value};
use crate::reactive::{AsNode, Derived, EventDecl, NodeRef, Output, Readable};
use crate::runtime::{Notification, Runtime};

mod inspect;
mod options;
mod scheduler;
mod subscription;

pub use inspect::{Inspector, LifecycleEvent};
pub use options::{CommitMode, StoreOptions};
pub use subscription::{DomainSubscription, SubscriberId, Subscription};

use scheduler::Scheduler;

const DEFAULT_NAME: &str = "store";

pub(crate) struct Inner {
    name: Arc<str>,
    commit_mode: CommitMode,
    inspectors: Vec<Arc<dyn Inspector>>,
    /// Snapshot the store was created with, restored by `discard`.
    seed: PreloadedState,
    runtime: Mutex<Runtime>,
    scheduler: Scheduler,
}

/// A reactive store.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateDecl::new("Count", 1u32);
/// let doubled = {
///     let count = count.clone();
///     QueryDecl::new("Doubled", move |r| Ok(r.get(&count)? * 2))
/// };
///
/// let store = Store::new();
/// let _sub = store.subscribe_query(&doubled, |n| println!("doubled: {n}"))?;
/// store.dispatch(count.set(5))?; // prints "doubled: 10"
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a store with default options.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub fn with_options(options: StoreOptions) -> Self {
        let runtime = Runtime::new(&options);
        let name: Arc<str> = Arc::from(options.name.as_deref().unwrap_or(DEFAULT_NAME));
        tracing::debug!(
            store = %name,
            mode = ?options.commit_mode,
            externs = options.externs.len(),
            preloaded = options.preloaded_state.as_ref().map_or(0, PreloadedState::len),
            "created store"
        );
        Self {
            inner: Arc::new(Inner {
                name,
                commit_mode: options.commit_mode,
                inspectors: options.inspectors,
                seed: options.preloaded_state.unwrap_or_default(),
                runtime: Mutex::new(runtime),
                scheduler: Scheduler::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.inner.commit_mode
    }

    /// Apply an output as one transaction.
    ///
    /// Either every write, emission and nested command of the output takes
    /// effect, or (when anything fails) none of them does and the error is
    /// returned.
    pub fn dispatch(&self, output: impl Into<Output>) -> Result<()> {
        self.dispatch_with(self.inner.commit_mode, output.into())
    }

    fn dispatch_with(&self, mode: CommitMode, output: Output) -> Result<()> {
        if output.is_none() {
            return Ok(());
        }
        self.locked(mode, |rt| rt.transact(|rt| rt.apply(output)))
    }

    /// Current value of a state, entity or query.
    ///
    /// A query nothing subscribes to is evaluated for this read and dropped
    /// again afterwards.
    pub fn get<K: Readable>(&self, key: &K) -> Result<K::Value> {
        self.locked(self.inner.commit_mode, |rt| {
            rt.transact(|rt| Reader::untracked(rt).get(key))
        })
    }

    /// Whether an entity currently holds a value.
    pub fn has<K: Readable>(&self, key: &K) -> Result<bool> {
        self.locked(self.inner.commit_mode, |rt| {
            rt.transact(|rt| Reader::untracked(rt).has(key))
        })
    }

    /// Subscribe to a query. The callback receives every committed value
    /// that differs from the previous committed one.
    pub fn subscribe_query<K, F>(&self, query: &K, callback: F) -> Result<Subscription>
    where
        K: Derived,
        F: Fn(&K::Value) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(move |value: &Value| {
            if let Some(value) = value.downcast_ref::<K::Value>() {
                callback(value);
            }
        });
        self.subscribe(&query.node(), callback)
    }

    /// Subscribe to an event. The callback receives every emitted payload.
    pub fn subscribe_event<T, I, F>(
        &self,
        event: &EventDecl<T, I>,
        callback: F,
    ) -> Result<Subscription>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(move |value: &Value| {
            if let Some(payload) = value.downcast_ref::<T>() {
                callback(payload);
            }
        });
        self.subscribe(&event.node(), callback)
    }

    fn subscribe(&self, node: &NodeRef, callback: Callback) -> Result<Subscription> {
        let id = SubscriberId::new();
        let (domain, key) = self.locked(self.inner.commit_mode, |rt| {
            rt.subscribe(node, id, callback, false)
        })?;
        Ok(Subscription::new(self, domain, key, id))
    }

    /// Output of a domain, creating the domain if needed.
    pub fn get_domain<O, A>(&self, domain: &DomainKey<O, A>) -> Result<O>
    where
        O: Clone + 'static,
    {
        self.locked(self.inner.commit_mode, |rt| {
            let key = rt.domain_key(&domain.domain)?;
            let output = rt.domain_output(&key)?;
            downcast(&output, || key.to_string())
        })
    }

    /// Hold a domain alive and ignite it.
    pub fn subscribe_domain<O, A>(
        &self,
        domain: &DomainKey<O, A>,
    ) -> Result<DomainSubscription> {
        let mode = self.inner.commit_mode;
        let key = self.locked(mode, |rt| rt.retain_domain(&domain.domain))?;
        let subscription = DomainSubscription::new(self, key);
        self.ignite_domain(&domain.domain)?;
        Ok(subscription)
    }

    /// Start a domain's effects, upstream domains first.
    ///
    /// Igniting a running domain does nothing. A domain whose preload is
    /// still in flight cannot be ignited.
    pub fn ignite<O, A>(&self, domain: &DomainKey<O, A>) -> Result<()> {
        self.ignite_domain(&domain.domain)
    }

    fn ignite_domain(&self, domain: &DomainRef) -> Result<()> {
        let mode = self.inner.commit_mode;
        let Some(plan) = self.locked(mode, |rt| rt.begin_ignition(domain))? else {
            return Ok(());
        };
        let key = plan.key.clone();
        let abort = |tickets: Vec<EffectTicket>| {
            self.release(|rt| rt.abort_ignition(&key, tickets));
        };

        for upstream in &plan.upstream {
            if let Err(err) = self.ignite_domain(upstream) {
                abort(Vec::new());
                return Err(err);
            }
        }

        let handle = match Handle::try_current() {
            Ok(handle) => Some(handle),
            Err(_) if plan.effects.is_empty() => None,
            Err(_) => {
                abort(Vec::new());
                return Err(StoreError::NoRuntime(key.to_string()));
            }
        };

        let mut ctx = EffectContext::new(self.clone(), key.clone());
        let mut streams = Vec::with_capacity(plan.effects.len());
        for effect in &plan.effects {
            match (effect.run)(&mut ctx) {
                Ok(stream) => streams.push((effect.name.clone(), stream)),
                Err(err) => {
                    tracing::error!(
                        domain = %key,
                        effect = %effect.name,
                        error = %err,
                        "effect failed to start"
                    );
                    abort(std::mem::take(&mut ctx.tickets));
                    return Err(err);
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = match handle {
            Some(handle) => streams
                .into_iter()
                .map(|(name, stream)| {
                    handle.spawn(drive(Arc::downgrade(&self.inner), key.clone(), name, stream))
                })
                .collect(),
            None => Vec::new(),
        };
        let tickets = std::mem::take(&mut ctx.tickets);
        tracing::debug!(domain = %key, effects = tasks.len(), "igniting");
        self.release(|rt| rt.finish_ignition(&key, tasks, tickets));
        Ok(())
    }

    /// Run the preload steps of a domain and its upstream domains.
    ///
    /// Concurrent and repeated calls share one completion. Steps whose data
    /// is already in the preloaded state are skipped. Until the preload
    /// completes, igniting the domain fails with
    /// [`StoreError::IgniteWhilePreloading`].
    pub fn preload<O, A>(&self, domain: &DomainKey<O, A>) -> BoxFuture<'static, Result<()>> {
        self.preload_domain(domain.domain.clone())
    }

    fn preload_domain(&self, domain: DomainRef) -> BoxFuture<'static, Result<()>> {
        let store = self.clone();
        async move {
            let cell = store.locked(store.inner.commit_mode, |rt| rt.preload_cell(&domain))?;
            cell.get_or_init(|| store.run_preload(domain.clone()))
                .await
                .clone()
        }
        .boxed()
    }

    async fn run_preload(&self, domain: DomainRef) -> Result<()> {
        let mode = self.inner.commit_mode;
        let plan = self.locked(mode, |rt| rt.preload_plan(&domain))?;
        let _preloading = PreloadGuard {
            store: self.clone(),
            key: plan.key.clone(),
        };

        for upstream in plan.upstream {
            match self.preload_domain(upstream).await {
                // Already running through another downstream domain.
                Err(StoreError::PreloadWhileRunning(_)) => {}
                other => other?,
            }
        }

        for preload in plan.preloads {
            tracing::debug!(domain = %plan.key, preload = %preload.key, "preloading");
            let data = preload.read(PreloadContext::new(self.clone())).await?;
            self.locked(mode, |rt| {
                rt.transact(|rt| rt.apply(preload.write(data.clone())))?;
                rt.preloaded.insert(preload.key.clone(), data);
                Ok(())
            })?;
        }
        tracing::debug!(domain = %plan.key, "preloaded");
        Ok(())
    }

    /// Snapshot of everything preloaded so far, including the data the store
    /// was created with.
    pub fn get_preloaded_state(&self) -> PreloadedState {
        self.inner.runtime.lock().preloaded.clone()
    }

    pub fn get_extern<T>(&self, decl: &ExternDecl<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.runtime.lock().externs.resolve(decl)
    }

    /// Whether the node currently has a storage.
    pub fn has_storage<K: AsNode>(&self, key: &K) -> bool {
        let node = key.node();
        let (Ok(domain), Ok(key)) = (node.owner().key(), node.key()) else {
            return false;
        };
        self.inner.runtime.lock().lookup(&domain, &key).is_some()
    }

    /// Whether the domain is live (not torn down).
    pub fn has_domain<O, A>(&self, domain: &DomainKey<O, A>) -> bool {
        match domain.key() {
            Ok(key) => self.inner.runtime.lock().domains.contains_key(&key),
            Err(_) => false,
        }
    }

    /// Deliver pending notifications now.
    pub fn flush(&self) {
        self.inner.scheduler.cancel();
        let (lifecycle, notifications) = {
            let mut rt = self.inner.runtime.lock();
            let notifications = rt.take_notifications();
            (rt.take_lifecycle(), notifications)
        };
        self.deliver(lifecycle, notifications);
    }

    /// Tear down every domain and storage, regardless of subscriptions.
    ///
    /// Outstanding subscription handles become inert. The store stays usable
    /// and starts over from the snapshot it was created with.
    pub fn discard(&self) {
        self.inner.scheduler.cancel();
        let (discarded, lifecycle) = {
            let mut rt = self.inner.runtime.lock();
            let discarded = rt.discard_all(self.inner.seed.clone());
            (discarded, rt.take_lifecycle())
        };
        drop(discarded);
        tracing::debug!(store = %self.inner.name, "discarded");
        self.deliver(lifecycle, Vec::new());
    }

    /// Attach an effect's subscriber. Returns the ticket to release it with
    /// and the current value for queries.
    pub(crate) fn attach(
        &self,
        node: &NodeRef,
        callback: Callback,
        effect_domain: &str,
    ) -> Result<(EffectTicket, Option<Value>)> {
        let id = SubscriberId::new();
        let internal = &*node.owner().key()? == effect_domain;
        self.locked(self.inner.commit_mode, |rt| {
            let (domain, key) = rt.subscribe(node, id, callback, internal)?;
            let current = match node.kind() {
                NodeKind::Query => rt.peek(node)?,
                _ => None,
            };
            Ok((EffectTicket { domain, key, id }, current))
        })
    }

    /// Run `f` under the lock, then deliver what it produced.
    fn locked<R>(&self, mode: CommitMode, f: impl FnOnce(&mut Runtime) -> Result<R>) -> Result<R> {
        let (result, lifecycle, notifications, pending) = {
            let mut rt = self.inner.runtime.lock();
            let result = f(&mut rt);
            rt.collect();
            let notifications = match mode {
                CommitMode::Immediate => rt.take_notifications(),
                CommitMode::Deferred => Vec::new(),
            };
            (result, rt.take_lifecycle(), notifications, rt.has_pending())
        };
        self.deliver(lifecycle, notifications);
        if pending && mode == CommitMode::Deferred {
            self.schedule_flush();
        }
        result
    }

    /// Run an infallible release under the lock.
    fn release(&self, f: impl FnOnce(&mut Runtime)) {
        let result = self.locked(self.inner.commit_mode, |rt| {
            f(rt);
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(store = %self.inner.name, error = %err, "release failed");
        }
    }

    fn deliver(&self, lifecycle: Vec<LifecycleEvent>, notifications: Vec<Notification>) {
        for event in &lifecycle {
            for inspector in &self.inner.inspectors {
                inspector.on_event(event);
            }
        }
        for notification in notifications {
            notification.deliver();
        }
    }

    fn schedule_flush(&self) {
        let generation = self.inner.scheduler.schedule();
        let Ok(handle) = Handle::try_current() else {
            tracing::trace!(store = %self.inner.name, "no runtime, flush waits for Store::flush");
            return;
        };
        let store = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::task::yield_now().await;
            let Some(inner) = store.upgrade() else {
                return;
            };
            if inner.scheduler.is_current(generation) {
                Store { inner }.flush();
            }
        });
    }
}

/// Clears a domain's preloading mark when its preload run ends, including
/// when the run fails or its future is dropped.
struct PreloadGuard {
    store: Store,
    key: Arc<str>,
}

impl Drop for PreloadGuard {
    fn drop(&mut self) {
        let key = self.key.clone();
        self.store.release(move |rt| rt.end_preload(&key));
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("commit_mode", &self.inner.commit_mode)
            .finish()
    }
}

/// Feed an effect's outputs back into the store until the stream ends, the
/// task is aborted or the store is dropped.
async fn drive(store: Weak<Inner>, domain: Arc<str>, effect: Arc<str>, mut stream: EffectStream) {
    while let Some(output) = stream.next().await {
        let Some(inner) = store.upgrade() else {
            break;
        };
        let store = Store { inner };
        if let Err(err) = store.dispatch_with(CommitMode::Deferred, output) {
            tracing::error!(
                domain = %domain,
                effect = %effect,
                error = %err,
                "effect output failed"
            );
        }
    }
    tracing::debug!(domain = %domain, effect = %effect, "effect finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::reactive::{CommandDecl, QueryDecl, StateDecl};

    fn counter() -> (StateDecl<u32>, QueryDecl<u32>) {
        let count = StateDecl::new("Count", 1u32);
        let doubled = {
            let count = count.clone();
            QueryDecl::new("Doubled", move |r| Ok(r.get(&count)? * 2))
        };
        (count, doubled)
    }

    #[test]
    fn immediate_dispatch_notifies_before_returning() {
        let store = Store::new();
        let (count, doubled) = counter();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            store
                .subscribe_query(&doubled, move |n| seen.lock().push(*n))
                .unwrap()
        };

        store.dispatch(count.set(5)).unwrap();
        assert_eq!(*seen.lock(), vec![10]);
        assert_eq!(store.get(&doubled).unwrap(), 10);
    }

    #[test]
    fn deferred_dispatch_waits_for_flush() {
        let options = StoreOptions::new().with_commit_mode(CommitMode::Deferred);
        let store = Store::with_options(options);
        let (count, doubled) = counter();
        let hits = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let hits = hits.clone();
            store
                .subscribe_query(&doubled, move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        store.dispatch(count.set(2)).unwrap();
        store.dispatch(count.set(3)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        store.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&doubled).unwrap(), 6);
    }

    #[test]
    fn callbacks_may_reenter_the_store() {
        let store = Store::new();
        let (count, doubled) = counter();
        let mirror = StateDecl::new("Mirror", 0u32);
        let _sub = {
            let inner = store.clone();
            let mirror = mirror.clone();
            store
                .subscribe_query(&doubled, move |n| {
                    inner.dispatch(mirror.set(*n)).unwrap();
                })
                .unwrap()
        };

        store.dispatch(count.set(4)).unwrap();
        assert_eq!(store.get(&mirror).unwrap(), 8);
    }

    #[test]
    fn unsubscribe_collects_the_query() {
        let store = Store::new();
        let (count, doubled) = counter();
        let sub = store.subscribe_query(&doubled, |_| {}).unwrap();
        assert!(store.has_storage(&doubled));

        sub.unsubscribe();
        assert!(!store.has_storage(&doubled));
        assert!(store.has_storage(&count));
    }

    #[test]
    fn discard_makes_handles_inert() {
        let store = Store::new();
        let (count, doubled) = counter();
        let sub = store.subscribe_query(&doubled, |_| {}).unwrap();
        store.dispatch(count.set(7)).unwrap();

        store.discard();
        assert!(!store.has_storage(&doubled));
        assert_eq!(store.get(&count).unwrap(), 1);
        drop(sub);
    }

    #[test]
    fn inspectors_see_lifecycle_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let inspector: Arc<dyn Inspector> = {
            let events = events.clone();
            Arc::new(move |event: &LifecycleEvent| events.lock().push(event.clone()))
        };
        let store = Store::with_options(StoreOptions::new().with_inspector(inspector));
        let (count, _) = counter();
        let bump = {
            let count = count.clone();
            CommandDecl::new("Bump", move |r, ()| Ok(count.set(r.get(&count)? + 1)))
        };

        store.dispatch(bump.call(())).unwrap();
        let events = events.lock();
        assert!(matches!(events[0], LifecycleEvent::DomainCreated { .. }));
        assert!(matches!(events[1], LifecycleEvent::CommandReceived { .. }));
        assert!(matches!(events[2], LifecycleEvent::NodeCreated { .. }));
    }
}
