//! Effect Implementation
//!
//! An effect is a long-running side computation attached to a domain. It is
//! the only way a domain reacts to the outside world on its own.
//!
//! # How Effects Work
//!
//! 1. When the domain is ignited, each effect function runs once with an
//!    [`EffectContext`] and returns a stream of outputs.
//!
//! 2. The context turns graph notifications into streams: `from_event`
//!    yields every emitted payload, `from_query` yields the current value
//!    and then every committed change.
//!
//! 3. The returned stream is driven on the tokio runtime. Each output it
//!    yields is dispatched exactly as if it came from outside, followed by a
//!    deferred commit.
//!
//! 4. When the domain is torn down the task is aborted and the
//!    subscriptions the effect held are released.
//!
//! # Ownership
//!
//! Subscriptions an effect holds on nodes of its own domain do not keep the
//! domain alive; subscriptions on other domains do.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::graph::{Callback, Value};
use crate::reactive::{AsNode, Derived, EventDecl, NodeRef, Output};
use crate::store::{Store, SubscriberId};

/// Stream of outputs produced by an effect.
pub type EffectStream = BoxStream<'static, Output>;

type RunFn = dyn Fn(&mut EffectContext) -> Result<EffectStream> + Send + Sync;

/// One registered effect.
pub(crate) struct EffectDescriptor {
    pub(crate) name: Arc<str>,
    pub(crate) run: Arc<RunFn>,
}

/// A subscription held by a running effect.
#[derive(Debug, Clone)]
pub(crate) struct EffectTicket {
    pub(crate) domain: Arc<str>,
    pub(crate) key: Arc<str>,
    pub(crate) id: SubscriberId,
}

/// What an effect function can do while it sets itself up.
pub struct EffectContext {
    store: Store,
    domain: Arc<str>,
    pub(crate) tickets: Vec<EffectTicket>,
}

impl EffectContext {
    pub(crate) fn new(store: Store, domain: Arc<str>) -> Self {
        Self {
            store,
            domain,
            tickets: Vec::new(),
        }
    }

    /// The store the effect runs in.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Canonical key of the domain the effect belongs to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Stream every payload of an event, starting with the next emission.
    pub fn from_event<T, I>(
        &mut self,
        event: &EventDecl<T, I>,
    ) -> Result<BoxStream<'static, T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<T>();
        self.watch(&event.node(), forward(tx))?;
        Ok(receive(rx).boxed())
    }

    /// Stream the current value of a query, then every committed change.
    pub fn from_query<K>(&mut self, query: &K) -> Result<BoxStream<'static, K::Value>>
    where
        K: Derived,
    {
        let (tx, rx) = mpsc::unbounded_channel::<K::Value>();
        let current = self.watch(&query.node(), forward(tx))?;
        let first = current
            .as_ref()
            .and_then(|value| value.downcast_ref::<K::Value>())
            .cloned();
        Ok(stream::iter(first).chain(receive(rx)).boxed())
    }

    fn watch(&mut self, node: &NodeRef, callback: Callback) -> Result<Option<Value>> {
        let (ticket, current) = self.store.attach(node, callback, &self.domain)?;
        self.tickets.push(ticket);
        Ok(current)
    }
}

fn forward<T>(tx: mpsc::UnboundedSender<T>) -> Callback
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(move |value: &Value| {
        if let Some(value) = value.downcast_ref::<T>() {
            // A closed receiver means the effect ended; nothing to deliver.
            let _ = tx.send(value.clone());
        }
    })
}

fn receive<T: Send + 'static>(mut rx: mpsc::UnboundedReceiver<T>) -> impl Stream<Item = T> {
    stream::poll_fn(move |cx| rx.poll_recv(cx))
}

impl std::fmt::Debug for EffectDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwarded_values_arrive_in_order() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let callback = forward(tx);
        for n in [1u32, 2, 3] {
            callback(&(Arc::new(n) as Value));
        }
        callback(&(Arc::new("ignored") as Value));
        drop(callback);

        let received: Vec<u32> = receive(rx).collect().await;
        assert_eq!(received, vec![1, 2, 3]);
    }
}
