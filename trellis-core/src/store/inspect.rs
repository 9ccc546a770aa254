//! Lifecycle inspection hooks.
//!
//! Tooling can observe what the engine does by registering an [`Inspector`].
//! Events are buffered while the store lock is held and handed to every
//! inspector, in order, once it is released.

use std::fmt;
use std::sync::Arc;

use crate::graph::NodeKind;

/// Something that happened inside a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    NodeCreated { key: Arc<str>, kind: NodeKind },
    NodeUpdated { key: Arc<str> },
    NodeDiscarded { key: Arc<str> },
    DomainCreated { key: Arc<str> },
    /// A torn-down domain was brought back under its old key.
    DomainReused { key: Arc<str> },
    DomainDiscarded { key: Arc<str> },
    CommandReceived { key: Arc<str> },
    EventEmitted { key: Arc<str> },
}

impl LifecycleEvent {
    /// Key of the node or domain the event is about.
    pub fn key(&self) -> &str {
        match self {
            Self::NodeCreated { key, .. }
            | Self::NodeUpdated { key }
            | Self::NodeDiscarded { key }
            | Self::DomainCreated { key }
            | Self::DomainReused { key }
            | Self::DomainDiscarded { key }
            | Self::CommandReceived { key }
            | Self::EventEmitted { key } => key,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeCreated { key, kind } => write!(f, "created {kind} {key}"),
            Self::NodeUpdated { key } => write!(f, "updated {key}"),
            Self::NodeDiscarded { key } => write!(f, "discarded {key}"),
            Self::DomainCreated { key } => write!(f, "created domain {key}"),
            Self::DomainReused { key } => write!(f, "reused domain {key}"),
            Self::DomainDiscarded { key } => write!(f, "discarded domain {key}"),
            Self::CommandReceived { key } => write!(f, "received {key}"),
            Self::EventEmitted { key } => write!(f, "emitted {key}"),
        }
    }
}

/// Observer of lifecycle events.
///
/// Inspectors run outside the store lock and may call back into the store.
pub trait Inspector: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> Inspector for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_display_their_key() {
        let event = LifecycleEvent::NodeCreated {
            key: Arc::from("Query/4/Total:"),
            kind: NodeKind::Query,
        };
        assert_eq!(event.key(), "Query/4/Total:");
        assert_eq!(event.to_string(), "created Query Query/4/Total:");
    }

    #[test]
    fn closures_are_inspectors() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let inspector = |event: &LifecycleEvent| seen.lock().push(event.key().to_string());
        inspector.on_event(&LifecycleEvent::DomainCreated {
            key: Arc::from("Domain/0/Root:"),
        });
        assert_eq!(seen.lock().as_slice(), ["Domain/0/Root:"]);
    }
}
