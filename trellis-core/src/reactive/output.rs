//! Dispatchable outputs.
//!
//! Everything that can be handed to `Store::dispatch` is an [`Output`]:
//! state writes, entity creates and deletes, event emissions and command
//! calls, or a batch of those. Commands return an `Output` as well, which is
//! how they fan out into further writes.

use std::fmt;
use std::sync::Arc;

use crate::domain::DomainRef;
use crate::error::Result;
use crate::graph::{Reader, Value};

use super::NodeRef;

pub(crate) type Payload = Box<dyn FnOnce(&mut Reader<'_>) -> Result<Value> + Send>;
pub(crate) type Run = Box<dyn FnOnce(&mut Reader<'_>) -> Result<Output> + Send>;

/// A value assignment.
pub struct Write {
    pub(crate) node: NodeRef,
    pub(crate) value: Value,
}

/// An event emission. The payload is produced at apply time so mapped
/// events can read the graph.
pub struct Emit {
    pub(crate) node: NodeRef,
    pub(crate) payload: Payload,
}

/// A command call bound to its argument.
pub struct Call {
    pub(crate) key: Arc<str>,
    pub(crate) owner: DomainRef,
    pub(crate) run: Run,
}

/// Something to dispatch.
#[derive(Default)]
pub enum Output {
    /// Nothing to do.
    #[default]
    None,
    State(Write),
    Entity(Write),
    EntityDelete(NodeRef),
    Event(Emit),
    Command(Call),
    /// Outputs applied in order within one dispatch.
    Batch(Vec<Output>),
}

impl Output {
    /// Combine outputs into one batch.
    pub fn batch(outputs: impl IntoIterator<Item = Output>) -> Self {
        outputs.into_iter().collect()
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Output::None)
    }
}

impl From<Vec<Output>> for Output {
    fn from(outputs: Vec<Output>) -> Self {
        Output::Batch(outputs)
    }
}

impl From<Option<Output>> for Output {
    fn from(output: Option<Output>) -> Self {
        output.unwrap_or_default()
    }
}

impl FromIterator<Output> for Output {
    fn from_iter<I: IntoIterator<Item = Output>>(iter: I) -> Self {
        Output::Batch(iter.into_iter().collect())
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::None => f.write_str("None"),
            Output::State(write) => f.debug_tuple("State").field(&write.node).finish(),
            Output::Entity(write) => f.debug_tuple("Entity").field(&write.node).finish(),
            Output::EntityDelete(node) => f.debug_tuple("EntityDelete").field(node).finish(),
            Output::Event(emit) => f.debug_tuple("Event").field(&emit.node).finish(),
            Output::Command(call) => f.debug_tuple("Command").field(&call.key).finish(),
            Output::Batch(outputs) => f.debug_list().entries(outputs).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::StateDecl;

    #[test]
    fn batches_collect_in_order() {
        let a = StateDecl::new("A", 0u32);
        let b = StateDecl::new("B", 0u32);
        let output = Output::batch([a.set(1), Output::None, b.set(2)]);
        let Output::Batch(items) = output else {
            panic!("expected a batch");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Output::State(_)));
        assert!(items[1].is_none());
    }

    #[test]
    fn debug_shows_keys() {
        let a = StateDecl::new("A", 0u32);
        let rendered = format!("{:?}", Output::from(vec![a.set(1)]));
        assert!(rendered.contains("State/"));
    }
}
