//! Undo Journal
//!
//! A dispatch either commits completely or leaves the graph exactly as the
//! last successful commit left it. While a transaction is open, every value
//! assignment, upstream replacement and storage creation pushes its inverse
//! here. On failure the runtime replays the entries in reverse.
//!
//! Collection never runs inside a transaction, so removals need no undo.
//! Domains created by a failed dispatch are handed to the collector instead
//! of being removed directly.

use std::sync::Arc;

use indexmap::IndexSet;

use crate::runtime::Runtime;

use super::{NodeId, Value};

/// Inverse of one graph mutation.
pub(crate) enum Undo {
    /// Restore the previous value of a node.
    Value { id: NodeId, previous: Option<Value> },

    /// Restore the previous upstream set of a query, and the matching
    /// downstream entries.
    Upstream { id: NodeId, previous: IndexSet<NodeId> },

    /// Remove a storage created inside the transaction.
    Created { id: NodeId },

    /// Re-check a domain created inside the transaction for collection.
    Domain { key: Arc<str> },
}

/// Transaction-scoped undo log.
#[derive(Default)]
pub(crate) struct Journal {
    depth: usize,
    entries: Vec<Undo>,
}

impl Journal {
    /// Open a (possibly nested) transaction.
    pub(crate) fn begin(&mut self) {
        self.depth += 1;
    }

    /// Close a transaction. Returns the recorded entries once the outermost
    /// transaction closes.
    pub(crate) fn finish(&mut self) -> Vec<Undo> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            std::mem::take(&mut self.entries)
        } else {
            Vec::new()
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Record an inverse operation. Outside a transaction this is a no-op.
    pub(crate) fn record(&mut self, undo: Undo) {
        if self.is_active() {
            self.entries.push(undo);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Runtime {
    /// Replay journal entries in reverse order.
    pub(crate) fn rollback(&mut self, entries: Vec<Undo>) {
        for undo in entries.into_iter().rev() {
            match undo {
                Undo::Value { id, previous } => {
                    if let Some(storage) = self.nodes.get_mut(&id) {
                        storage.value = previous;
                    }
                }
                Undo::Upstream { id, previous } => self.restore_upstream(id, previous),
                Undo::Created { id } => self.remove_created(id),
                Undo::Domain { key } => {
                    self.pending.domains.insert(key);
                }
            }
        }
    }

    fn restore_upstream(&mut self, id: NodeId, previous: IndexSet<NodeId>) {
        let Some(storage) = self.nodes.get_mut(&id) else {
            return;
        };
        let current = std::mem::replace(&mut storage.upstream, previous.clone());
        for up in current.difference(&previous) {
            if let Some(node) = self.nodes.get_mut(up) {
                node.downstream.shift_remove(&id);
            }
        }
        for up in previous.difference(&current) {
            if let Some(node) = self.nodes.get_mut(up) {
                node.downstream.insert(id);
            }
        }
    }

    fn remove_created(&mut self, id: NodeId) {
        let Some(storage) = self.nodes.remove(&id) else {
            return;
        };
        for up in &storage.upstream {
            if let Some(node) = self.nodes.get_mut(up) {
                node.downstream.shift_remove(&id);
            }
        }
        if let Some(domain) = self.domains.get_mut(&storage.domain) {
            if domain.namespace.get(&storage.key) == Some(&id) {
                domain.namespace.shift_remove(&storage.key);
            }
        }
        tracing::trace!(key = %storage.key, "rolled back node creation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_inside_transaction() {
        let mut journal = Journal::default();
        journal.record(Undo::Created { id: NodeId::new() });
        assert_eq!(journal.len(), 0);

        journal.begin();
        journal.record(Undo::Created { id: NodeId::new() });
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.finish().len(), 1);
        assert!(!journal.is_active());
    }

    #[test]
    fn nested_transactions_flush_at_outermost() {
        let mut journal = Journal::default();
        journal.begin();
        journal.begin();
        journal.record(Undo::Value {
            id: NodeId::new(),
            previous: None,
        });
        assert!(journal.finish().is_empty());
        assert!(journal.is_active());
        assert_eq!(journal.finish().len(), 1);
    }
}
