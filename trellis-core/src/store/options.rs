//! Store configuration.

use std::fmt;
use std::sync::Arc;

use crate::domain::PreloadedState;
use crate::externs::ExternImpl;

use super::inspect::Inspector;

/// When notifications are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// Every dispatch is its own commit; subscribers are notified before
    /// `dispatch` returns.
    #[default]
    Immediate,
    /// Dispatches are batched. A flush is scheduled on the tokio runtime and
    /// runs once the current task yields; dispatches made before that share
    /// one commit.
    Deferred,
}

/// Options for [`Store::with_options`](super::Store::with_options).
#[derive(Clone, Default)]
pub struct StoreOptions {
    pub name: Option<String>,
    pub commit_mode: CommitMode,
    pub externs: Vec<ExternImpl>,
    /// Snapshot taken from another store with `get_preloaded_state`.
    pub preloaded_state: Option<PreloadedState>,
    pub inspectors: Vec<Arc<dyn Inspector>>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    /// Override an extern's default.
    pub fn with_extern(mut self, provided: ExternImpl) -> Self {
        self.externs.push(provided);
        self
    }

    pub fn with_preloaded_state(mut self, state: PreloadedState) -> Self {
        self.preloaded_state = Some(state);
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspectors.push(inspector);
        self
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("name", &self.name)
            .field("commit_mode", &self.commit_mode)
            .field("externs", &self.externs.len())
            .field("preloaded_state", &self.preloaded_state.as_ref().map(|s| s.len()))
            .field("inspectors", &self.inspectors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::externs::ExternDecl;

    #[test]
    fn builder_accumulates() {
        let retries = ExternDecl::new("Retries", 3u32);
        let options = StoreOptions::new()
            .with_name("test")
            .with_commit_mode(CommitMode::Deferred)
            .with_extern(retries.provide(1))
            .with_extern(retries.provide(2));

        assert_eq!(options.name.as_deref(), Some("test"));
        assert_eq!(options.commit_mode, CommitMode::Deferred);
        assert_eq!(options.externs.len(), 2);
        assert!(options.preloaded_state.is_none());
    }
}
