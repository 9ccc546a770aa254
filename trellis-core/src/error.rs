//! Error types for the store engine.
//!
//! Every fallible operation in the crate returns [`Result`]. Usage errors
//! (misconfigured domains, reading an entity before it exists) and evaluation
//! errors (a derived query or command reporting failure) share one enum so
//! that a failure raised deep inside a propagation pass reaches the caller
//! of `dispatch` unchanged.

use thiserror::Error;

/// Errors that can occur while reading, dispatching or managing domains.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// `ignite` was re-entered while the domain was still starting its effects.
    #[error("domain `{0}` is already igniting")]
    AlreadyIgniting(String),

    /// Preload was requested for a domain whose effects are already running.
    #[error("domain `{0}` is running and can no longer be preloaded")]
    PreloadWhileRunning(String),

    /// Ignition was requested while the domain's preload was still running.
    #[error("domain `{0}` is still preloading and cannot be ignited yet")]
    IgniteWhilePreloading(String),

    /// Two preload descriptors of one domain share a key.
    #[error("duplicate preload key `{key}` in domain `{domain}`")]
    DuplicatePreloadKey {
        /// Canonical key of the offending domain.
        domain: String,
        /// The repeated preload key.
        key: String,
    },

    /// An entity was read before anything created it.
    #[error("entity `{0}` was read before it was created")]
    EntityNotCreated(String),

    /// A stored value did not have the type its declaration promised.
    #[error("value stored at `{0}` does not have the requested type")]
    TypeMismatch(String),

    /// A query (or domain) reached itself while being evaluated.
    #[error("`{0}` depends on itself")]
    Cycle(String),

    /// A query, command or event transform reported failure.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// A declaration argument could not be canonically encoded.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A node disappeared from its domain while it was still in use.
    #[error("node `{0}` is no longer attached to the store")]
    Detached(String),

    /// A domain with effects was ignited outside of a tokio runtime.
    #[error("effects of domain `{0}` need a tokio runtime to run")]
    NoRuntime(String),

    /// A preload payload or snapshot failed to (de)serialize.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl StoreError {
    /// Build an evaluation error from any displayable message.
    ///
    /// This is the error user code returns from query, command and event
    /// functions.
    pub fn evaluation(message: impl std::fmt::Display) -> Self {
        Self::Evaluation(message.to_string())
    }

    /// Whether this error signals a misuse of the store rather than a
    /// failing user function.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyIgniting(_)
                | Self::PreloadWhileRunning(_)
                | Self::IgniteWhilePreloading(_)
                | Self::DuplicatePreloadKey { .. }
                | Self::EntityNotCreated(_)
                | Self::Cycle(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

/// Result type alias for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_are_classified() {
        assert!(StoreError::EntityNotCreated("Entity/1/Todo:1".into()).is_usage_error());
        assert!(StoreError::DuplicatePreloadKey {
            domain: "Domain/2/Todos:".into(),
            key: "todos".into(),
        }
        .is_usage_error());
        assert!(!StoreError::evaluation("boom").is_usage_error());
    }

    #[test]
    fn evaluation_message_is_kept() {
        let err = StoreError::evaluation(format!("bad input {}", 3));
        assert_eq!(err.to_string(), "evaluation failed: bad input 3");
    }

    #[test]
    fn json_errors_become_snapshot_errors() {
        let err: StoreError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, StoreError::Snapshot(_)));
    }
}
