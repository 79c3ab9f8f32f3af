//! Error types for the aggregation engine.

use thiserror::Error;

/// Main error type for engine operations.
///
/// Only [`EngineError::ProfileResolution`] is meant to reach an end user;
/// every other variant is contained where it happens and logged.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// A live query could not be established.
    #[error("Source unavailable for {descriptor}: {reason}")]
    SourceUnavailable { descriptor: String, reason: String },

    /// A single delivery could not be applied; last-known state is kept.
    #[error("Transient delivery error on {collection}: {reason}")]
    TransientDelivery { collection: String, reason: String },

    /// The one-shot profile lookup for the session failed.
    #[error("Profile resolution failed: {0}")]
    ProfileResolution(String),

    /// A disposer failed during cleanup.
    #[error("Teardown error for {descriptor}: {reason}")]
    Teardown { descriptor: String, reason: String },

    #[error("Initialization already in flight")]
    AlreadyInitializing,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl EngineError {
    pub(crate) fn transient(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::TransientDelivery {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    /// True for the errors a consumer should render as a visible error state.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, EngineError::ProfileResolution(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
