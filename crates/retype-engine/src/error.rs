//! Error types for the migration engine.

use thiserror::Error;

use crate::RecordId;

/// Errors that can occur in migration operations.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The start request was rejected; no state was written.
    #[error("invalid job configuration: {0}")]
    Validation(#[from] ValidationError),

    /// The record store could not serve a request the step depends on.
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    /// The job document could not be loaded or saved.
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Reasons a start request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Source type was empty after key normalization.
    #[error("source type is empty")]
    EmptySourceType,

    /// Reclassification was requested without a destination type.
    #[error("destination type is required unless renaming attributes only")]
    MissingDestinationType,

    /// Source and destination normalize to the same type key.
    #[error("source and destination type are both '{0}'")]
    SameSourceAndDestination(String),

    /// Attributes-only mode with no usable rename rules.
    #[error("attributes-only mode needs at least one rename rule")]
    NoRenameRules,
}

/// Errors reported by a [`RecordStore`](crate::RecordStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store is unreachable or refused the request.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// The record does not exist.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// The destination type is not known to the store.
    #[error("unknown record type: {0}")]
    UnknownType(String),

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors reported by a [`StateStore`](crate::StateStore) implementation.
#[derive(Debug, Error)]
pub enum StateError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}
