use thiserror::Error;

use crate::{SagaId, SagaRecord, TimeoutId, Version};

/// Errors that can occur when interacting with the saga or timeout stores.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The persisted version of a saga instance differs from the version
    /// the working copy was read at.
    #[error(
        "Version conflict for saga instance {id}: expected version {expected}, found {}",
        .current.version
    )]
    VersionConflict {
        id: SagaId,
        expected: Version,
        current: Box<SagaRecord>,
    },

    /// The saga instance is not (or no longer) persisted.
    #[error("Saga instance not found: {0}")]
    InstanceNotFound(SagaId),

    /// A timeout with this id is already scheduled.
    #[error("Timeout already scheduled: {0}")]
    DuplicateTimeout(TimeoutId),

    /// The record failed validation before saving.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
