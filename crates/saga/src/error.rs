//! Saga error types.

use common::SagaId;
use messaging::MessageError;
use persistence::PersistenceError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A continuation message arrived for an instance that does not exist.
    #[error(
        "No {saga_type} instance for {message_type} (expected instance: {})",
        expected_instance(.instance_id)
    )]
    NotFound {
        message_type: String,
        saga_type: String,
        instance_id: Option<SagaId>,
    },

    /// The conflict merger refused to reconcile two versions.
    #[error("Cannot merge concurrent updates of saga instance {id}: {reason}")]
    MergeFailed { id: SagaId, reason: String },

    /// Saving kept conflicting after repeated merges.
    #[error("Saga instance {id} still conflicting after {attempts} merge attempts")]
    ConflictRetriesExhausted { id: SagaId, attempts: u32 },

    /// The saga definition is not usable.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// Message encoding or decoding error.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Saga data store error.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn expected_instance(id: &Option<SagaId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "none correlated".to_string(),
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_expected_instance() {
        let id = SagaId::new();
        let error = SagaError::NotFound {
            message_type: "PreferredStatusExpired".to_string(),
            saga_type: "CustomerLoyalty".to_string(),
            instance_id: Some(id),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("CustomerLoyalty"));
        assert!(rendered.contains("PreferredStatusExpired"));
        assert!(rendered.contains(&id.to_string()));
    }

    #[test]
    fn not_found_without_correlated_instance() {
        let error = SagaError::NotFound {
            message_type: "M".to_string(),
            saga_type: "S".to_string(),
            instance_id: None,
        };
        assert!(error.to_string().contains("none correlated"));
    }
}
