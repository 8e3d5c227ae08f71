//! Message error types.

use thiserror::Error;

use crate::builder::FieldKind;

/// Errors that can occur when encoding, decoding or building messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// A message body could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The message does not implement the requested type.
    #[error("Message of type {actual} cannot be read as {expected}")]
    TypeMismatch { expected: String, actual: String },

    /// A structural message was given a field its schema does not declare.
    #[error("Unknown field '{field}' on message type {message_type}")]
    UnknownField { message_type: String, field: String },

    /// A structural message field was given a value of the wrong kind.
    #[error("Field '{field}' on message type {message_type} expects a {kind} value")]
    InvalidFieldValue {
        message_type: String,
        field: String,
        kind: FieldKind,
    },
}

/// Result type for message operations.
pub type Result<T> = std::result::Result<T, MessageError>;
