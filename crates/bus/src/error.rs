//! Bus and dispatch error types.

use common::{Endpoint, MessageId, SagaId};
use messaging::MessageError;
use persistence::PersistenceError;
use saga::SagaError;
use thiserror::Error;

use crate::callback::CallbackId;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by bus facade operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport failed to deliver an envelope.
    #[error("Transport error on {endpoint}: {reason}")]
    Transport { endpoint: Endpoint, reason: String },

    /// A message was sent without a destination and no route matches it.
    #[error("No route configured for {0}")]
    NoRoute(String),

    /// `reply` was called outside of a dispatch.
    #[error("There is no message being handled to reply to")]
    NoMessageToReplyTo,

    /// The message being handled carries no reply-to endpoint.
    #[error("Message {0} carries no reply-to endpoint")]
    NoReplyAddress(MessageId),

    /// The callback was released before a reply or expiry arrived.
    #[error("Callback {0} was cancelled before completing")]
    CallbackCancelled(CallbackId),

    /// Message encoding or decoding error.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Timeout or saga data store error.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Convenience type alias for bus results.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised while dispatching one envelope.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A consumer raised an error; the cause is kept as the error source.
    #[error("{consumer} failed handling {message_type}")]
    ConsumerFailed {
        message_type: String,
        consumer: String,
        #[source]
        source: HandlerError,
    },

    /// A continuation message matched no saga instance.
    #[error("{message_type} does not correlate to any {saga_type} instance (expected: {})", describe(.instance_id))]
    CorrelationFault {
        message_type: String,
        saga_type: String,
        instance_id: Option<SagaId>,
    },

    /// Saga persistence or merge failure.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// Timeout store failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A saga action could not be carried out.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl DispatchError {
    /// Returns the consumer the error is attributed to, if any.
    pub fn consumer(&self) -> Option<&str> {
        match self {
            DispatchError::ConsumerFailed { consumer, .. } => Some(consumer),
            DispatchError::CorrelationFault { saga_type, .. } => Some(saga_type),
            _ => None,
        }
    }

    /// Returns true if retrying the same envelope cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DispatchError::CorrelationFault { .. })
    }

    /// Converts a saga failure.
    ///
    /// Correlation faults keep their own shape and persistence and merge
    /// faults pass through as-is. Anything the saga itself raised is
    /// attributed to `consumer` like a handler failure.
    pub(crate) fn from_saga(error: SagaError, consumer: &str, message_type: &str) -> Self {
        match error {
            SagaError::NotFound {
                message_type,
                saga_type,
                instance_id,
            } => DispatchError::CorrelationFault {
                message_type,
                saga_type,
                instance_id,
            },
            error @ (SagaError::Persistence(_)
            | SagaError::MergeFailed { .. }
            | SagaError::ConflictRetriesExhausted { .. }) => DispatchError::Saga(error),
            other => DispatchError::ConsumerFailed {
                message_type: message_type.to_string(),
                consumer: consumer.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Converts a failure carrying out a saga action. Timeout store faults
    /// pass through as-is.
    pub(crate) fn from_action(error: BusError, consumer: &str, message_type: &str) -> Self {
        match error {
            BusError::Persistence(error) => DispatchError::Persistence(error),
            other => DispatchError::ConsumerFailed {
                message_type: message_type.to_string(),
                consumer: consumer.to_string(),
                source: Box::new(other),
            },
        }
    }
}

fn describe(instance_id: &Option<SagaId>) -> String {
    instance_id.map_or_else(|| "none correlated".to_string(), |id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("card declined")]
    struct Declined;

    #[test]
    fn consumer_failure_keeps_cause_as_source() {
        let error = DispatchError::ConsumerFailed {
            message_type: "ChargeCard".to_string(),
            consumer: "PaymentHandler".to_string(),
            source: Box::new(Declined),
        };
        assert_eq!(error.to_string(), "PaymentHandler failed handling ChargeCard");
        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "card declined");
        assert_eq!(error.consumer(), Some("PaymentHandler"));
    }

    #[test]
    fn saga_not_found_becomes_correlation_fault() {
        let id = SagaId::new();
        let error = DispatchError::from_saga(
            SagaError::NotFound {
                message_type: "PreferredStatusExpired".to_string(),
                saga_type: "CustomerLoyalty".to_string(),
                instance_id: Some(id),
            },
            "CustomerLoyalty",
            "PreferredStatusExpired",
        );
        assert!(error.is_permanent());
        assert!(error.to_string().contains(&id.to_string()));
    }

    #[test]
    fn saga_raised_errors_are_attributed_to_the_saga() {
        let error = DispatchError::from_saga(
            SagaError::InvalidDefinition("x".to_string()),
            "CustomerLoyalty",
            "OrderAccepted",
        );
        assert!(matches!(
            &error,
            DispatchError::ConsumerFailed { message_type, .. } if message_type == "OrderAccepted"
        ));
        assert_eq!(error.consumer(), Some("CustomerLoyalty"));
        assert!(!error.is_permanent());
    }

    #[test]
    fn merge_faults_pass_through() {
        let error = DispatchError::from_saga(
            SagaError::MergeFailed {
                id: SagaId::new(),
                reason: "stale".to_string(),
            },
            "CustomerLoyalty",
            "OrderAccepted",
        );
        assert!(matches!(error, DispatchError::Saga(SagaError::MergeFailed { .. })));
    }

    #[test]
    fn failed_action_is_attributed_to_the_saga() {
        let error = DispatchError::from_action(
            BusError::NoRoute("Unrouted".to_string()),
            "CustomerLoyalty",
            "OrderAccepted",
        );
        assert_eq!(error.consumer(), Some("CustomerLoyalty"));
        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "No route configured for Unrouted");

        let error = DispatchError::from_action(
            BusError::Persistence(PersistenceError::DuplicateTimeout(persistence::TimeoutId::new())),
            "CustomerLoyalty",
            "OrderAccepted",
        );
        assert!(matches!(error, DispatchError::Persistence(_)));
    }
}
