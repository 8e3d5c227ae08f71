//! Fault handling for unroutable and failed envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use common::Endpoint;
use messaging::Envelope;

use crate::error::DispatchError;
use crate::transport::Transport;
use crate::Result;

/// Receives envelopes the bus could not process.
#[async_trait]
pub trait FaultHandler: Send + Sync {
    /// Called when no consumer and no callback took the envelope.
    async fn no_consumer(&self, envelope: &Envelope) -> Result<()>;

    /// Called when dispatch failed permanently or retries ran out. The
    /// envelope carries its stage trace and captured errors.
    async fn dispatch_failed(&self, envelope: Envelope, error: &DispatchError) -> Result<()>;
}

/// Forwards faulted envelopes to the error endpoint for offline inspection.
pub struct ForwardToErrorEndpoint {
    transport: Arc<dyn Transport>,
    error_endpoint: Endpoint,
}

impl ForwardToErrorEndpoint {
    pub fn new(transport: Arc<dyn Transport>, error_endpoint: Endpoint) -> Self {
        Self {
            transport,
            error_endpoint,
        }
    }
}

#[async_trait]
impl FaultHandler for ForwardToErrorEndpoint {
    async fn no_consumer(&self, envelope: &Envelope) -> Result<()> {
        tracing::warn!(
            message_id = %envelope.id,
            message_type = %envelope.message.message_type(),
            error_endpoint = %self.error_endpoint,
            "No consumer for message"
        );
        self.transport
            .send(&self.error_endpoint, envelope.clone())
            .await
    }

    async fn dispatch_failed(&self, envelope: Envelope, error: &DispatchError) -> Result<()> {
        tracing::error!(
            message_id = %envelope.id,
            message_type = %envelope.message.message_type(),
            consumer = error.consumer().unwrap_or("bus"),
            retries = envelope.headers.retries,
            %error,
            "Dispatch failed, forwarding to error endpoint"
        );
        self.transport.send(&self.error_endpoint, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use messaging::TransportMessage;

    fn envelope() -> Envelope {
        Envelope::new(TransportMessage::from_parts(
            "Ping",
            Vec::new(),
            None,
            serde_json::json!({}),
        ))
    }

    #[tokio::test]
    async fn unroutable_envelope_goes_to_error_endpoint() {
        let transport = InMemoryTransport::new();
        let error_endpoint = Endpoint::new("memory://error");
        let handler = ForwardToErrorEndpoint::new(Arc::new(transport.clone()), error_endpoint.clone());

        handler.no_consumer(&envelope()).await.unwrap();

        assert_eq!(transport.drain(&error_endpoint).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_envelope_keeps_captured_errors() {
        let transport = InMemoryTransport::new();
        let error_endpoint = Endpoint::new("memory://error");
        let handler = ForwardToErrorEndpoint::new(Arc::new(transport.clone()), error_endpoint.clone());
        let error = DispatchError::CorrelationFault {
            message_type: "Ping".to_string(),
            saga_type: "PingSaga".to_string(),
            instance_id: None,
        };
        let mut failed = envelope();
        failed.capture_error(error.consumer(), &error);

        handler.dispatch_failed(failed, &error).await.unwrap();

        let forwarded = transport.drain(&error_endpoint).await;
        assert_eq!(forwarded[0].footer.errors.len(), 1);
        assert_eq!(forwarded[0].footer.errors[0].consumer.as_deref(), Some("PingSaga"));
    }
}
