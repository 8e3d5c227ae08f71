use chrono::{DateTime, Utc};
use common::{Endpoint, MessageId};
use serde::{Deserialize, Serialize};

use crate::TransportMessage;

/// One processing step recorded in an envelope's header.
///
/// Stages are appended before each consumer invocation so that a failed
/// envelope shows exactly how far dispatch got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// The consumer about to be invoked.
    pub consumer: String,

    /// The message types the consumer was resolved through.
    pub message_types: Vec<String>,

    /// When the stage was entered.
    pub recorded_at: DateTime<Utc>,
}

/// Envelope header metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers {
    /// Endpoint replies should be sent to.
    pub reply_to: Option<Endpoint>,

    /// Endpoint the envelope was addressed to.
    pub destination: Option<Endpoint>,

    /// Endpoint currently processing the envelope.
    pub local_endpoint: Option<Endpoint>,

    /// Id of the request this envelope answers.
    pub in_reply_to: Option<MessageId>,

    /// Number of failed delivery attempts so far.
    pub retries: u32,

    /// When the envelope was created.
    pub sent_at: Option<DateTime<Utc>>,

    /// Processing-stage trace.
    pub stages: Vec<Stage>,
}

/// An error captured while processing an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedError {
    /// The consumer that raised it, if known.
    pub consumer: Option<String>,

    /// Rendered error chain.
    pub message: String,

    /// When it was captured.
    pub recorded_at: DateTime<Utc>,
}

/// Envelope footer metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Footer {
    /// Errors captured across delivery attempts, oldest first.
    pub errors: Vec<CapturedError>,
}

/// A message together with its header and footer.
///
/// Owned by the dispatch pipeline for the duration of one delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id of this transmission.
    pub id: MessageId,

    /// The transported message.
    pub message: TransportMessage,

    /// Header metadata.
    pub headers: Headers,

    /// Footer metadata.
    pub footer: Footer,
}

impl Envelope {
    /// Wraps a message in a fresh envelope.
    pub fn new(message: TransportMessage) -> Self {
        Self {
            id: MessageId::new(),
            message,
            headers: Headers {
                sent_at: Some(Utc::now()),
                ..Headers::default()
            },
            footer: Footer::default(),
        }
    }

    /// Sets the reply-to endpoint.
    pub fn with_reply_to(mut self, endpoint: Endpoint) -> Self {
        self.headers.reply_to = Some(endpoint);
        self
    }

    /// Sets the destination endpoint.
    pub fn with_destination(mut self, endpoint: Endpoint) -> Self {
        self.headers.destination = Some(endpoint);
        self
    }

    /// Marks the envelope as a reply to the given request.
    pub fn in_reply_to(mut self, request: MessageId) -> Self {
        self.headers.in_reply_to = Some(request);
        self
    }

    /// Appends a stage marker to the header trace.
    pub fn record_stage(&mut self, consumer: impl Into<String>, message_types: Vec<String>) {
        self.headers.stages.push(Stage {
            consumer: consumer.into(),
            message_types,
            recorded_at: Utc::now(),
        });
    }

    /// Returns the most recently recorded stage.
    pub fn current_stage(&self) -> Option<&Stage> {
        self.headers.stages.last()
    }

    /// Captures an error, with its source chain, into the footer.
    pub fn capture_error(&mut self, consumer: Option<&str>, error: &dyn std::error::Error) {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        self.footer.errors.push(CapturedError {
            consumer: consumer.map(str::to_string),
            message,
            recorded_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TransportMessage {
        TransportMessage::from_parts("Ping", Vec::new(), None, serde_json::json!({"n": 1}))
    }

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn new_envelope_has_fresh_id_and_empty_trace() {
        let a = Envelope::new(message());
        let b = Envelope::new(message());
        assert_ne!(a.id, b.id);
        assert!(a.headers.stages.is_empty());
        assert!(a.footer.errors.is_empty());
        assert!(a.headers.sent_at.is_some());
    }

    #[test]
    fn stages_are_recorded_in_order() {
        let mut envelope = Envelope::new(message());
        envelope.record_stage("A", vec!["Ping".to_string()]);
        envelope.record_stage("B", vec!["Ping".to_string()]);

        assert_eq!(envelope.headers.stages.len(), 2);
        assert_eq!(envelope.current_stage().unwrap().consumer, "B");
    }

    #[test]
    fn captured_error_includes_source_chain() {
        let mut envelope = Envelope::new(message());
        envelope.capture_error(Some("A"), &Outer(Inner));

        let captured = &envelope.footer.errors[0];
        assert_eq!(captured.consumer.as_deref(), Some("A"));
        assert_eq!(captured.message, "outer: inner");
    }

    #[test]
    fn addressing_builders() {
        let request = MessageId::new();
        let envelope = Envelope::new(message())
            .with_reply_to(Endpoint::new("memory://a"))
            .with_destination(Endpoint::new("memory://b"))
            .in_reply_to(request);

        assert_eq!(envelope.headers.reply_to, Some(Endpoint::new("memory://a")));
        assert_eq!(envelope.headers.destination, Some(Endpoint::new("memory://b")));
        assert_eq!(envelope.headers.in_reply_to, Some(request));
    }
}
