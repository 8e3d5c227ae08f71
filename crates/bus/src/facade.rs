//! The bus facade handlers and sagas talk to.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::Endpoint;
use messaging::{Message, MessageBuilder, MessageSchema, TransportMessage};
use persistence::TimeoutId;
use serde::{Deserialize, Serialize};

use crate::callback::Callback;
use crate::collaborators::Collaborators;
use crate::Result;

/// Addresses a bus instance knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// The endpoint this bus instance reads from.
    pub local: Endpoint,

    /// Where failed and unroutable envelopes are forwarded.
    pub error: Endpoint,

    /// Optional audit endpoint.
    pub log: Option<Endpoint>,
}

/// A timeout scheduled through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimeout {
    /// Id usable with [`Bus::cancel_timeout`].
    pub id: TimeoutId,

    /// When the message will be delivered.
    pub at: DateTime<Utc>,
}

/// Object-safe bus operations.
///
/// Handlers receive a `&dyn Bus` for the duration of one dispatch. Typed
/// convenience methods live in [`BusExt`].
#[async_trait]
pub trait Bus: Send + Sync {
    /// Returns the local, error and log endpoints.
    fn endpoints(&self) -> &Endpoints;

    /// Returns the registered collaborators.
    fn collaborators(&self) -> &Collaborators;

    /// Publishes a message to every subscribed endpoint.
    async fn publish_message(&self, message: TransportMessage) -> Result<()>;

    /// Sends a message to `destination`, or to its routed endpoint when
    /// `None`. The returned [`Callback`] correlates the reply.
    async fn send_message(
        &self,
        destination: Option<Endpoint>,
        message: TransportMessage,
    ) -> Result<Callback>;

    /// Replies to the sender of the message being handled.
    async fn reply_message(&self, message: TransportMessage) -> Result<()>;

    /// Schedules a message for delivery to the local endpoint after `delay`.
    async fn schedule_message(
        &self,
        delay: Duration,
        message: TransportMessage,
    ) -> Result<ScheduledTimeout>;

    /// Cancels a scheduled timeout. Returns false if it already fired.
    async fn cancel_timeout(&self, id: TimeoutId) -> Result<bool>;
}

/// Typed convenience methods over [`Bus`].
#[async_trait]
pub trait BusExt: Bus {
    /// Publishes a typed message.
    async fn publish<M: Message>(&self, message: &M) -> Result<()> {
        self.publish_message(TransportMessage::from_message(message)?)
            .await
    }

    /// Publishes a message built from its default value.
    async fn publish_with<M, F>(&self, build: F) -> Result<()>
    where
        M: Message + Default,
        F: FnOnce(&mut M) + Send,
    {
        let mut message = M::default();
        build(&mut message);
        self.publish(&message).await
    }

    /// Sends a typed message to its routed endpoint.
    async fn send<M: Message>(&self, message: &M) -> Result<Callback> {
        self.send_message(None, TransportMessage::from_message(message)?)
            .await
    }

    /// Sends a typed message to an explicit endpoint.
    async fn send_to<M: Message>(&self, endpoint: Endpoint, message: &M) -> Result<Callback> {
        self.send_message(Some(endpoint), TransportMessage::from_message(message)?)
            .await
    }

    /// Replies with a typed message.
    async fn reply<M: Message>(&self, message: &M) -> Result<()> {
        self.reply_message(TransportMessage::from_message(message)?)
            .await
    }

    /// Delivers a typed message back to the local endpoint after `delay`.
    async fn defer<M: Message>(&self, delay: Duration, message: &M) -> Result<ScheduledTimeout> {
        self.schedule_message(delay, TransportMessage::from_message(message)?)
            .await
    }

    /// Requests a timeout message; cancel it with [`Bus::cancel_timeout`].
    async fn request_timeout<M: Message>(
        &self,
        delay: Duration,
        message: &M,
    ) -> Result<ScheduledTimeout> {
        self.defer(delay, message).await
    }

    /// Starts a contract-shaped message with default field values.
    fn create_message<'a>(&self, schema: &'a MessageSchema) -> MessageBuilder<'a> {
        schema.builder()
    }

    /// Returns the first collaborator of type `T`.
    fn find<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.collaborators().find::<T>()
    }

    /// Returns every collaborator of type `T`, in registration order.
    fn find_all<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.collaborators().find_all::<T>()
    }
}

// Blanket implementation for all Bus implementations
impl<B: Bus + ?Sized> BusExt for B {}
