//! The bus composition root.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use common::{Endpoint, MessageId};
use messaging::{Envelope, Message, TransportMessage};
use persistence::{
    InMemorySagaStore, InMemoryTimeoutStore, SagaStore, TimeoutEntry, TimeoutId, TimeoutStore,
};
use saga::{SagaData, SagaDefinition, SagaHandler, SagaRuntime};

use crate::callback::{Callback, CallbackRegistry};
use crate::collaborators::Collaborators;
use crate::config::BusConfig;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::DispatchError;
use crate::facade::{Bus, Endpoints, ScheduledTimeout};
use crate::fault::{FaultHandler, ForwardToErrorEndpoint};
use crate::handler::Handles;
use crate::poller::TimeoutPoller;
use crate::registry::{ConsumerRegistry, HandlerChain};
use crate::transport::{InMemoryTransport, Transport};
use crate::worker::{RetryPolicy, WorkerPool};
use crate::{BusError, Result};

type Registration = Box<dyn FnOnce(&ConsumerRegistry, &Arc<dyn SagaStore>) + Send>;

/// Builder for [`MessageBus`].
///
/// Stores and transport default to the in-memory implementations.
pub struct MessageBusBuilder {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    saga_store: Option<Arc<dyn SagaStore>>,
    timeouts: Option<Arc<dyn TimeoutStore>>,
    fault_handler: Option<Arc<dyn FaultHandler>>,
    routes: HashMap<String, Endpoint>,
    chains: Vec<HandlerChain>,
    collaborators: Collaborators,
    registrations: Vec<Registration>,
}

impl MessageBusBuilder {
    fn new(config: BusConfig) -> Self {
        Self {
            config,
            transport: None,
            saga_store: None,
            timeouts: None,
            fault_handler: None,
            routes: HashMap::new(),
            chains: Vec::new(),
            collaborators: Collaborators::new(),
            registrations: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn saga_store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.saga_store = Some(store);
        self
    }

    pub fn timeout_store(mut self, store: Arc<dyn TimeoutStore>) -> Self {
        self.timeouts = Some(store);
        self
    }

    /// Replaces the default forwarding to the error endpoint.
    pub fn fault_handler(mut self, handler: Arc<dyn FaultHandler>) -> Self {
        self.fault_handler = Some(handler);
        self
    }

    /// Routes sends of `M` (and of messages implementing it) to `endpoint`.
    pub fn route<M: Message>(self, endpoint: impl Into<Endpoint>) -> Self {
        self.route_type(M::message_type(), endpoint)
    }

    /// Routes sends of the named type to `endpoint`.
    pub fn route_type(mut self, message_type: impl Into<String>, endpoint: impl Into<Endpoint>) -> Self {
        self.routes.insert(message_type.into(), endpoint.into());
        self
    }

    /// Fixes the consumer order for one message type.
    pub fn chain(mut self, chain: HandlerChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Makes `collaborator` available through `Bus::find`.
    pub fn collaborator<T: Any + Send + Sync>(mut self, collaborator: Arc<T>) -> Self {
        self.collaborators.register(collaborator);
        self
    }

    /// Registers a stateless handler for `M`.
    pub fn consumes<M, H>(mut self, handler: Arc<H>) -> Self
    where
        M: Message,
        H: Handles<M> + 'static,
    {
        self.registrations.push(Box::new(
            move |registry: &ConsumerRegistry, _: &Arc<dyn SagaStore>| {
                registry.consumes::<M, H>(handler)
            },
        ));
        self
    }

    /// Registers a saga running against the bus's saga store.
    pub fn saga<D: SagaData>(self, definition: SagaDefinition<D>) -> Self {
        self.saga_with(definition, |runtime| runtime)
    }

    /// Registers a saga, customizing its runtime (finders, merger).
    pub fn saga_with<D, F>(mut self, definition: SagaDefinition<D>, configure: F) -> Self
    where
        D: SagaData,
        F: FnOnce(SagaRuntime<D>) -> SagaRuntime<D> + Send + 'static,
    {
        self.registrations.push(Box::new(
            move |registry: &ConsumerRegistry, store: &Arc<dyn SagaStore>| {
                let runtime = configure(SagaRuntime::new(definition, store.clone()));
                registry.register_saga(Arc::new(runtime));
            },
        ));
        self
    }

    /// Registers an already assembled saga handler.
    pub fn saga_handler(mut self, handler: Arc<dyn SagaHandler>) -> Self {
        self.registrations.push(Box::new(
            move |registry: &ConsumerRegistry, _: &Arc<dyn SagaStore>| {
                registry.register_saga(handler)
            },
        ));
        self
    }

    /// Builds the bus and subscribes its endpoint to every consumed type.
    pub async fn build(self) -> Result<MessageBus> {
        let endpoints = self.config.endpoints();
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(InMemoryTransport::new()),
        };
        let saga_store: Arc<dyn SagaStore> = match self.saga_store {
            Some(store) => store,
            None => Arc::new(InMemorySagaStore::new()),
        };
        let timeouts: Arc<dyn TimeoutStore> = match self.timeouts {
            Some(store) => store,
            None => Arc::new(InMemoryTimeoutStore::new()),
        };
        let fault_handler: Arc<dyn FaultHandler> = match self.fault_handler {
            Some(handler) => handler,
            None => Arc::new(ForwardToErrorEndpoint::new(
                transport.clone(),
                endpoints.error.clone(),
            )),
        };

        let registry = Arc::new(ConsumerRegistry::new());
        for register in self.registrations {
            register(&registry, &saga_store);
        }
        for chain in self.chains {
            registry.configure_chain(chain);
        }
        for message_type in registry.message_types() {
            transport.subscribe(&message_type, &endpoints.local).await?;
        }

        let callbacks = Arc::new(CallbackRegistry::new(
            timeouts.clone(),
            endpoints.local.clone(),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            callbacks.clone(),
            timeouts.clone(),
            fault_handler.clone(),
            endpoints.local.clone(),
        );

        tracing::info!(
            endpoint = %endpoints.local,
            consumers = registry.len(),
            routes = self.routes.len(),
            "Message bus built"
        );

        Ok(MessageBus {
            inner: Arc::new(Inner {
                config: self.config,
                endpoints,
                transport,
                registry,
                callbacks,
                timeouts,
                saga_store,
                dispatcher,
                routes: self.routes,
                collaborators: self.collaborators,
                fault_handler,
            }),
        })
    }
}

struct Inner {
    config: BusConfig,
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    registry: Arc<ConsumerRegistry>,
    callbacks: Arc<CallbackRegistry>,
    timeouts: Arc<dyn TimeoutStore>,
    saga_store: Arc<dyn SagaStore>,
    dispatcher: Dispatcher,
    routes: HashMap<String, Endpoint>,
    collaborators: Collaborators,
    fault_handler: Arc<dyn FaultHandler>,
}

/// A message bus instance.
///
/// Cheap to clone; clones share registries, stores and transport.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

/// The envelope being dispatched, as far as replies need to know.
struct ReplyContext {
    message_id: MessageId,
    reply_to: Option<Endpoint>,
}

/// The bus as lent to consumers during one dispatch.
struct BusContext<'a> {
    bus: &'a MessageBus,
    current: ReplyContext,
}

impl MessageBus {
    /// Starts building a bus.
    pub fn builder(config: BusConfig) -> MessageBusBuilder {
        MessageBusBuilder::new(config)
    }

    /// Dispatches one inbound envelope.
    pub async fn dispatch(&self, envelope: &mut Envelope) -> std::result::Result<DispatchReport, DispatchError> {
        let context = BusContext {
            bus: self,
            current: ReplyContext {
                message_id: envelope.id,
                reply_to: envelope.headers.reply_to.clone(),
            },
        };
        self.inner.dispatcher.dispatch(&context, envelope).await
    }

    /// Registers a transient handler and subscribes the local endpoint to `M`.
    pub async fn register_transient<M, H>(&self, handler: Arc<H>) -> Result<()>
    where
        M: Message,
        H: Handles<M> + 'static,
    {
        self.inner.registry.transient::<M, H>(handler);
        self.inner
            .transport
            .subscribe(M::message_type(), &self.inner.endpoints.local)
            .await
    }

    /// Removes every registration of `consumer`.
    pub fn unregister<T: ?Sized>(&self, consumer: &Arc<T>) -> usize {
        self.inner.registry.unregister(consumer)
    }

    /// Starts the configured number of workers on the local endpoint.
    pub async fn start_workers(&self) -> WorkerPool {
        let inbox = self.inner.transport.inbox(&self.inner.endpoints.local).await;
        WorkerPool::start(
            self.clone(),
            inbox,
            self.inner.config.workers,
            RetryPolicy::new(self.inner.config.max_retries),
        )
    }

    /// Creates the poller delivering this endpoint's timeouts.
    pub fn timeout_poller(&self) -> TimeoutPoller {
        TimeoutPoller::new(
            self.inner.timeouts.clone(),
            self.inner.transport.clone(),
            self.inner.endpoints.local.clone(),
            self.inner.config.timeout_poll_interval,
        )
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.inner.registry
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn saga_store(&self) -> &Arc<dyn SagaStore> {
        &self.inner.saga_store
    }

    pub fn timeout_store(&self) -> &Arc<dyn TimeoutStore> {
        &self.inner.timeouts
    }

    pub fn fault_handler(&self) -> &Arc<dyn FaultHandler> {
        &self.inner.fault_handler
    }

    fn outbound(&self, message: TransportMessage) -> Envelope {
        let mut envelope = Envelope::new(message).with_reply_to(self.inner.endpoints.local.clone());
        envelope.headers.local_endpoint = Some(self.inner.endpoints.local.clone());
        envelope
    }

    fn route_for(&self, message: &TransportMessage) -> Option<&Endpoint> {
        message
            .applicable_types()
            .into_iter()
            .find_map(|message_type| self.inner.routes.get(message_type))
    }

    async fn audit(&self, envelope: &Envelope) -> Result<()> {
        if let Some(log) = &self.inner.endpoints.log {
            self.inner.transport.send(log, envelope.clone()).await?;
        }
        Ok(())
    }

    async fn publish_outbound(&self, message: TransportMessage) -> Result<()> {
        let envelope = self.outbound(message);
        self.audit(&envelope).await?;
        let message_type = envelope.message.message_type().to_string();
        let reached = self.inner.transport.publish(envelope).await?;
        tracing::debug!(%message_type, subscribers = reached, "message published");
        Ok(())
    }

    async fn send_outbound(
        &self,
        destination: Option<Endpoint>,
        message: TransportMessage,
    ) -> Result<Callback> {
        let destination = match destination {
            Some(endpoint) => endpoint,
            None => self
                .route_for(&message)
                .cloned()
                .ok_or_else(|| BusError::NoRoute(message.message_type().to_string()))?,
        };

        let envelope = self.outbound(message);
        let callback = self.inner.callbacks.track(&envelope);
        self.audit(&envelope).await?;
        self.inner.transport.send(&destination, envelope).await?;
        Ok(callback)
    }

    async fn reply_outbound(&self, current: Option<&ReplyContext>, message: TransportMessage) -> Result<()> {
        let current = current.ok_or(BusError::NoMessageToReplyTo)?;
        let destination = current
            .reply_to
            .clone()
            .ok_or(BusError::NoReplyAddress(current.message_id))?;

        let envelope = self.outbound(message).in_reply_to(current.message_id);
        self.audit(&envelope).await?;
        self.inner.transport.send(&destination, envelope).await
    }

    async fn schedule(&self, delay: Duration, message: TransportMessage) -> Result<ScheduledTimeout> {
        let entry = TimeoutEntry::new(self.inner.endpoints.local.clone(), delay, message);
        let scheduled = ScheduledTimeout {
            id: entry.id(),
            at: entry.at(),
        };
        self.inner.timeouts.add(entry).await?;
        metrics::counter!("timeouts_scheduled_total").increment(1);
        tracing::debug!(timeout_id = %scheduled.id, at = %scheduled.at, "timeout scheduled");
        Ok(scheduled)
    }

    async fn cancel(&self, id: TimeoutId) -> Result<bool> {
        Ok(self.inner.timeouts.remove(id).await?)
    }
}

#[async_trait]
impl Bus for MessageBus {
    fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    async fn publish_message(&self, message: TransportMessage) -> Result<()> {
        self.publish_outbound(message).await
    }

    async fn send_message(&self, destination: Option<Endpoint>, message: TransportMessage) -> Result<Callback> {
        self.send_outbound(destination, message).await
    }

    async fn reply_message(&self, message: TransportMessage) -> Result<()> {
        self.reply_outbound(None, message).await
    }

    async fn schedule_message(&self, delay: Duration, message: TransportMessage) -> Result<ScheduledTimeout> {
        self.schedule(delay, message).await
    }

    async fn cancel_timeout(&self, id: TimeoutId) -> Result<bool> {
        self.cancel(id).await
    }
}

#[async_trait]
impl Bus for BusContext<'_> {
    fn endpoints(&self) -> &Endpoints {
        &self.bus.inner.endpoints
    }

    fn collaborators(&self) -> &Collaborators {
        &self.bus.inner.collaborators
    }

    async fn publish_message(&self, message: TransportMessage) -> Result<()> {
        self.bus.publish_outbound(message).await
    }

    async fn send_message(&self, destination: Option<Endpoint>, message: TransportMessage) -> Result<Callback> {
        self.bus.send_outbound(destination, message).await
    }

    async fn reply_message(&self, message: TransportMessage) -> Result<()> {
        self.bus.reply_outbound(Some(&self.current), message).await
    }

    async fn schedule_message(&self, delay: Duration, message: TransportMessage) -> Result<ScheduledTimeout> {
        self.bus.schedule(delay, message).await
    }

    async fn cancel_timeout(&self, id: TimeoutId) -> Result<bool> {
        self.bus.cancel(id).await
    }
}
