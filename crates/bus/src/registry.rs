//! Consumer registration and resolution.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use messaging::{Capability, Message, TransportMessage};
use saga::SagaHandler;

use crate::handler::{HandlerInvoker, Handles, Invoker};

/// How a resolved consumer is invoked.
#[derive(Clone)]
pub enum ConsumerKind {
    /// A stateless handler, through its registration-time invoker.
    Handler(Arc<dyn Invoker>),

    /// A saga runtime.
    Saga(Arc<dyn SagaHandler>),
}

/// A consumer selected for one message.
#[derive(Clone)]
pub struct ResolvedConsumer {
    /// Handler type name or saga type.
    pub name: String,

    /// Capability the consumer was found under.
    pub capability: Capability,

    /// Message type or contract the consumer was registered for.
    pub message_type: String,

    /// How to invoke it.
    pub kind: ConsumerKind,
}

impl ResolvedConsumer {
    /// Returns true for saga consumers.
    pub fn is_saga(&self) -> bool {
        matches!(self.kind, ConsumerKind::Saga(_))
    }
}

impl std::fmt::Debug for ResolvedConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConsumer")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("message_type", &self.message_type)
            .field("saga", &self.is_saga())
            .finish()
    }
}

/// Explicit consumer order for one message type.
///
/// When configured, only the listed consumers receive the message, in the
/// listed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerChain {
    message_type: String,
    consumers: Vec<String>,
}

impl HandlerChain {
    /// Starts a chain for `M`.
    pub fn for_message<M: Message>() -> Self {
        Self {
            message_type: M::message_type().to_string(),
            consumers: Vec::new(),
        }
    }

    /// Puts handler `H` first.
    pub fn initially_handled_by<H: ?Sized + 'static>(mut self) -> Self {
        self.consumers
            .insert(0, std::any::type_name::<H>().to_string());
        self
    }

    /// Appends handler `H`.
    pub fn followed_by<H: ?Sized + 'static>(mut self) -> Self {
        self.consumers.push(std::any::type_name::<H>().to_string());
        self
    }

    /// Appends a saga by type name.
    pub fn followed_by_saga(mut self, saga_type: impl Into<String>) -> Self {
        self.consumers.push(saga_type.into());
        self
    }

    /// Returns the message type the chain applies to.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Returns the consumer names, in order.
    pub fn consumers(&self) -> &[String] {
        &self.consumers
    }

    fn arrange(&self, resolved: Vec<ResolvedConsumer>) -> Vec<ResolvedConsumer> {
        let mut ordered = Vec::with_capacity(resolved.len());
        for name in &self.consumers {
            ordered.extend(resolved.iter().filter(|c| &c.name == name).cloned());
        }
        ordered
    }
}

#[derive(Clone)]
struct Registration {
    sequence: u64,
    identity: usize,
    name: String,
    kind: ConsumerKind,
}

#[derive(Default)]
struct Registrations {
    next_sequence: u64,
    by_type: HashMap<String, HashMap<Capability, Vec<Registration>>>,
    chains: HashMap<String, HandlerChain>,
}

/// Registry of every consumer known to a bus instance.
///
/// Maps (message type, capability) to registrations. Invokers are built
/// once, at registration; resolution does no per-message type inspection.
#[derive(Default)]
pub struct ConsumerRegistry {
    inner: RwLock<Registrations>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `M` under `capability`.
    pub fn register<M, H>(&self, capability: Capability, handler: Arc<H>)
    where
        M: Message,
        H: Handles<M> + 'static,
    {
        let identity = identity_of(&handler);
        let invoker: Arc<dyn Invoker> = Arc::new(HandlerInvoker::<H, M>::new(handler));
        self.insert(
            M::message_type(),
            capability,
            identity,
            std::any::type_name::<H>(),
            ConsumerKind::Handler(invoker),
        );
    }

    /// Registers a stateless handler for `M`.
    pub fn consumes<M, H>(&self, handler: Arc<H>)
    where
        M: Message,
        H: Handles<M> + 'static,
    {
        self.register::<M, H>(Capability::ConsumesOnce, handler);
    }

    /// Registers a handler instance for `M` until it is unregistered.
    pub fn transient<M, H>(&self, handler: Arc<H>)
    where
        M: Message,
        H: Handles<M> + 'static,
    {
        self.register::<M, H>(Capability::TransientConsumerOf, handler);
    }

    /// Registers a saga under each of its triggers.
    pub fn register_saga(&self, saga: Arc<dyn SagaHandler>) {
        let identity = identity_of(&saga);
        for trigger in saga.triggers() {
            self.insert(
                trigger.message_type,
                trigger.capability,
                identity,
                saga.saga_type(),
                ConsumerKind::Saga(saga.clone()),
            );
        }
    }

    /// Removes every registration of `consumer`, returning how many there were.
    pub fn unregister<T: ?Sized>(&self, consumer: &Arc<T>) -> usize {
        let identity = identity_of(consumer);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for table in inner.by_type.values_mut() {
            for registrations in table.values_mut() {
                let before = registrations.len();
                registrations.retain(|r| r.identity != identity);
                removed += before - registrations.len();
            }
        }
        removed
    }

    /// Sets the explicit consumer order for a message type.
    pub fn configure_chain(&self, chain: HandlerChain) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.chains.insert(chain.message_type.clone(), chain);
    }

    /// Returns every consumer of `message`, de-duplicated by instance.
    ///
    /// Consumers registered for the concrete type and for every implemented
    /// contract are included, in registration order unless a chain is
    /// configured for one of the message's types. An empty result is not an
    /// error.
    pub fn resolve_all(&self, message: &TransportMessage) -> Vec<ResolvedConsumer> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let applicable = message.applicable_types();

        let mut found = Vec::new();
        for message_type in &applicable {
            let Some(table) = inner.by_type.get(*message_type) else {
                continue;
            };
            for capability in Capability::ALL {
                if let Some(registrations) = table.get(&capability) {
                    found.extend(
                        registrations
                            .iter()
                            .map(|registration| (registration, capability, *message_type)),
                    );
                }
            }
        }

        found.sort_by_key(|(registration, _, _)| registration.sequence);
        let mut seen = HashSet::new();
        let resolved: Vec<_> = found
            .into_iter()
            .filter(|(registration, _, _)| seen.insert(registration.identity))
            .map(|(registration, capability, message_type)| ResolvedConsumer {
                name: registration.name.clone(),
                capability,
                message_type: message_type.to_string(),
                kind: registration.kind.clone(),
            })
            .collect();

        match applicable.iter().find_map(|t| inner.chains.get(*t)) {
            Some(chain) => chain.arrange(resolved),
            None => resolved,
        }
    }

    /// Returns every message type with at least one registration.
    pub fn message_types(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = inner
            .by_type
            .iter()
            .filter(|(_, table)| table.values().any(|r| !r.is_empty()))
            .map(|(message_type, _)| message_type.clone())
            .collect();
        types.sort();
        types
    }

    /// Returns the number of registrations.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_type
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(
        &self,
        message_type: &str,
        capability: Capability,
        identity: usize,
        name: &str,
        kind: ConsumerKind,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner
            .by_type
            .entry(message_type.to_string())
            .or_default()
            .entry(capability)
            .or_default()
            .push(Registration {
                sequence,
                identity,
                name: name.to_string(),
                kind,
            });
        tracing::debug!(message_type, %capability, consumer = name, "consumer registered");
    }
}

fn identity_of<T: ?Sized>(consumer: &Arc<T>) -> usize {
    Arc::as_ptr(consumer) as *const () as usize
}
