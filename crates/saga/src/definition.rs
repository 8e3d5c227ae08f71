//! Declarative saga definitions.
//!
//! A definition is an ordered list of [`TriggerCondition`]s, each naming
//! the state the saga must be in, the message that triggers it, an optional
//! pre-condition and the [`MessageAction`]s to run. Definitions are built
//! with a fluent builder:
//!
//! ```ignore
//! let definition = SagaDefinition::<Loyalty>::builder("CustomerLoyalty", START)
//!     .started_by::<OrderAccepted>()
//!     .shared_key("customer_id")
//!     .when::<OrderAccepted>(&START)
//!     .only_if(|data, order| data.total + order.amount > 5000)
//!     .then_do(|data, order| data.total += order.amount)
//!     .publish(|data, _| CustomerMadePreferred { customer_id: data.customer_id })
//!     .build()?;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Duration;
use common::Endpoint;
use messaging::{Capability, Message, TransportMessage};

use crate::{Result, SagaData, SagaError, State};

/// State-mutating logic run against the working copy.
pub type DoFn<D> = Arc<dyn Fn(&mut D, &TransportMessage) -> Result<()> + Send + Sync>;

/// Builds an outgoing message from the saga data and the triggering message.
pub type MessageFactory<D> =
    Arc<dyn Fn(&D, &TransportMessage) -> Result<TransportMessage> + Send + Sync>;

/// Predicate over the saga data and a message.
pub type Predicate<D> = Arc<dyn Fn(&D, &TransportMessage) -> Result<bool> + Send + Sync>;

/// One step of a trigger condition.
pub enum MessageAction<D> {
    /// Mutates the working copy of the saga data.
    Do(DoFn<D>),

    /// Publishes a message to every subscriber.
    Publish(MessageFactory<D>),

    /// Sends a message to its routed endpoint.
    Send(MessageFactory<D>),

    /// Sends a message to an explicit endpoint.
    SendToEndpoint(Endpoint, MessageFactory<D>),

    /// Replies to the sender of the triggering message.
    Reply(MessageFactory<D>),

    /// Schedules a message for delivery back to this saga after a delay.
    Delay(Duration, MessageFactory<D>),

    /// Moves the saga to another state.
    TransitionTo(State),

    /// Ends the saga; its data is removed instead of saved.
    Complete,

    /// Declares how the triggering message correlates to an instance.
    Correlate(Predicate<D>),
}

impl<D> MessageAction<D> {
    /// Returns the action name.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageAction::Do(_) => "Do",
            MessageAction::Publish(_) => "Publish",
            MessageAction::Send(_) => "Send",
            MessageAction::SendToEndpoint(..) => "SendToEndpoint",
            MessageAction::Reply(_) => "Reply",
            MessageAction::Delay(..) => "Delay",
            MessageAction::TransitionTo(_) => "TransitionTo",
            MessageAction::Complete => "Complete",
            MessageAction::Correlate(_) => "Correlate",
        }
    }
}

impl<D> std::fmt::Debug for MessageAction<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageAction::SendToEndpoint(endpoint, _) => {
                write!(f, "SendToEndpoint({endpoint})")
            }
            MessageAction::Delay(delay, _) => write!(f, "Delay({delay})"),
            MessageAction::TransitionTo(state) => write!(f, "TransitionTo({state})"),
            other => f.write_str(other.kind()),
        }
    }
}

/// A (state, message type, pre-condition) rule and the actions it runs.
pub struct TriggerCondition<D> {
    state: State,
    message_type: &'static str,
    precondition: Option<Predicate<D>>,
    actions: Vec<MessageAction<D>>,
}

impl<D> TriggerCondition<D> {
    /// Returns the state the saga must be in.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Returns the triggering message type.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// Returns the actions, in declaration order.
    pub fn actions(&self) -> &[MessageAction<D>] {
        &self.actions
    }

    /// Returns true if the condition carries a pre-condition.
    pub fn has_precondition(&self) -> bool {
        self.precondition.is_some()
    }

    /// Returns true if this condition reacts to `message` in `state`.
    pub fn applies_to(&self, state: &State, message: &TransportMessage) -> bool {
        self.state == *state && message.implements(self.message_type)
    }

    /// Evaluates the pre-condition. An absent pre-condition is satisfied.
    pub fn is_satisfied(&self, data: &D, message: &TransportMessage) -> Result<bool> {
        match &self.precondition {
            Some(predicate) => predicate(data, message),
            None => Ok(true),
        }
    }

    /// Returns the correlation predicates declared by this condition.
    pub fn correlation_predicates(&self) -> impl Iterator<Item = &Predicate<D>> {
        self.actions.iter().filter_map(|action| match action {
            MessageAction::Correlate(predicate) => Some(predicate),
            _ => None,
        })
    }
}

impl<D> std::fmt::Debug for TriggerCondition<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerCondition")
            .field("state", &self.state)
            .field("message_type", &self.message_type)
            .field("precondition", &self.precondition.is_some())
            .field("actions", &self.actions)
            .finish()
    }
}

/// A message type the saga declares interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trigger {
    /// The message type name.
    pub message_type: &'static str,

    /// `StartedBy` or `OrchestratedBy`.
    pub capability: Capability,
}

/// The complete, validated behaviour of a saga type.
pub struct SagaDefinition<D> {
    name: String,
    initial_state: State,
    shared_key: Option<String>,
    triggers: Vec<Trigger>,
    conditions: Vec<TriggerCondition<D>>,
}

impl<D: SagaData> SagaDefinition<D> {
    /// Starts building a definition.
    pub fn builder(name: impl Into<String>, initial_state: State) -> SagaDefinitionBuilder<D> {
        SagaDefinitionBuilder {
            definition: SagaDefinition {
                name: name.into(),
                initial_state,
                shared_key: None,
                triggers: Vec::new(),
                conditions: Vec::new(),
            },
        }
    }
}

impl<D> SagaDefinition<D> {
    /// Returns the saga type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the state fresh instances start in.
    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    /// Returns the field shared by saga data and messages, if configured.
    pub fn shared_key(&self) -> Option<&str> {
        self.shared_key.as_deref()
    }

    /// Returns the declared triggers, in declaration order.
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Returns the trigger conditions, in declaration order.
    pub fn conditions(&self) -> &[TriggerCondition<D>] {
        &self.conditions
    }

    /// Returns the capability the saga declares for a message type.
    pub fn capability_for(&self, message_type: &str) -> Option<Capability> {
        self.triggers
            .iter()
            .find(|trigger| trigger.message_type == message_type)
            .map(|trigger| trigger.capability)
    }

    /// Returns true if the message may create a new instance.
    pub fn can_start(&self, message: &TransportMessage) -> bool {
        message
            .applicable_types()
            .into_iter()
            .any(|message_type| self.capability_for(message_type) == Some(Capability::StartedBy))
    }

    /// Returns the correlation predicates declared for a message.
    pub fn correlation_predicates<'a>(
        &'a self,
        message: &'a TransportMessage,
    ) -> impl Iterator<Item = &'a Predicate<D>> + 'a {
        self.conditions
            .iter()
            .filter(move |condition| message.implements(condition.message_type))
            .flat_map(TriggerCondition::correlation_predicates)
    }
}

impl<D> std::fmt::Debug for SagaDefinition<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("shared_key", &self.shared_key)
            .field("triggers", &self.triggers)
            .field("conditions", &self.conditions)
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder<D> {
    definition: SagaDefinition<D>,
}

impl<D: SagaData> SagaDefinitionBuilder<D> {
    /// Declares a message type that creates an instance when none correlates.
    pub fn started_by<M: Message>(mut self) -> Self {
        self.declare(M::message_type(), Capability::StartedBy);
        self
    }

    /// Correlates messages to instances by equality of this field.
    pub fn shared_key(mut self, field: impl Into<String>) -> Self {
        self.definition.shared_key = Some(field.into());
        self
    }

    /// Starts a trigger condition for `M` in `state`.
    ///
    /// `M` is declared `OrchestratedBy` unless already declared `StartedBy`.
    pub fn when<M: Message>(mut self, state: &State) -> ConditionBuilder<D, M> {
        self.declare(M::message_type(), Capability::OrchestratedBy);
        ConditionBuilder {
            parent: self,
            condition: TriggerCondition {
                state: state.clone(),
                message_type: M::message_type(),
                precondition: None,
                actions: Vec::new(),
            },
            _message: PhantomData,
        }
    }

    /// Validates and returns the definition.
    pub fn build(self) -> Result<SagaDefinition<D>> {
        let definition = self.definition;
        if definition.name.is_empty() {
            return Err(SagaError::InvalidDefinition(
                "saga name must not be empty".to_string(),
            ));
        }
        if definition.conditions.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "{} declares no trigger conditions",
                definition.name
            )));
        }
        if !definition
            .triggers
            .iter()
            .any(|trigger| trigger.capability == Capability::StartedBy)
        {
            return Err(SagaError::InvalidDefinition(format!(
                "{} declares no StartedBy message",
                definition.name
            )));
        }
        Ok(definition)
    }

    fn declare(&mut self, message_type: &'static str, capability: Capability) {
        match self
            .definition
            .triggers
            .iter_mut()
            .find(|trigger| trigger.message_type == message_type)
        {
            Some(trigger) if capability == Capability::StartedBy => {
                trigger.capability = Capability::StartedBy;
            }
            Some(_) => {}
            None => self.definition.triggers.push(Trigger {
                message_type,
                capability,
            }),
        }
    }
}

/// Builder for one trigger condition, typed by its triggering message.
pub struct ConditionBuilder<D, M> {
    parent: SagaDefinitionBuilder<D>,
    condition: TriggerCondition<D>,
    _message: PhantomData<fn() -> M>,
}

impl<D: SagaData, M: Message> ConditionBuilder<D, M> {
    /// Sets the pre-condition.
    pub fn only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&D, &M) -> bool + Send + Sync + 'static,
    {
        self.condition.precondition = Some(typed_predicate(predicate));
        self
    }

    /// Runs state-mutating logic.
    pub fn then_do<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut D, &M) + Send + Sync + 'static,
    {
        let action: DoFn<D> = Arc::new(move |data: &mut D, message: &TransportMessage| {
            let message = message.decode::<M>()?;
            action(data, &message);
            Ok(())
        });
        self.condition.actions.push(MessageAction::Do(action));
        self
    }

    /// Publishes a message.
    pub fn publish<N, F>(mut self, factory: F) -> Self
    where
        N: Message,
        F: Fn(&D, &M) -> N + Send + Sync + 'static,
    {
        self.condition
            .actions
            .push(MessageAction::Publish(typed_factory(factory)));
        self
    }

    /// Sends a message to its routed endpoint.
    pub fn send<N, F>(mut self, factory: F) -> Self
    where
        N: Message,
        F: Fn(&D, &M) -> N + Send + Sync + 'static,
    {
        self.condition
            .actions
            .push(MessageAction::Send(typed_factory(factory)));
        self
    }

    /// Sends a message to an explicit endpoint.
    pub fn send_to<N, F>(mut self, endpoint: impl Into<Endpoint>, factory: F) -> Self
    where
        N: Message,
        F: Fn(&D, &M) -> N + Send + Sync + 'static,
    {
        self.condition.actions.push(MessageAction::SendToEndpoint(
            endpoint.into(),
            typed_factory(factory),
        ));
        self
    }

    /// Replies to the sender of the triggering message.
    pub fn reply<N, F>(mut self, factory: F) -> Self
    where
        N: Message,
        F: Fn(&D, &M) -> N + Send + Sync + 'static,
    {
        self.condition
            .actions
            .push(MessageAction::Reply(typed_factory(factory)));
        self
    }

    /// Schedules a message back to this saga after `delay`.
    pub fn delay<N, F>(mut self, delay: Duration, factory: F) -> Self
    where
        N: Message,
        F: Fn(&D, &M) -> N + Send + Sync + 'static,
    {
        self.condition
            .actions
            .push(MessageAction::Delay(delay, typed_factory(factory)));
        self
    }

    /// Moves the saga to `state`.
    pub fn transition_to(mut self, state: &State) -> Self {
        self.condition
            .actions
            .push(MessageAction::TransitionTo(state.clone()));
        self
    }

    /// Ends the saga.
    pub fn complete(mut self) -> Self {
        self.condition.actions.push(MessageAction::Complete);
        self
    }

    /// Declares how `M` correlates to an instance.
    pub fn correlate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&D, &M) -> bool + Send + Sync + 'static,
    {
        self.condition
            .actions
            .push(MessageAction::Correlate(typed_predicate(predicate)));
        self
    }

    /// Finishes this condition and starts the next one.
    pub fn when<N: Message>(self, state: &State) -> ConditionBuilder<D, N> {
        self.finish().when::<N>(state)
    }

    /// Finishes this condition and validates the definition.
    pub fn build(self) -> Result<SagaDefinition<D>> {
        self.finish().build()
    }

    fn finish(self) -> SagaDefinitionBuilder<D> {
        let mut parent = self.parent;
        parent.definition.conditions.push(self.condition);
        parent
    }
}

fn typed_predicate<D, M, F>(predicate: F) -> Predicate<D>
where
    D: SagaData,
    M: Message,
    F: Fn(&D, &M) -> bool + Send + Sync + 'static,
{
    Arc::new(move |data: &D, message: &TransportMessage| {
        Ok(predicate(data, &message.decode::<M>()?))
    })
}

fn typed_factory<D, M, N, F>(factory: F) -> MessageFactory<D>
where
    D: SagaData,
    M: Message,
    N: Message,
    F: Fn(&D, &M) -> N + Send + Sync + 'static,
{
    Arc::new(move |data: &D, message: &TransportMessage| {
        let outgoing = factory(data, &message.decode::<M>()?);
        Ok(TransportMessage::from_message(&outgoing)?)
    })
}
