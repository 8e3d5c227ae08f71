//! The saga engine.
//!
//! [`execute`] interprets a definition against one message. It performs no
//! I/O: given the same definition, state, message and data it always yields
//! the same [`Execution`] and leaves the data in the same shape.

use chrono::Duration;
use common::Endpoint;
use messaging::TransportMessage;
use serde::{Deserialize, Serialize};

use crate::definition::{MessageAction, SagaDefinition};
use crate::{Result, State};

/// A side effect requested by a saga, carried out by the bus after the
/// instance has been persisted.
///
/// Actions are serializable so they can wait in the instance's outbox
/// until the bus has carried them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SagaAction {
    /// Publish to every subscriber.
    Publish(TransportMessage),

    /// Send to the routed endpoint.
    Send(TransportMessage),

    /// Send to an explicit endpoint.
    SendToEndpoint(Endpoint, TransportMessage),

    /// Reply to the sender of the triggering message.
    Reply(TransportMessage),

    /// Schedule a timeout back to the saga.
    Delay {
        #[serde(rename = "delay_ms", with = "delay_millis")]
        delay: Duration,
        message: TransportMessage,
    },
}

mod delay_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(delay.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        i64::deserialize(deserializer).map(Duration::milliseconds)
    }
}

impl SagaAction {
    /// Returns the carried message.
    pub fn message(&self) -> &TransportMessage {
        match self {
            SagaAction::Publish(message)
            | SagaAction::Send(message)
            | SagaAction::SendToEndpoint(_, message)
            | SagaAction::Reply(message)
            | SagaAction::Delay { message, .. } => message,
        }
    }
}

/// Result of running the engine on one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Whether any trigger condition fired.
    pub matched: bool,

    /// State after the fired condition's transitions.
    pub next_state: State,

    /// Whether a `Complete` action ran.
    pub completed: bool,

    /// Side effects, in declaration order.
    pub actions: Vec<SagaAction>,
}

impl Execution {
    fn unmatched(state: &State) -> Self {
        Self {
            matched: false,
            next_state: state.clone(),
            completed: false,
            actions: Vec::new(),
        }
    }
}

/// Runs the first satisfied trigger condition for `message` in `state`.
///
/// Conditions sharing a state and message type are tried in declaration
/// order. A message no condition reacts to yields an unmatched execution,
/// not an error.
pub fn execute<D>(
    definition: &SagaDefinition<D>,
    state: &State,
    message: &TransportMessage,
    data: &mut D,
) -> Result<Execution> {
    let mut selected = None;
    for condition in definition.conditions() {
        if condition.applies_to(state, message) && condition.is_satisfied(data, message)? {
            selected = Some(condition);
            break;
        }
    }

    let Some(condition) = selected else {
        return Ok(Execution::unmatched(state));
    };

    let mut execution = Execution {
        matched: true,
        ..Execution::unmatched(state)
    };

    for action in condition.actions() {
        match action {
            MessageAction::Do(action) => action(&mut *data, message)?,
            MessageAction::Publish(factory) => execution
                .actions
                .push(SagaAction::Publish(factory(data, message)?)),
            MessageAction::Send(factory) => execution
                .actions
                .push(SagaAction::Send(factory(data, message)?)),
            MessageAction::SendToEndpoint(endpoint, factory) => execution.actions.push(
                SagaAction::SendToEndpoint(endpoint.clone(), factory(data, message)?),
            ),
            MessageAction::Reply(factory) => execution
                .actions
                .push(SagaAction::Reply(factory(data, message)?)),
            MessageAction::Delay(delay, factory) => execution.actions.push(SagaAction::Delay {
                delay: *delay,
                message: factory(data, message)?,
            }),
            MessageAction::TransitionTo(next) => execution.next_state = next.clone(),
            MessageAction::Complete => execution.completed = true,
            MessageAction::Correlate(_) => {}
        }
    }

    Ok(execution)
}
