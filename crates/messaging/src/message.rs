//! Message trait and the type-erased transport form.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{MessageError, Result};

/// Name of the generic correlation contract.
///
/// Implemented by every message carrying a correlation id. It never takes
/// part in consumer resolution.
pub const CORRELATED_CONTRACT: &str = "Correlated";

/// Trait for bus-transportable messages.
///
/// A message has a concrete type name and may implement any number of
/// contracts. A contract is just another message type name: a handler
/// registered for a contract receives every message implementing it,
/// read through the contract's own (structural) view.
///
/// Messages are immutable once dispatched.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Returns the concrete message type name.
    fn message_type() -> &'static str;

    /// Returns every contract this message implements, transitively.
    fn contracts() -> &'static [&'static str] {
        &[]
    }

    /// Returns the shared correlation value, for messages taking part in
    /// request/response conversations.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }
}

/// A message in its routable, persistable form.
///
/// Carries the concrete type name, the implemented contracts and the JSON
/// body. Every component past the edge of the bus works on this type, so
/// routing never needs to introspect Rust types per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    message_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    contracts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
    body: serde_json::Value,
}

impl TransportMessage {
    /// Encodes a typed message.
    pub fn from_message<M: Message>(message: &M) -> Result<Self> {
        let correlation_id = message.correlation_id();
        let mut contracts = Vec::new();
        for contract in M::contracts() {
            push_unique(&mut contracts, contract, M::message_type());
        }
        if correlation_id.is_some() {
            push_unique(&mut contracts, CORRELATED_CONTRACT, M::message_type());
        }

        Ok(Self {
            message_type: M::message_type().to_string(),
            contracts,
            correlation_id,
            body: serde_json::to_value(message)?,
        })
    }

    /// Assembles a message from already encoded parts.
    pub fn from_parts(
        message_type: impl Into<String>,
        contracts: impl IntoIterator<Item = String>,
        correlation_id: Option<Uuid>,
        body: serde_json::Value,
    ) -> Self {
        let message_type = message_type.into();
        let mut deduped = Vec::new();
        for contract in contracts {
            push_unique(&mut deduped, &contract, &message_type);
        }
        if correlation_id.is_some() {
            push_unique(&mut deduped, CORRELATED_CONTRACT, &message_type);
        }
        Self {
            message_type,
            contracts: deduped,
            correlation_id,
            body,
        }
    }

    /// Returns the concrete message type name.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Returns the implemented contracts, de-duplicated.
    pub fn contracts(&self) -> &[String] {
        &self.contracts
    }

    /// Returns the correlation value, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Returns the JSON body.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Returns a top-level body field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.body.get(name)
    }

    /// Returns the types consumers may be registered for: the concrete
    /// type followed by the contracts, without the correlation contract.
    pub fn applicable_types(&self) -> Vec<&str> {
        std::iter::once(self.message_type.as_str())
            .chain(
                self.contracts
                    .iter()
                    .map(String::as_str)
                    .filter(|contract| *contract != CORRELATED_CONTRACT),
            )
            .collect()
    }

    /// Returns true if this message is, or implements, the named type.
    pub fn implements(&self, type_name: &str) -> bool {
        self.message_type == type_name || self.contracts.iter().any(|c| c == type_name)
    }

    /// Returns true if this message can be read as `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.implements(M::message_type())
    }

    /// Decodes the body as `M`.
    ///
    /// Succeeds for the concrete type and for any implemented contract;
    /// contract views read the fields they declare and ignore the rest.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if !self.is::<M>() {
            return Err(MessageError::TypeMismatch {
                expected: M::message_type().to_string(),
                actual: self.message_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

fn push_unique(contracts: &mut Vec<String>, contract: &str, concrete: &str) {
    if contract != concrete && !contracts.iter().any(|c| c == contract) {
        contracts.push(contract.to_string());
    }
}
