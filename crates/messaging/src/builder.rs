//! Structural construction of contract-shaped messages.
//!
//! A contract with no concrete Rust type is described by a [`MessageSchema`].
//! [`MessageBuilder`] produces a [`TransportMessage`] from it with every
//! declared field starting at its kind's default value.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{MessageError, Result, TransportMessage};

/// The kind of a structural message field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Boolean,
    Uuid,
    Timestamp,
    List,
    Map,
    Optional,
}

impl FieldKind {
    /// Returns the zero/empty value a field of this kind starts with.
    pub fn default_value(&self) -> Value {
        match self {
            FieldKind::Text => Value::String(String::new()),
            FieldKind::Integer => Value::from(0),
            FieldKind::Decimal => Value::from(0.0),
            FieldKind::Boolean => Value::Bool(false),
            FieldKind::Uuid => Value::String(Uuid::nil().to_string()),
            FieldKind::Timestamp => Value::String("1970-01-01T00:00:00Z".to_string()),
            FieldKind::List => Value::Array(Vec::new()),
            FieldKind::Map => Value::Object(Map::new()),
            FieldKind::Optional => Value::Null,
        }
    }

    /// Returns true if `value` is a valid value for this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Decimal => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Uuid => value.as_str().is_some_and(|s| Uuid::parse_str(s).is_ok()),
            FieldKind::Timestamp => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            FieldKind::List => value.is_array(),
            FieldKind::Map => value.is_object(),
            FieldKind::Optional => true,
        }
    }

    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Boolean => "boolean",
            FieldKind::Uuid => "uuid",
            FieldKind::Timestamp => "timestamp",
            FieldKind::List => "list",
            FieldKind::Map => "map",
            FieldKind::Optional => "optional",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declarative description of a contract-shaped message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchema {
    message_type: String,
    contracts: Vec<String>,
    fields: Vec<(String, FieldKind)>,
}

impl MessageSchema {
    /// Creates a schema for the named message type.
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            contracts: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Declares an implemented contract.
    pub fn implements(mut self, contract: impl Into<String>) -> Self {
        self.contracts.push(contract.into());
        self
    }

    /// Declares a field. Redeclaring a field replaces its kind.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(field) => field.1 = kind,
            None => self.fields.push((name, kind)),
        }
        self
    }

    /// Returns the message type name.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Returns the declared kind of a field.
    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, kind)| *kind)
    }

    /// Starts building a message of this shape.
    pub fn builder(&self) -> MessageBuilder<'_> {
        MessageBuilder::new(self)
    }
}

/// Builds a [`TransportMessage`] from a [`MessageSchema`].
#[derive(Debug)]
pub struct MessageBuilder<'a> {
    schema: &'a MessageSchema,
    values: Map<String, Value>,
    correlation_id: Option<Uuid>,
}

impl<'a> MessageBuilder<'a> {
    /// Creates a builder with every field at its default value.
    pub fn new(schema: &'a MessageSchema) -> Self {
        let values = schema
            .fields
            .iter()
            .map(|(name, kind)| (name.clone(), kind.default_value()))
            .collect();
        Self {
            schema,
            values,
            correlation_id: None,
        }
    }

    /// Sets a field value.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        let kind = self
            .schema
            .kind_of(field)
            .ok_or_else(|| MessageError::UnknownField {
                message_type: self.schema.message_type.clone(),
                field: field.to_string(),
            })?;
        let value = value.into();
        if !kind.accepts(&value) {
            return Err(MessageError::InvalidFieldValue {
                message_type: self.schema.message_type.clone(),
                field: field.to_string(),
                kind,
            });
        }
        self.values.insert(field.to_string(), value);
        Ok(self)
    }

    /// Sets the correlation value.
    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Builds the message.
    pub fn build(self) -> TransportMessage {
        TransportMessage::from_parts(
            self.schema.message_type.clone(),
            self.schema.contracts.iter().cloned(),
            self.correlation_id,
            Value::Object(self.values),
        )
    }
}
