use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{MessageId, SagaId};

/// Version number of a saga instance, used for optimistic concurrency control.
///
/// A freshly created instance is at version 0; every successful save
/// persists the next version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of an unsaved instance.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Side effects a saga instance still owes for one delivery.
///
/// Written together with the state change that produced them, and cleared
/// once the bus has carried them out. A redelivery of the same message
/// finds its outbox and replays the actions instead of running the saga
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbox {
    /// The delivery that produced the actions.
    pub message_id: MessageId,

    /// Whether that delivery completed the saga.
    #[serde(default)]
    pub completed: bool,

    /// The owed actions, in the saga's own encoding.
    pub actions: serde_json::Value,
}

/// Persisted state of one saga instance.
///
/// The saga-specific fields travel as an opaque JSON blob; the store only
/// interprets the id, type, state name and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga instance id.
    pub id: SagaId,

    /// The saga definition this instance belongs to.
    pub saga_type: String,

    /// Name of the current state.
    pub state: String,

    /// Version the record was read at (or saved as).
    pub version: Version,

    /// Whether further message processing is suspended.
    #[serde(default)]
    pub suspended: bool,

    /// The saga-declared fields.
    pub data: serde_json::Value,

    /// Actions not yet carried out, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<Outbox>,
}

impl SagaRecord {
    /// Creates an unsaved record at the initial version.
    pub fn new(
        id: SagaId,
        saga_type: impl Into<String>,
        state: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            saga_type: saga_type.into(),
            state: state.into(),
            version: Version::initial(),
            suspended: false,
            data,
            outbox: None,
        }
    }

    /// Creates a record from serializable saga data.
    pub fn from_data<T: Serialize>(
        id: SagaId,
        saga_type: impl Into<String>,
        state: impl Into<String>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, saga_type, state, serde_json::to_value(data)?))
    }

    /// Deserializes the saga data into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Returns true if the record holds the outbox of `message_id`.
    pub fn owes_actions_for(&self, message_id: MessageId) -> bool {
        self.outbox
            .as_ref()
            .is_some_and(|outbox| outbox.message_id == message_id)
    }

    /// Sets the version.
    pub fn at_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }
}
