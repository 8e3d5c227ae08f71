use chrono::{DateTime, Duration, Utc};
use messaging::TransportMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Endpoint, SagaId};

/// Unique identifier for a scheduled timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeoutId(Uuid);

impl TimeoutId {
    /// Creates a new random timeout ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a timeout ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TimeoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The saga instance that requested a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requestor {
    /// The requesting instance.
    pub saga_id: SagaId,

    /// The requesting saga definition.
    pub saga_type: String,
}

/// A message scheduled for future delivery.
///
/// Fields are private so that `at` always equals `created_on` plus the
/// requested delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEntry {
    id: TimeoutId,
    #[serde(rename = "invocation_time")]
    at: DateTime<Utc>,
    created_on: DateTime<Utc>,
    endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    requestor: Option<Requestor>,
    payload: TransportMessage,
}

impl TimeoutEntry {
    /// Schedules `payload` for delivery to `endpoint` after `delay`, from now.
    pub fn new(endpoint: Endpoint, delay: Duration, payload: TransportMessage) -> Self {
        Self::created_at(Utc::now(), endpoint, delay, payload)
    }

    /// Schedules `payload` for delivery `delay` after `created_on`.
    pub fn created_at(
        created_on: DateTime<Utc>,
        endpoint: Endpoint,
        delay: Duration,
        payload: TransportMessage,
    ) -> Self {
        Self {
            id: TimeoutId::new(),
            at: created_on + delay,
            created_on,
            endpoint,
            requestor: None,
            payload,
        }
    }

    /// Tags the entry with the saga instance that requested it.
    pub fn requested_by(mut self, requestor: Requestor) -> Self {
        self.requestor = Some(requestor);
        self
    }

    /// Returns the timeout ID.
    pub fn id(&self) -> TimeoutId {
        self.id
    }

    /// Returns the delivery time.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Returns when the entry was created.
    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    /// Returns the requested delay.
    pub fn delay(&self) -> Duration {
        self.at - self.created_on
    }

    /// Returns the owning endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the requesting saga instance, if any.
    pub fn requestor(&self) -> Option<&Requestor> {
        self.requestor.as_ref()
    }

    /// Returns the message to redeliver.
    pub fn payload(&self) -> &TransportMessage {
        &self.payload
    }

    /// Consumes the entry, returning the message to redeliver.
    pub fn into_payload(self) -> TransportMessage {
        self.payload
    }

    /// Returns true if the entry is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.at <= now
    }
}
