//! Working copies of saga instances.

use common::{MessageId, SagaId};
use persistence::{Outbox, SagaRecord, Version};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, SagaAction, State};

/// Saga-declared data carried by every instance of a saga type.
///
/// Fresh instances start from `Default`.
pub trait SagaData: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> SagaData for T where T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

/// Actions an instance still owes for one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingActions {
    /// The delivery that produced the actions.
    pub message_id: MessageId,

    /// Whether that delivery completed the saga.
    pub completed: bool,

    /// The actions, in the order they must be carried out.
    pub actions: Vec<SagaAction>,
}

impl PendingActions {
    fn from_outbox(outbox: &Outbox) -> Result<Self> {
        Ok(Self {
            message_id: outbox.message_id,
            completed: outbox.completed,
            actions: serde_json::from_value(outbox.actions.clone())?,
        })
    }

    fn to_outbox(&self) -> Result<Outbox> {
        Ok(Outbox {
            message_id: self.message_id,
            completed: self.completed,
            actions: serde_json::to_value(&self.actions)?,
        })
    }
}

/// A typed working copy of one saga instance.
///
/// `version` is the version this copy was read at; saving compares it
/// against the persisted one.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaInstance<D> {
    pub id: SagaId,
    pub state: State,
    pub version: Version,
    pub suspended: bool,
    pub data: D,
    pub pending: Option<PendingActions>,
}

impl<D: SagaData> SagaInstance<D> {
    /// Creates an unsaved instance with default data.
    pub fn new(id: SagaId, state: State) -> Self {
        Self {
            id,
            state,
            version: Version::initial(),
            suspended: false,
            data: D::default(),
            pending: None,
        }
    }

    /// Decodes a persisted record.
    pub fn from_record(record: &SagaRecord) -> Result<Self> {
        Ok(Self {
            id: record.id,
            state: State::new(record.state.clone()),
            version: record.version,
            suspended: record.suspended,
            data: record.data_as()?,
            pending: record
                .outbox
                .as_ref()
                .map(PendingActions::from_outbox)
                .transpose()?,
        })
    }

    /// Encodes the instance for the given saga type.
    pub fn to_record(&self, saga_type: &str) -> Result<SagaRecord> {
        let mut record = SagaRecord::from_data(self.id, saga_type, self.state.name(), &self.data)?
            .at_version(self.version);
        record.suspended = self.suspended;
        record.outbox = self
            .pending
            .as_ref()
            .map(PendingActions::to_outbox)
            .transpose()?;
        Ok(record)
    }

    /// Returns the data as JSON, for field-based correlation.
    pub fn data_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.data)?)
    }

    /// Returns true if the instance owes the actions of `message_id`.
    pub fn owes_actions_for(&self, message_id: MessageId) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.message_id == message_id)
    }

    /// Returns true if a completing delivery is still settling its actions.
    pub fn is_completing(&self) -> bool {
        self.pending.as_ref().is_some_and(|pending| pending.completed)
    }

    /// Returns true if the instance has never been saved.
    pub fn is_new(&self) -> bool {
        self.version == Version::initial()
    }
}
