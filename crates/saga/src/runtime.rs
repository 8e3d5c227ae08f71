//! Execution of one saga definition against inbound messages.

use std::sync::Arc;

use async_trait::async_trait;
use common::{MessageId, SagaId};
use messaging::{Message, TransportMessage};
use persistence::{PersistenceError, SagaStore};

use crate::correlation::Correlator;
use crate::definition::{SagaDefinition, Trigger};
use crate::engine::{self, SagaAction};
use crate::merge::ConflictMerger;
use crate::repository::SagaRepository;
use crate::{PendingActions, Result, SagaData, SagaError, SagaInstance, State};

/// What handling one message did to a saga.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaOutcome {
    /// The saga type.
    pub saga_type: String,

    /// The instance the message was correlated to (or created for).
    pub saga_id: SagaId,

    /// Whether the instance was created by this message.
    pub started: bool,

    /// Whether a trigger condition fired.
    pub matched: bool,

    /// Whether the saga completed and its data was removed.
    pub completed: bool,

    /// Whether the instance is suspended and the message was skipped.
    pub suspended: bool,

    /// Whether the message was a redelivery and `actions` were replayed
    /// from the outbox instead of running the saga again.
    pub replayed: bool,

    /// The instance's state afterwards.
    pub state: State,

    /// The delivery that was handled.
    pub message_id: MessageId,

    /// Side effects for the bus to carry out.
    pub actions: Vec<SagaAction>,

    /// Whether `actions` wait in the instance's outbox until acknowledged.
    pub pending: bool,
}

impl SagaOutcome {
    fn skipped(
        saga_type: &str,
        instance_id: SagaId,
        state: State,
        message_id: MessageId,
    ) -> Self {
        Self {
            saga_type: saga_type.to_string(),
            saga_id: instance_id,
            started: false,
            matched: false,
            completed: false,
            suspended: false,
            replayed: false,
            state,
            message_id,
            actions: Vec::new(),
            pending: false,
        }
    }

    fn replay<D>(saga_type: &str, instance: SagaInstance<D>, owed: PendingActions) -> Self {
        Self {
            saga_type: saga_type.to_string(),
            saga_id: instance.id,
            started: false,
            matched: true,
            completed: owed.completed,
            suspended: false,
            replayed: true,
            state: instance.state,
            message_id: owed.message_id,
            actions: owed.actions,
            pending: true,
        }
    }
}

/// A saga as the dispatcher sees it, independent of its data type.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    /// Returns the saga type name.
    fn saga_type(&self) -> &str;

    /// Returns the message types the saga reacts to, with their capability.
    fn triggers(&self) -> &[Trigger];

    /// Correlates, runs and persists the saga for one delivery.
    ///
    /// The resulting actions are saved with the instance. Handling the same
    /// `message_id` again replays them without running the saga twice.
    async fn handle(
        &self,
        message: &TransportMessage,
        message_id: MessageId,
    ) -> Result<SagaOutcome>;

    /// Settles the actions of `outcome` once they were carried out.
    async fn acknowledge(&self, outcome: &SagaOutcome) -> Result<()>;
}

/// Runs a [`SagaDefinition`] over a saga data store.
pub struct SagaRuntime<D> {
    definition: Arc<SagaDefinition<D>>,
    repository: SagaRepository<D>,
    correlator: Correlator<D>,
}

impl<D: SagaData> SagaRuntime<D> {
    /// Creates a runtime persisting to `store`.
    pub fn new(definition: SagaDefinition<D>, store: Arc<dyn SagaStore>) -> Self {
        let repository = SagaRepository::new(definition.name(), store);
        Self {
            definition: Arc::new(definition),
            repository,
            correlator: Correlator::new(),
        }
    }

    /// Registers a custom finder for `M`, preferred over default correlation.
    pub fn with_finder<M, F>(mut self, finder: F) -> Self
    where
        M: Message,
        F: Fn(&[SagaInstance<D>], &M) -> Option<SagaId> + Send + Sync + 'static,
    {
        self.correlator.register_finder::<M, F>(finder);
        self
    }

    /// Sets the merger used when saves conflict.
    pub fn with_merger(mut self, merger: impl ConflictMerger<D> + 'static) -> Self {
        self.repository = self.repository.with_merger(merger);
        self
    }

    /// Returns the definition.
    pub fn definition(&self) -> &SagaDefinition<D> {
        &self.definition
    }

    /// Returns the repository.
    pub fn repository(&self) -> &SagaRepository<D> {
        &self.repository
    }

    /// Finds an instance by id.
    pub async fn find(&self, id: SagaId) -> Result<Option<SagaInstance<D>>> {
        self.repository.find(id).await
    }

    /// Stops the instance from processing further messages.
    pub async fn suspend(&self, id: SagaId) -> Result<()> {
        self.set_suspended(id, true).await
    }

    /// Lets a suspended instance process messages again.
    pub async fn resume(&self, id: SagaId) -> Result<()> {
        self.set_suspended(id, false).await
    }

    async fn set_suspended(&self, id: SagaId, suspended: bool) -> Result<()> {
        let mut instance = self
            .repository
            .find(id)
            .await?
            .ok_or(PersistenceError::InstanceNotFound(id))?;
        if instance.suspended == suspended {
            return Ok(());
        }
        instance.suspended = suspended;
        let marker = TransportMessage::from_parts(
            if suspended { "SuspendSaga" } else { "ResumeSaga" },
            Vec::new(),
            None,
            serde_json::Value::Null,
        );
        self.repository.save(instance, &marker).await?;
        tracing::info!(saga_type = %self.definition.name(), saga_id = %id, suspended, "saga suspension changed");
        Ok(())
    }

    /// Correlates `message` to an instance, creating one for starting
    /// messages. Instances whose completion is still settling are gone as
    /// far as new messages are concerned.
    fn load_or_start(
        &self,
        instances: Vec<SagaInstance<D>>,
        message: &TransportMessage,
    ) -> Result<(SagaInstance<D>, bool)> {
        let instances: Vec<_> = instances
            .into_iter()
            .filter(|instance| !instance.is_completing())
            .collect();
        let correlated = self
            .correlator
            .correlate(&self.definition, &instances, message)?;

        let existing = correlated
            .and_then(|id| instances.into_iter().find(|instance| instance.id == id));
        match existing {
            Some(instance) => Ok((instance, false)),
            None if self.definition.can_start(message) => Ok((
                SagaInstance::new(SagaId::new(), self.definition.initial_state().clone()),
                true,
            )),
            None => Err(SagaError::NotFound {
                message_type: message.message_type().to_string(),
                saga_type: self.definition.name().to_string(),
                instance_id: correlated,
            }),
        }
    }
}

#[async_trait]
impl<D: SagaData> SagaHandler for SagaRuntime<D> {
    fn saga_type(&self) -> &str {
        self.definition.name()
    }

    fn triggers(&self) -> &[Trigger] {
        self.definition.triggers()
    }

    #[tracing::instrument(
        skip(self, message),
        fields(saga_type = %self.definition.name(), message_type = %message.message_type())
    )]
    async fn handle(
        &self,
        message: &TransportMessage,
        message_id: MessageId,
    ) -> Result<SagaOutcome> {
        let saga_type = self.definition.name();
        let mut instances = self.repository.find_all().await?;

        if let Some(index) = instances
            .iter()
            .position(|instance| instance.owes_actions_for(message_id))
        {
            let mut instance = instances.swap_remove(index);
            if let Some(owed) = instance.pending.take() {
                tracing::info!(saga_id = %instance.id, %message_id, "redelivered message, replaying owed actions");
                return Ok(SagaOutcome::replay(saga_type, instance, owed));
            }
        }

        let (mut instance, started) = self.load_or_start(instances, message)?;

        if instance.suspended {
            tracing::debug!(saga_id = %instance.id, "saga suspended, message skipped");
            let mut outcome = SagaOutcome::skipped(saga_type, instance.id, instance.state, message_id);
            outcome.started = started;
            outcome.suspended = true;
            return Ok(outcome);
        }

        let mut data = instance.data.clone();
        let execution = engine::execute(&self.definition, &instance.state, message, &mut data)?;

        if !execution.matched {
            // A fresh instance nothing applied to is discarded unsaved.
            tracing::debug!(saga_id = %instance.id, state = %instance.state, "no trigger condition matched");
            return Ok(SagaOutcome::skipped(saga_type, instance.id, instance.state, message_id));
        }

        if started {
            metrics::counter!("saga_instances_started_total").increment(1);
        }

        // Actions an earlier delivery never settled go out first.
        let mut actions = instance
            .pending
            .take()
            .map(|earlier| earlier.actions)
            .unwrap_or_default();
        actions.extend(execution.actions);

        let pending = execution.completed || !actions.is_empty();
        instance.data = data;
        instance.state = execution.next_state.clone();
        instance.pending = pending.then(|| PendingActions {
            message_id,
            completed: execution.completed,
            actions: actions.clone(),
        });
        instance = self.repository.save(instance, message).await?;
        tracing::debug!(saga_id = %instance.id, version = %instance.version, state = %instance.state, "saga saved");

        if execution.completed {
            metrics::counter!("saga_instances_completed_total").increment(1);
            tracing::info!(saga_id = %instance.id, "saga completed");
        }

        Ok(SagaOutcome {
            saga_type: saga_type.to_string(),
            saga_id: instance.id,
            started,
            matched: true,
            completed: execution.completed,
            suspended: false,
            replayed: false,
            state: execution.next_state,
            message_id,
            actions,
            pending,
        })
    }

    async fn acknowledge(&self, outcome: &SagaOutcome) -> Result<()> {
        if !outcome.pending {
            return Ok(());
        }
        self.repository
            .settle(outcome.saga_id, outcome.message_id)
            .await
    }
}
