//! Typed repository over a shared saga data store.

use std::sync::Arc;

use common::{MessageId, SagaId};
use messaging::TransportMessage;
use persistence::{PersistenceError, SagaStore};

use crate::merge::{ConflictMerger, RejectConflicts};
use crate::{Result, SagaData, SagaError, SagaInstance};

/// How many times a conflicting save is merged and retried.
pub const DEFAULT_MERGE_ATTEMPTS: u32 = 3;

/// Loads and saves the instances of one saga type.
///
/// Saves use optimistic concurrency: a working copy is only written if the
/// persisted version is still the one it was read at. On conflict the
/// configured [`ConflictMerger`] decides what to write instead.
pub struct SagaRepository<D> {
    saga_type: String,
    store: Arc<dyn SagaStore>,
    merger: Arc<dyn ConflictMerger<D>>,
    max_merge_attempts: u32,
}

impl<D: SagaData> SagaRepository<D> {
    /// Creates a repository that rejects conflicting saves.
    pub fn new(saga_type: impl Into<String>, store: Arc<dyn SagaStore>) -> Self {
        Self {
            saga_type: saga_type.into(),
            store,
            merger: Arc::new(RejectConflicts),
            max_merge_attempts: DEFAULT_MERGE_ATTEMPTS,
        }
    }

    /// Sets the conflict merger.
    pub fn with_merger(mut self, merger: impl ConflictMerger<D> + 'static) -> Self {
        self.merger = Arc::new(merger);
        self
    }

    /// Sets how many merges are attempted before giving up.
    pub fn with_max_merge_attempts(mut self, attempts: u32) -> Self {
        self.max_merge_attempts = attempts;
        self
    }

    /// Returns the saga type this repository serves.
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Finds an instance by id.
    pub async fn find(&self, id: SagaId) -> Result<Option<SagaInstance<D>>> {
        match self.store.find(id).await? {
            Some(record) if record.saga_type == self.saga_type => {
                Ok(Some(SagaInstance::from_record(&record)?))
            }
            _ => Ok(None),
        }
    }

    /// Returns every persisted instance.
    pub async fn find_all(&self) -> Result<Vec<SagaInstance<D>>> {
        self.store
            .find_all(&self.saga_type)
            .await?
            .iter()
            .map(SagaInstance::from_record)
            .collect()
    }

    /// Saves a working copy and returns it at its new version.
    ///
    /// A version conflict is handed to the merger together with the
    /// persisted copy and `message`; the merged copy is saved against the
    /// persisted version. Merge faults abort the save.
    #[tracing::instrument(skip(self, instance, message), fields(saga_type = %self.saga_type, saga_id = %instance.id))]
    pub async fn save(
        &self,
        instance: SagaInstance<D>,
        message: &TransportMessage,
    ) -> Result<SagaInstance<D>> {
        let id = instance.id;
        let mut working = instance;
        let mut merges = 0;

        loop {
            let record = working.to_record(&self.saga_type)?;
            match self.store.save(record, working.version).await {
                Ok(version) => {
                    working.version = version;
                    return Ok(working);
                }
                Err(PersistenceError::VersionConflict { current, .. }) => {
                    if merges >= self.max_merge_attempts {
                        return Err(SagaError::ConflictRetriesExhausted {
                            id,
                            attempts: merges,
                        });
                    }
                    merges += 1;
                    metrics::counter!("saga_merge_conflicts_total").increment(1);
                    tracing::info!(
                        expected = %working.version,
                        persisted = %current.version,
                        attempt = merges,
                        "merging concurrent saga update"
                    );

                    let persisted = SagaInstance::from_record(&current)?;
                    let mut merged = self.merger.merge(&working, &persisted, message)?;
                    merged.id = id;
                    merged.version = persisted.version;
                    // The actions of this delivery are owed whatever data won.
                    merged.pending = working.pending.take();
                    working = merged;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Clears the actions owed for `message_id` once they were carried out.
    ///
    /// An instance that delivery completed is removed instead. Nothing
    /// happens if the outbox already moved on to another delivery.
    #[tracing::instrument(skip(self), fields(saga_type = %self.saga_type))]
    pub async fn settle(&self, id: SagaId, message_id: MessageId) -> Result<()> {
        for _ in 0..=self.max_merge_attempts {
            let Some(mut instance) = self.find(id).await? else {
                return Ok(());
            };
            if !instance.owes_actions_for(message_id) {
                return Ok(());
            }
            if instance.is_completing() {
                self.store.remove(id).await?;
                return Ok(());
            }

            instance.pending = None;
            let record = instance.to_record(&self.saga_type)?;
            match self.store.save(record, instance.version).await {
                Ok(_) => return Ok(()),
                Err(PersistenceError::VersionConflict { .. }) => {
                    tracing::debug!(saga_id = %id, "outbox changed while settling, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SagaError::ConflictRetriesExhausted {
            id,
            attempts: self.max_merge_attempts,
        })
    }

    /// Removes an instance. Returns false if it was not persisted.
    pub async fn remove(&self, id: SagaId) -> Result<bool> {
        Ok(self.store.remove(id).await?)
    }
}
