use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Endpoint, PersistenceError, Result, SagaId, SagaRecord, TimeoutEntry, TimeoutId, Version};

/// Core trait for saga data stores.
///
/// Stores are shared by every bus process working on the same sagas, so
/// saves are guarded by optimistic concurrency rather than locks.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Retrieves a saga instance by id.
    async fn find(&self, id: SagaId) -> Result<Option<SagaRecord>>;

    /// Retrieves every instance of a saga type.
    async fn find_all(&self, saga_type: &str) -> Result<Vec<SagaRecord>>;

    /// Saves a record.
    ///
    /// The save is atomic: it only succeeds if the persisted version equals
    /// `expected` (an absent record counts as [`Version::initial`]), in
    /// which case the record is stored at `expected.next()` and that
    /// version is returned. Otherwise fails with `VersionConflict`
    /// carrying the currently persisted record, or `InstanceNotFound` if
    /// the record was removed.
    async fn save(&self, record: SagaRecord, expected: Version) -> Result<Version>;

    /// Removes an instance. Returns false if it was not persisted.
    async fn remove(&self, id: SagaId) -> Result<bool>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Checks if an instance is persisted.
    async fn exists(&self, id: SagaId) -> Result<bool> {
        Ok(self.find(id).await?.is_some())
    }

    /// Gets the persisted version of an instance.
    async fn version_of(&self, id: SagaId) -> Result<Option<Version>> {
        Ok(self.find(id).await?.map(|record| record.version))
    }

    /// Removes the instance a record describes.
    async fn remove_record(&self, record: &SagaRecord) -> Result<bool> {
        self.remove(record.id).await
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Core trait for timeout stores.
///
/// Delivery pollers iterate entries while dispatch threads add and remove
/// them, so implementations must tolerate concurrent access.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Schedules an entry.
    async fn add(&self, entry: TimeoutEntry) -> Result<()>;

    /// Cancels an entry. Returns false if it was not scheduled.
    async fn remove(&self, id: TimeoutId) -> Result<bool>;

    /// Cancels every entry requested by a saga instance, returning how many
    /// were removed.
    async fn remove_requested_by(&self, requestor: SagaId) -> Result<usize>;

    /// Retrieves every entry owned by an endpoint, in no particular order.
    async fn find_all(&self, endpoint: &Endpoint) -> Result<Vec<TimeoutEntry>>;
}

/// Extension trait providing convenience methods for timeout stores.
#[async_trait]
pub trait TimeoutStoreExt: TimeoutStore {
    /// Retrieves the entries of an endpoint due at `now`, earliest first.
    async fn due(&self, endpoint: &Endpoint, now: DateTime<Utc>) -> Result<Vec<TimeoutEntry>> {
        let mut entries: Vec<_> = self
            .find_all(endpoint)
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect();
        entries.sort_by_key(|entry| entry.at());
        Ok(entries)
    }

    /// Cancels the given entry.
    async fn remove_entry(&self, entry: &TimeoutEntry) -> Result<bool> {
        self.remove(entry.id()).await
    }
}

// Blanket implementation for all TimeoutStore implementations
impl<T: TimeoutStore + ?Sized> TimeoutStoreExt for T {}

/// Validates a record before saving.
pub fn validate_record_for_save(record: &SagaRecord) -> Result<()> {
    if record.saga_type.is_empty() {
        return Err(PersistenceError::InvalidRecord(
            "Saga type must not be empty".to_string(),
        ));
    }
    if record.state.is_empty() {
        return Err(PersistenceError::InvalidRecord(format!(
            "Saga instance {} has no state",
            record.id
        )));
    }
    Ok(())
}
