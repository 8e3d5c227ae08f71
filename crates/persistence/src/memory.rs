use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    Endpoint, PersistenceError, Result, SagaId, SagaRecord, TimeoutEntry, TimeoutId, Version,
    store::{SagaStore, TimeoutStore, validate_record_for_save},
};

/// In-memory saga data store.
///
/// Provides the same compare-and-swap save semantics a shared database
/// store would, which makes it suitable for tests and single-process
/// deployments.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    records: Arc<RwLock<HashMap<SagaId, SagaRecord>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of persisted instances.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Removes every instance.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn find(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_all(&self, saga_type: &str) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|record| record.saga_type == saga_type)
            .cloned()
            .collect();
        matching.sort_by_key(|record| record.id);
        Ok(matching)
    }

    async fn save(&self, mut record: SagaRecord, expected: Version) -> Result<Version> {
        validate_record_for_save(&record)?;

        let mut records = self.records.write().await;
        let id = record.id;

        match records.get(&id) {
            Some(current) if current.version != expected => {
                tracing::debug!(%id, %expected, actual = %current.version, "saga version conflict");
                return Err(PersistenceError::VersionConflict {
                    id,
                    expected,
                    current: Box::new(current.clone()),
                });
            }
            None if expected != Version::initial() => {
                return Err(PersistenceError::InstanceNotFound(id));
            }
            _ => {}
        }

        let version = expected.next();
        record.version = version;
        records.insert(id, record);
        Ok(version)
    }

    async fn remove(&self, id: SagaId) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }
}

/// In-memory timeout store.
#[derive(Clone, Default)]
pub struct InMemoryTimeoutStore {
    entries: Arc<RwLock<HashMap<TimeoutId, TimeoutEntry>>>,
}

impl InMemoryTimeoutStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of scheduled entries across all endpoints.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Retrieves an entry by id.
    pub async fn get(&self, id: TimeoutId) -> Option<TimeoutEntry> {
        self.entries.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn add(&self, entry: TimeoutEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.id()) {
            return Err(PersistenceError::DuplicateTimeout(entry.id()));
        }
        entries.insert(entry.id(), entry);
        Ok(())
    }

    async fn remove(&self, id: TimeoutId) -> Result<bool> {
        Ok(self.entries.write().await.remove(&id).is_some())
    }

    async fn remove_requested_by(&self, requestor: SagaId) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .requestor()
                .is_none_or(|owner| owner.saga_id != requestor)
        });
        Ok(before - entries.len())
    }

    async fn find_all(&self, endpoint: &Endpoint) -> Result<Vec<TimeoutEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|entry| entry.endpoint() == endpoint)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SagaStoreExt, TimeoutStoreExt};
    use crate::timeout::Requestor;
    use chrono::{Duration, Utc};
    use messaging::TransportMessage;

    fn create_test_record(state: &str) -> SagaRecord {
        SagaRecord::new(
            SagaId::new(),
            "TestSaga",
            state,
            serde_json::json!({"total": 0}),
        )
    }

    fn payload(message_type: &str) -> TransportMessage {
        TransportMessage::from_parts(message_type, Vec::new(), None, serde_json::json!({}))
    }

    fn local() -> Endpoint {
        Endpoint::new("memory://local")
    }

    #[tokio::test]
    async fn save_new_record() {
        let store = InMemorySagaStore::new();
        let record = create_test_record("Start");
        let id = record.id;

        let version = store.save(record, Version::initial()).await.unwrap();
        assert_eq!(version, Version::new(1));

        let found = store.find(id).await.unwrap().unwrap();
        assert_eq!(found.version, Version::new(1));
        assert_eq!(found.state, "Start");
    }

    #[tokio::test]
    async fn save_with_matching_version_increments() {
        let store = InMemorySagaStore::new();
        let record = create_test_record("Start");
        let id = record.id;
        store.save(record.clone(), Version::initial()).await.unwrap();

        let version = store.save(record, Version::new(1)).await.unwrap();
        assert_eq!(version, Version::new(2));
        assert_eq!(store.version_of(id).await.unwrap(), Some(Version::new(2)));
    }

    #[tokio::test]
    async fn stale_save_reports_current_record() {
        let store = InMemorySagaStore::new();
        let mut record = create_test_record("Start");
        let id = record.id;
        store.save(record.clone(), Version::initial()).await.unwrap();

        record.state = "Elsewhere".to_string();
        store.save(record.clone(), Version::new(1)).await.unwrap();

        let result = store.save(record, Version::new(1)).await;
        match result {
            Err(PersistenceError::VersionConflict {
                id: conflict_id,
                expected,
                current,
            }) => {
                assert_eq!(conflict_id, id);
                assert_eq!(expected, Version::new(1));
                assert_eq!(current.version, Version::new(2));
                assert_eq!(current.state, "Elsewhere");
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_of_removed_instance_fails() {
        let store = InMemorySagaStore::new();
        let record = create_test_record("Start");
        let id = record.id;

        let result = store.save(record, Version::new(4)).await;
        assert!(matches!(result, Err(PersistenceError::InstanceNotFound(missing)) if missing == id));
    }

    #[tokio::test]
    async fn save_rejects_record_without_state() {
        let store = InMemorySagaStore::new();
        let result = store.save(create_test_record(""), Version::initial()).await;
        assert!(matches!(result, Err(PersistenceError::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn find_all_filters_by_saga_type() {
        let store = InMemorySagaStore::new();
        store.save(create_test_record("Start"), Version::initial()).await.unwrap();
        store.save(create_test_record("Start"), Version::initial()).await.unwrap();
        let other = SagaRecord::new(SagaId::new(), "OtherSaga", "Start", serde_json::json!({}));
        store.save(other, Version::initial()).await.unwrap();

        assert_eq!(store.find_all("TestSaga").await.unwrap().len(), 2);
        assert_eq!(store.find_all("OtherSaga").await.unwrap().len(), 1);
        assert_eq!(store.record_count().await, 3);
    }

    #[tokio::test]
    async fn remove_instance() {
        let store = InMemorySagaStore::new();
        let record = create_test_record("Start");
        let id = record.id;
        store.save(record.clone(), Version::initial()).await.unwrap();

        assert!(store.remove_record(&record).await.unwrap());
        assert!(!store.exists(id).await.unwrap());
        assert!(!store.remove(id).await.unwrap());
    }

    #[tokio::test]
    async fn add_and_find_timeouts_by_endpoint() {
        let store = InMemoryTimeoutStore::new();
        store
            .add(TimeoutEntry::new(local(), Duration::seconds(1), payload("A")))
            .await
            .unwrap();
        store
            .add(TimeoutEntry::new(
                Endpoint::new("memory://other"),
                Duration::seconds(1),
                payload("B"),
            ))
            .await
            .unwrap();

        let mine = store.find_all(&local()).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].payload().message_type(), "A");
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn duplicate_timeout_is_rejected() {
        let store = InMemoryTimeoutStore::new();
        let entry = TimeoutEntry::new(local(), Duration::seconds(1), payload("A"));
        store.add(entry.clone()).await.unwrap();

        let result = store.add(entry).await;
        assert!(matches!(result, Err(PersistenceError::DuplicateTimeout(_))));
    }

    #[tokio::test]
    async fn due_returns_earliest_first() {
        let store = InMemoryTimeoutStore::new();
        let now = Utc::now();
        let later = TimeoutEntry::created_at(now, local(), Duration::seconds(20), payload("Later"));
        let sooner = TimeoutEntry::created_at(now, local(), Duration::seconds(10), payload("Sooner"));
        let future = TimeoutEntry::created_at(now, local(), Duration::hours(1), payload("Future"));
        store.add(later).await.unwrap();
        store.add(future).await.unwrap();
        store.add(sooner).await.unwrap();

        let due = store.due(&local(), now + Duration::seconds(30)).await.unwrap();
        let types: Vec<_> = due.iter().map(|e| e.payload().message_type()).collect();
        assert_eq!(types, vec!["Sooner", "Later"]);
    }

    #[tokio::test]
    async fn remove_requested_by_cancels_only_that_instance() {
        let store = InMemoryTimeoutStore::new();
        let saga_id = SagaId::new();
        let requestor = Requestor {
            saga_id,
            saga_type: "TestSaga".to_string(),
        };
        for _ in 0..2 {
            store
                .add(
                    TimeoutEntry::new(local(), Duration::days(1), payload("A"))
                        .requested_by(requestor.clone()),
                )
                .await
                .unwrap();
        }
        let unrelated = TimeoutEntry::new(local(), Duration::days(1), payload("B"));
        let unrelated_id = unrelated.id();
        store.add(unrelated).await.unwrap();

        assert_eq!(store.remove_requested_by(saga_id).await.unwrap(), 2);
        assert_eq!(store.entry_count().await, 1);
        assert!(store.get(unrelated_id).await.is_some());
    }

    #[tokio::test]
    async fn remove_timeout_entry() {
        let store = InMemoryTimeoutStore::new();
        let entry = TimeoutEntry::new(local(), Duration::seconds(1), payload("A"));
        store.add(entry.clone()).await.unwrap();

        assert!(store.remove_entry(&entry).await.unwrap());
        assert!(!store.remove(entry.id()).await.unwrap());
    }
}
