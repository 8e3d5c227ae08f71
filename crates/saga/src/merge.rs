//! Reconciliation of concurrent updates to one saga instance.

use messaging::TransportMessage;

use crate::{Result, SagaError, SagaInstance};

/// Produces the data to persist when a save finds a newer persisted version.
///
/// Receives the working copy (with this dispatch's changes applied), the
/// currently persisted copy and the message that triggered the save.
pub trait ConflictMerger<D>: Send + Sync {
    fn merge(
        &self,
        working: &SagaInstance<D>,
        persisted: &SagaInstance<D>,
        message: &TransportMessage,
    ) -> Result<SagaInstance<D>>;
}

/// Refuses every conflict. The save is aborted with a merge fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectConflicts;

impl<D: Send + Sync> ConflictMerger<D> for RejectConflicts {
    fn merge(
        &self,
        working: &SagaInstance<D>,
        persisted: &SagaInstance<D>,
        message: &TransportMessage,
    ) -> Result<SagaInstance<D>> {
        Err(SagaError::MergeFailed {
            id: working.id,
            reason: format!(
                "{} was processed against version {} but version {} is persisted",
                message.message_type(),
                working.version,
                persisted.version
            ),
        })
    }
}

/// Keeps the persisted copy, discarding this dispatch's changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferPersisted;

impl<D: Clone + Send + Sync> ConflictMerger<D> for PreferPersisted {
    fn merge(
        &self,
        _working: &SagaInstance<D>,
        persisted: &SagaInstance<D>,
        _message: &TransportMessage,
    ) -> Result<SagaInstance<D>> {
        Ok(persisted.clone())
    }
}

/// Merges with a closure.
pub struct MergeWith<F>(F);

/// Wraps a closure as a [`ConflictMerger`].
pub fn merge_with<D, F>(merge: F) -> MergeWith<F>
where
    F: Fn(&SagaInstance<D>, &SagaInstance<D>, &TransportMessage) -> Result<SagaInstance<D>>
        + Send
        + Sync,
{
    MergeWith(merge)
}

impl<D, F> ConflictMerger<D> for MergeWith<F>
where
    F: Fn(&SagaInstance<D>, &SagaInstance<D>, &TransportMessage) -> Result<SagaInstance<D>>
        + Send
        + Sync,
{
    fn merge(
        &self,
        working: &SagaInstance<D>,
        persisted: &SagaInstance<D>,
        message: &TransportMessage,
    ) -> Result<SagaInstance<D>> {
        (self.0)(working, persisted, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use common::SagaId;
    use persistence::Version;

    fn pair() -> (SagaInstance<u64>, SagaInstance<u64>) {
        let id = SagaId::new();
        let mut working = SagaInstance::new(id, State::new("Start"));
        working.version = Version::new(1);
        working.data = 10;
        let mut persisted = working.clone();
        persisted.version = Version::new(2);
        persisted.data = 7;
        (working, persisted)
    }

    fn trigger() -> TransportMessage {
        TransportMessage::from_parts("Tick", Vec::new(), None, serde_json::json!({}))
    }

    #[test]
    fn reject_conflicts_is_a_merge_fault() {
        let (working, persisted) = pair();
        let result = RejectConflicts.merge(&working, &persisted, &trigger());
        assert!(matches!(result, Err(SagaError::MergeFailed { id, .. }) if id == working.id));
    }

    #[test]
    fn prefer_persisted_keeps_persisted_data() {
        let (working, persisted) = pair();
        let merged = PreferPersisted.merge(&working, &persisted, &trigger()).unwrap();
        assert_eq!(merged.data, 7);
    }

    #[test]
    fn closure_merger() {
        let (working, persisted) = pair();
        let merger = merge_with(|working: &SagaInstance<u64>, persisted: &SagaInstance<u64>, _: &TransportMessage| {
            let mut merged = persisted.clone();
            merged.data = working.data.max(persisted.data);
            Ok(merged)
        });
        let merged = merger.merge(&working, &persisted, &trigger()).unwrap();
        assert_eq!(merged.data, 10);
    }
}
