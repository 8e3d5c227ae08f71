//! Correlation of inbound messages to saga instances.

use std::collections::HashMap;
use std::sync::Arc;

use common::SagaId;
use messaging::{Message, TransportMessage};

use crate::{Result, SagaData, SagaDefinition, SagaInstance};

/// Custom lookup of the instance a message belongs to.
pub type Finder<D> =
    Arc<dyn Fn(&[SagaInstance<D>], &TransportMessage) -> Result<Option<SagaId>> + Send + Sync>;

/// Maps messages to saga instances.
///
/// Lookup order:
/// 1. a custom finder registered for the message type (its answer is final)
/// 2. `Correlate` predicates declared in the definition's conditions
/// 3. equality of the definition's shared key field in data and message
///
/// When several instances match, the lowest id wins.
pub struct Correlator<D> {
    finders: HashMap<&'static str, Finder<D>>,
}

impl<D> Default for Correlator<D> {
    fn default() -> Self {
        Self {
            finders: HashMap::new(),
        }
    }
}

impl<D: SagaData> Correlator<D> {
    /// Creates a correlator with no custom finders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom finder for `M`, replacing any previous one.
    pub fn register_finder<M, F>(&mut self, finder: F)
    where
        M: Message,
        F: Fn(&[SagaInstance<D>], &M) -> Option<SagaId> + Send + Sync + 'static,
    {
        let finder: Finder<D> = Arc::new(
            move |instances: &[SagaInstance<D>], message: &TransportMessage| {
                Ok(finder(instances, &message.decode::<M>()?))
            },
        );
        self.finders.insert(M::message_type(), finder);
    }

    /// Returns true if a custom finder handles the message.
    pub fn has_finder(&self, message: &TransportMessage) -> bool {
        self.finder_for(message).is_some()
    }

    /// Returns the id of the instance `message` belongs to, if any.
    pub fn correlate(
        &self,
        definition: &SagaDefinition<D>,
        instances: &[SagaInstance<D>],
        message: &TransportMessage,
    ) -> Result<Option<SagaId>> {
        if let Some(finder) = self.finder_for(message) {
            return finder(instances, message);
        }

        let predicates: Vec<_> = definition.correlation_predicates(message).collect();
        if !predicates.is_empty() {
            let mut matching = Vec::new();
            for instance in instances {
                for predicate in &predicates {
                    if predicate(&instance.data, message)? {
                        matching.push(instance.id);
                        break;
                    }
                }
            }
            return Ok(lowest(definition.name(), message, matching));
        }

        let Some(key) = definition.shared_key() else {
            return Ok(None);
        };
        let Some(expected) = message.field(key).filter(|value| !value.is_null()) else {
            return Ok(None);
        };

        let mut matching = Vec::new();
        for instance in instances {
            if instance.data_value()?.get(key) == Some(expected) {
                matching.push(instance.id);
            }
        }
        Ok(lowest(definition.name(), message, matching))
    }

    fn finder_for(&self, message: &TransportMessage) -> Option<&Finder<D>> {
        message
            .applicable_types()
            .into_iter()
            .find_map(|message_type| self.finders.get(message_type))
    }
}

fn lowest(saga_type: &str, message: &TransportMessage, mut ids: Vec<SagaId>) -> Option<SagaId> {
    ids.sort();
    if ids.len() > 1 {
        tracing::warn!(
            saga_type,
            message_type = message.message_type(),
            candidates = ids.len(),
            "message correlates to several saga instances, using the lowest id"
        );
    }
    ids.into_iter().next()
}
