//! Type-keyed lookup of shared collaborators (loggers, clients, ...).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Collaborators registered with the bus at composition time.
#[derive(Clone, Default)]
pub struct Collaborators {
    entries: HashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>,
}

impl Collaborators {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collaborator.
    pub fn register<T: Any + Send + Sync>(&mut self, collaborator: Arc<T>) {
        self.entries
            .entry(TypeId::of::<T>())
            .or_default()
            .push(collaborator);
    }

    /// Returns the first collaborator of type `T`.
    pub fn find<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())?
            .first()
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Returns every collaborator of type `T`.
    pub fn find_all<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .map(|entries| {
                entries
                    .iter()
                    .cloned()
                    .filter_map(|entry| entry.downcast::<T>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of registered collaborators.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct AuditLog(&'static str);

    #[test]
    fn find_by_type() {
        let mut collaborators = Collaborators::new();
        collaborators.register(Arc::new(AuditLog("primary")));
        collaborators.register(Arc::new(AuditLog("secondary")));
        collaborators.register(Arc::new(42_u32));

        assert_eq!(collaborators.find::<AuditLog>().unwrap().0, "primary");
        assert_eq!(collaborators.find_all::<AuditLog>().len(), 2);
        assert_eq!(*collaborators.find::<u32>().unwrap(), 42);
        assert_eq!(collaborators.len(), 3);
    }

    #[test]
    fn missing_type() {
        let collaborators = Collaborators::new();
        assert!(collaborators.find::<AuditLog>().is_none());
        assert!(collaborators.find_all::<AuditLog>().is_empty());
        assert!(collaborators.is_empty());
    }
}
