//! Consumer capability tags.

use serde::{Deserialize, Serialize};

/// The way a consumer declares interest in a message type.
///
/// A single consumer may declare several capabilities, for several
/// message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Stateless handler for one message type.
    ConsumesOnce,

    /// Message that creates a saga instance when none correlates.
    StartedBy,

    /// Message that continues an existing saga instance.
    OrchestratedBy,

    /// Handler instance registered for the lifetime of the bus.
    TransientConsumerOf,
}

impl Capability {
    /// All capabilities, in lookup order.
    pub const ALL: [Capability; 4] = [
        Capability::ConsumesOnce,
        Capability::StartedBy,
        Capability::OrchestratedBy,
        Capability::TransientConsumerOf,
    ];

    /// Returns true for the capabilities only sagas declare.
    pub fn is_saga(&self) -> bool {
        matches!(self, Capability::StartedBy | Capability::OrchestratedBy)
    }

    /// Returns the capability name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ConsumesOnce => "ConsumesOnce",
            Capability::StartedBy => "StartedBy",
            Capability::OrchestratedBy => "OrchestratedBy",
            Capability::TransientConsumerOf => "TransientConsumerOf",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_capabilities() {
        assert!(!Capability::ConsumesOnce.is_saga());
        assert!(Capability::StartedBy.is_saga());
        assert!(Capability::OrchestratedBy.is_saga());
        assert!(!Capability::TransientConsumerOf.is_saga());
    }

    #[test]
    fn test_display() {
        assert_eq!(Capability::ConsumesOnce.to_string(), "ConsumesOnce");
        assert_eq!(Capability::StartedBy.to_string(), "StartedBy");
        assert_eq!(Capability::OrchestratedBy.to_string(), "OrchestratedBy");
        assert_eq!(
            Capability::TransientConsumerOf.to_string(),
            "TransientConsumerOf"
        );
    }
}
