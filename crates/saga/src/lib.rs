//! Declarative, message-driven sagas.
//!
//! This crate provides:
//! - [`SagaDefinition`], built with a fluent DSL of trigger conditions and actions
//! - [`engine::execute`], the pure interpreter of a definition against one message
//! - [`Correlator`], mapping messages to instances via finders, predicates or a shared key
//! - [`SagaRepository`], versioned saves with [`ConflictMerger`] reconciliation
//! - [`SagaRuntime`], tying these together behind the type-erased [`SagaHandler`]
//!
//! The [`loyalty`] module holds a complete saga: preferred-customer loyalty tracking.

pub mod correlation;
pub mod definition;
pub mod engine;
pub mod error;
pub mod instance;
pub mod loyalty;
pub mod merge;
pub mod repository;
pub mod runtime;
pub mod state;

pub use correlation::{Correlator, Finder};
pub use definition::{
    ConditionBuilder, MessageAction, SagaDefinition, SagaDefinitionBuilder, Trigger,
    TriggerCondition,
};
pub use engine::{Execution, SagaAction};
pub use error::{Result, SagaError};
pub use instance::{PendingActions, SagaData, SagaInstance};
pub use merge::{ConflictMerger, MergeWith, PreferPersisted, RejectConflicts, merge_with};
pub use repository::SagaRepository;
pub use runtime::{SagaHandler, SagaOutcome, SagaRuntime};
pub use state::State;
