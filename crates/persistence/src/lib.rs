//! Durable state of the message bus.
//!
//! Two stores make up everything the bus persists:
//! - [`SagaStore`] holds versioned [`SagaRecord`]s, saved with optimistic concurrency
//! - [`TimeoutStore`] holds [`TimeoutEntry`]s scheduled for future delivery
//!
//! In-memory implementations of both live in [`memory`].

pub mod error;
pub mod memory;
pub mod record;
pub mod store;
pub mod timeout;

pub use common::{Endpoint, MessageId, SagaId};
pub use error::{PersistenceError, Result};
pub use memory::{InMemorySagaStore, InMemoryTimeoutStore};
pub use record::{Outbox, SagaRecord, Version};
pub use store::{SagaStore, SagaStoreExt, TimeoutStore, TimeoutStoreExt};
pub use timeout::{Requestor, TimeoutEntry, TimeoutId};
