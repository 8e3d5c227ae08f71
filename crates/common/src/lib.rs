//! Shared identifiers and endpoint addresses.

pub mod types;

pub use types::{Endpoint, MessageId, SagaId};
