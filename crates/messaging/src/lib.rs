//! Message model for the message bus.
//!
//! This crate provides the transport-independent message abstractions:
//! - [`Message`] trait for bus-transportable types and the contracts they implement
//! - [`TransportMessage`], the type-erased form every component routes and persists
//! - [`Envelope`] with its header (stage trace, addressing) and footer (captured errors)
//! - [`Capability`] tags a consumer declares interest with
//! - [`MessageSchema`] / [`MessageBuilder`] for contract-shaped messages with no concrete type

pub mod builder;
pub mod capability;
pub mod envelope;
pub mod error;
pub mod message;

pub use builder::{FieldKind, MessageBuilder, MessageSchema};
pub use capability::Capability;
pub use envelope::{CapturedError, Envelope, Footer, Headers, Stage};
pub use error::{MessageError, Result};
pub use message::{CORRELATED_CONTRACT, Message, TransportMessage};
