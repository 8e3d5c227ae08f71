//! Message bus core.
//!
//! This crate provides:
//! - [`Bus`] / [`BusExt`], the facade handlers and sagas use to publish, send, reply and schedule
//! - [`ConsumerRegistry`], resolving a message to every interested handler and saga
//! - [`Dispatcher`], invoking resolved consumers and carrying out saga actions
//! - [`CallbackRegistry`], correlating replies with the requests that caused them
//! - [`MessageBus`], the composition root, with its [`WorkerPool`] and [`TimeoutPoller`]
//! - [`InMemoryTransport`] for tests and single-process deployments

pub mod callback;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod fault;
pub mod handler;
pub mod message_bus;
pub mod poller;
pub mod registry;
pub mod transport;
pub mod worker;

pub use callback::{Callback, CallbackExpired, CallbackId, CallbackOutcome, CallbackRegistry};
pub use collaborators::Collaborators;
pub use config::BusConfig;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{BusError, DispatchError, HandlerError, Result};
pub use facade::{Bus, BusExt, Endpoints, ScheduledTimeout};
pub use fault::{FaultHandler, ForwardToErrorEndpoint};
pub use handler::{Handles, HandlerInvoker, Invoker};
pub use message_bus::{MessageBus, MessageBusBuilder};
pub use poller::{PollerHandle, TimeoutPoller};
pub use registry::{ConsumerKind, ConsumerRegistry, HandlerChain, ResolvedConsumer};
pub use transport::{InMemoryTransport, Inbox, Transport};
pub use worker::{Delivery, RetryPolicy, WorkerPool};
