//! Message handlers and the invokers built for them at registration.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use messaging::{Message, TransportMessage};

use crate::error::HandlerError;
use crate::facade::Bus;

/// A stateless consumer of `M`.
///
/// The bus is lent for the duration of the call only; handlers must not
/// try to keep it between dispatches.
///
/// A handler registered for a contract receives every message implementing
/// that contract, decoded through the contract's view.
#[async_trait]
pub trait Handles<M: Message>: Send + Sync {
    async fn handle(&self, message: M, bus: &dyn Bus) -> Result<(), HandlerError>;
}

/// Type-erased call into one `Handles<M>` implementation.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, message: &TransportMessage, bus: &dyn Bus) -> Result<(), HandlerError>;
}

/// Invoker decoding the transport message as `M` before calling `H`.
pub struct HandlerInvoker<H, M> {
    handler: Arc<H>,
    _message: PhantomData<fn() -> M>,
}

impl<H, M> HandlerInvoker<H, M> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<H, M> Invoker for HandlerInvoker<H, M>
where
    H: Handles<M> + 'static,
    M: Message,
{
    async fn invoke(&self, message: &TransportMessage, bus: &dyn Bus) -> Result<(), HandlerError> {
        let message = message.decode::<M>()?;
        self.handler.handle(message, bus).await
    }
}
