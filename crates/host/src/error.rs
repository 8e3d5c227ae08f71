use bus::BusError;
use saga::SagaError;
use thiserror::Error;

/// Errors raised while composing the host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid saga definition: {0}")]
    Saga(#[from] SagaError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, HostError>;
