//! Composition root for a bus host process.
//!
//! Wires the loyalty saga and its notification handler into a
//! [`MessageBus`] configured from the environment.

pub mod config;
pub mod error;

use std::sync::Arc;

use async_trait::async_trait;
use bus::{Bus, BusConfig, HandlerError, Handles, MessageBus};
use saga::loyalty::{self, CustomerMadePreferred};

pub use error::{HostError, Result};

/// Logs every customer that reaches preferred status.
pub struct PreferredCustomerNotifier;

#[async_trait]
impl Handles<CustomerMadePreferred> for PreferredCustomerNotifier {
    async fn handle(
        &self,
        event: CustomerMadePreferred,
        bus: &dyn Bus,
    ) -> std::result::Result<(), HandlerError> {
        tracing::info!(
            customer_id = %event.customer_id,
            running_total = event.running_total,
            endpoint = %bus.endpoints().local,
            "customer made preferred"
        );
        metrics::counter!("customers_made_preferred_total").increment(1);
        Ok(())
    }
}

/// Builds the host's bus.
pub async fn build_bus(config: BusConfig) -> Result<MessageBus> {
    let bus = MessageBus::builder(config)
        .saga(loyalty::definition()?)
        .consumes::<CustomerMadePreferred, _>(Arc::new(PreferredCustomerNotifier))
        .build()
        .await?;
    Ok(bus)
}
