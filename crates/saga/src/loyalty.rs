//! Preferred-customer loyalty saga.
//!
//! Tracks the running order total of a customer. The first order that takes
//! the total past [`PREFERRED_THRESHOLD`] makes the customer preferred for
//! [`PREFERRED_STATUS_DAYS`] days; the status lapses when the scheduled
//! [`PreferredStatusExpired`] timeout comes back.

use chrono::Duration;
use messaging::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, SagaDefinition, State};

/// The saga type identifier for customer loyalty.
pub const SAGA_TYPE: &str = "CustomerLoyalty";

/// Running total an order must exceed to earn preferred status.
pub const PREFERRED_THRESHOLD: u64 = 5000;

/// How long preferred status lasts.
pub const PREFERRED_STATUS_DAYS: i64 = 365;

/// The only state: loyalty tracking never completes.
pub const START: State = State::from_static("Start");

/// An order was accepted for a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAccepted {
    pub customer_id: Uuid,
    pub amount: u64,
}

impl Message for OrderAccepted {
    fn message_type() -> &'static str {
        "OrderAccepted"
    }
}

/// A customer earned preferred status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerMadePreferred {
    pub customer_id: Uuid,
    pub running_total: u64,
}

impl Message for CustomerMadePreferred {
    fn message_type() -> &'static str {
        "CustomerMadePreferred"
    }
}

/// A customer's preferred status ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredStatusExpired {
    pub customer_id: Uuid,
}

impl Message for PreferredStatusExpired {
    fn message_type() -> &'static str {
        "PreferredStatusExpired"
    }
}

/// Per-customer loyalty data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyData {
    pub customer_id: Uuid,
    pub running_total: u64,
    pub preferred: bool,
}

impl LoyaltyData {
    fn record(&mut self, order: &OrderAccepted) {
        self.customer_id = order.customer_id;
        self.running_total = self.running_total.saturating_add(order.amount);
    }
}

/// Builds the loyalty saga definition.
pub fn definition() -> Result<SagaDefinition<LoyaltyData>> {
    SagaDefinition::<LoyaltyData>::builder(SAGA_TYPE, START)
        .started_by::<OrderAccepted>()
        .shared_key("customer_id")
        .when::<OrderAccepted>(&START)
        .only_if(|data, order| {
            !data.preferred && data.running_total.saturating_add(order.amount) > PREFERRED_THRESHOLD
        })
        .then_do(|data, order| {
            data.record(order);
            data.preferred = true;
        })
        .publish(|data, _| CustomerMadePreferred {
            customer_id: data.customer_id,
            running_total: data.running_total,
        })
        .delay(Duration::days(PREFERRED_STATUS_DAYS), |data, _| {
            PreferredStatusExpired {
                customer_id: data.customer_id,
            }
        })
        .when::<OrderAccepted>(&START)
        .then_do(|data, order| data.record(order))
        .when::<PreferredStatusExpired>(&START)
        .then_do(|data, _| data.preferred = false)
        .build()
}
