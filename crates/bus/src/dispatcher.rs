//! Routing of one envelope to its consumers.

use std::sync::Arc;
use std::time::Instant;

use common::Endpoint;
use messaging::Envelope;
use persistence::{Requestor, TimeoutEntry, TimeoutStore};
use saga::{SagaAction, SagaOutcome};

use crate::callback::{CallbackExpired, CallbackId, CallbackRegistry};
use crate::error::DispatchError;
use crate::facade::Bus;
use crate::fault::FaultHandler;
use crate::registry::{ConsumerKind, ConsumerRegistry, ResolvedConsumer};
use crate::BusError;

/// What dispatching one envelope did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// The callback the envelope completed, as a reply.
    pub callback: Option<CallbackId>,

    /// The callback the envelope expired, as an expiry timeout.
    pub expired: Option<CallbackId>,

    /// Consumers invoked, in order.
    pub consumers: Vec<String>,

    /// Outcome of each saga consumer.
    pub saga_outcomes: Vec<SagaOutcome>,
}

impl DispatchReport {
    /// Returns true if a callback or at least one consumer took the envelope.
    pub fn was_consumed(&self) -> bool {
        self.callback.is_some() || self.expired.is_some() || !self.consumers.is_empty()
    }
}

/// Routes envelopes to callbacks, handlers and sagas.
pub struct Dispatcher {
    registry: Arc<ConsumerRegistry>,
    callbacks: Arc<CallbackRegistry>,
    timeouts: Arc<dyn TimeoutStore>,
    fault_handler: Arc<dyn FaultHandler>,
    local: Endpoint,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        callbacks: Arc<CallbackRegistry>,
        timeouts: Arc<dyn TimeoutStore>,
        fault_handler: Arc<dyn FaultHandler>,
        local: Endpoint,
    ) -> Self {
        Self {
            registry,
            callbacks,
            timeouts,
            fault_handler,
            local,
        }
    }

    /// Dispatches an envelope.
    ///
    /// A stage is recorded on the envelope before each consumer runs, so a
    /// failed envelope shows how far dispatch got. Consumer errors are
    /// wrapped in [`DispatchError::ConsumerFailed`] and stop the dispatch.
    #[tracing::instrument(
        skip_all,
        fields(message_id = %envelope.id, message_type = %envelope.message.message_type())
    )]
    pub async fn dispatch(
        &self,
        bus: &dyn Bus,
        envelope: &mut Envelope,
    ) -> Result<DispatchReport, DispatchError> {
        let started = Instant::now();
        let result = self.route(bus, envelope).await;
        metrics::histogram!("bus_dispatch_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => metrics::counter!("bus_messages_dispatched_total").increment(1),
            Err(error) => {
                metrics::counter!("bus_dispatch_failures_total").increment(1);
                tracing::debug!(%error, "dispatch failed");
            }
        }
        result
    }

    async fn route(
        &self,
        bus: &dyn Bus,
        envelope: &mut Envelope,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();

        if envelope.message.is::<CallbackExpired>() {
            let expired: CallbackExpired = envelope.message.decode().map_err(BusError::from)?;
            if self.callbacks.expire(expired.callback_id) {
                report.expired = Some(expired.callback_id);
            }
            return Ok(report);
        }

        report.callback = self.callbacks.correlate(envelope).await?;

        let consumers = self.registry.resolve_all(&envelope.message);
        if consumers.is_empty() {
            if report.callback.is_none() {
                metrics::counter!("bus_messages_without_consumer_total").increment(1);
                self.fault_handler.no_consumer(envelope).await?;
            }
            return Ok(report);
        }

        for consumer in consumers {
            envelope.record_stage(consumer.name.clone(), vec![consumer.message_type.clone()]);
            tracing::debug!(consumer = %consumer.name, capability = %consumer.capability, "invoking consumer");

            if let Some(outcome) = self.invoke(bus, envelope, &consumer).await? {
                report.saga_outcomes.push(outcome);
            }
            report.consumers.push(consumer.name);
        }
        Ok(report)
    }

    async fn invoke(
        &self,
        bus: &dyn Bus,
        envelope: &Envelope,
        consumer: &ResolvedConsumer,
    ) -> Result<Option<SagaOutcome>, DispatchError> {
        match &consumer.kind {
            ConsumerKind::Handler(invoker) => {
                invoker
                    .invoke(&envelope.message, bus)
                    .await
                    .map_err(|source| DispatchError::ConsumerFailed {
                        message_type: envelope.message.message_type().to_string(),
                        consumer: consumer.name.clone(),
                        source,
                    })?;
                Ok(None)
            }
            ConsumerKind::Saga(saga) => {
                let message_type = envelope.message.message_type();
                let outcome = saga
                    .handle(&envelope.message, envelope.id)
                    .await
                    .map_err(|error| DispatchError::from_saga(error, &consumer.name, message_type))?;
                self.apply(bus, &outcome)
                    .await
                    .map_err(|error| DispatchError::from_action(error, &consumer.name, message_type))?;
                saga.acknowledge(&outcome)
                    .await
                    .map_err(|error| DispatchError::from_saga(error, &consumer.name, message_type))?;
                Ok(Some(outcome))
            }
        }
    }

    /// Carries out the actions a saga emitted, in order. Completion cancels
    /// every timeout the instance still has outstanding.
    ///
    /// The actions stay in the instance's outbox until this succeeds, so a
    /// failure here is retried by redelivering the envelope.
    async fn apply(&self, bus: &dyn Bus, outcome: &SagaOutcome) -> crate::Result<()> {
        for action in &outcome.actions {
            match action {
                SagaAction::Publish(message) => bus.publish_message(message.clone()).await?,
                SagaAction::Send(message) => {
                    bus.send_message(None, message.clone()).await?;
                }
                SagaAction::SendToEndpoint(endpoint, message) => {
                    bus.send_message(Some(endpoint.clone()), message.clone())
                        .await?;
                }
                SagaAction::Reply(message) => bus.reply_message(message.clone()).await?,
                SagaAction::Delay { delay, message } => {
                    let entry = TimeoutEntry::new(self.local.clone(), *delay, message.clone())
                        .requested_by(Requestor {
                            saga_id: outcome.saga_id,
                            saga_type: outcome.saga_type.clone(),
                        });
                    tracing::debug!(
                        saga_id = %outcome.saga_id,
                        timeout_id = %entry.id(),
                        at = %entry.at(),
                        "saga timeout requested"
                    );
                    self.timeouts.add(entry).await?;
                    metrics::counter!("timeouts_scheduled_total").increment(1);
                }
            }
        }

        if outcome.completed {
            let cancelled = self.timeouts.remove_requested_by(outcome.saga_id).await?;
            tracing::info!(
                saga_type = %outcome.saga_type,
                saga_id = %outcome.saga_id,
                cancelled_timeouts = cancelled,
                "saga completed"
            );
        }
        Ok(())
    }
}
