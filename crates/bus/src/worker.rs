//! Dispatch workers draining the local endpoint.

use std::sync::Arc;

use futures_util::future::join_all;
use messaging::Envelope;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::DispatchError;
use crate::message_bus::MessageBus;
use crate::transport::Inbox;

/// Bounded redelivery of failed envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Redeliveries after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Returns true if an envelope that failed with `error` after
    /// `retries` redeliveries should be tried again.
    pub fn should_retry(&self, retries: u32, error: &DispatchError) -> bool {
        !error.is_permanent() && retries <= self.max_retries
    }
}

/// What a worker did with one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dispatch succeeded.
    Dispatched,

    /// Dispatch failed and the envelope was requeued.
    Retried,

    /// Dispatch failed for good; the fault handler has the envelope.
    Faulted,
}

/// Pool of tasks dispatching envelopes concurrently.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks reading from `inbox`.
    pub fn start(bus: MessageBus, inbox: Arc<dyn Inbox>, workers: usize, retry: RetryPolicy) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker| {
                let bus = bus.clone();
                let inbox = inbox.clone();
                let shutdown = shutdown.subscribe();
                tokio::spawn(run(worker, bus, inbox, retry, shutdown))
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = handles.len(), "dispatch workers started");
        Self { shutdown, handles }
    }

    /// Returns the number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops the workers after their current envelope.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        join_all(self.handles).await;
        tracing::info!("dispatch workers stopped");
    }
}

async fn run(
    worker: usize,
    bus: MessageBus,
    inbox: Arc<dyn Inbox>,
    retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.changed() => break,
            received = inbox.receive() => match received {
                Some(envelope) => envelope,
                None => break,
            },
        };
        process(&bus, retry, envelope).await;
    }
    tracing::debug!(worker, "worker exiting");
}

/// Dispatches one envelope, applying the retry policy on failure.
///
/// Failed envelopes get the error captured into their footer and are either
/// requeued at the local endpoint or handed to the fault handler.
pub async fn process(bus: &MessageBus, retry: RetryPolicy, mut envelope: Envelope) -> Delivery {
    let error = match bus.dispatch(&mut envelope).await {
        Ok(_) => return Delivery::Dispatched,
        Err(error) => error,
    };

    envelope.capture_error(error.consumer(), &error);
    envelope.headers.retries += 1;

    if retry.should_retry(envelope.headers.retries, &error) {
        tracing::warn!(
            message_id = %envelope.id,
            retries = envelope.headers.retries,
            %error,
            "dispatch failed, retrying"
        );
        let local = bus.config().endpoint.clone();
        match bus.transport().send(&local, envelope.clone()).await {
            Ok(()) => return Delivery::Retried,
            Err(send_error) => {
                tracing::error!(error = %send_error, "requeue failed");
            }
        }
    }

    if let Err(fault_error) = bus.fault_handler().dispatch_failed(envelope, &error).await {
        tracing::error!(error = %fault_error, "fault handler failed");
    }
    Delivery::Faulted
}
