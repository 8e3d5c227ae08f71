//! Delivery of due timeouts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Endpoint;
use messaging::Envelope;
use persistence::{TimeoutStore, TimeoutStoreExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::transport::Transport;
use crate::Result;

/// Re-injects due timeout payloads into their endpoint.
///
/// Redelivered payloads arrive as ordinary envelopes, so sagas react to
/// timeouts exactly as to any other message.
pub struct TimeoutPoller {
    store: Arc<dyn TimeoutStore>,
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    interval: Duration,
}

impl TimeoutPoller {
    pub fn new(
        store: Arc<dyn TimeoutStore>,
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            endpoint,
            interval,
        }
    }

    /// Delivers every entry due at `now`, earliest first, returning how
    /// many were delivered.
    ///
    /// An entry is removed before its payload is sent, so a concurrent
    /// poller or cancellation cannot deliver it twice. It is put back if
    /// the send fails.
    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut delivered = 0;
        for entry in self.store.due(&self.endpoint, now).await? {
            if !self.store.remove(entry.id()).await? {
                continue;
            }

            let mut envelope = Envelope::new(entry.payload().clone());
            envelope.headers.local_endpoint = Some(self.endpoint.clone());
            if let Err(error) = self.transport.send(&self.endpoint, envelope).await {
                self.store.add(entry).await?;
                return Err(error);
            }

            metrics::counter!("timeouts_delivered_total").increment(1);
            tracing::debug!(timeout_id = %entry.id(), message_type = %entry.payload().message_type(), "timeout delivered");
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Polls on the configured interval until stopped.
    pub fn spawn(self) -> PollerHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.poll_once(Utc::now()).await {
                            tracing::warn!(%error, "timeout poll failed");
                        }
                    }
                }
            }
        });
        PollerHandle { shutdown, handle }
    }
}

/// A running poller.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops polling and waits for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            tracing::warn!(%error, "timeout poller task failed");
        }
    }
}
