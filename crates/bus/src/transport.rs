//! Transport contract and the in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::Endpoint;
use messaging::Envelope;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::{BusError, Result};

/// Delivers envelopes between endpoints.
///
/// Concrete wire transports live outside this crate and implement this
/// trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueues an envelope at `endpoint`.
    async fn send(&self, endpoint: &Endpoint, envelope: Envelope) -> Result<()>;

    /// Delivers an envelope to every endpoint subscribed to one of its
    /// applicable types. Returns the number of endpoints reached.
    async fn publish(&self, envelope: Envelope) -> Result<usize>;

    /// Subscribes `endpoint` to published messages of `message_type`.
    async fn subscribe(&self, message_type: &str, endpoint: &Endpoint) -> Result<()>;

    /// Returns the receiving side of `endpoint`.
    async fn inbox(&self, endpoint: &Endpoint) -> Arc<dyn Inbox>;
}

/// Receiving side of one endpoint.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Waits for the next envelope. `None` once the endpoint is closed.
    async fn receive(&self) -> Option<Envelope>;
}

struct Queue {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

#[async_trait]
impl Inbox for Queue {
    async fn receive(&self) -> Option<Envelope> {
        self.receiver.lock().await.recv().await
    }
}

type History = Arc<RwLock<Vec<(Endpoint, Envelope)>>>;

/// In-process transport backed by unbounded per-endpoint queues.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    queues: Arc<RwLock<HashMap<Endpoint, Arc<Queue>>>>,
    subscriptions: Arc<RwLock<HashMap<String, Vec<Endpoint>>>>,
    history: Option<History>,
}

impl InMemoryTransport {
    /// Creates a transport with no endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that also keeps a copy of every delivery, for
    /// inspection with [`sent_to`](Self::sent_to). The history is never
    /// trimmed.
    pub fn with_history() -> Self {
        Self {
            history: Some(History::default()),
            ..Self::default()
        }
    }

    /// Returns every envelope delivered to `endpoint`, in delivery order.
    /// Empty unless the transport was created [`with_history`](Self::with_history).
    pub async fn sent_to(&self, endpoint: &Endpoint) -> Vec<Envelope> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        history
            .read()
            .await
            .iter()
            .filter(|(to, _)| to == endpoint)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Removes and returns every envelope queued at `endpoint`.
    pub async fn drain(&self, endpoint: &Endpoint) -> Vec<Envelope> {
        let queue = self.queue(endpoint).await;
        let mut receiver = queue.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            drained.push(envelope);
        }
        drained
    }

    async fn queue(&self, endpoint: &Endpoint) -> Arc<Queue> {
        if let Some(queue) = self.queues.read().await.get(endpoint) {
            return queue.clone();
        }
        self.queues
            .write()
            .await
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(Queue::new()))
            .clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, endpoint: &Endpoint, mut envelope: Envelope) -> Result<()> {
        envelope.headers.destination = Some(endpoint.clone());
        let queue = self.queue(endpoint).await;
        if let Some(history) = &self.history {
            history
                .write()
                .await
                .push((endpoint.clone(), envelope.clone()));
        }
        queue.sender.send(envelope).map_err(|error| BusError::Transport {
            endpoint: endpoint.clone(),
            reason: error.to_string(),
        })?;
        tracing::trace!(%endpoint, "envelope enqueued");
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<usize> {
        let endpoints = {
            let subscriptions = self.subscriptions.read().await;
            let mut endpoints: Vec<Endpoint> = Vec::new();
            for message_type in envelope.message.applicable_types() {
                for endpoint in subscriptions.get(message_type).into_iter().flatten() {
                    if !endpoints.contains(endpoint) {
                        endpoints.push(endpoint.clone());
                    }
                }
            }
            endpoints
        };

        for endpoint in &endpoints {
            self.send(endpoint, envelope.clone()).await?;
        }
        Ok(endpoints.len())
    }

    async fn subscribe(&self, message_type: &str, endpoint: &Endpoint) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscribers = subscriptions.entry(message_type.to_string()).or_default();
        if !subscribers.contains(endpoint) {
            subscribers.push(endpoint.clone());
        }
        Ok(())
    }

    async fn inbox(&self, endpoint: &Endpoint) -> Arc<dyn Inbox> {
        self.queue(endpoint).await
    }
}
