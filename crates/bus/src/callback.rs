//! Request/reply correlation.
//!
//! Every `send` through the bus tracks a pending callback keyed by the
//! request envelope. Replies are matched back to it by `in_reply_to`, or by
//! expected reply type refined with the shared correlation id. A callback
//! completes exactly once: with the reply, or with [`CallbackOutcome::TimedOut`]
//! when its expiry timeout fires first.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Duration;
use common::{Endpoint, MessageId};
use messaging::{Envelope, Message, TransportMessage};
use persistence::{TimeoutEntry, TimeoutId, TimeoutStore};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{BusError, Result};

/// Unique identifier for a pending callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(Uuid);

impl CallbackId {
    /// Creates a new random callback ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a callback completed.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// A reply arrived.
    Replied(TransportMessage),

    /// The expiry timeout fired before any reply.
    TimedOut,
}

impl CallbackOutcome {
    /// Returns the reply, if one arrived.
    pub fn reply(&self) -> Option<&TransportMessage> {
        match self {
            CallbackOutcome::Replied(message) => Some(message),
            CallbackOutcome::TimedOut => None,
        }
    }

    /// Returns true if the callback expired.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, CallbackOutcome::TimedOut)
    }
}

/// Timeout payload expiring a pending callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackExpired {
    pub callback_id: CallbackId,
}

impl Message for CallbackExpired {
    fn message_type() -> &'static str {
        "CallbackExpired"
    }
}

type CompletionAction = Box<dyn FnOnce(CallbackOutcome) + Send + Sync>;

enum Completion {
    Waiter(oneshot::Sender<CallbackOutcome>),
    Action(CompletionAction),
}

struct PendingCallback {
    id: CallbackId,
    request_id: MessageId,
    correlation_id: Option<Uuid>,
    expected_reply: Option<String>,
    expiry: Option<TimeoutId>,
    completion: Completion,
}

impl PendingCallback {
    fn accepts(&self, reply: &TransportMessage) -> bool {
        self.expected_reply
            .as_deref()
            .is_none_or(|expected| reply.implements(expected))
    }

    fn expects(&self, reply: &TransportMessage) -> bool {
        self.expected_reply.is_some() && self.accepts(reply)
    }
}

#[derive(Default)]
struct Pending {
    entries: Vec<PendingCallback>,
    by_correlation: HashMap<Uuid, Vec<CallbackId>>,
}

impl Pending {
    fn position(&self, id: CallbackId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    fn matching(&self, reply: &Envelope) -> Option<usize> {
        let message = &reply.message;

        if let Some(request) = reply.headers.in_reply_to {
            let found = self
                .entries
                .iter()
                .position(|entry| entry.request_id == request && entry.accepts(message));
            if found.is_some() {
                return found;
            }
        }

        if let Some(correlation_id) = message.correlation_id() {
            let found = self
                .by_correlation
                .get(&correlation_id)
                .into_iter()
                .flatten()
                .filter_map(|id| self.position(*id))
                .find(|index| self.entries[*index].expects(message));
            if found.is_some() {
                return found;
            }
        }

        // Type match only where the correlation id cannot refine it.
        self.entries.iter().position(|entry| {
            entry.expects(message)
                && (entry.correlation_id.is_none() || message.correlation_id().is_none())
        })
    }

    fn remove(&mut self, index: usize) -> PendingCallback {
        let entry = self.entries.remove(index);
        if let Some(correlation_id) = entry.correlation_id
            && let Some(ids) = self.by_correlation.get_mut(&correlation_id)
        {
            ids.retain(|id| *id != entry.id);
            if ids.is_empty() {
                self.by_correlation.remove(&correlation_id);
            }
        }
        entry
    }
}

/// Pending callbacks of one bus instance.
///
/// Shares the timeout store with the bus so that "reply or expire,
/// whichever comes first" uses ordinary timeout delivery.
pub struct CallbackRegistry {
    pending: RwLock<Pending>,
    timeouts: Arc<dyn TimeoutStore>,
    endpoint: Endpoint,
}

impl CallbackRegistry {
    /// Creates a registry delivering expiries to `endpoint`.
    pub fn new(timeouts: Arc<dyn TimeoutStore>, endpoint: Endpoint) -> Self {
        Self {
            pending: RwLock::new(Pending::default()),
            timeouts,
            endpoint,
        }
    }

    /// Registers a pending callback for `request`.
    pub fn track(self: &Arc<Self>, request: &Envelope) -> Callback {
        let (sender, receiver) = oneshot::channel();
        let id = CallbackId::new();
        let correlation_id = request.message.correlation_id();

        let mut pending = self.write();
        if let Some(correlation_id) = correlation_id {
            pending
                .by_correlation
                .entry(correlation_id)
                .or_default()
                .push(id);
        }
        pending.entries.push(PendingCallback {
            id,
            request_id: request.id,
            correlation_id,
            expected_reply: None,
            expiry: None,
            completion: Completion::Waiter(sender),
        });
        drop(pending);

        tracing::debug!(callback_id = %id, request_id = %request.id, "callback registered");
        Callback {
            id,
            registry: Arc::clone(self),
            receiver: Some(receiver),
            armed: false,
        }
    }

    /// Completes the callback `reply` answers, if any.
    ///
    /// The callback is removed before its completion runs, so concurrent
    /// replies complete it at most once. A linked expiry is cancelled.
    #[tracing::instrument(skip(self, reply), fields(message_type = %reply.message.message_type()))]
    pub async fn correlate(&self, reply: &Envelope) -> Result<Option<CallbackId>> {
        let outcome = CallbackOutcome::Replied(reply.message.clone());
        let Some((id, expiry)) = self.complete(|pending| pending.matching(reply), outcome) else {
            return Ok(None);
        };

        if let Some(expiry) = expiry {
            self.timeouts.remove(expiry).await?;
        }
        metrics::counter!("callbacks_completed_total").increment(1);
        tracing::debug!(callback_id = %id, "callback completed");
        Ok(Some(id))
    }

    /// Completes a callback as timed out. Returns false if it already
    /// completed or was released.
    pub fn expire(&self, id: CallbackId) -> bool {
        let expired = self
            .complete(|pending| pending.position(id), CallbackOutcome::TimedOut)
            .is_some();
        if expired {
            metrics::counter!("callbacks_expired_total").increment(1);
            tracing::debug!(callback_id = %id, "callback expired");
        }
        expired
    }

    /// Drops a pending callback without completing it.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut pending = self.write();
        match pending.position(id) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns the number of pending callbacks.
    pub fn pending_count(&self) -> usize {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    fn complete(
        &self,
        select: impl FnOnce(&Pending) -> Option<usize>,
        outcome: CallbackOutcome,
    ) -> Option<(CallbackId, Option<TimeoutId>)> {
        let (id, expiry, action) = {
            let mut pending = self.write();
            let index = select(&pending)?;
            let entry = pending.remove(index);
            // Waiters are signalled under the lock so `Callback::register`
            // observes either the pending entry or the delivered outcome.
            let action = match entry.completion {
                Completion::Waiter(sender) => {
                    let _ = sender.send(outcome);
                    None
                }
                Completion::Action(action) => Some((action, outcome)),
            };
            (entry.id, entry.expiry, action)
        };

        if let Some((action, outcome)) = action {
            action(outcome);
        }
        Some((id, expiry))
    }

    fn update(&self, id: CallbackId, apply: impl FnOnce(&mut PendingCallback)) -> bool {
        let mut pending = self.write();
        match pending.position(id) {
            Some(index) => {
                apply(&mut pending.entries[index]);
                true
            }
            None => false,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Pending> {
        self.pending.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a pending callback, returned by `send`.
///
/// Dropping the handle without registering an action releases the
/// callback; replies then reach ordinary consumers.
pub struct Callback {
    id: CallbackId,
    registry: Arc<CallbackRegistry>,
    receiver: Option<oneshot::Receiver<CallbackOutcome>>,
    armed: bool,
}

impl Callback {
    /// Returns the callback ID.
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Restricts matching replies to `R` (or messages implementing it).
    pub fn expect<R: Message>(self) -> Self {
        self.expect_type(R::message_type())
    }

    /// Restricts matching replies to the named type.
    pub fn expect_type(self, message_type: impl Into<String>) -> Self {
        let message_type = message_type.into();
        self.registry.update(self.id, |entry| {
            entry.expected_reply = Some(message_type);
        });
        self
    }

    /// Expires the callback if no reply arrives within `delay`.
    pub async fn expire_after(self, delay: Duration) -> Result<Self> {
        let payload = TransportMessage::from_message(&CallbackExpired {
            callback_id: self.id,
        })?;
        let entry = TimeoutEntry::new(self.registry.endpoint.clone(), delay, payload);
        let timeout_id = entry.id();
        self.registry.timeouts.add(entry).await?;
        metrics::counter!("timeouts_scheduled_total").increment(1);

        let linked = self.registry.update(self.id, |pending| {
            pending.expiry = Some(timeout_id);
        });
        if !linked {
            self.registry.timeouts.remove(timeout_id).await?;
        }
        Ok(self)
    }

    /// Runs `action` exactly once when the callback completes.
    ///
    /// Runs immediately if the callback already completed.
    pub fn register<F>(mut self, action: F)
    where
        F: FnOnce(CallbackOutcome) + Send + Sync + 'static,
    {
        self.armed = true;
        let mut action: Option<CompletionAction> = Some(Box::new(action));
        self.registry.update(self.id, |entry| {
            if let Some(action) = action.take() {
                entry.completion = Completion::Action(action);
            }
        });

        if let Some(action) = action
            && let Some(mut receiver) = self.receiver.take()
            && let Ok(outcome) = receiver.try_recv()
        {
            action(outcome);
        }
    }

    /// Waits for the reply or the expiry.
    pub async fn into_reply(mut self) -> Result<CallbackOutcome> {
        let receiver = self
            .receiver
            .take()
            .ok_or(BusError::CallbackCancelled(self.id))?;
        receiver
            .await
            .map_err(|_| BusError::CallbackCancelled(self.id))
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if !self.armed {
            self.registry.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}
