//! Outstanding calls, keyed by request id.
//!
//! Every entry leaves the table exactly once: resolved by its response (or
//! `end` for streams), expired by its deadline, cancelled by the caller, or
//! dropped because a stream consumer fell too far behind. All paths go
//! through `DashMap::remove`, so whichever runs first wins and the others
//! see nothing. A response that arrives after its entry is gone is dropped.
//!
//! Resolution never waits on a consumer. It runs on the node's single
//! inbound task, and one unread stream must not hold up every other reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::envelope::{Envelope, EnvelopeError, EnvelopeKind};
use crate::identity::PeerId;

/// Delivery side of a streaming call.
#[derive(Clone)]
pub struct StreamSlot {
    tx: mpsc::Sender<Envelope>,
    overflowed: Arc<AtomicBool>,
}

impl StreamSlot {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            tx,
            overflowed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the call was dropped because its buffer was full. Shared
    /// with the consumer so it can tell overflow from a lost peer.
    pub fn overflow_flag(&self) -> Arc<AtomicBool> {
        self.overflowed.clone()
    }
}

/// Where a matching reply is delivered.
pub enum Completion {
    /// Single-response call.
    Single(oneshot::Sender<Envelope>),
    /// Streaming call; receives `stream`, `end` and error `response` envelopes.
    Stream(StreamSlot),
}

struct PendingCall {
    target: PeerId,
    deadline: Instant,
    completion: Completion,
}

/// What happened to an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// No pending entry: late, duplicate, or never ours.
    Unmatched,
    /// Entry exists but the reply came from a different peer.
    WrongSender,
    /// Stream buffer full; the call was ended.
    Overflowed,
}

#[derive(Default)]
pub struct PendingTable {
    calls: DashMap<Uuid, PendingCall>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call before its request is sent.
    pub fn register(
        &self,
        request_id: Uuid,
        target: PeerId,
        deadline: Instant,
        completion: Completion,
    ) -> Result<(), EnvelopeError> {
        match self.calls.entry(request_id) {
            Entry::Occupied(_) => Err(EnvelopeError::DuplicateRequestId(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    target,
                    deadline,
                    completion,
                });
                Ok(())
            }
        }
    }

    /// Routes a reply to its pending call without waiting on the consumer.
    pub fn resolve(&self, envelope: Envelope) -> Resolution {
        let id = envelope.request_id;
        let stream = {
            let Some(call) = self.calls.get(&id) else {
                debug!(request_id = %id, kind = %envelope.kind, "reply for unknown or resolved call dropped");
                return Resolution::Unmatched;
            };
            if call.target != envelope.sender_id {
                warn!(request_id = %id, from = %envelope.sender_id.short(), "reply from unexpected peer dropped");
                return Resolution::WrongSender;
            }
            match &call.completion {
                Completion::Stream(slot) if envelope.kind == EnvelopeKind::Stream => Some(slot.clone()),
                _ => None,
            }
        };

        if let Some(slot) = stream {
            // Intermediate stream item; the entry stays unless the consumer
            // is gone or too far behind.
            return match slot.tx.try_send(envelope) {
                Ok(()) => Resolution::Delivered,
                Err(TrySendError::Full(_)) => {
                    if self.calls.remove(&id).is_some() {
                        slot.overflowed.store(true, Ordering::SeqCst);
                        warn!(request_id = %id, "stream consumer fell behind, call ended");
                    }
                    Resolution::Overflowed
                }
                Err(TrySendError::Closed(_)) => {
                    self.calls.remove(&id);
                    Resolution::Unmatched
                }
            };
        }

        let Some((_, call)) = self.calls.remove(&id) else {
            return Resolution::Unmatched;
        };
        match call.completion {
            Completion::Single(tx) => {
                let _ = tx.send(envelope);
            }
            Completion::Stream(slot) => {
                if let Err(TrySendError::Full(envelope)) = slot.tx.try_send(envelope) {
                    // The terminal item waits for room off the dispatch path;
                    // nothing can follow it.
                    tokio::spawn(async move {
                        let _ = slot.tx.send(envelope).await;
                    });
                }
            }
        }
        Resolution::Delivered
    }

    /// Removes an entry whose deadline passed. False if it was already gone.
    pub fn expire(&self, request_id: &Uuid) -> bool {
        self.calls.remove(request_id).is_some()
    }

    /// Removes an entry on caller cancellation.
    pub fn cancel(&self, request_id: &Uuid) -> bool {
        self.calls.remove(request_id).is_some()
    }

    /// Pushes a stream call's deadline forward after activity.
    pub fn extend(&self, request_id: &Uuid, deadline: Instant) {
        if let Some(mut call) = self.calls.get_mut(request_id) {
            call.deadline = deadline;
        }
    }

    /// Drops every entry whose deadline is before `now`. Callers waiting on
    /// them observe a closed channel.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, call| call.deadline > now);
        before.saturating_sub(self.calls.len())
    }

    /// Drops every entry. Used when the session closes.
    pub fn clear(&self) {
        self.calls.clear();
    }

    pub fn contains(&self, request_id: &Uuid) -> bool {
        self.calls.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
