//! Diagnostic tap on a node's inbound subject.
//!
//! Sees every envelope addressed to this node (requests, responses, stream
//! items) exactly as it arrives, before any correlation. It never touches the
//! pending-call table, so listening does not steal replies from the RPC
//! engine: both subscribe to the same subject and each gets its own copy.

use std::future::Future;

use tracing::{debug, info, warn};

use crate::error::MeshResult;
use crate::network::{ConnectionManager, SubscriptionTask};
use crate::rpc::Envelope;

/// A running listener. Stops on [`cancel`](Self::cancel) or drop.
pub struct Listener {
    task: SubscriptionTask,
}

impl Listener {
    /// Invokes `handler` for every envelope parsed from the inbound subject.
    /// Unparseable messages are logged and skipped. Signatures are checked
    /// and the result is logged, but unverified envelopes are still passed
    /// on so they can be inspected.
    pub async fn start<F, Fut>(conn: &ConnectionManager, handler: F) -> MeshResult<Self>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subject = conn.inbound_subject();
        let task = conn
            .subscribe_with(&subject, move |msg| {
                let parsed = Envelope::from_bytes(&msg.payload);
                let delivery = match parsed {
                    Ok(envelope) => {
                        if let Err(e) = envelope.verify() {
                            warn!(request_id = %envelope.request_id, error = %e, "unverified envelope");
                        }
                        debug!(
                            request_id = %envelope.request_id,
                            kind = %envelope.kind,
                            action = %envelope.action,
                            "envelope observed"
                        );
                        Some(handler(envelope))
                    }
                    Err(e) => {
                        warn!(subject = %msg.subject, error = %e, "skipping unparseable message");
                        None
                    }
                };
                async move {
                    if let Some(delivery) = delivery {
                        delivery.await;
                    }
                }
            })
            .await?;
        info!(%subject, "listening");
        Ok(Self { task })
    }

    pub fn subject(&self) -> &str {
        self.task.subject()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancel(self) {
        self.task.cancel();
    }
}
