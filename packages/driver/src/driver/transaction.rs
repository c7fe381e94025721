use crate::error::Error;
use futures::channel::oneshot;
use std::time::Instant;
use zwh_core::prelude::*;
use zwh_serial::prelude::*;

/// The priority bands of the send queue, highest first.
/// Ties within a band are broken by enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Nonce replies for secure communication. Jump the queue so the peer's
    /// nonce timer does not expire.
    Nonce,
    /// Supervision reports on the reply path
    Supervision,
    /// Controller (non-radio) commands
    Controller,
    /// Pings to probe a node's liveness
    Ping,
    /// Steps of multi-message controller procedures
    MultistepController,
    /// Security handshakes initiated by the node
    Handshake,
    /// Security handshakes the driver performs before sending
    PreTransmitHandshake,
    /// Node interview traffic
    NodeQuery,
    Normal,
    /// Background polling
    Poll,
    /// Commands waiting for a sleeping node to wake up
    WakeUp,
}

/// What a settled transaction resolves to: the final message of the
/// exchange, if the message flow produced one
pub type TransactionResult = std::result::Result<Option<Message>, Error>;

/// One logical host -> network exchange, alive from enqueue until its
/// promise settles
pub struct Transaction {
    pub priority: Priority,
    /// Set when a reducer moved this transaction to a different band, so a
    /// later reducer can restore it
    pub original_priority: Option<Priority>,
    pub message: Message,
    /// Free-form label used by reducers to find related transactions
    pub tag: Option<String>,
    /// The node this transaction addresses, if any
    pub node_id: Option<NodeId>,
    /// Reject with [Error::MessageExpired] when still queued at this instant
    pub expires_at: Option<Instant>,
    /// Whether a radio timeout should update the node's liveness state
    pub change_node_status_on_timeout: bool,
    /// Pause the send queue once this transaction settles, e.g. around a
    /// soft reset
    pub pause_after_dispatch: bool,
    result_tx: Option<oneshot::Sender<TransactionResult>>,
}

impl Transaction {
    pub fn new(priority: Priority, message: Message) -> (Self, oneshot::Receiver<TransactionResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        let node_id = message.node_id();
        (
            Self {
                priority,
                original_priority: None,
                message,
                tag: None,
                node_id,
                expires_at: None,
                change_node_status_on_timeout: true,
                pause_after_dispatch: false,
                result_tx: Some(result_tx),
            },
            result_rx,
        )
    }

    /// Like [Transaction::new], but settling into a promise the caller
    /// already holds the receiving end of
    pub fn with_promise(
        priority: Priority,
        message: Message,
        result_tx: oneshot::Sender<TransactionResult>,
    ) -> Self {
        let node_id = message.node_id();
        Self {
            priority,
            original_priority: None,
            message,
            tag: None,
            node_id,
            expires_at: None,
            change_node_status_on_timeout: true,
            pause_after_dispatch: false,
            result_tx: Some(result_tx),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_expiration(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Settles the transaction's promise. Settling twice is a no-op, which
    /// keeps the "terminates exactly once" invariant even if a late callback
    /// races with a timeout.
    pub fn settle(&mut self, result: TransactionResult) {
        if let Some(tx) = self.result_tx.take() {
            // The caller may have dropped the receiver, which is fine
            let _ = tx.send(result);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.result_tx.is_none()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("priority", &self.priority)
            .field("message", &self.message)
            .field("tag", &self.tag)
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// What a reducer decides for one transaction
pub enum TransactionReduction {
    Keep,
    /// Settle with [Error::MessageDropped] and remove
    Drop,
    Reject(Error),
    Resolve(Option<Message>),
    /// Move to a different priority band (and optionally retag), keeping
    /// enqueue order relative to other requeued transactions
    Requeue {
        priority: Priority,
        tag: Option<String>,
    },
}

/// A pure function applied to every queued and active transaction under the
/// scheduler's lock. The sole mechanism for bulk queue surgery: moving a
/// sleeping node's traffic to the wake-up band, purging a removed node,
/// expiring transactions.
pub type Reducer = Box<dyn Fn(&Transaction) -> TransactionReduction + Send>;

#[cfg(test)]
mod test {
    use super::*;
    use zwh_serial::prelude::SoftResetRequest;

    #[test]
    fn test_settles_exactly_once() {
        let (mut transaction, mut rx) =
            Transaction::new(Priority::Normal, SoftResetRequest::default().into());
        assert!(!transaction.is_settled());

        transaction.settle(Ok(None));
        assert!(transaction.is_settled());
        // The second settlement is ignored
        transaction.settle(Err(Error::MessageDropped));

        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_priority_order() {
        // Strict priority: earlier variants dominate later ones
        assert!(Priority::Nonce < Priority::Supervision);
        assert!(Priority::Controller < Priority::Normal);
        assert!(Priority::Normal < Priority::WakeUp);
    }
}
