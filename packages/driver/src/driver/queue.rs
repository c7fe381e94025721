use super::transaction::{Priority, Reducer, Transaction, TransactionReduction};
use crate::error::Error;
use std::collections::BinaryHeap;
use std::time::Instant;

struct QueuedTransaction {
    /// Monotonic sequence number, makes the ordering within a band stable
    seq: i64,
    transaction: Transaction,
}

impl PartialEq for QueuedTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTransaction {}

impl PartialOrd for QueuedTransaction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTransaction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: "greater" means dequeued first.
        // Higher priority (lower discriminant) wins, then lower sequence.
        other
            .transaction
            .priority
            .cmp(&self.transaction.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The send queue: strict priority between bands, FIFO within a band
#[derive(Default)]
pub struct TransactionQueue {
    heap: BinaryHeap<QueuedTransaction>,
    next_seq: i64,
    front_seq: i64,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, transaction: Transaction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTransaction { seq, transaction });
    }

    /// Enqueues ahead of everything already queued in the same band. Used
    /// when an already-dequeued transaction has to go back into the queue.
    pub fn push_front(&mut self, transaction: Transaction) {
        self.front_seq -= 1;
        let seq = self.front_seq;
        self.heap.push(QueuedTransaction { seq, transaction });
    }

    /// Pops the next transaction to execute, rejecting expired ones on the way
    pub fn pop(&mut self, now: Instant) -> Option<Transaction> {
        self.pop_allowed(now, |_| true)
    }

    /// Like [TransactionQueue::pop], but transactions the filter rejects are
    /// left in the queue in their position. Used to hold back wake-up
    /// traffic while its node sleeps.
    pub fn pop_allowed(
        &mut self,
        now: Instant,
        allowed: impl Fn(&Transaction) -> bool,
    ) -> Option<Transaction> {
        let mut skipped = Vec::new();
        let ret = loop {
            let Some(mut entry) = self.heap.pop() else {
                break None;
            };
            if entry.transaction.is_expired(now) {
                entry.transaction.settle(Err(Error::MessageExpired));
                continue;
            }
            if allowed(&entry.transaction) {
                break Some(entry.transaction);
            }
            skipped.push(entry);
        };
        // The skipped entries keep their sequence numbers and thus their order
        self.heap.extend(skipped);
        ret
    }

    /// Visits every queued transaction without changing the queue
    pub fn peek_all(&self, f: &mut dyn FnMut(&Transaction)) {
        for entry in self.heap.iter() {
            f(&entry.transaction);
        }
    }

    /// The earliest queued expiration, for timer scheduling
    pub fn next_expiration(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter_map(|entry| entry.transaction.expires_at)
            .min()
    }

    /// Rejects all transactions whose expiration has passed
    pub fn expire(&mut self, now: Instant) {
        if !self
            .heap
            .iter()
            .any(|entry| entry.transaction.is_expired(now))
        {
            return;
        }
        let reducer: Reducer = Box::new(move |t: &Transaction| {
            if t.is_expired(now) {
                TransactionReduction::Reject(Error::MessageExpired)
            } else {
                TransactionReduction::Keep
            }
        });
        self.apply_reducer(&reducer);
    }

    /// Applies a reducer to every queued transaction. Requeued transactions
    /// keep their relative order by keeping their sequence numbers.
    pub fn apply_reducer(&mut self, reducer: &Reducer) {
        let entries = std::mem::take(&mut self.heap).into_vec();
        for mut entry in entries {
            match reducer(&entry.transaction) {
                TransactionReduction::Keep => {
                    self.heap.push(entry);
                }
                TransactionReduction::Drop => {
                    entry.transaction.settle(Err(Error::MessageDropped));
                }
                TransactionReduction::Reject(error) => {
                    entry.transaction.settle(Err(error));
                }
                TransactionReduction::Resolve(message) => {
                    entry.transaction.settle(Ok(message));
                }
                TransactionReduction::Requeue { priority, tag } => {
                    if entry.transaction.original_priority.is_none()
                        && priority != entry.transaction.priority
                    {
                        entry.transaction.original_priority =
                            Some(entry.transaction.priority);
                    }
                    entry.transaction.priority = priority;
                    if let Some(tag) = tag {
                        entry.transaction.tag = Some(tag);
                    }
                    self.heap.push(entry);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::transaction::TransactionResult;
    use futures::channel::oneshot;
    use zwh_core::prelude::*;
    use zwh_serial::prelude::*;

    fn transaction(
        priority: Priority,
        node_id: u8,
    ) -> (Transaction, oneshot::Receiver<TransactionResult>) {
        let message: Message = SendDataRequest::builder()
            .node_id(node_id)
            .command(zwh_cc::prelude::BasicCCGet::default().into())
            .build()
            .into();
        Transaction::new(priority, message)
    }

    #[test]
    fn test_priority_dominance() {
        let mut queue = TransactionQueue::new();
        let now = Instant::now();

        let (normal, _rx1) = transaction(Priority::Normal, 2);
        let (nonce, _rx2) = transaction(Priority::Nonce, 3);
        let (poll, _rx3) = transaction(Priority::Poll, 4);
        queue.push(normal);
        queue.push(nonce);
        queue.push(poll);

        assert_eq!(queue.pop(now).unwrap().priority, Priority::Nonce);
        assert_eq!(queue.pop(now).unwrap().priority, Priority::Normal);
        assert_eq!(queue.pop(now).unwrap().priority, Priority::Poll);
        assert!(queue.pop(now).is_none());
    }

    #[test]
    fn test_fifo_within_band() {
        let mut queue = TransactionQueue::new();
        let now = Instant::now();

        for node in 1..=5u8 {
            let (t, _rx) = transaction(Priority::Normal, node);
            queue.push(t);
        }

        for node in 1..=5u8 {
            let popped = queue.pop(now).unwrap();
            assert_eq!(popped.node_id, Some(NodeId::new(node)));
        }
    }

    #[test]
    fn test_requeue_preserves_relative_order() {
        let mut queue = TransactionQueue::new();
        let now = Instant::now();

        let mut receivers = Vec::new();
        for node in [5u8, 5, 6, 5] {
            let (t, rx) = transaction(Priority::Normal, node);
            queue.push(t);
            receivers.push(rx);
        }

        // Move node 5's traffic to the wake-up band
        let reducer: Reducer = Box::new(|t: &Transaction| {
            if t.node_id == Some(NodeId::new(5u8)) {
                TransactionReduction::Requeue {
                    priority: Priority::WakeUp,
                    tag: None,
                }
            } else {
                TransactionReduction::Keep
            }
        });
        queue.apply_reducer(&reducer);

        // Node 6 is still Normal and dequeues first
        assert_eq!(queue.pop(now).unwrap().node_id, Some(NodeId::new(6u8)));
        // Node 5's transactions follow in their original order
        let a = queue.pop(now).unwrap();
        let b = queue.pop(now).unwrap();
        let c = queue.pop(now).unwrap();
        assert!(a.priority == Priority::WakeUp);
        assert!(b.priority == Priority::WakeUp);
        assert!(c.priority == Priority::WakeUp);
    }

    #[test]
    fn test_expired_transaction_rejected() {
        let mut queue = TransactionQueue::new();
        let now = Instant::now();

        let (t, mut rx) = transaction(Priority::Normal, 2);
        let t = t.with_expiration(now + std::time::Duration::from_millis(200));
        queue.push(t);

        // Not expired yet
        queue.expire(now);
        assert_eq!(queue.len(), 1);

        // Expired now
        queue.expire(now + std::time::Duration::from_millis(201));
        assert!(queue.is_empty());
        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::MessageExpired)));
    }

    #[test]
    fn test_reducer_drop_settles_promise() {
        let mut queue = TransactionQueue::new();

        let (t, mut rx) = transaction(Priority::Ping, 5);
        queue.push(t);

        let reducer: Reducer = Box::new(|_t: &Transaction| TransactionReduction::Drop);
        queue.apply_reducer(&reducer);

        assert!(queue.is_empty());
        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::MessageDropped)));
    }
}
