use crate::error::{Error, Result};
use futures::channel::oneshot;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Sync + Send>;

/// The registry behind `wait_for_message` / `wait_for_command`: pending
/// awaiters in insertion order, each with a matching predicate and an
/// optional deadline. The first matching awaiter consumes an observed value.
///
/// Deadlines are data, like every other timer in this driver: the registry
/// never sleeps. The driver actor folds [AwaitedRegistry::next_expiration]
/// into its wakeup deadline and calls [AwaitedRegistry::expire] when it
/// fires, which settles overdue awaiters with [Error::Timeout]. On shutdown
/// the actor rejects whatever is left, so no caller outlives the driver.
pub struct AwaitedRegistry<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    next_id: u64,
    entries: Vec<AwaitedEntry<T>>,
}

struct AwaitedEntry<T> {
    id: u64,
    predicate: Predicate<T>,
    expires_at: Option<Instant>,
    settle_tx: oneshot::Sender<Result<T>>,
}

impl<T> Default for AwaitedRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }
}

impl<T> AwaitedRegistry<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("lock on AwaitedRegistry poisoned")
    }

    /// Registers an awaiter. The returned [AwaitedRef] receives the first
    /// matching value, or [Error::Timeout] once the deadline passes, and
    /// deregisters itself when dropped.
    pub fn add(self: &Arc<Self>, predicate: Predicate<T>, timeout: Option<Duration>) -> AwaitedRef<T> {
        let (settle_tx, settle_rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(AwaitedEntry {
            id,
            predicate,
            expires_at: timeout.map(|t| Instant::now() + t),
            settle_tx,
        });
        AwaitedRef {
            id,
            registry: self.clone(),
            settle_rx: Some(settle_rx),
        }
    }

    /// Offers a value: the first awaiter whose predicate matches is removed
    /// and its settlement channel returned. The caller sends `Ok(value)`,
    /// which lets it skip the send when the value turns out unusable.
    pub fn take_matching(&self, value: &T) -> Option<oneshot::Sender<Result<T>>> {
        let mut inner = self.lock();
        let index = inner.entries.iter().position(|e| (e.predicate)(value))?;
        Some(inner.entries.remove(index).settle_tx)
    }

    /// The earliest deadline of any pending awaiter, for timer scheduling
    pub fn next_expiration(&self) -> Option<Instant> {
        self.lock()
            .entries
            .iter()
            .filter_map(|e| e.expires_at)
            .min()
    }

    /// Settles every awaiter whose deadline has passed with [Error::Timeout]
    pub fn expire(&self, now: Instant) {
        let overdue: Vec<AwaitedEntry<T>> = {
            let mut inner = self.lock();
            let (overdue, pending) = inner
                .entries
                .drain(..)
                .partition(|e| e.expires_at.is_some_and(|at| at <= now));
            inner.entries = pending;
            overdue
        };
        for entry in overdue {
            let _ = entry.settle_tx.send(Err(Error::Timeout));
        }
    }

    /// Settles every pending awaiter with an error. Part of the shutdown
    /// sequence: the scheduler is cancelled first, then the awaiters drain.
    pub fn reject_all(&self, error: impl Fn() -> Error) {
        let entries: Vec<AwaitedEntry<T>> = {
            let mut inner = self.lock();
            inner.entries.drain(..).collect()
        };
        for entry in entries {
            let _ = entry.settle_tx.send(Err(error()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn remove(&self, id: u64) {
        self.lock().entries.retain(|e| e.id != id);
    }
}

/// A handle to one pending awaiter
pub struct AwaitedRef<T> {
    id: u64,
    registry: Arc<AwaitedRegistry<T>>,
    settle_rx: Option<oneshot::Receiver<Result<T>>>,
}

impl<T> AwaitedRef<T> {
    /// Awaits the settlement: the matched value, [Error::Timeout] from the
    /// registry's deadline sweep, or the rejection from a driver shutdown.
    pub async fn try_await(mut self) -> Result<T> {
        let settle_rx = self
            .settle_rx
            .take()
            .expect("try_await may only be called once");
        match settle_rx.await {
            Ok(result) => result,
            // The registry disappeared without settling us
            Err(_) => Err(Error::Destroyed),
        }
    }
}

impl<T> Debug for AwaitedRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwaitedRef").field("id", &self.id).finish()
    }
}

impl<T> Drop for AwaitedRef<T> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_first_match_wins() {
        let registry: Arc<AwaitedRegistry<u8>> = Arc::new(AwaitedRegistry::default());

        let first = registry.add(Box::new(|v| *v > 10), None);
        let _second = registry.add(Box::new(|v| *v > 5), None);

        // Both predicates match, the earlier entry wins
        let channel = registry.take_matching(&20).unwrap();
        channel.send(Ok(20)).unwrap();
        let received = block_on(first.try_await()).unwrap();
        assert_eq!(received, 20);

        // The second entry is still registered
        assert!(registry.take_matching(&7).is_some());
    }

    #[test]
    fn test_dropping_ref_removes_entry() {
        let registry: Arc<AwaitedRegistry<u8>> = Arc::new(AwaitedRegistry::default());
        {
            let _awaited = registry.add(Box::new(|_| true), None);
            assert!(!registry.is_empty());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deadline_sweep() {
        // Deadlines are data: the test drives time explicitly
        let registry: Arc<AwaitedRegistry<u8>> = Arc::new(AwaitedRegistry::default());
        let now = Instant::now();

        let short = registry.add(Box::new(|_| true), Some(Duration::from_millis(10)));
        let long = registry.add(Box::new(|_| false), Some(Duration::from_millis(500)));

        let first_deadline = registry.next_expiration().unwrap();
        assert!(first_deadline <= now + Duration::from_millis(10));

        registry.expire(now + Duration::from_millis(11));
        let result = block_on(short.try_await());
        assert!(matches!(result, Err(Error::Timeout)));

        // The longer deadline is still pending
        assert!(!registry.is_empty());
        drop(long);
    }

    #[test]
    fn test_reject_all_on_shutdown() {
        let registry: Arc<AwaitedRegistry<u8>> = Arc::new(AwaitedRegistry::default());
        let awaited = registry.add(Box::new(|_| true), None);

        registry.reject_all(|| Error::Destroyed);
        let result = block_on(awaited.try_await());
        assert!(matches!(result, Err(Error::Destroyed)));
        assert!(registry.is_empty());
    }
}
