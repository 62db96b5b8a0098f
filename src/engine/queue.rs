//! Bounded FIFO of pending operations shared by all workers of a cluster.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::engine::operation::Operation;
use crate::error::QueueError;

/// Who is enqueueing.
///
/// Puts from the feeding threads themselves must never block on the queue
/// those same threads drain; capacity is a hard bound for external
/// producers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCaller {
    External,
    Feeder,
}

/// Multi-producer/multi-consumer blocking queue with age-based head
/// eviction and a sticky closed state. Close does not drop queued items;
/// drainers pull until empty.
pub struct OperationQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    /// Signalled when space frees up (put waiters).
    space: Condvar,
    /// Signalled when an item arrives or the queue closes (poll waiters).
    items: Condvar,
}

struct QueueState {
    pending: VecDeque<Operation>,
    closed: bool,
}

impl OperationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            space: Condvar::new(),
            items: Condvar::new(),
        }
    }

    /// Enqueue an operation, stamping its queue-admission time.
    ///
    /// Blocks while the queue is at capacity for external callers; feeder
    /// callers are admitted immediately regardless of capacity.
    pub fn put(&self, mut op: Operation, caller: QueueCaller) -> Result<(), QueueError> {
        let mut state = self.lock_state()?;
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if caller == QueueCaller::Feeder || state.pending.len() < self.capacity {
                op.stamp_queued(Instant::now());
                state.pending.push_back(op);
                self.items.notify_all();
                return Ok(());
            }
            state = self
                .space
                .wait(state)
                .map_err(|_| QueueError::LockPoisoned)?;
        }
    }

    /// Dequeue, blocking up to `timeout`. Returns `None` on timeout, on a
    /// spurious empty wake after close, or if the lock is poisoned.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Operation> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state().ok()?;
        loop {
            if let Some(op) = state.pending.pop_front() {
                self.space.notify_all();
                return Some(op);
            }
            if state.closed {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, wait) = self.items.wait_timeout(state, remaining).ok()?;
            state = guard;
            if wait.timed_out() && state.pending.is_empty() {
                return None;
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn poll_now(&self) -> Option<Operation> {
        let mut state = self.lock_state().ok()?;
        let op = state.pending.pop_front();
        if op.is_some() {
            self.space.notify_all();
        }
        op
    }

    /// Remove and return the head if it has been queued longer than
    /// `max_age`. FIFO order makes the head a good approximation of the
    /// oldest entry.
    pub fn evict_stale(&self, max_age: Duration) -> Option<Operation> {
        let mut state = self.lock_state().ok()?;
        let stale = state
            .pending
            .front()
            .and_then(|op| op.queued_at())
            .is_some_and(|at| at.elapsed() > max_age);
        if !stale {
            return None;
        }
        let op = state.pending.pop_front();
        self.space.notify_all();
        op
    }

    /// Atomically remove and return every queued operation.
    pub fn drain_all(&self) -> Vec<Operation> {
        let Ok(mut state) = self.lock_state() else {
            return Vec::new();
        };
        let drained = state.pending.drain(..).collect();
        self.space.notify_all();
        drained
    }

    /// Flip the sticky closed flag. Idempotent; wakes every waiter.
    pub fn close(&self) {
        if let Ok(mut state) = self.lock_state() {
            state.closed = true;
            self.items.notify_all();
            self.space.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.lock_state().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().map(|s| s.closed).unwrap_or(true)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use bytes::Bytes;

    use super::*;

    fn op(id: &str) -> Operation {
        Operation::new(id, Bytes::from_static(b"x"))
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = OperationQueue::new(8);
        queue.put(op("a"), QueueCaller::External).unwrap();
        queue.put(op("b"), QueueCaller::External).unwrap();

        assert_eq!(queue.poll_now().unwrap().id.as_str(), "a");
        assert_eq!(queue.poll_now().unwrap().id.as_str(), "b");
        assert!(queue.poll_now().is_none());
    }

    #[test]
    fn external_put_blocks_until_space() {
        let queue = Arc::new(OperationQueue::new(1));
        queue.put(op("first"), QueueCaller::External).unwrap();

        let unblocked = Arc::new(AtomicUsize::new(0));
        let q = Arc::clone(&queue);
        let flag = Arc::clone(&unblocked);
        let producer = thread::spawn(move || {
            q.put(op("second"), QueueCaller::External).unwrap();
            flag.store(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(unblocked.load(Ordering::SeqCst), 0, "put should block");

        assert!(queue.poll_now().is_some());
        producer.join().unwrap();
        assert_eq!(unblocked.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn feeder_put_never_blocks_on_full_queue() {
        let queue = OperationQueue::new(1);
        queue.put(op("a"), QueueCaller::External).unwrap();
        queue.put(op("b"), QueueCaller::Feeder).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn put_after_close_fails() {
        let queue = OperationQueue::new(4);
        queue.close();
        queue.close(); // idempotent
        assert_eq!(
            queue.put(op("a"), QueueCaller::External),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn close_does_not_drop_queued_items() {
        let queue = OperationQueue::new(4);
        queue.put(op("a"), QueueCaller::External).unwrap();
        queue.close();

        assert_eq!(queue.poll_now().unwrap().id.as_str(), "a");
        assert!(queue.poll_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn close_wakes_blocked_pollers() {
        let queue = Arc::new(OperationQueue::new(4));
        let q = Arc::clone(&queue);
        let poller = thread::spawn(move || q.poll_timeout(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(poller.join().unwrap().is_none());
    }

    #[test]
    fn poll_timeout_returns_none_when_idle() {
        let queue = OperationQueue::new(4);
        let start = Instant::now();
        assert!(queue.poll_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn evict_stale_inspects_only_the_head() {
        let queue = OperationQueue::new(4);
        queue.put(op("old"), QueueCaller::External).unwrap();
        thread::sleep(Duration::from_millis(30));
        queue.put(op("young"), QueueCaller::External).unwrap();

        let evicted = queue.evict_stale(Duration::from_millis(10)).unwrap();
        assert_eq!(evicted.id.as_str(), "old");
        // Head is now young; nothing further to evict.
        assert!(queue.evict_stale(Duration::from_millis(10)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_all_empties_the_queue() {
        let queue = OperationQueue::new(4);
        queue.put(op("a"), QueueCaller::External).unwrap();
        queue.put(op("b"), QueueCaller::External).unwrap();

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
