//! Closure-based deferred teardown
//!
//! Complements the [`GarbageCollector`](super::garbage::GarbageCollector) for
//! teardown that spans several objects, such as a command buffer's fence and
//! semaphore. Actions are queued per frame slot and run in FIFO order.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// A deferred teardown action
pub type FreeFn = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    current_slot: usize,
    slots: Vec<VecDeque<FreeFn>>,
}

/// Thread-safe, slot-partitioned FIFO of teardown actions
///
/// Actions are taken out of the queue under the lock and run after it is
/// released, so an action may enqueue further actions; those run on a later flush.
/// Actions must not panic.
pub struct FreeQueue {
    state: Mutex<QueueState>,
}

impl FreeQueue {
    /// Create an empty queue with one partition per frame slot
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                current_slot: 0,
                slots: (0..frames_in_flight.max(1)).map(|_| VecDeque::new()).collect(),
            }),
        }
    }

    /// Enqueue an action into the current frame slot
    pub fn free<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        let slot = state.current_slot;
        state.slots[slot].push_back(Box::new(action));
    }

    /// Run every action queued in `slot` and make `slot` the current slot
    ///
    /// Must only be called after the fences of `slot` have signalled.
    pub fn flush_slot(&self, slot: usize) {
        let actions = {
            let mut state = self.lock();
            let slot = slot % state.slots.len();
            state.current_slot = slot;
            std::mem::take(&mut state.slots[slot])
        };
        if !actions.is_empty() {
            log::trace!("Running {} deferred action(s) for slot {}", actions.len(), slot);
        }
        run(actions);
    }

    /// Run every queued action in every slot, oldest slot first
    ///
    /// Only valid once the device is idle.
    pub fn flush(&self) {
        let actions: Vec<VecDeque<FreeFn>> = {
            let mut state = self.lock();
            let count = state.slots.len();
            let start = (state.current_slot + 1) % count;
            (0..count)
                .map(|offset| std::mem::take(&mut state.slots[(start + offset) % count]))
                .collect()
        };
        for slot_actions in actions {
            run(slot_actions);
        }
    }

    /// Number of queued actions across all slots
    pub fn pending_count(&self) -> usize {
        self.lock().slots.iter().map(VecDeque::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run(actions: VecDeque<FreeFn>) {
    for action in actions {
        action();
    }
}

impl Drop for FreeQueue {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_flush_runs_in_fifo_order() {
        let queue = FreeQueue::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            queue.free(move || order.lock().unwrap().push(name));
        }

        queue.flush();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let queue = FreeQueue::new(3);
        queue.flush();
        queue.flush_slot(1);
        queue.flush();
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_flush_slot_only_runs_that_slot() {
        let queue = FreeQueue::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        queue.free(move || { c.fetch_add(1, Ordering::SeqCst); });
        queue.flush_slot(1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let c = Arc::clone(&counter);
        queue.free(move || { c.fetch_add(10, Ordering::SeqCst); });
        queue.flush_slot(0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        queue.flush_slot(1);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_flush_visits_oldest_slot_first() {
        let queue = FreeQueue::new(3);
        let order = Arc::new(Mutex::new(Vec::new()));

        for slot in 0..3 {
            queue.flush_slot(slot);
            let order = Arc::clone(&order);
            queue.free(move || order.lock().unwrap().push(slot));
        }

        queue.flush();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_action_may_enqueue_more_work() {
        let queue = Arc::new(FreeQueue::new(1));
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let c = Arc::clone(&counter);
        queue.free(move || {
            let c2 = Arc::clone(&c);
            inner_queue.free(move || { c2.fetch_add(1, Ordering::SeqCst); });
            c.fetch_add(1, Ordering::SeqCst);
        });

        queue.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 1);
        queue.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_runs_pending_actions() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = FreeQueue::new(2);
            let c = Arc::clone(&counter);
            queue.free(move || { c.fetch_add(1, Ordering::SeqCst); });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
