//! Thread-safe, ordered event queue.
//!
//! `gwtimer` produces expiry events here; whatever the rest of the
//! gateway looks like, it consumes them. The queue only needs to support
//! what `abort_elapsed` (see `gwtimer::set`) depends on: producing in
//! order, and deleting every queued value equal to a given one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A multi-producer, multi-consumer queue of opaque events.
///
/// `E` must be `Clone` (the timer set enqueues a duplicate of its
/// template event) and `PartialEq` (so `delete_equal` can find the
/// duplicates to cancel).
pub struct EventQueue<E> {
    items: Mutex<VecDeque<E>>,
    not_empty: Condvar,
    producers: AtomicUsize,
}

impl<E> EventQueue<E>
where
    E: Clone + PartialEq,
{
    /// Create a new, empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            producers: AtomicUsize::new(0),
        }
    }

    /// Register the caller as a producer. Purely a diagnostic counter —
    /// the queue functions identically with or without it — but the
    /// `TimerSet` contract calls for holding a producer reservation for
    /// its lifetime, so we track it explicitly rather than relying on
    /// `Arc` reference counts to mean something they don't.
    pub fn add_producer(&self) {
        self.producers.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a producer reservation taken by `add_producer`.
    pub fn remove_producer(&self) {
        self.producers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Current number of registered producers (diagnostic only).
    pub fn producer_count(&self) -> usize {
        self.producers.load(Ordering::SeqCst)
    }

    /// Push `event` onto the back of the queue and wake one waiting
    /// consumer, if any.
    pub fn produce(&self, event: E) {
        let mut items = self.items.lock().unwrap();
        items.push_back(event);
        self.not_empty.notify_one();
    }

    /// Remove every queued item equal to `value`, returning how many were
    /// removed. Used by `abort_elapsed` to cancel an in-flight duplicate
    /// before a downstream consumer observes it.
    pub fn delete_equal(&self, value: &E) -> usize {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|item| item != value);
        before - items.len()
    }

    /// Pop the front item, blocking until one is available.
    pub fn consume(&self) -> E {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }

    /// Pop the front item, blocking up to `timeout`. Returns `None` on
    /// timeout.
    pub fn consume_timeout(&self, timeout: Duration) -> Option<E> {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.pop_front() {
            return Some(item);
        }
        let (mut items, result) = self.not_empty.wait_timeout(items, timeout).unwrap();
        if result.timed_out() {
            return None;
        }
        items.pop_front()
    }

    /// Snapshot of the number of items currently queued.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for EventQueue<E>
where
    E: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn produce_consume_order() {
        let q: EventQueue<u32> = EventQueue::new();
        q.produce(1);
        q.produce(2);
        q.produce(3);
        assert_eq!(q.consume(), 1);
        assert_eq!(q.consume(), 2);
        assert_eq!(q.consume(), 3);
    }

    #[test]
    fn delete_equal_removes_all_matches() {
        let q: EventQueue<u32> = EventQueue::new();
        q.produce(7);
        q.produce(9);
        q.produce(7);
        assert_eq!(q.delete_equal(&7), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.consume(), 9);
    }

    #[test]
    fn delete_equal_on_absent_value_is_noop() {
        let q: EventQueue<u32> = EventQueue::new();
        q.produce(1);
        assert_eq!(q.delete_equal(&99), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn producer_accounting() {
        let q: EventQueue<u32> = EventQueue::new();
        assert_eq!(q.producer_count(), 0);
        q.add_producer();
        q.add_producer();
        assert_eq!(q.producer_count(), 2);
        q.remove_producer();
        assert_eq!(q.producer_count(), 1);
    }

    #[test]
    fn consume_blocks_until_produced() {
        let q = Arc::new(EventQueue::<u32>::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.consume());

        thread::sleep(Duration::from_millis(30));
        q.produce(42);

        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn consume_timeout_returns_none_when_empty() {
        let q: EventQueue<u32> = EventQueue::new();
        assert_eq!(q.consume_timeout(Duration::from_millis(20)), None);
    }
}
