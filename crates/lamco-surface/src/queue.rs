//! Cross-thread FIFO
//!
//! [`SafeQueue`] carries decoded surfaces and free input surfaces between
//! the threads that feed and drain a codec session. It has a non-blocking
//! `try_pop` for hot paths and a blocking `wait_pop` for consumers that
//! park until work arrives.
//!
//! After [`SafeQueue::shutdown`] pushes are rejected. Items already queued
//! remain poppable so consumers can drain before exiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    done: bool,
}

/// Mutex and condition-variable guarded FIFO
pub struct SafeQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> Default for SafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SafeQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                done: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append an item
    ///
    /// Returns `false` once the queue has been shut down.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Pop the oldest item without blocking
    ///
    /// Returns `None` if the queue is empty or another thread holds the lock.
    pub fn try_pop(&self) -> Option<T> {
        self.state.try_lock()?.items.pop_front()
    }

    /// Pop the oldest item, blocking until one is available
    ///
    /// Returns `None` only after shutdown, once the queue is drained.
    pub fn wait_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.done {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Pop the oldest item, blocking for at most `timeout`
    pub fn wait_pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.done {
                return None;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return state.items.pop_front();
            }
        }
    }

    /// Reject further pushes and wake every waiter
    pub fn shutdown(&self) {
        self.state.lock().done = true;
        self.ready.notify_all();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().done
    }

    /// Whether no items are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

impl<T> Drop for SafeQueue<T> {
    fn drop(&mut self) {
        self.state.get_mut().done = true;
    }
}

impl<T> std::fmt::Debug for SafeQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SafeQueue")
            .field("len", &state.items.len())
            .field("done", &state.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = SafeQueue::new();
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.wait_pop(), Some(3));
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_push_after_shutdown() {
        let queue = SafeQueue::new();
        queue.push("kept");
        queue.shutdown();
        assert!(!queue.push("rejected"));
        assert!(queue.is_shutdown());

        // Drains what was queued, then reports closed.
        assert_eq!(queue.wait_pop(), Some("kept"));
        assert_eq!(queue.wait_pop(), None);
    }

    #[test]
    fn test_wait_pop_blocks_until_push() {
        let queue = Arc::new(SafeQueue::new());
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.push(42u32);
        });

        let started = Instant::now();
        assert_eq!(queue.wait_pop(), Some(42));
        assert!(started.elapsed() >= Duration::from_millis(20));
        handle.join().expect("producer");
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let queue: Arc<SafeQueue<u8>> = Arc::new(SafeQueue::new());
        let consumer = Arc::clone(&queue);

        let handle = thread::spawn(move || consumer.wait_pop());
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();

        assert_eq!(handle.join().expect("consumer"), None);
    }

    #[test]
    fn test_wait_pop_timeout() {
        let queue: SafeQueue<u8> = SafeQueue::new();
        let started = Instant::now();
        assert_eq!(queue.wait_pop_timeout(Duration::from_millis(15)), None);
        assert!(started.elapsed() >= Duration::from_millis(10));

        queue.push(7);
        assert_eq!(queue.wait_pop_timeout(Duration::from_millis(15)), Some(7));
    }

    #[test]
    fn test_timeout_survives_stolen_wakeups() {
        let queue = Arc::new(SafeQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let start = Instant::now();
                let item = queue.wait_pop_timeout(Duration::from_millis(50));
                (item, start.elapsed())
            })
        };

        // Each push wakes the waiter; popping right away usually steals the item
        for i in 0..30 {
            thread::sleep(Duration::from_millis(5));
            queue.push(i);
            let _ = queue.try_pop();
        }

        let (item, elapsed) = waiter.join().expect("waiter");
        assert!(item.is_some() || elapsed < Duration::from_millis(200), "waited {elapsed:?}");
    }
}
