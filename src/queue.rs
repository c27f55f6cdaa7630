// src/queue.rs
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer single-consumer queue shared by the worker pool
/// and the log sink.
///
/// The back-pressure contract: producers are rejected, never blocked, at
/// capacity; the consumer blocks until an item arrives or the queue is
/// closed and drained.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append without blocking; false when full or closed.
    pub fn try_push(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.items.len() >= self.capacity {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Block until an item is available. None once the queue is closed and
    /// every queued item has been drained.
    pub fn pop_blocking(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake all waiters; subsequent pushes fail, pops drain what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Nudge the consumer out of its wait without queuing anything.
    pub fn wake(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_exactly_at_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_push(1));
        assert!(queue.try_push(2));
        assert!(!queue.try_push(3));
        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.try_push(3));
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = BoundedQueue::new(8);
        for i in 0..8 {
            assert!(queue.try_push(i));
        }
        for i in 0..8 {
            assert_eq!(queue.pop_blocking(), Some(i));
        }
    }

    #[test]
    fn close_drains_then_ends() {
        let queue = BoundedQueue::new(4);
        assert!(queue.try_push("a"));
        assert!(queue.try_push("b"));
        queue.close();
        assert!(!queue.try_push("c"));
        assert_eq!(queue.pop_blocking(), Some("a"));
        assert_eq!(queue.pop_blocking(), Some("b"));
        assert_eq!(queue.pop_blocking(), None);
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_blocking())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(queue.try_push(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_blocking())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
