use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};


/// Blocking, mutex-protected double-ended queue. This is the hand-off point
///  between the I/O thread and the application thread — the only state the
///  two sides share.
///
/// Every operation is safe to call from any number of threads. A push wakes
///  at most one thread blocked in [`wait`](TsQueue::wait). The application
///  side is a plain OS thread, which is why this is built on std's mutex and
///  condition variable rather than tokio's async primitives.
pub struct TsQueue<T> {
    items: Mutex<VecDeque<T>>,
    readable: Condvar,
}

impl<T> TsQueue<T> {
    pub fn new() -> TsQueue<T> {
        TsQueue {
            items: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.readable.notify_one();
    }

    pub fn push_front(&self, item: T) {
        self.items.lock().unwrap().push_front(item);
        self.readable.notify_one();
    }

    /// Removes and returns the first element, `None` if the queue is empty.
    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Removes and returns the last element, `None` if the queue is empty.
    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().unwrap().pop_back()
    }

    pub fn front(&self) -> Option<T>
    where T: Clone {
        self.items.lock().unwrap().front().cloned()
    }

    pub fn back(&self) -> Option<T>
    where T: Clone {
        self.items.lock().unwrap().back().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    /// Blocks the calling thread until the queue is non-empty. Emptiness is
    ///  rechecked around the condvar wait, so spurious wakeups (and races
    ///  with other consumers) never let this return on an empty queue.
    pub fn wait(&self) {
        let mut items = self.items.lock().unwrap();
        while items.is_empty() {
            items = self.readable.wait(items).unwrap();
        }
    }
}

impl<T> Default for TsQueue<T> {
    fn default() -> TsQueue<T> {
        TsQueue::new()
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = TsQueue::new();
        for i in 0..5 {
            queue.push_back(i);
        }

        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.pop_front(), Some(i));
        }
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn test_both_ends() {
        let queue = TsQueue::new();
        queue.push_back(2);
        queue.push_front(1);
        queue.push_back(3);

        assert_eq!(queue.front(), Some(1));
        assert_eq!(queue.back(), Some(3));
        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = TsQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_wait_blocks_until_push() {
        let queue = Arc::new(TsQueue::new());

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.push_back(42);
            })
        };

        queue.wait();
        assert!(!queue.is_empty());
        assert_eq!(queue.pop_front(), Some(42));

        producer.join().unwrap();
    }

    #[test]
    fn test_single_producer_single_consumer_order() {
        let queue = Arc::new(TsQueue::new());

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    queue.push_back(i);
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 100 {
            queue.wait();
            if let Some(item) = queue.pop_front() {
                received.push(item);
            }
        }

        assert_eq!(received, (0..100).collect::<Vec<_>>());
        producer.join().unwrap();
    }
}
