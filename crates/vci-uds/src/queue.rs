//! Blocking FIFO shared between caller threads and pipeline workers

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Longest single blocking receive; keeps `drain` responsive to waiting readers
const RECV_SLICE: Duration = Duration::from_millis(10);

/// Unbounded channel with timed and bulk dequeue
///
/// Capacity limits are enforced by the caller; see the service request
/// pipelines.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    tx: Mutex<mpsc::Sender<T>>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, item: T) {
        // The receiver lives as long as the queue
        let _ = self.tx.lock().send(item);
    }

    pub fn push_all(&self, items: impl IntoIterator<Item = T>) {
        let tx = self.tx.lock();
        for item in items {
            let _ = tx.send(item);
        }
    }

    /// Dequeue one item without blocking
    pub fn try_pop(&self) -> Option<T> {
        self.rx.lock().try_recv().ok()
    }

    /// Dequeue one item, waiting up to `timeout` for it to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(RECV_SLICE);
            match self.rx.lock().recv_timeout(slice) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) if remaining <= slice => return None,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// Dequeue up to `max` items, waiting up to `timeout` for the first one
    ///
    /// A zero timeout never blocks.
    pub fn pop_bulk_timeout(&self, max: usize, timeout: Duration) -> Vec<T> {
        if max == 0 {
            return Vec::new();
        }
        let Some(first) = self.pop_timeout(timeout) else {
            return Vec::new();
        };
        let mut items = vec![first];
        // Wait out a batch still being pushed
        drop(self.tx.lock());
        let rx = self.rx.lock();
        items.extend(rx.try_iter().take(max - 1));
        items
    }

    /// Remove and return everything currently queued
    pub fn drain(&self) -> Vec<T> {
        self.rx.lock().try_iter().collect()
    }

    pub fn clear(&self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = BlockingQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop_timeout(Duration::ZERO), Some(1));
        assert_eq!(queue.pop_bulk_timeout(10, Duration::ZERO), vec![2, 3]);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue: BlockingQueue<u8> = BlockingQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(25)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(BlockingQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.push("frame");
        });

        assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some("frame"));
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_while_reader_waits() {
        let queue = Arc::new(BlockingQueue::new());
        let reader = Arc::clone(&queue);
        let handle = std::thread::spawn(move || reader.pop_timeout(Duration::from_millis(300)));

        std::thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        assert!(queue.drain().is_empty());
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(handle.join().unwrap(), None::<u8>);
    }

    #[test]
    fn test_bulk_pop_respects_max() {
        let queue = BlockingQueue::new();
        queue.push_all(0..10);
        assert_eq!(queue.pop_bulk_timeout(4, Duration::ZERO), vec![0, 1, 2, 3]);
        assert_eq!(queue.drain(), vec![4, 5, 6, 7, 8, 9]);
        queue.push(10);
        queue.clear();
        assert!(queue.pop_bulk_timeout(4, Duration::ZERO).is_empty());
    }
}
