//! Bounded FIFO between the producing task and the consuming engine loop.
//!
//! Single producer, single consumer. `put` applies backpressure by waiting
//! for capacity — records are never dropped — and `take` waits for a record
//! or a timeout. Waiting uses `Notify` wake-ups re-checked against the
//! predicate; there is no polling loop anywhere.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Inner<T> {
    buf: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
}

/// A bounded single-producer/single-consumer queue preserving insertion order.
pub struct RecordQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RecordQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> RecordQueue<T> {
    /// Create a queue holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    buf: VecDeque::with_capacity(capacity),
                    capacity,
                    closed: false,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
            }),
        }
    }

    /// Enqueue one record, waiting while the queue is full.
    ///
    /// Returns `Err(item)` if the queue was closed before the record could be
    /// enqueued.
    pub async fn put(&self, item: T) -> Result<(), T> {
        loop {
            // register interest before checking, so a wake-up between the
            // check and the await is not lost
            let wait = self.shared.not_full.notified();
            {
                let mut inner = self.shared.inner.lock();
                if inner.closed {
                    return Err(item);
                }
                if inner.buf.len() < inner.capacity {
                    inner.buf.push_back(item);
                    self.shared.not_empty.notify_one();
                    return Ok(());
                }
            }
            wait.await;
        }
    }

    /// Dequeue one record, waiting up to `timeout`. Returns `None` on timeout
    /// or when the queue is closed and drained.
    pub async fn take(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = self.shared.not_empty.notified();
            {
                let mut inner = self.shared.inner.lock();
                if let Some(item) = inner.buf.pop_front() {
                    self.shared.not_full.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                // deadline passed; one final non-waiting look
                let mut inner = self.shared.inner.lock();
                let item = inner.buf.pop_front();
                if item.is_some() {
                    self.shared.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Dequeue up to `max` records without waiting.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut inner = self.shared.inner.lock();
        let n = max.min(inner.buf.len());
        let drained: Vec<T> = inner.buf.drain(..n).collect();
        if !drained.is_empty() {
            self.shared.not_full.notify_one();
        }
        drained
    }

    /// Close the queue: pending and future `put`s fail, `take` drains what
    /// remains and then returns `None`.
    pub fn close(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.closed = true;
        }
        self.shared.not_empty.notify_one();
        self.shared.not_full.notify_one();
    }

    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().buf.len()
    }

    /// True when no records are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.inner.lock().capacity
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = RecordQueue::new(8);
        for i in 0..5 {
            queue.put(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.take(Duration::from_millis(10)).await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_take_times_out_when_empty() {
        let queue: RecordQueue<u32> = RecordQueue::new(4);
        let start = std::time::Instant::now();
        assert_eq!(queue.take(Duration::from_millis(50)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_put_blocks_at_capacity() {
        let queue = RecordQueue::new(4);
        for i in 0..4 {
            queue.put(i).await.unwrap();
        }

        // the 5th put must block
        let q = queue.clone();
        let blocked = tokio::spawn(async move { q.put(4).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // one take unblocks exactly one put, order preserved
        assert_eq!(queue.take(Duration::from_millis(10)).await, Some(0));
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.len(), 4);
        for expected in 1..=4 {
            assert_eq!(queue.take(Duration::from_millis(10)).await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_take_wakes_on_put() {
        let queue = RecordQueue::new(4);
        let q = queue.clone();
        let taker = tokio::spawn(async move { q.take(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(42).await.unwrap();
        assert_eq!(taker.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_drain() {
        let queue = RecordQueue::new(8);
        for i in 0..6 {
            queue.put(i).await.unwrap();
        }

        assert_eq!(queue.drain(4), vec![0, 1, 2, 3]);
        assert_eq!(queue.drain(10), vec![4, 5]);
        assert!(queue.drain(10).is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let queue: RecordQueue<u32> = RecordQueue::new(4);
        let q = queue.clone();
        let taker = tokio::spawn(async move { q.take(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(taker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_fails_blocked_producer() {
        let queue = RecordQueue::new(1);
        queue.put(0).await.unwrap();

        let q = queue.clone();
        let producer = tokio::spawn(async move { q.put(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        assert_eq!(producer.await.unwrap(), Err(1));

        // close still lets the consumer drain what was queued
        assert_eq!(queue.take(Duration::from_millis(10)).await, Some(0));
        assert_eq!(queue.take(Duration::from_millis(10)).await, None);
    }
}
