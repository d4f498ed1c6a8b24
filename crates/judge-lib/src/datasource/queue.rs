//! Bounded FIFO of converted series waiting for remote write

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::prompb::TimeSeries;

/// Default capacity of the write queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_240_000;

/// Concurrent-safe FIFO; pushes never block, overflow is dropped and counted
pub struct WriteQueue {
    items: Mutex<VecDeque<TimeSeries>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(65_536))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append one series; returns false if the queue was full
    pub fn push(&self, series: TimeSeries) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        items.push_back(series);
        true
    }

    /// Remove up to `max` series from the head
    pub fn pop_batch(&self, max: usize) -> Vec<TimeSeries> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Series dropped on overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::prompb::Label;

    fn series(n: usize) -> TimeSeries {
        TimeSeries {
            labels: vec![Label {
                name: "__name__".into(),
                value: format!("m{}", n),
            }],
            samples: vec![],
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = WriteQueue::new(10);
        for i in 0..5 {
            assert!(queue.push(series(i)));
        }

        let batch = queue.pop_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].label("__name__"), Some("m0"));
        assert_eq!(batch[2].label("__name__"), Some("m2"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_overflow_drops_newest() {
        let queue = WriteQueue::new(2);
        assert!(queue.push(series(0)));
        assert!(queue.push(series(1)));
        assert!(!queue.push(series(2)));
        assert_eq!(queue.dropped(), 1);

        let batch = queue.pop_batch(10);
        assert_eq!(batch[1].label("__name__"), Some("m1"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_from_empty_queue() {
        let queue = WriteQueue::new(4);
        assert!(queue.pop_batch(100).is_empty());
    }
}
