// =============================================================================
// Event Sink queues — bounded, non-blocking fan-in to the writer task, §4.7
// =============================================================================
//
// Logs, market events, and metrics snapshots use a drop-oldest bounded
// buffer: pushing never blocks the trading path, and under sustained
// overflow the oldest unwritten entry is discarded rather than the newest.
// Trade records use a real bounded `mpsc` channel instead — §4.7 requires
// these writes to "block the trading path only until accepted into the
// queue", never to drop.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Capacity shared by every Event Sink queue, per §4.7's "bounded queue
/// (e.g., 4096)".
pub const QUEUE_CAPACITY: usize = 4096;

/// A bounded FIFO that drops the oldest entry instead of rejecting a push.
pub struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: std::sync::atomic::AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            notify: Notify::new(),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Never blocks. Drops the oldest entry when full, per §4.7.
    pub fn push(&self, item: T) {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        q.push_back(item);
        drop(q);
        self.notify.notify_one();
    }

    /// Drains everything currently buffered, or waits for the next push.
    pub async fn drain(&self) -> Vec<T> {
        loop {
            {
                let mut q = self.inner.lock();
                if !q.is_empty() {
                    return q.drain(..).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drains whatever is currently buffered without waiting; empty if the
    /// queue is empty. Used by the writer task's periodic flush tick.
    pub fn drain_nonblocking(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_beyond_capacity_drops_oldest() {
        let q: DropOldestQueue<u32> = DropOldestQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3);
        let drained = q.drain().await;
        assert_eq!(drained, vec![2, 3]);
        assert_eq!(q.dropped_count(), 1);
    }

    #[tokio::test]
    async fn drain_waits_for_next_push() {
        let q: std::sync::Arc<DropOldestQueue<u32>> = std::sync::Arc::new(DropOldestQueue::new(4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.drain().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.push(42);
        let drained = handle.await.unwrap();
        assert_eq!(drained, vec![42]);
    }
}
