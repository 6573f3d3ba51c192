//! Lossy, non-blocking, many-producer record transport.
//!
//! `emit` never waits: when the queue is full the record is discarded and only the
//! drop counter moves. Per-producer FIFO order holds; nothing is promised across
//! producers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub emitted: u64,
    pub consumed: u64,
    pub dropped: u64,
}

struct Shared<T> {
    queue: ArrayQueue<T>,
    emitted: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
}

pub struct EventChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> EventChannel<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: ArrayQueue::new(capacity.max(1)),
                emitted: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Hands `record` to the consumer side, or drops it if the queue is full.
    #[inline]
    pub fn emit(&self, record: T) {
        match self.shared.queue.push(record) {
            Ok(()) => {
                self.shared.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn try_recv(&self) -> Option<T> {
        let record = self.shared.queue.pop()?;
        self.shared.consumed.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    /// Pops up to `max` records.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        while batch.len() < max {
            match self.try_recv() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            emitted: self.shared.emitted.load(Ordering::Relaxed),
            consumed: self.shared.consumed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let channel = EventChannel::with_capacity(4);
        for i in 0..10u32 {
            channel.emit(i);
        }
        assert_eq!(channel.len(), 4);
        assert_eq!(
            channel.stats(),
            ChannelStats {
                emitted: 4,
                consumed: 0,
                dropped: 6
            }
        );
    }

    #[test]
    fn test_single_producer_fifo() {
        let channel = EventChannel::with_capacity(8);
        for i in 0..5u32 {
            channel.emit(i);
        }
        assert_eq!(channel.drain(3), vec![0, 1, 2]);
        assert_eq!(channel.drain(10), vec![3, 4]);
        assert!(channel.is_empty());
        assert_eq!(channel.stats().consumed, 5);
    }

    #[test]
    fn test_clones_share_queue() {
        let producer = EventChannel::with_capacity(2);
        let consumer = producer.clone();
        producer.emit("a");
        assert_eq!(consumer.try_recv(), Some("a"));
        assert_eq!(consumer.try_recv(), None);
        assert_eq!(producer.capacity(), 2);
    }

    #[test]
    fn test_concurrent_producers_account_for_every_emit() {
        let channel = EventChannel::with_capacity(64);
        let handles: Vec<_> = (0..4u32)
            .map(|p| {
                let channel = channel.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        channel.emit(p * 1_000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = channel.stats();
        assert_eq!(stats.emitted + stats.dropped, 2_000);
        assert_eq!(stats.emitted as usize, channel.len());
    }
}
