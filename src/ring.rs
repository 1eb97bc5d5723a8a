//! Cross-subsystem SPSC ring queue (spec §4.1).
//!
//! Transports fixed-size 32-bit slot descriptors between the application
//! processor and a real-time processor. Adapted from the split-virtqueue
//! design in `drivers/virtio/queue.rs`: there, descriptor indices move
//! between an avail ring (guest-written) and a used ring (device-written)
//! across a DMA boundary reached through raw volatile pointers. Here there
//! is no MMU/DMA boundary to cross — both ends run in the same address
//! space — so slot storage is a safe `UnsafeCell<[u32]>` array guarded by
//! the same acquire/release discipline instead of raw pointers and
//! `write_volatile`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// One direction of descriptor flow: producer writes slots and advances
/// `head`; consumer reads slots and advances `tail`. Capacity must be a
/// power of two.
pub struct RingHalf {
    slots: Box<[UnsafeCell<u32>]>,
    mask: u32,
    head: AtomicU32,
    tail: AtomicU32,
    high_water: AtomicU32,
    published: AtomicU32,
}

// SAFETY: `slots` is only ever written by the single producer at index
// `head % capacity` and read by the single consumer at index `tail %
// capacity`; the two never alias because the producer never publishes a
// slot index >= `tail + capacity`, and the consumer never reads past the
// head it has observed via an acquire load.
unsafe impl Send for RingHalf {}
unsafe impl Sync for RingHalf {}

impl RingHalf {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        RingHalf {
            slots,
            mask: (capacity - 1) as u32,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            high_water: AtomicU32::new(0),
            published: AtomicU32::new(0),
        }
    }

    fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of slots currently occupied, from the producer's view.
    pub fn len(&self) -> u32 {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Publish one descriptor. Caller (the single producer) must ensure
    /// the ring is not full; overflow is a programming error per spec §4.1
    /// ("none; overflow... must be prevented by flow control"), so this
    /// panics rather than silently dropping data.
    pub fn publish(&self, descriptor: u32) {
        assert!(!self.is_full(), "ring queue overflow: producer must apply flow control");
        let head = self.head.load(Ordering::Relaxed);
        let idx = (head & self.mask) as usize;
        // SAFETY: single producer, slot at `idx` is not the consumer's
        // current read target since the ring is not full.
        unsafe { *self.slots[idx].get() = descriptor };
        self.head.store(head.wrapping_add(1), Ordering::Release);

        let published = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        let occupied = self.len();
        let mut hw = self.high_water.load(Ordering::Relaxed);
        while occupied > hw {
            match self.high_water.compare_exchange_weak(
                hw,
                occupied,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => hw = cur,
            }
        }
        let _ = published;
    }

    /// Consume one descriptor if available.
    pub fn consume(&self) -> Option<u32> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = (tail & self.mask) as usize;
        // SAFETY: single consumer, `head` acquire-load ensures this slot's
        // write from `publish` is visible.
        let value = unsafe { *self.slots[idx].get() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            high_water_mark: self.high_water.load(Ordering::Relaxed),
            total_published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// Diagnostics counters (`[SUPPLEMENT]`) — present implicitly in the
/// original firmware's `r5poll` instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub high_water_mark: u32,
    pub total_published: u32,
}

/// One request/response pair of `RingHalf`s, connecting the AP to one RTP.
pub struct Ring {
    pub request: RingHalf,
    pub response: RingHalf,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Ring {
            request: RingHalf::new(capacity),
            response: RingHalf::new(capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let ring = RingHalf::new(8);
        ring.publish(10);
        ring.publish(20);
        ring.publish(30);
        assert_eq!(ring.consume(), Some(10));
        assert_eq!(ring.consume(), Some(20));
        assert_eq!(ring.consume(), Some(30));
        assert_eq!(ring.consume(), None);
    }

    #[test]
    fn full_ring_is_detected() {
        let ring = RingHalf::new(4);
        for i in 0..4 {
            ring.publish(i);
        }
        assert!(ring.is_full());
        ring.consume();
        assert!(!ring.is_full());
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn publish_past_capacity_panics() {
        let ring = RingHalf::new(2);
        ring.publish(1);
        ring.publish(2);
        ring.publish(3);
    }

    #[test]
    fn high_water_mark_tracks_peak_occupancy() {
        let ring = RingHalf::new(8);
        ring.publish(1);
        ring.publish(2);
        ring.publish(3);
        ring.consume();
        ring.consume();
        let stats = ring.stats();
        assert_eq!(stats.high_water_mark, 3);
        assert_eq!(stats.total_published, 3);
    }

    #[test]
    fn cross_thread_producer_consumer_preserves_fifo() {
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(RingHalf::new(1024));
        let producer_ring = ring.clone();
        let producer = thread::spawn(move || {
            for i in 0..1000u32 {
                while producer_ring.is_full() {
                    thread::yield_now();
                }
                producer_ring.publish(i);
            }
        });

        let mut received = Vec::with_capacity(1000);
        while received.len() < 1000 {
            if let Some(v) = ring.consume() {
                received.push(v);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..1000u32).collect::<Vec<_>>());
    }
}
