// Copyright (c) 2025 The LLUDP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::packet::OutgoingPacket;

/// Number of priority levels. Level 0 is the lowest, `LEVEL_COUNT - 1` the
/// highest.
pub const LEVEL_COUNT: usize = 8;

/// Promotion cadence: a promotion sweep runs once every `mask + 1` enqueues
/// at a level.
pub const DEFAULT_PROMOTION_MASK: u32 = 0x01;

/// An entry in the outgoing queue.
///
/// Producers enqueue either a packet that is already serialized or a lazy
/// producer that is polled at dequeue time. A lazy producer that declines to
/// materialize keeps its queue slot and is tried again on a later pass.
pub enum QueueItem {
    /// A serialized packet ready to send.
    Ready(OutgoingPacket),

    /// A deferred producer polled at dequeue time.
    Lazy(Box<dyn FnMut() -> Option<OutgoingPacket> + Send>),
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            QueueItem::Ready(pkt) => write!(f, "Ready({} bytes)", pkt.payload_len()),
            QueueItem::Lazy(_) => write!(f, "Lazy"),
        }
    }
}

/// A multi-level outgoing queue with periodic promotion of lower levels.
///
/// Dequeue serves the highest non-empty level, FIFO within a level. To keep
/// sustained high-priority traffic from starving the lower levels, every
/// `mask + 1` enqueues at a level lift one item from each level below it up
/// one step.
///
/// All operations are non-blocking; `len` is best-effort under concurrent
/// promotion and must only be used as a backpressure hint.
pub struct PriorityQueue {
    /// One FIFO per priority level.
    levels: [Mutex<VecDeque<QueueItem>>; LEVEL_COUNT],

    /// Enqueue counters driving the promotion cadence, one per level.
    promotion_counters: [AtomicU32; LEVEL_COUNT],

    /// Promotion cadence mask, e.g. `0x01` for a sweep every two enqueues.
    promotion_mask: u32,

    /// Approximate total number of queued items.
    count: AtomicU32,
}

impl PriorityQueue {
    /// Create a queue with the given promotion cadence mask.
    pub fn new(promotion_mask: u32) -> Self {
        Self {
            levels: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            promotion_counters: std::array::from_fn(|_| AtomicU32::new(0)),
            promotion_mask,
            count: AtomicU32::new(0),
        }
    }

    /// Return the approximate number of queued items.
    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Return whether the queue is (approximately) empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `item` at `priority`. Returns false iff the priority is out of
    /// range.
    pub fn enqueue(&self, priority: u8, item: QueueItem) -> bool {
        let level = priority as usize;
        if level >= LEVEL_COUNT {
            return false;
        }

        self.levels[level]
            .lock()
            .unwrap()
            .push_back(item);
        self.count.fetch_add(1, Ordering::Relaxed);

        let c = self.promotion_counters[level]
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        if c & self.promotion_mask == 0 {
            self.promote_below(level);
        }
        true
    }

    /// Remove and return the highest-priority packet available, together
    /// with the level it was dequeued from.
    ///
    /// Lazy items that decline to materialize are re-parked at the back of
    /// their level without touching the count; at most one full rotation of
    /// each level is attempted per call.
    pub fn dequeue(&self) -> Option<(usize, OutgoingPacket)> {
        for level in (0..LEVEL_COUNT).rev() {
            let mut budget = self.levels[level].lock().unwrap().len();

            while budget > 0 {
                budget -= 1;
                let item = self.levels[level].lock().unwrap().pop_front();
                let item = match item {
                    Some(item) => item,
                    None => break,
                };

                match item {
                    QueueItem::Ready(pkt) => {
                        self.count.fetch_sub(1, Ordering::Relaxed);
                        return Some((level, pkt));
                    }
                    QueueItem::Lazy(mut produce) => match produce() {
                        Some(pkt) => {
                            self.count.fetch_sub(1, Ordering::Relaxed);
                            return Some((level, pkt));
                        }
                        None => {
                            self.levels[level]
                                .lock()
                                .unwrap()
                                .push_back(QueueItem::Lazy(produce));
                        }
                    },
                }
            }
        }
        None
    }

    /// Drop every queued item, returning how many were discarded.
    pub fn clear(&self) -> u32 {
        let mut dropped = 0;
        for level in self.levels.iter() {
            let mut queue = level.lock().unwrap();
            dropped += queue.len() as u32;
            queue.clear();
        }
        // Reset rather than subtract: enqueues raced during the drain are
        // counted on the next enqueue anyway.
        self.count.store(0, Ordering::Relaxed);
        dropped
    }

    /// Lift one item from each level below `level` up one step, lowest last.
    ///
    /// The lift and the re-insert are not atomic; `count` may be observed
    /// low for the duration of a lift.
    fn promote_below(&self, level: usize) {
        for i in (0..level).rev() {
            let lifted = self.levels[i].lock().unwrap().pop_front();
            if let Some(item) = lifted {
                self.levels[i + 1].lock().unwrap().push_back(item);
            }
        }
    }

    #[cfg(test)]
    fn level_len(&self, level: usize) -> usize {
        self.levels[level].lock().unwrap().len()
    }
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PriorityQueue(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::Category;
    use bytes::Bytes;

    fn packet(tag: u32) -> QueueItem {
        let mut pkt = OutgoingPacket::new(Category::Task, Bytes::from_static(&[0u8; 8]));
        pkt.sequence = tag;
        QueueItem::Ready(pkt)
    }

    #[test]
    fn enqueue_bounds() {
        let q = PriorityQueue::new(DEFAULT_PROMOTION_MASK);
        assert!(q.enqueue(0, packet(1)));
        assert!(q.enqueue(LEVEL_COUNT as u8 - 1, packet(2)));
        assert!(!q.enqueue(LEVEL_COUNT as u8, packet(3)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn strict_priority_without_promotion() {
        // A mask of all ones defers the first sweep past any practical
        // enqueue count, so dequeue order is non-increasing in priority.
        let q = PriorityQueue::new(u32::MAX);
        q.enqueue(2, packet(20));
        q.enqueue(0, packet(1));
        q.enqueue(7, packet(70));
        q.enqueue(2, packet(21));
        q.enqueue(5, packet(50));

        let order: Vec<u32> = std::iter::from_fn(|| q.dequeue().map(|(_, p)| p.sequence)).collect();
        assert_eq!(order, vec![70, 50, 20, 21, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn random_enqueues_dequeue_in_priority_order() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let q = PriorityQueue::new(u32::MAX);
        for i in 0..500 {
            assert!(q.enqueue(rng.gen_range(0..LEVEL_COUNT as u8), packet(i)));
        }

        let mut last = LEVEL_COUNT;
        while let Some((level, _)) = q.dequeue() {
            assert!(level <= last);
            last = level;
        }
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_within_level() {
        let q = PriorityQueue::new(u32::MAX);
        for tag in 0..10 {
            q.enqueue(3, packet(tag));
        }
        for tag in 0..10 {
            let (level, pkt) = q.dequeue().unwrap();
            assert_eq!(level, 3);
            assert_eq!(pkt.sequence, tag);
        }
    }

    #[test]
    fn promotion_climbs_to_top() {
        // An item parked at level p reaches the top level after
        // 2 * (LEVEL_COUNT - 1 - p) enqueues at the top with the default
        // mask: one sweep every two enqueues, one level per sweep.
        for p in 0..LEVEL_COUNT - 1 {
            let q = PriorityQueue::new(DEFAULT_PROMOTION_MASK);
            q.enqueue(p as u8, packet(999));

            let climb = 2 * (LEVEL_COUNT - 1 - p);
            for i in 0..climb {
                q.enqueue(LEVEL_COUNT as u8 - 1, packet(i as u32));
            }
            assert_eq!(q.level_len(p), 0, "level {} not lifted", p);
            assert_eq!(
                q.level_len(LEVEL_COUNT - 1),
                climb + 1,
                "marker missing from top level for start level {}",
                p
            );
        }
    }

    #[test]
    fn promotion_lifts_forgotten_packet_before_drain() {
        // One packet at the bottom, then a burst at the top: the bottom
        // packet must surface before the burst finishes draining.
        let q = PriorityQueue::new(DEFAULT_PROMOTION_MASK);
        q.enqueue(0, packet(999));
        for i in 0..20 {
            q.enqueue(7, packet(i));
        }

        let mut position = None;
        for n in 0..21 {
            let (_, pkt) = q.dequeue().unwrap();
            if pkt.sequence == 999 {
                position = Some(n);
                break;
            }
        }
        let position = position.expect("marker never dequeued");
        assert!(position < 20, "marker drained last: {}", position);
    }

    #[test]
    fn lazy_items_materialize() {
        let q = PriorityQueue::new(u32::MAX);
        q.enqueue(
            4,
            QueueItem::Lazy(Box::new(|| {
                Some(OutgoingPacket::new(
                    Category::Land,
                    Bytes::from_static(&[0u8; 16]),
                ))
            })),
        );
        assert_eq!(q.len(), 1);

        let (level, pkt) = q.dequeue().unwrap();
        assert_eq!(level, 4);
        assert_eq!(pkt.category, Category::Land);
        assert!(q.is_empty());
    }

    #[test]
    fn declining_lazy_item_keeps_slot() {
        let q = PriorityQueue::new(u32::MAX);
        q.enqueue(6, QueueItem::Lazy(Box::new(|| None)));
        q.enqueue(3, packet(30));

        // The declining item keeps its slot and its count; the ready packet
        // below is still served.
        let (level, pkt) = q.dequeue().unwrap();
        assert_eq!(level, 3);
        assert_eq!(pkt.sequence, 30);
        assert_eq!(q.len(), 1);

        // Still parked, still declining.
        assert!(q.dequeue().is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let q = PriorityQueue::new(DEFAULT_PROMOTION_MASK);
        for i in 0..5 {
            q.enqueue(i, packet(i as u32));
        }
        assert_eq!(q.clear(), 5);
        assert!(q.is_empty());
        assert!(q.dequeue().is_none());
    }
}
