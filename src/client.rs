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

use std::cmp;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use log::debug;
use log::error;
use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::packet::OutgoingPacket;
use crate::queue::PriorityQueue;
use crate::queue::QueueItem;
use crate::queue::LEVEL_COUNT;
use crate::rtt::RttEstimator;
use crate::throttle::Category;
use crate::throttle::ThrottleTree;
use crate::tick_delta;
use crate::Clock;
use crate::Config;
use crate::EgressEvents;
use crate::Error;
use crate::Executor;
use crate::PacketSendHandler;
use crate::Result;
use crate::TICK_MASK;

/// Queue depth at or below which the queue-empty signal is considered.
const QUEUE_EMPTY_LOW_WATER: i64 = 100;

/// Consecutive busy dequeue passes after which the signal fires anyway.
const QUEUE_EMPTY_STALL_TICKS: i64 = 10;

/// Smallest packet grant worth waking the producers for.
const MIN_CALLBACK_GRANT: i64 = 20;

/// Cool-down between queue-empty callbacks, in milliseconds.
const MIN_CALLBACK_MS: i32 = 50;

/// In-flight reliable packets, ordered by last send so the timeout scan
/// only ever inspects the front.
#[derive(Default)]
struct UnackedTable {
    /// Sequence numbers in send order. Entries acked away are skipped
    /// lazily during the next scan.
    order: VecDeque<u32>,

    /// Live packets by sequence number.
    packets: FxHashMap<u32, OutgoingPacket>,
}

/// Point-in-time statistics snapshot for a client circuit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EgressStats {
    /// Packets handed to the send sink.
    pub packets_sent: i32,

    /// Packets received on the circuit.
    pub packets_received: i32,

    /// Bytes of reliable packets awaiting acknowledgement.
    pub unacked_bytes: i32,

    /// Approximate number of queued outgoing items.
    pub queued_packets: u32,

    /// Current retransmission timeout in milliseconds.
    pub rto: i32,

    /// Smoothed round-trip time in milliseconds.
    pub srtt: i32,

    /// Effective client-root drip rate in bytes per second.
    pub client_rate: u32,
}

/// Per-client egress pipeline.
///
/// One instance exists per viewer circuit, shared behind an [`Arc`] between
/// the producer threads (which enqueue), the dequeue loop, and the inbound
/// reader thread (which feeds RTT samples and acknowledgements). All public
/// operations are non-blocking.
pub struct ClientEgress {
    /// Agent this circuit belongs to.
    agent_id: Uuid,

    /// Remote UDP endpoint of the viewer.
    remote_endpoint: SocketAddr,

    /// Circuit code negotiated during the handshake.
    circuit_code: u32,

    /// Identifier used in log lines.
    trace_id: String,

    /// False once the circuit has been shut down.
    is_connected: AtomicBool,

    /// While paused the dequeue loop dispatches nothing and the queue-empty
    /// signal stays quiet.
    is_paused: AtomicBool,

    /// Most recently allocated reliable sequence number.
    current_sequence: AtomicU32,

    /// Next ping id.
    current_ping_sequence: AtomicU8,

    /// Tick of the most recent inbound packet.
    last_packet_received_tick: AtomicI32,

    /// Bytes handed to the sink since the last acknowledgement arrived.
    bytes_since_last_ack: AtomicI32,

    /// Packets handed to the send sink.
    packets_sent: AtomicI32,

    /// Packets received on the circuit.
    packets_received: AtomicI32,

    /// Bytes of reliable packets awaiting acknowledgement.
    unacked_bytes: AtomicI32,

    /// Counter values as of the last published stats event.
    packets_sent_reported: AtomicI32,
    packets_received_reported: AtomicI32,

    /// Outgoing multi-level queue.
    queue: PriorityQueue,

    /// Throttle hierarchy for the circuit.
    throttle: Mutex<ThrottleTree>,

    /// RTT estimation for the circuit.
    rtt: Mutex<RttEstimator>,

    /// In-flight reliable packets.
    unacked: Mutex<UnackedTable>,

    /// Gate for the queue-empty callback. Zero while a callback is in
    /// flight, otherwise the earliest tick the next callback may fire.
    next_queue_empty_tick: AtomicI32,

    /// Consecutive dequeue passes that left the queue above the low-water
    /// mark.
    empty_tick_counter: AtomicI64,

    /// Packet grant offered per queue-empty callback.
    prim_updates_per_callback: i64,

    /// Ramp-up threshold: below this effective rate each admitted packet
    /// nudges the adaptive root upward.
    start_rate: u32,

    /// Tick source.
    clock: Arc<dyn Clock>,

    /// Executor for callback dispatch.
    executor: Arc<dyn Executor>,

    /// Wire sink.
    sink: Arc<dyn PacketSendHandler>,

    /// Event callbacks of the owning simulator, cleared on shutdown.
    events: RwLock<Option<Arc<dyn EgressEvents>>>,

    /// Self-reference handed to spawned callback tasks.
    weak_self: Weak<ClientEgress>,
}

impl ClientEgress {
    /// Create the egress pipeline for a freshly established circuit.
    pub fn new(
        agent_id: Uuid,
        remote_endpoint: SocketAddr,
        circuit_code: u32,
        config: &Config,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn PacketSendHandler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let now = clock.tick_count();

        Ok(Arc::new_cyclic(|weak| Self {
            agent_id,
            remote_endpoint,
            circuit_code,
            trace_id: format!("{}-{}", agent_id, circuit_code),
            is_connected: AtomicBool::new(true),
            is_paused: AtomicBool::new(false),
            current_sequence: AtomicU32::new(0),
            current_ping_sequence: AtomicU8::new(0),
            last_packet_received_tick: AtomicI32::new(now),
            bytes_since_last_ack: AtomicI32::new(0),
            packets_sent: AtomicI32::new(0),
            packets_received: AtomicI32::new(0),
            unacked_bytes: AtomicI32::new(0),
            packets_sent_reported: AtomicI32::new(0),
            packets_received_reported: AtomicI32::new(0),
            queue: PriorityQueue::new(config.promotion_mask),
            throttle: Mutex::new(ThrottleTree::new(
                config.start_rate,
                config.min_client_rate,
                config.max_client_rate,
                now,
            )),
            rtt: Mutex::new(RttEstimator::new(config.default_rto, config.max_rto)),
            unacked: Mutex::new(UnackedTable::default()),
            next_queue_empty_tick: AtomicI32::new(1),
            empty_tick_counter: AtomicI64::new(0),
            prim_updates_per_callback: config.prim_updates_per_callback,
            start_rate: config.start_rate,
            clock,
            executor,
            sink,
            events: RwLock::new(None),
            weak_self: weak.clone(),
        }))
    }

    /// Agent this circuit belongs to.
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Remote UDP endpoint of the viewer.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    /// Circuit code negotiated during the handshake.
    pub fn circuit_code(&self) -> u32 {
        self.circuit_code
    }

    /// Whether the circuit is still connected.
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// Install or clear the event callbacks.
    pub fn set_events(&self, events: Option<Arc<dyn EgressEvents>>) {
        *self.events.write().unwrap() = events;
    }

    /// Allocate the next reliable sequence number.
    pub fn next_sequence(&self) -> u32 {
        self.current_sequence
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Allocate the next ping id.
    pub fn next_ping_sequence(&self) -> u8 {
        self.current_ping_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Record an inbound packet on the circuit.
    pub fn on_packet_received(&self, now: i32) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.last_packet_received_tick.store(now, Ordering::Relaxed);
    }

    /// Tick of the most recent inbound packet.
    pub fn last_packet_received_tick(&self) -> i32 {
        self.last_packet_received_tick.load(Ordering::Relaxed)
    }

    /// Queue a packet for transmission.
    ///
    /// The packet's category selects its priority level. Returns false if
    /// the circuit is shut down or the category maps outside the queue.
    pub fn enqueue_outgoing(&self, packet: OutgoingPacket) -> bool {
        if !self.is_connected() {
            return false;
        }
        let priority = packet.category.priority();
        self.queue.enqueue(priority, QueueItem::Ready(packet))
    }

    /// Queue a lazy producer that is polled at dequeue time, at the
    /// priority of `category`.
    pub fn enqueue_lazy(
        &self,
        category: Category,
        producer: Box<dyn FnMut() -> Option<OutgoingPacket> + Send>,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.queue.enqueue(category.priority(), QueueItem::Lazy(producer))
    }

    /// Drain up to `max_n` packets from the queue into the send sink.
    ///
    /// A packet is dispatched when its category bypasses throttling or its
    /// bucket chain admits the payload; otherwise it is parked and, after
    /// the iteration budget is spent, re-queued one level above where it
    /// was, so fresh same-priority traffic cannot overtake it forever.
    ///
    /// Returns true iff at least one packet was dispatched. Afterwards the
    /// queue-empty signal is evaluated.
    pub fn dequeue_outgoing(&self, max_n: usize) -> bool {
        if !self.is_connected() {
            return false;
        }
        let now = self.clock.tick_count();
        let mut dispatched = false;

        if !self.is_paused.load(Ordering::Acquire) {
            let mut waiting: SmallVec<[(usize, OutgoingPacket); 8]> = SmallVec::new();

            for _ in 0..max_n {
                let (level, packet) = match self.queue.dequeue() {
                    Some(entry) => entry,
                    None => break,
                };

                let len = packet.payload_len();
                let admitted = if packet.category.is_throttled() {
                    let mut throttle = self.throttle.lock().unwrap();
                    let ok = throttle.remove_tokens(packet.category, len, now);
                    if ok && throttle.root_rate() < self.start_rate {
                        throttle.ramp_up();
                    }
                    ok
                } else {
                    true
                };

                if admitted {
                    self.sink.on_packet_send(packet);
                    self.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.bytes_since_last_ack
                        .fetch_add(len as i32, Ordering::Relaxed);
                    dispatched = true;
                } else {
                    waiting.push((level, packet));
                }
            }

            for (level, packet) in waiting {
                let bumped = cmp::min(level + 1, LEVEL_COUNT - 1) as u8;
                self.queue.enqueue(bumped, QueueItem::Ready(packet));
            }
        }

        self.signal_queue_empty(now);
        dispatched
    }

    /// Apply a viewer throttle update. See
    /// [`ThrottleTree::set_throttles`] for the blob layout.
    pub fn set_throttles(&self, blob: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ClosedConnection);
        }
        let now = self.clock.tick_count();
        self.throttle.lock().unwrap().set_throttles(blob, now)?;
        trace!("{} applied throttle update", self.trace_id);
        Ok(())
    }

    /// Return the packed throttle report for the viewer.
    pub fn get_throttles_packed(&self) -> [u8; crate::throttle::THROTTLE_BLOB_LEN] {
        self.throttle.lock().unwrap().get_throttles_packed()
    }

    /// Feed a round-trip sample from an acknowledged packet, in
    /// milliseconds.
    pub fn update_round_trip(&self, r: i32) {
        if !self.is_connected() {
            return;
        }
        self.rtt.lock().unwrap().update(r);
    }

    /// Back off the retransmission timeout after a detected loss.
    pub fn backoff_rto(&self) {
        if !self.is_connected() {
            return;
        }
        self.rtt.lock().unwrap().backoff();
    }

    /// Current retransmission timeout in milliseconds.
    pub fn rto(&self) -> i32 {
        self.rtt.lock().unwrap().rto()
    }

    /// Drop the adaptive client rate after detected congestion.
    pub fn slow_down_send(&self) {
        if !self.is_connected() {
            return;
        }
        let now = self.clock.tick_count();
        self.throttle.lock().unwrap().slow_down(now);
    }

    /// Record a reliable packet handed to the wire, for the resend scanner.
    ///
    /// The packet must carry the sequence number it was serialized with.
    pub fn record_sent(&self, mut packet: OutgoingPacket) {
        if !self.is_connected() {
            return;
        }
        debug_assert!(packet.sequence != 0);
        packet.tick_sent = self.clock.tick_count();
        self.unacked_bytes
            .fetch_add(packet.payload_len() as i32, Ordering::Relaxed);

        let mut unacked = self.unacked.lock().unwrap();
        unacked.order.push_back(packet.sequence);
        unacked.packets.insert(packet.sequence, packet);
    }

    /// Process an acknowledgement for `sequence`. Returns whether the
    /// sequence was outstanding.
    pub fn ack_received(&self, sequence: u32) -> bool {
        let removed = self.unacked.lock().unwrap().packets.remove(&sequence);
        match removed {
            Some(packet) => {
                self.unacked_bytes
                    .fetch_sub(packet.payload_len() as i32, Ordering::Relaxed);
                self.bytes_since_last_ack.store(0, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Collect the reliable packets whose retransmission timeout expired.
    ///
    /// Each expired packet is re-armed (send tick refreshed, resend count
    /// bumped) and returned as a clone for the caller to re-enqueue under
    /// the [`Category::Resend`] budget. The scan stops at the first live
    /// packet that has not yet timed out.
    pub fn expired_unacked(&self, now: i32) -> Vec<OutgoingPacket> {
        let rto = self.rto();
        let mut expired = Vec::new();

        let mut guard = self.unacked.lock().unwrap();
        let table = &mut *guard;
        while let Some(sequence) = table.order.front().copied() {
            let Some(packet) = table.packets.get_mut(&sequence) else {
                // Acked away; drop the stale order entry.
                table.order.pop_front();
                continue;
            };
            if tick_delta(now, packet.tick_sent) < rto {
                break;
            }
            packet.tick_sent = now;
            packet.resend_count += 1;
            expired.push(packet.clone());
            table.order.pop_front();
            table.order.push_back(sequence);
        }
        expired
    }

    /// Bytes of reliable packets awaiting acknowledgement.
    pub fn unacked_bytes(&self) -> i32 {
        self.unacked_bytes.load(Ordering::Relaxed)
    }

    /// Stop dispatching packets without tearing the circuit down.
    pub fn pause(&self) {
        self.is_paused.store(true, Ordering::Release);
    }

    /// Resume dispatching after [`pause`].
    ///
    /// [`pause`]: ClientEgress::pause
    pub fn resume(&self) {
        self.is_paused.store(false, Ordering::Release);
    }

    /// Publish packet statistics to the event callbacks and advance the
    /// reported counters.
    pub fn send_packet_stats(&self) {
        if !self.is_connected() {
            return;
        }
        let events = self.events.read().unwrap().clone();
        let Some(events) = events else {
            return;
        };

        let sent = self.packets_sent.load(Ordering::Relaxed);
        let received = self.packets_received.load(Ordering::Relaxed);
        let in_delta = received - self.packets_received_reported.load(Ordering::Relaxed);
        let out_delta = sent - self.packets_sent_reported.load(Ordering::Relaxed);
        let unacked_bytes = self.unacked_bytes.load(Ordering::Relaxed);

        if catch_unwind(AssertUnwindSafe(|| {
            events.on_packet_stats(in_delta, out_delta, unacked_bytes)
        }))
        .is_err()
        {
            error!("{} packet-stats callback panicked", self.trace_id);
        }

        self.packets_received_reported
            .store(received, Ordering::Relaxed);
        self.packets_sent_reported.store(sent, Ordering::Relaxed);
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> EgressStats {
        let (rto, srtt) = {
            let rtt = self.rtt.lock().unwrap();
            (rtt.rto(), rtt.srtt() as i32)
        };
        EgressStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            unacked_bytes: self.unacked_bytes.load(Ordering::Relaxed),
            queued_packets: self.queue.len(),
            rto,
            srtt,
            client_rate: self.throttle.lock().unwrap().root_rate(),
        }
    }

    /// Tear the circuit down: drop every queued packet and clear the event
    /// callbacks. Idempotent; every other operation is a no-op afterwards.
    pub fn shutdown(&self) {
        if !self.is_connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let dropped = self.queue.clear();
        *self.events.write().unwrap() = None;
        debug!(
            "{} shut down, dropped {} queued packets",
            self.trace_id, dropped
        );
    }

    /// Evaluate the queue-empty signal after a dequeue pass.
    ///
    /// The signal fires when the queue is at or below the low-water mark,
    /// or when it has stayed above it for enough consecutive passes that
    /// producers deserve a (dampened) grant anyway.
    fn signal_queue_empty(&self, now: i32) {
        if self.is_paused.load(Ordering::Acquire) {
            return;
        }

        let count = self.queue.len() as i64;
        let stalled = self.empty_tick_counter.load(Ordering::Relaxed);

        if count <= QUEUE_EMPTY_LOW_WATER || stalled > QUEUE_EMPTY_STALL_TICKS {
            let mut num_packets = self.prim_updates_per_callback;
            if count > QUEUE_EMPTY_LOW_WATER {
                num_packets *= (num_packets / count) * (stalled / QUEUE_EMPTY_STALL_TICKS);
            }
            if num_packets >= MIN_CALLBACK_GRANT {
                self.empty_tick_counter.store(0, Ordering::Relaxed);
                self.begin_fire_queue_empty(num_packets, now);
            }
        } else {
            self.empty_tick_counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Dispatch the queue-empty callback on the executor, at most once per
    /// cool-down window.
    ///
    /// `next_queue_empty_tick` doubles as the re-entry sentinel: zero means
    /// a callback is in flight and further fires are suppressed until the
    /// running task re-arms the gate.
    fn begin_fire_queue_empty(&self, num_packets: i64, now: i32) {
        let gate = self.next_queue_empty_tick.load(Ordering::Acquire);
        if gate == 0 || now < gate {
            return;
        }
        if self
            .next_queue_empty_tick
            .compare_exchange(gate, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(client) = self.weak_self.upgrade() else {
            return;
        };
        self.executor.spawn(Box::new(move || {
            if client.is_connected() {
                let events = client.events.read().unwrap().clone();
                if let Some(events) = events {
                    if catch_unwind(AssertUnwindSafe(|| events.on_queue_empty(num_packets)))
                        .is_err()
                    {
                        error!("{} queue-empty callback panicked", client.trace_id);
                    }
                }
            }
            let now = client.clock.tick_count();
            let next = now.wrapping_add(MIN_CALLBACK_MS) & TICK_MASK;
            client
                .next_queue_empty_tick
                .store(cmp::max(1, next), Ordering::Release);
        }));
    }
}

impl std::fmt::Debug for ClientEgress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ClientEgress({} {} connected={})",
            self.trace_id,
            self.remote_endpoint,
            self.is_connected()
        )
    }
}
