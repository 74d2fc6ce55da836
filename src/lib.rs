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

//! Per-client egress pipeline for LLUDP-based virtual world simulators.
//!
//! Each viewer circuit owns one [`ClientEgress`], which composes the three
//! concerns of the hot send path:
//!
//! * **Scheduling**: a multi-level [`PriorityQueue`] with periodic
//!   promotion of lower levels, so sustained high-priority traffic cannot
//!   starve terrain or layer data.
//! * **Rate shaping**: a hierarchical token-bucket [`ThrottleTree`] rooted
//!   at an adaptive per-client bucket, driven by the viewer's throttle
//!   updates.
//! * **Reliability timing**: an RFC 2988 [`RttEstimator`] computing the
//!   retransmission timeout consumed by the resend scanner.
//!
//! The pipeline is sans-IO: the owning simulator injects a millisecond
//! [`Clock`], a background [`Executor`], and a [`PacketSendHandler`] sink,
//! and drives [`ClientEgress::dequeue_outgoing`] from its tick loop.
//!
//! [`ThrottleTree`]: throttle::ThrottleTree

use crate::bucket::MAX_PER_CLIENT_RATE;
use crate::bucket::MIN_PER_CLIENT_RATE;
use crate::bucket::START_PER_CLIENT_RATE;
use crate::queue::DEFAULT_PROMOTION_MASK;
use crate::rtt::DEFAULT_RTO;
use crate::rtt::MAX_RTO;

/// Mask applied to every tick value, keeping the clock in the non-negative
/// 31-bit range across wraparound.
pub const TICK_MASK: i32 = 0x7FFF_FFFF;

/// Granularity of the tick clock in milliseconds.
pub const TIMER_GRANULARITY_MS: i32 = 1;

/// A specialized [`Result`] type for egress pipeline operations.
///
/// [`Result`]: std::result::Result
pub type Result<T> = std::result::Result<T, Error>;

/// Elapsed ticks from `then` to `now`, tolerant of clock wraparound.
pub(crate) fn tick_delta(now: i32, then: i32) -> i32 {
    now.wrapping_sub(then) & TICK_MASK
}

/// Monotonic millisecond tick source shared by every egress component.
pub trait Clock: Send + Sync {
    /// Return the current tick. Implementations must mask the value with
    /// [`TICK_MASK`].
    fn tick_count(&self) -> i32;
}

/// Fire-and-forget background task executor used for callback dispatch.
pub trait Executor: Send + Sync {
    /// Run `task` off the caller's thread. Tasks are one-shot and
    /// non-cancellable.
    fn spawn(&self, task: Box<dyn FnOnce() + Send>);
}

/// The PacketSendHandler lists the callback used by the egress loop to
/// hand packets to the wire.
pub trait PacketSendHandler: Send + Sync {
    /// Called for each packet cleared for transmission. Ownership of the
    /// packet transfers to the sink.
    fn on_packet_send(&self, packet: OutgoingPacket);
}

/// Events the egress pipeline raises toward the owning simulator.
///
/// Both callbacks have empty default implementations; implementors override
/// what they consume. Panics inside a callback are logged and swallowed.
pub trait EgressEvents: Send + Sync {
    /// Called when packet statistics are published, with the counter deltas
    /// since the previous report.
    fn on_packet_stats(&self, in_delta: i32, out_delta: i32, unacked_bytes: i32) {
        let _ = (in_delta, out_delta, unacked_bytes);
    }

    /// Called when the outgoing queue drains below its low-water mark and
    /// upstream producers should generate roughly `num_packets` more
    /// updates.
    fn on_queue_empty(&self, num_packets: i64) {
        let _ = num_packets;
    }
}

/// Configurations for a client egress pipeline.
#[derive(Clone, Debug)]
pub struct Config {
    /// Initial retransmission timeout in milliseconds, also the lower bound
    /// of computed RTOs.
    pub(crate) default_rto: i32,

    /// Upper bound of the retransmission timeout in milliseconds.
    pub(crate) max_rto: i32,

    /// Promotion cadence mask of the outgoing queue.
    pub(crate) promotion_mask: u32,

    /// Packet grant offered per queue-empty callback.
    pub(crate) prim_updates_per_callback: i64,

    /// Initial adaptive per-client rate in bytes per second.
    pub(crate) start_rate: u32,

    /// Floor of the adaptive per-client rate in bytes per second.
    pub(crate) min_client_rate: u32,

    /// Ceiling of the adaptive per-client rate in bytes per second.
    pub(crate) max_client_rate: u32,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    pub fn new() -> Self {
        Self {
            default_rto: DEFAULT_RTO,
            max_rto: MAX_RTO,
            promotion_mask: DEFAULT_PROMOTION_MASK,
            prim_updates_per_callback: 100,
            start_rate: START_PER_CLIENT_RATE,
            min_client_rate: MIN_PER_CLIENT_RATE,
            max_client_rate: MAX_PER_CLIENT_RATE,
        }
    }

    /// Set the initial retransmission timeout in milliseconds. Zero restores
    /// the default.
    pub fn set_default_rto(&mut self, ms: i32) {
        self.default_rto = if ms == 0 { DEFAULT_RTO } else { ms };
    }

    /// Set the maximum retransmission timeout in milliseconds. Zero restores
    /// the default.
    pub fn set_max_rto(&mut self, ms: i32) {
        self.max_rto = if ms == 0 { MAX_RTO } else { ms };
    }

    /// Set the promotion cadence of the outgoing queue: a promotion sweep
    /// runs once every `mask + 1` enqueues at a level.
    pub fn set_promotion_mask(&mut self, mask: u32) {
        self.promotion_mask = mask;
    }

    /// Set the packet grant offered per queue-empty callback.
    pub fn set_prim_updates_per_callback(&mut self, n: i64) {
        self.prim_updates_per_callback = n;
    }

    /// Set the adaptive per-client rate envelope in bytes per second.
    pub fn set_client_rates(&mut self, start: u32, min: u32, max: u32) {
        self.start_rate = start;
        self.min_client_rate = min;
        self.max_client_rate = max;
    }

    /// Check the configuration for internal consistency.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_client_rate > self.max_client_rate
            || self.start_rate < self.min_client_rate
            || self.start_rate > self.max_client_rate
        {
            return Err(Error::InvalidConfig(format!(
                "client rates out of order: {}/{}/{}",
                self.min_client_rate, self.start_rate, self.max_client_rate
            )));
        }
        if self.default_rto <= 0 || self.default_rto > self.max_rto {
            return Err(Error::InvalidConfig(format!(
                "rto bounds out of order: {}/{}",
                self.default_rto, self.max_rto
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

pub use crate::bucket::MAX_PER_CLIENT_RATE as MAX_CLIENT_RATE;
pub use crate::bucket::MIN_PER_CLIENT_RATE as MIN_CLIENT_RATE;
pub use crate::client::ClientEgress;
pub use crate::client::EgressStats;
pub use crate::error::Error;
pub use crate::packet::OutgoingPacket;
pub use crate::queue::PriorityQueue;
pub use crate::queue::QueueItem;
pub use crate::rtt::RttEstimator;
pub use crate::throttle::Category;
pub use crate::throttle::THROTTLE_BLOB_LEN;

pub mod bucket;
pub mod client;
pub mod error;
pub mod packet;
pub mod queue;
pub mod rtt;
pub mod throttle;
