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

use slab::Slab;
use smallvec::SmallVec;

use crate::tick_delta;

/// Floor for the adaptive per-client drip rate, in bytes per second.
pub const MIN_PER_CLIENT_RATE: u32 = 6_250;

/// Ceiling for the adaptive per-client drip rate, in bytes per second.
pub const MAX_PER_CLIENT_RATE: u32 = 625_000;

/// Initial adaptive per-client drip rate, in bytes per second.
pub const START_PER_CLIENT_RATE: u32 = 25_000;

/// Multiplier applied to the burst size when the adaptive rate slows down.
const SLOW_DOWN_FACTOR: f64 = 0.95;

/// Multiplier applied to the requested rate on each adaptive ramp-up step.
const RAMP_UP_FACTOR: f64 = 1.005;

/// Key of a bucket within a [`BucketTree`] arena.
pub type BucketKey = usize;

/// A single-rate token bucket linked into a per-client hierarchy.
///
/// Tokens are bytes. A bucket accrues `current_drip_rate` tokens per second
/// up to `burst_rate`; consuming from a bucket also debits every ancestor,
/// so the sum of bytes admitted across siblings can never exceed the parent
/// budget while each sibling keeps its own burst envelope.
#[derive(Debug)]
pub struct TokenBucket {
    /// Target drip rate requested by the owner, in bytes per second.
    requested_drip_rate: u32,

    /// Effective drip rate after clamping against the parent, bytes per second.
    current_drip_rate: u32,

    /// Maximum token accumulation. Tracks the effective rate unless pinned
    /// with [`set_burst_rate`].
    ///
    /// [`set_burst_rate`]: TokenBucket::set_burst_rate
    burst_rate: u32,

    /// Pinned burst size, if any.
    burst_override: Option<u32>,

    /// Tokens currently available, in bytes.
    tokens: u32,

    /// Tick of the last drip.
    last_drip_tick: i32,

    /// Parent bucket within the owning arena. `None` for a root.
    parent: Option<BucketKey>,

    /// Requested-rate floor and ceiling. Present on adaptive buckets only.
    bounds: Option<(u32, u32)>,
}

impl TokenBucket {
    /// Create a fixed-rate bucket.
    pub fn new(parent: Option<BucketKey>, requested_drip_rate: u32, now: i32) -> Self {
        Self {
            requested_drip_rate,
            current_drip_rate: requested_drip_rate,
            burst_rate: requested_drip_rate,
            burst_override: None,
            tokens: 0,
            last_drip_tick: now,
            parent,
            bounds: None,
        }
    }

    /// Create an adaptive bucket whose requested rate is confined to
    /// `[min_rate, max_rate]`.
    pub fn new_adaptive(requested_drip_rate: u32, min_rate: u32, max_rate: u32, now: i32) -> Self {
        let mut bucket = Self::new(None, requested_drip_rate, now);
        bucket.bounds = Some((min_rate, max_rate));
        bucket.requested_drip_rate = requested_drip_rate.clamp(min_rate, max_rate);
        bucket.current_drip_rate = bucket.requested_drip_rate;
        bucket.burst_rate = bucket.current_drip_rate;
        bucket
    }

    /// Return the rate requested by the owner, in bytes per second.
    pub fn requested_drip_rate(&self) -> u32 {
        self.requested_drip_rate
    }

    /// Return the effective rate after the parent clamp, in bytes per second.
    pub fn current_drip_rate(&self) -> u32 {
        self.current_drip_rate
    }

    /// Return the maximum token accumulation, in bytes.
    pub fn burst_rate(&self) -> u32 {
        self.burst_rate
    }

    /// Return the tokens currently available, in bytes.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Return the parent key, if any.
    pub fn parent(&self) -> Option<BucketKey> {
        self.parent
    }

    /// Set the target drip rate. Adaptive buckets clamp the value into their
    /// configured bounds. The effective rate is recomputed on the next drip.
    pub fn set_requested_drip_rate(&mut self, rate: u32) {
        self.requested_drip_rate = match self.bounds {
            Some((min, max)) => rate.clamp(min, max),
            None => rate,
        };
        if self.parent.is_none() {
            self.current_drip_rate = self.requested_drip_rate;
        }
    }

    /// Pin the burst size instead of letting it track the effective rate.
    pub fn set_burst_rate(&mut self, burst: u32) {
        self.burst_override = Some(burst);
        self.burst_rate = burst;
        self.tokens = self.tokens.min(burst);
    }

    /// Accrue tokens for the time elapsed since the last drip.
    ///
    /// `parent_rate` is the parent's effective rate, already dripped; the
    /// effective rate of this bucket is re-clamped against it here.
    pub fn drip(&mut self, now: i32, parent_rate: Option<u32>) {
        self.current_drip_rate = match parent_rate {
            Some(cap) => self.requested_drip_rate.min(cap),
            None => self.requested_drip_rate,
        };
        if self.burst_override.is_none() {
            self.burst_rate = self.current_drip_rate;
        }

        let elapsed = tick_delta(now, self.last_drip_tick) as i64;
        let accrued = self.current_drip_rate as i64 * elapsed / 1000;
        self.tokens = (self.tokens as i64 + accrued).min(self.burst_rate as i64) as u32;
        self.last_drip_tick = now;
    }

    /// Remove `n` tokens. The caller has already checked availability.
    fn debit(&mut self, n: u32) {
        debug_assert!(self.tokens >= n);
        self.tokens = self.tokens.saturating_sub(n);
    }

    /// Drop the requested rate toward the floor after detected congestion.
    pub fn slow_down(&mut self) {
        let (min, _) = self.bounds.unwrap_or((0, u32::MAX));
        let slowed = (self.burst_rate as f64 * SLOW_DOWN_FACTOR) as u32;
        self.set_requested_drip_rate(slowed.max(min));
    }

    /// Nudge the requested rate upward after a successful send.
    pub fn ramp_up(&mut self) {
        let raised = (self.requested_drip_rate as f64 * RAMP_UP_FACTOR) as u32;
        self.set_requested_drip_rate(raised);
    }
}

/// Arena of token buckets forming the per-client throttle hierarchy.
///
/// Parent links are slab keys; the link graph is a forest (roots have no
/// parent). Consuming from a leaf drips and debits the whole ancestor chain
/// under a single `&mut` access, so the debit is atomic with respect to
/// sibling consumers.
#[derive(Debug, Default)]
pub struct BucketTree {
    buckets: Slab<TokenBucket>,
}

impl BucketTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            buckets: Slab::new(),
        }
    }

    /// Insert a bucket, returning its key.
    ///
    /// The bucket's parent key, if any, must already be present.
    pub fn insert(&mut self, bucket: TokenBucket) -> BucketKey {
        if let Some(parent) = bucket.parent {
            debug_assert!(self.buckets.contains(parent));
        }
        self.buckets.insert(bucket)
    }

    /// Return a shared reference to the bucket at `key`.
    pub fn get(&self, key: BucketKey) -> &TokenBucket {
        &self.buckets[key]
    }

    /// Return an exclusive reference to the bucket at `key`.
    pub fn get_mut(&mut self, key: BucketKey) -> &mut TokenBucket {
        &mut self.buckets[key]
    }

    /// Drip the ancestor chain of `leaf`, root first.
    pub fn drip(&mut self, leaf: BucketKey, now: i32) {
        let chain = self.chain(leaf);
        let mut parent_rate = None;
        for key in chain {
            let bucket = &mut self.buckets[key];
            bucket.drip(now, parent_rate);
            parent_rate = Some(bucket.current_drip_rate());
        }
    }

    /// Attempt to consume `n` tokens from `leaf` and every ancestor.
    ///
    /// The chain drips root first, then the whole chain is tested; the debit
    /// happens only if every bucket on the chain holds at least `n` tokens.
    pub fn remove_tokens(&mut self, leaf: BucketKey, n: u32, now: i32) -> bool {
        let chain = self.chain(leaf);

        let mut parent_rate = None;
        for key in chain.iter() {
            let bucket = &mut self.buckets[*key];
            bucket.drip(now, parent_rate);
            parent_rate = Some(bucket.current_drip_rate());
        }

        if chain.iter().any(|key| self.buckets[*key].tokens() < n) {
            return false;
        }

        for key in chain.iter() {
            self.buckets[*key].debit(n);
        }
        true
    }

    /// Return the chain of keys from the root down to `leaf` inclusive.
    fn chain(&self, leaf: BucketKey) -> SmallVec<[BucketKey; 4]> {
        let mut chain: SmallVec<[BucketKey; 4]> = SmallVec::new();
        let mut cursor = Some(leaf);
        while let Some(key) = cursor {
            debug_assert!(chain.len() < self.buckets.len().max(1), "bucket cycle");
            chain.push(key);
            cursor = self.buckets[key].parent();
        }
        chain.reverse();
        chain
    }
}
