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

use bytes::Buf;
use bytes::BufMut;
use strum::EnumCount;
use strum::IntoEnumIterator;
use strum_macros::EnumCount as EnumCountMacro;
use strum_macros::EnumIter;

use crate::bucket::BucketKey;
use crate::bucket::BucketTree;
use crate::bucket::TokenBucket;
use crate::bucket::MAX_PER_CLIENT_RATE;
use crate::bucket::MIN_PER_CLIENT_RATE;
use crate::error::Error;
use crate::Result;

/// Size of the wire throttle blob: seven single-precision floats.
pub const THROTTLE_BLOB_LEN: usize = 28;

/// Upper bound for a single wire throttle value, in bits per second.
///
/// Applied before any arithmetic so that hostile floats cannot overflow the
/// integer scaling below.
const MAX_THROTTLE_BITS: f32 = (MAX_PER_CLIENT_RATE * 8) as f32;

/// Per-category drip rates used until the viewer's first throttle update,
/// in bytes per second.
const DEFAULT_CATEGORY_RATE: u32 = 1_000;
const DEFAULT_RESEND_RATE: u32 = 12_500;

/// Throttle category of an outgoing packet.
///
/// Categories are both the unit of rate shaping (each owns a token bucket)
/// and the source of the packet's priority level. The first seven variants
/// are the wire categories of the viewer's throttle update, in wire order;
/// the remaining ones are derived server-side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumCountMacro)]
pub enum Category {
    /// Retransmissions of reliable packets.
    Resend,

    /// Terrain patches.
    Land,

    /// Wind layer data.
    Wind,

    /// Cloud layer data.
    Cloud,

    /// Object and scene updates.
    Task,

    /// Texture data.
    Texture,

    /// Asset downloads.
    Asset,

    /// Asset transfers split out of the Asset budget.
    Transfer,

    /// Object state updates split out of the Task budget.
    State,

    /// Avatar appearance and animation data split out of the State budget.
    AvatarInfo,

    /// Urgent control traffic. Bypasses throttling entirely.
    OutBand,
}

impl Category {
    /// Default priority level of the category. 0 is lowest, 7 highest.
    pub fn priority(self) -> u8 {
        match self {
            Category::Wind => 0,
            Category::Cloud => 0,
            Category::Land => 1,
            Category::Texture => 2,
            Category::Asset => 3,
            Category::Task => 4,
            Category::Transfer => 5,
            Category::State => 5,
            Category::AvatarInfo => 6,
            Category::Resend => 7,
            Category::OutBand => 7,
        }
    }

    /// Parent category in the throttle hierarchy. `None` parents the
    /// category directly to the client root.
    pub fn parent(self) -> Option<Category> {
        match self {
            Category::Transfer => Some(Category::Asset),
            Category::State => Some(Category::Task),
            Category::AvatarInfo => Some(Category::State),
            _ => None,
        }
    }

    /// Whether packets of this category consume throttle tokens.
    pub fn is_throttled(self) -> bool {
        !matches!(self, Category::OutBand)
    }
}

/// Per-category drip rates in bytes per second, after the server-side
/// derivation of the sub-categories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ThrottleRates {
    resend: i64,
    land: i64,
    wind: i64,
    cloud: i64,
    task: i64,
    texture: i64,
    asset: i64,
    transfer: i64,
    state: i64,
    avatar_info: i64,
}

impl ThrottleRates {
    /// Decode the seven wire values and derive the sub-category splits.
    ///
    /// Wire values are bits per second; each is sanitized (NaN becomes 0,
    /// infinities and out-of-range values clamp) before the conversion to
    /// bytes per second.
    fn decode(mut blob: &[u8]) -> Self {
        let mut next = || {
            let v = blob.get_f32_le();
            let v = if v.is_nan() { 0.0 } else { v };
            let bits = v.clamp(0.0, MAX_THROTTLE_BITS);
            (bits as f64 * 0.125) as i64
        };

        let resend = next();
        let land = next();
        let wind = next();
        let cloud = next();
        let mut task = next();
        let texture = next();
        let mut asset = next();

        let mut state = task * 3 / 10;
        task -= state;
        let transfer = asset * 3 / 4;
        asset -= transfer;
        let avatar_info = state * 3 / 10;
        state -= avatar_info;

        Self {
            resend,
            land,
            wind,
            cloud,
            task,
            texture,
            asset,
            transfer,
            state,
            avatar_info,
        }
    }

    fn total(&self) -> i64 {
        self.resend
            + self.land
            + self.wind
            + self.cloud
            + self.task
            + self.texture
            + self.asset
            + self.transfer
            + self.state
            + self.avatar_info
    }

    fn for_each(&mut self, mut f: impl FnMut(&mut i64)) {
        f(&mut self.resend);
        f(&mut self.land);
        f(&mut self.wind);
        f(&mut self.cloud);
        f(&mut self.task);
        f(&mut self.texture);
        f(&mut self.asset);
        f(&mut self.transfer);
        f(&mut self.state);
        f(&mut self.avatar_info);
    }

    fn get(&self, category: Category) -> i64 {
        match category {
            Category::Resend => self.resend,
            Category::Land => self.land,
            Category::Wind => self.wind,
            Category::Cloud => self.cloud,
            Category::Task => self.task,
            Category::Texture => self.texture,
            Category::Asset => self.asset,
            Category::Transfer => self.transfer,
            Category::State => self.state,
            Category::AvatarInfo => self.avatar_info,
            Category::OutBand => 0,
        }
    }
}

/// The per-client throttle hierarchy: an adaptive root bucket capping the
/// whole circuit, with one child bucket per category parented according to
/// [`Category::parent`].
#[derive(Debug)]
pub struct ThrottleTree {
    /// Bucket arena.
    tree: BucketTree,

    /// Key of the adaptive client-root bucket.
    root: BucketKey,

    /// Per-category bucket keys, indexed by `Category as usize`.
    keys: [BucketKey; Category::COUNT],

    /// Cache of the packed throttle report.
    packed: Option<[u8; THROTTLE_BLOB_LEN]>,
}

impl ThrottleTree {
    /// Build the hierarchy with the adaptive root at `start_rate`, confined
    /// to `[min_rate, max_rate]`, and modest per-category defaults.
    pub fn new(start_rate: u32, min_rate: u32, max_rate: u32, now: i32) -> Self {
        let mut tree = BucketTree::new();
        let root = tree.insert(TokenBucket::new_adaptive(
            start_rate, min_rate, max_rate, now,
        ));

        // Parents precede children in declaration order, so a single pass
        // can resolve every parent key.
        let mut keys = [root; Category::COUNT];
        for category in Category::iter() {
            let parent = match category.parent() {
                Some(p) => keys[p as usize],
                None => root,
            };
            let rate = match category {
                Category::Resend => DEFAULT_RESEND_RATE,
                Category::OutBand => 0,
                _ => DEFAULT_CATEGORY_RATE,
            };
            keys[category as usize] = tree.insert(TokenBucket::new(Some(parent), rate, now));
        }

        Self {
            tree,
            root,
            keys,
            packed: None,
        }
    }

    /// Attempt to consume `n` tokens for a packet of `category`, debiting
    /// the category's bucket and every ancestor up to the client root.
    pub fn remove_tokens(&mut self, category: Category, n: u32, now: i32) -> bool {
        self.tree.remove_tokens(self.keys[category as usize], n, now)
    }

    /// Return the requested drip rate of a category, in bytes per second.
    pub fn category_rate(&self, category: Category) -> u32 {
        self.tree.get(self.keys[category as usize]).requested_drip_rate()
    }

    /// Return the effective client-root rate, in bytes per second.
    pub fn root_rate(&self) -> u32 {
        self.tree.get(self.root).current_drip_rate()
    }

    /// Drop the client-root rate toward the floor after detected congestion.
    pub fn slow_down(&mut self, now: i32) {
        let root = self.tree.get_mut(self.root);
        root.drip(now, None);
        root.slow_down();
    }

    /// Nudge the client-root rate upward after a successful send.
    pub fn ramp_up(&mut self) {
        self.tree.get_mut(self.root).ramp_up();
    }

    /// Apply a viewer throttle update.
    ///
    /// The blob is seven little-endian `f32` values in bits per second, in
    /// the order resend, land, wind, cloud, task, texture, asset. The task
    /// and asset budgets are split into their derived sub-categories, the
    /// grand total is capped at the per-client ceiling, and a total below
    /// the per-client floor scales every category up by an integer
    /// percentage.
    pub fn set_throttles(&mut self, blob: &[u8], now: i32) -> Result<()> {
        if blob.len() != THROTTLE_BLOB_LEN {
            return Err(Error::InvalidThrottleBlob);
        }

        let mut rates = ThrottleRates::decode(blob);

        let total = rates.total().min(MAX_PER_CLIENT_RATE as i64);
        if total > 0 && total < MIN_PER_CLIENT_RATE as i64 {
            // Integer percentage scale-up. Note that this multiplies the
            // categories by MIN/total rather than normalizing their sum to
            // the floor; a total of 1000 B/s scales by 6.25x.
            let percent = MIN_PER_CLIENT_RATE as i64 * 100 / total;
            rates.for_each(|rate| *rate = *rate * percent / 100);
        }

        let root = self.tree.get_mut(self.root);
        root.drip(now, None);
        root.set_requested_drip_rate(total as u32);

        for category in Category::iter() {
            let key = self.keys[category as usize];
            self.tree
                .get_mut(key)
                .set_requested_drip_rate(rates.get(category) as u32);
        }

        self.packed = None;
        Ok(())
    }

    /// Return the packed throttle report: seven little-endian `f32` values
    /// in bytes per second, with the derived sub-categories folded back
    /// into their wire parents.
    pub fn get_throttles_packed(&mut self) -> [u8; THROTTLE_BLOB_LEN] {
        if let Some(packed) = self.packed {
            return packed;
        }

        let task = self.category_rate(Category::Task)
            + self.category_rate(Category::State)
            + self.category_rate(Category::AvatarInfo);
        let asset = self.category_rate(Category::Asset) + self.category_rate(Category::Transfer);

        let mut packed = [0u8; THROTTLE_BLOB_LEN];
        {
            let mut buf = &mut packed[..];
            buf.put_f32_le(self.category_rate(Category::Resend) as f32);
            buf.put_f32_le(self.category_rate(Category::Land) as f32);
            buf.put_f32_le(self.category_rate(Category::Wind) as f32);
            buf.put_f32_le(self.category_rate(Category::Cloud) as f32);
            buf.put_f32_le(task as f32);
            buf.put_f32_le(self.category_rate(Category::Texture) as f32);
            buf.put_f32_le(asset as f32);
        }

        self.packed = Some(packed);
        packed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    /// Build a wire blob from seven bits-per-second values.
    fn blob(values: [f32; 7]) -> Vec<u8> {
        let mut out = Vec::with_capacity(THROTTLE_BLOB_LEN);
        for v in values {
            out.put_f32_le(v);
        }
        out
    }

    fn tree() -> ThrottleTree {
        ThrottleTree::new(
            crate::bucket::START_PER_CLIENT_RATE,
            MIN_PER_CLIENT_RATE,
            MAX_PER_CLIENT_RATE,
            0,
        )
    }

    #[test]
    fn category_table() {
        assert_eq!(Category::COUNT, 11);

        let expected = [
            (Category::Wind, 0, None),
            (Category::Cloud, 0, None),
            (Category::Land, 1, None),
            (Category::Texture, 2, None),
            (Category::Asset, 3, None),
            (Category::Task, 4, None),
            (Category::Transfer, 5, Some(Category::Asset)),
            (Category::State, 5, Some(Category::Task)),
            (Category::AvatarInfo, 6, Some(Category::State)),
            (Category::Resend, 7, None),
            (Category::OutBand, 7, None),
        ];
        for (category, priority, parent) in expected {
            assert_eq!(category.priority(), priority, "{:?}", category);
            assert_eq!(category.parent(), parent, "{:?}", category);
        }

        for category in Category::iter() {
            assert_eq!(category.is_throttled(), category != Category::OutBand);
        }
    }

    #[test]
    fn decode_splits_sub_categories() {
        // 8000/16000/24000 bits -> 1000/2000/3000 bytes.
        let blob = blob([8000.0, 8000.0, 8000.0, 8000.0, 16000.0, 8000.0, 24000.0]);
        let rates = ThrottleRates::decode(&blob);

        assert_eq!(rates.resend, 1000);
        assert_eq!(rates.land, 1000);
        assert_eq!(rates.wind, 1000);
        assert_eq!(rates.cloud, 1000);

        // task 2000 -> state 600 -> avatar_info 180
        assert_eq!(rates.state, 420);
        assert_eq!(rates.avatar_info, 180);
        assert_eq!(rates.task, 1400);

        // asset 3000 -> transfer 2250
        assert_eq!(rates.transfer, 2250);
        assert_eq!(rates.asset, 750);

        // The splits are subtractive, so the totals survive.
        assert_eq!(rates.task + rates.state + rates.avatar_info, 2000);
        assert_eq!(rates.asset + rates.transfer, 3000);
    }

    #[test]
    fn decode_sanitizes_hostile_floats() {
        let blob = blob([
            f32::NAN,
            f32::INFINITY,
            f32::NEG_INFINITY,
            -5000.0,
            1e30,
            8000.0,
            0.0,
        ]);
        let rates = ThrottleRates::decode(&blob);

        assert_eq!(rates.resend, 0);
        assert_eq!(rates.land, MAX_PER_CLIENT_RATE as i64);
        assert_eq!(rates.wind, 0);
        assert_eq!(rates.cloud, 0);
        assert_eq!(
            rates.task + rates.state + rates.avatar_info,
            MAX_PER_CLIENT_RATE as i64
        );
        assert_eq!(rates.texture, 1000);
        assert_eq!(rates.asset, 0);
    }

    #[test]
    fn set_throttles_rejects_bad_length() {
        let mut tree = tree();
        assert_eq!(
            tree.set_throttles(&[0u8; 27], 0),
            Err(Error::InvalidThrottleBlob)
        );
        assert_eq!(
            tree.set_throttles(&[0u8; 29], 0),
            Err(Error::InvalidThrottleBlob)
        );
    }

    #[test]
    fn set_throttles_applies_rates() {
        let mut tree = tree();
        let blob = blob([8000.0, 8000.0, 8000.0, 8000.0, 16000.0, 8000.0, 24000.0]);
        tree.set_throttles(&blob, 0).unwrap();

        assert_eq!(tree.category_rate(Category::Land), 1000);
        assert_eq!(tree.category_rate(Category::Task), 1400);
        assert_eq!(tree.category_rate(Category::Transfer), 2250);
        assert_eq!(tree.category_rate(Category::OutBand), 0);

        // Root follows the grand total: 4 * 1000 + 2000 + 1000 + 3000.
        assert_eq!(tree.root_rate(), 10_000);
    }

    #[test]
    fn set_throttles_low_total_integer_scaling() {
        // Total decodes to exactly 1000 bytes/sec, which is below the
        // per-client floor. The integer percentage is 625, so every
        // category is multiplied by 6.25 rather than normalized.
        let mut tree = tree();
        let blob = blob([800.0, 1600.0, 400.0, 400.0, 1600.0, 1600.0, 1600.0]);
        tree.set_throttles(&blob, 0).unwrap();

        assert_eq!(tree.category_rate(Category::Resend), 625);
        assert_eq!(tree.category_rate(Category::Land), 1250);
        assert_eq!(tree.category_rate(Category::Wind), 312);
        assert_eq!(tree.category_rate(Category::Cloud), 312);
        assert_eq!(tree.category_rate(Category::Task), 875);
        assert_eq!(tree.category_rate(Category::Texture), 1250);
        assert_eq!(tree.category_rate(Category::Asset), 312);
        assert_eq!(tree.category_rate(Category::Transfer), 937);
        assert_eq!(tree.category_rate(Category::State), 262);
        assert_eq!(tree.category_rate(Category::AvatarInfo), 112);

        // The root still floors at the per-client minimum.
        assert_eq!(tree.root_rate(), MIN_PER_CLIENT_RATE);
    }

    #[test]
    fn set_throttles_all_zero() {
        let mut tree = tree();
        tree.set_throttles(&blob([0.0; 7]), 0).unwrap();

        for category in Category::iter() {
            assert_eq!(tree.category_rate(category), 0, "{:?}", category);
        }
        // The adaptive root never drops below its floor.
        assert_eq!(tree.root_rate(), MIN_PER_CLIENT_RATE);
    }

    #[test]
    fn packed_report_folds_sub_categories() {
        let mut tree = tree();
        let update = blob([8000.0, 8000.0, 8000.0, 8000.0, 16000.0, 8000.0, 24000.0]);
        tree.set_throttles(&update, 0).unwrap();

        let packed = tree.get_throttles_packed();
        let mut buf = &packed[..];
        assert_eq!(buf.get_f32_le(), 1000.0); // resend
        assert_eq!(buf.get_f32_le(), 1000.0); // land
        assert_eq!(buf.get_f32_le(), 1000.0); // wind
        assert_eq!(buf.get_f32_le(), 1000.0); // cloud
        assert_eq!(buf.get_f32_le(), 2000.0); // task + state + avatar_info
        assert_eq!(buf.get_f32_le(), 1000.0); // texture
        assert_eq!(buf.get_f32_le(), 3000.0); // asset + transfer

        // Cached until the next throttle update.
        assert_eq!(tree.get_throttles_packed(), packed);
        let zeros = blob([0.0; 7]);
        tree.set_throttles(&zeros, 0).unwrap();
        assert_ne!(tree.get_throttles_packed(), packed);
    }

    #[test]
    fn default_rates_before_first_update() {
        let mut tree = tree();
        assert_eq!(tree.category_rate(Category::Resend), 12_500);
        assert_eq!(tree.category_rate(Category::Texture), 1_000);
        assert_eq!(tree.category_rate(Category::OutBand), 0);
        assert_eq!(tree.root_rate(), crate::bucket::START_PER_CLIENT_RATE);

        // Fresh circuits can send throttled traffic right away.
        assert!(tree.remove_tokens(Category::Texture, 500, 1000));
    }
}
