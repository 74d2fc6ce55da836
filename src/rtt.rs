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

use crate::TIMER_GRANULARITY_MS;

/// RTT smoothing weight for new samples.
/// See RFC 2988 Section 2
const RTT_ALPHA: f32 = 0.125;

/// RTT variance weight for new deviation samples.
const RTT_BETA: f32 = 0.25;

/// Multiplier applied to the variance term of the RTO.
const RTT_K: f32 = 4.0;

/// Default retransmission timeout in milliseconds.
pub const DEFAULT_RTO: i32 = 1000;

/// Upper bound for the retransmission timeout in milliseconds.
pub const MAX_RTO: i32 = 60_000;

/// RTT estimation for a client circuit
/// See RFC 2988
#[derive(Copy, Clone, Debug)]
pub struct RttEstimator {
    /// The smoothed RTT of the circuit, an exponentially weighted moving
    /// average of RTT samples, in milliseconds.
    srtt: f32,

    /// The RTT variance estimates the variation in the RTT samples using a
    /// mean variation, in milliseconds.
    rttvar: f32,

    /// Current retransmission timeout in milliseconds.
    rto: i32,

    /// Lower bound for the computed RTO.
    min_rto: i32,

    /// Upper bound for the computed RTO.
    max_rto: i32,

    /// Clock granularity floor applied to the variance term, in milliseconds.
    granularity: i32,
}

impl RttEstimator {
    /// Create an estimator. Zero for either bound keeps its default.
    pub fn new(default_rto: i32, max_rto: i32) -> Self {
        let min_rto = if default_rto == 0 {
            DEFAULT_RTO
        } else {
            default_rto
        };
        let max_rto = if max_rto == 0 { MAX_RTO } else { max_rto };
        debug_assert!(0 < min_rto && min_rto <= max_rto);

        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: min_rto,
            min_rto,
            max_rto,
            granularity: TIMER_GRANULARITY_MS,
        }
    }

    /// Return the smoothed RTT in milliseconds.
    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    /// Return the mean deviation of RTT samples in milliseconds.
    pub fn rttvar(&self) -> f32 {
        self.rttvar
    }

    /// Return the current retransmission timeout in milliseconds.
    pub fn rto(&self) -> i32 {
        self.rto
    }

    /// Update the estimator with the given RTT sample in milliseconds.
    ///
    /// The first sample after construction or after [`backoff`] initializes
    /// the smoothed RTT and its variance; later samples are folded in with
    /// the RFC 2988 weights.
    ///
    /// [`backoff`]: RttEstimator::backoff
    pub fn update(&mut self, r: i32) {
        let r = r as f32;

        if self.rttvar == 0.0 {
            self.srtt = r;
            self.rttvar = r / 2.0;
        } else {
            self.rttvar = (1.0 - RTT_BETA) * self.rttvar + RTT_BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - RTT_ALPHA) * self.srtt + RTT_ALPHA * r;
        }

        let var_term = cmp::max(self.granularity, (RTT_K * self.rttvar) as i32);
        self.rto = (self.srtt as i32)
            .saturating_add(var_term)
            .clamp(self.min_rto, self.max_rto);
    }

    /// Back off after a detected loss or timeout.
    ///
    /// The RTO doubles (capped at the maximum) and the smoothed state is
    /// reset so that the next sample is treated as the first measurement.
    pub fn backoff(&mut self) {
        self.srtt = 0.0;
        self.rttvar = 0.0;
        self.rto = cmp::min(self.rto.saturating_mul(2), self.max_rto);
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial() {
        let r = RttEstimator::new(0, 0);
        assert_eq!(r.srtt(), 0.0);
        assert_eq!(r.rttvar(), 0.0);
        assert_eq!(r.rto(), DEFAULT_RTO);

        let r = RttEstimator::new(500, 30_000);
        assert_eq!(r.rto(), 500);
    }

    #[test]
    fn update() {
        let mut r = RttEstimator::new(0, 0);

        // First rtt sample
        r.update(100);
        assert_eq!(r.srtt(), 100.0);
        assert_eq!(r.rttvar(), 50.0);
        assert_eq!(r.rto(), 1000);

        // Second rtt sample
        r.update(200);
        assert_eq!(r.rttvar(), 62.5);
        assert_eq!(r.srtt(), 112.5);
        assert_eq!(r.rto(), 1000);
    }

    #[test]
    fn rto_tracks_large_samples() {
        let mut r = RttEstimator::new(0, 0);
        r.update(2000);
        // srtt=2000, rttvar=1000, rto=2000+4000
        assert_eq!(r.rto(), 6000);

        let mut r = RttEstimator::new(0, 5000);
        r.update(2000);
        assert_eq!(r.rto(), 5000);
    }

    #[test]
    fn backoff_doubles_until_saturated() {
        let mut r = RttEstimator::new(0, 0);
        let mut last = r.rto();
        for _ in 0..6 {
            r.backoff();
            assert!(r.rto() > last);
            assert_eq!(r.rto(), cmp::min(last * 2, MAX_RTO));
            last = r.rto();
        }

        // 1000 << 6 = 64000 caps at 60000; further backoff holds there.
        assert_eq!(r.rto(), MAX_RTO);
        r.backoff();
        assert_eq!(r.rto(), MAX_RTO);
    }

    #[test]
    fn rto_stays_bounded_under_random_samples() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut r = RttEstimator::new(0, 0);
        for _ in 0..10_000 {
            if rng.gen_ratio(1, 50) {
                r.backoff();
            } else {
                r.update(rng.gen_range(1..5_000));
            }
            assert!(r.rto() >= DEFAULT_RTO);
            assert!(r.rto() <= MAX_RTO);
        }
    }

    #[test]
    fn recovery_after_backoff() {
        let mut r = RttEstimator::new(0, 0);
        r.update(100);
        r.update(200);
        r.backoff();
        assert_eq!(r.srtt(), 0.0);
        assert_eq!(r.rttvar(), 0.0);

        // The next sample is treated as the first measurement again.
        r.update(150);
        assert_eq!(r.srtt(), 150.0);
        assert_eq!(r.rttvar(), 75.0);
    }
}
