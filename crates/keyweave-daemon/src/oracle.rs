//! Humanized delay generation.
//!
//! Every sleep in the engine is backed by a [`TimingOracle`] draw. A draw
//! combines three ingredients:
//!
//! 1. a per-value weight derived from the range's *sweet spot*
//!    configuration (a mapping `value -> target probability`, summing to
//!    at most 1 per range),
//! 2. a mild anti-clustering correction from a sliding window of the last
//!    50 samples for that range, damping values that have recently been
//!    drawn more often than their weight predicts,
//! 3. bounded multiplicative noise in [0.9, 1.1].
//!
//! A draw never leaves its range, and over many draws a sweet-spot value's
//! empirical frequency stays within ±30% of its configured target. History
//! windows are independent per range.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use keyweave_config::MsRange;

/// Samples remembered per range for the anti-clustering correction.
const HISTORY_WINDOW: usize = 50;

/// History length below which the anti-clustering correction stays off.
const HISTORY_WARMUP: usize = 10;

/// The named delay ranges the engine draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayRange {
    BufferLow,
    BufferMedium,
    BufferHigh,
    KeyDown,
    EchoHit,
    HoldRelease,
    DualOffset,
    TrafficWait,
}

impl DelayRange {
    pub const ALL: [DelayRange; 8] = [
        DelayRange::BufferLow,
        DelayRange::BufferMedium,
        DelayRange::BufferHigh,
        DelayRange::KeyDown,
        DelayRange::EchoHit,
        DelayRange::HoldRelease,
        DelayRange::DualOffset,
        DelayRange::TrafficWait,
    ];

    /// Canonical inclusive bounds, milliseconds.
    pub fn bounds(self) -> MsRange {
        match self {
            DelayRange::BufferLow => MsRange::new(129, 163),
            DelayRange::BufferMedium => MsRange::new(229, 263),
            DelayRange::BufferHigh => MsRange::new(513, 667),
            DelayRange::KeyDown => MsRange::new(23, 38),
            DelayRange::EchoHit => MsRange::new(15, 25),
            DelayRange::HoldRelease => MsRange::new(7, 18),
            DelayRange::DualOffset => MsRange::new(4, 10),
            DelayRange::TrafficWait => MsRange::new(10, 30),
        }
    }
}

/// Per-range sweet-spot configuration: `value -> target probability`.
/// Targets in one range must sum to at most 1.
pub type SweetSpots = Vec<(u64, f64)>;

#[derive(Debug, Default)]
struct RangeState {
    sweet: SweetSpots,
    history: Vec<u64>,
    /// Index of the oldest history slot; the window is a ring once full.
    cursor: usize,
}

impl RangeState {
    fn record(&mut self, sample: u64) {
        if self.history.len() < HISTORY_WINDOW {
            self.history.push(sample);
        } else {
            self.history[self.cursor] = sample;
            self.cursor = (self.cursor + 1) % HISTORY_WINDOW;
        }
    }
}

/// Bounded, humanized delay sampler. Cheap to share behind an `Arc`; all
/// draws are synchronous.
#[derive(Debug)]
pub struct TimingOracle {
    ranges: Mutex<HashMap<DelayRange, RangeState>>,
}

impl Default for TimingOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingOracle {
    /// An oracle with empty sweet-spot configuration: draws are uniform
    /// with noise.
    pub fn new() -> Self {
        let mut ranges = HashMap::new();
        for r in DelayRange::ALL {
            ranges.insert(r, RangeState::default());
        }
        TimingOracle {
            ranges: Mutex::new(ranges),
        }
    }

    /// Replace a range's sweet-spot configuration.
    ///
    /// Out-of-range values are dropped; targets are scaled down
    /// proportionally if they sum beyond 1.
    pub fn set_sweet_spots(&self, range: DelayRange, spots: &[(u64, f64)]) {
        let bounds = range.bounds();
        let mut sweet: SweetSpots = spots
            .iter()
            .copied()
            .filter(|(v, p)| *v >= bounds.min && *v <= bounds.max && *p > 0.0)
            .collect();
        let total: f64 = sweet.iter().map(|(_, p)| p).sum();
        if total > 1.0 {
            for (_, p) in &mut sweet {
                *p /= total;
            }
        }
        let mut ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = ranges.get_mut(&range) {
            state.sweet = sweet;
        }
    }

    /// Draw from a named range.
    pub fn draw(&self, range: DelayRange) -> u64 {
        let bounds = range.bounds();
        let mut ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
        let state = ranges.entry(range).or_default();
        let sample = weighted_sample(bounds, state);
        state.record(sample);
        sample
    }

    /// Draw uniformly (with noise) from an ad-hoc inclusive range, e.g. a
    /// step's own `keyDownDuration`. Ad-hoc draws carry no history.
    pub fn draw_between(&self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        rand::rng().random_range(min..=max)
    }

    /// [`Self::draw_between`] over an [`MsRange`].
    pub fn draw_range(&self, range: MsRange) -> u64 {
        self.draw_between(range.min, range.max)
    }
}

/// One weighted draw: sweet-spot weights, anti-clustering damping from the
/// history window, multiplicative noise, then a roulette-wheel pick.
fn weighted_sample(bounds: MsRange, state: &RangeState) -> u64 {
    let span = (bounds.max - bounds.min + 1) as usize;
    let mut rng = rand::rng();

    let sweet_total: f64 = state.sweet.iter().map(|(_, p)| p).sum();
    let plain_count = span - state.sweet.len().min(span);
    let plain_weight = if plain_count > 0 {
        (1.0 - sweet_total).max(0.0) / plain_count as f64
    } else {
        0.0
    };

    let history_len = state.history.len();
    let mut weights = Vec::with_capacity(span);
    let mut total = 0.0;
    for i in 0..span {
        let value = bounds.min + i as u64;
        let base = state
            .sweet
            .iter()
            .find(|(v, _)| *v == value)
            .map(|(_, p)| *p)
            .unwrap_or(plain_weight);

        let mut weight = base;
        if history_len >= HISTORY_WARMUP {
            let observed = state.history.iter().filter(|s| **s == value).count() as f64
                / history_len as f64;
            // Damp values running hot against their target, lift cold ones.
            let correction = ((base + 0.02) / (observed + 0.02)).clamp(0.5, 1.5);
            weight *= correction;
        }
        weight *= rng.random_range(0.9..=1.1);

        total += weight;
        weights.push(weight);
    }

    if total <= f64::EPSILON {
        return rng.random_range(bounds.min..=bounds.max);
    }

    let mut pick = rng.random_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        pick -= w;
        if pick <= 0.0 {
            return bounds.min + i as u64;
        }
    }
    bounds.max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_never_leave_their_range() {
        let oracle = TimingOracle::new();
        for range in DelayRange::ALL {
            let bounds = range.bounds();
            for _ in 0..2000 {
                let v = oracle.draw(range);
                assert!(
                    v >= bounds.min && v <= bounds.max,
                    "{range:?} produced {v} outside {bounds}"
                );
            }
        }
    }

    #[test]
    fn ad_hoc_draws_stay_inside() {
        let oracle = TimingOracle::new();
        for _ in 0..1000 {
            let v = oracle.draw_between(11, 17);
            assert!((11..=17).contains(&v));
        }
        assert_eq!(oracle.draw_between(9, 9), 9);
    }

    #[test]
    fn ad_hoc_draws_center_on_the_midpoint() {
        let oracle = TimingOracle::new();
        const DRAWS: usize = 300;
        let total: u64 = (0..DRAWS).map(|_| oracle.draw_between(11, 17)).sum();
        let mean = total as f64 / DRAWS as f64;
        assert!(
            (12.0..=16.0).contains(&mean),
            "mean of low-tier draws was {mean}"
        );
    }

    #[test]
    fn sweet_spots_hold_their_target_frequency() {
        let oracle = TimingOracle::new();
        oracle.set_sweet_spots(DelayRange::BufferLow, &[(140, 0.25), (151, 0.15)]);

        const DRAWS: usize = 4000;
        let mut hits_140 = 0usize;
        let mut hits_151 = 0usize;
        for _ in 0..DRAWS {
            match oracle.draw(DelayRange::BufferLow) {
                140 => hits_140 += 1,
                151 => hits_151 += 1,
                _ => {}
            }
        }

        let f140 = hits_140 as f64 / DRAWS as f64;
        let f151 = hits_151 as f64 / DRAWS as f64;
        assert!((0.7 * 0.25..=1.3 * 0.25).contains(&f140), "140 at {f140}");
        assert!((0.7 * 0.15..=1.3 * 0.15).contains(&f151), "151 at {f151}");
    }

    #[test]
    fn sweet_spots_outside_bounds_are_dropped() {
        let oracle = TimingOracle::new();
        // 500 is outside the low buffer range; only the in-range spot should
        // influence draws, and nothing may ever land on 500.
        oracle.set_sweet_spots(DelayRange::BufferLow, &[(500, 0.9), (130, 0.2)]);
        for _ in 0..1000 {
            let v = oracle.draw(DelayRange::BufferLow);
            assert!((129..=163).contains(&v));
        }
    }

    #[test]
    fn oversubscribed_targets_are_scaled() {
        let oracle = TimingOracle::new();
        // Targets sum to 1.5; the oracle scales them to sum 1. Draws still
        // cover only configured values plus the (zero-weight) remainder.
        oracle.set_sweet_spots(DelayRange::DualOffset, &[(5, 0.9), (6, 0.6)]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(oracle.draw(DelayRange::DualOffset));
        }
        assert!(seen.contains(&5));
        assert!(seen.contains(&6));
    }

    #[test]
    fn histories_are_independent_per_range() {
        let oracle = TimingOracle::new();
        // Heavy traffic on one range must not distort another's sweet spot.
        oracle.set_sweet_spots(DelayRange::EchoHit, &[(20, 0.3)]);
        for _ in 0..500 {
            oracle.draw(DelayRange::TrafficWait);
        }
        const DRAWS: usize = 3000;
        let hits = (0..DRAWS)
            .filter(|_| oracle.draw(DelayRange::EchoHit) == 20)
            .count();
        let f = hits as f64 / DRAWS as f64;
        assert!((0.7 * 0.3..=1.3 * 0.3).contains(&f), "20 at {f}");
    }
}
