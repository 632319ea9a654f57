/*
 * This file is part of RingBMS.
 *
 * Copyright (C) 2025 RingBMS contributors
 *
 * RingBMS is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * RingBMS is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with RingBMS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Merging forward and backward readings of the same physical channel.

use crate::acquisition::{Direction, DualBuffer};
use crate::config::ReconcileConfig;
use crate::matrix::Grid;

/// How a voltage pair was resolved
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    /// Within tolerance, forward value taken
    Agree(f64),
    /// Both plausible but apart, lower value taken
    Conservative(f64),
    /// Forward reading dropped out, backward value taken
    ForwardDropout(f64),
    /// Backward reading dropped out, forward value taken
    BackwardDropout(f64),
    /// No rule applies; the previous canonical value is kept
    Ambiguous,
}

impl Resolution {
    pub fn value(&self) -> Option<f64> {
        match self {
            Resolution::Agree(v)
            | Resolution::Conservative(v)
            | Resolution::ForwardDropout(v)
            | Resolution::BackwardDropout(v) => Some(*v),
            Resolution::Ambiguous => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arbiter {
    tolerance: f64,
    floor: f64,
}

impl Arbiter {
    pub fn new(tolerance: f64, floor: f64) -> Self {
        Self { tolerance, floor }
    }

    pub fn from_config(cfg: &ReconcileConfig) -> Self {
        Self::new(cfg.tolerance, cfg.validity_floor)
    }

    /// Resolves a voltage pair, `a` from the forward pass and `b` from the
    /// mirrored backward pass.
    pub fn voltage(&self, a: f64, b: f64) -> Resolution {
        if (a - b).abs() < self.tolerance {
            Resolution::Agree(a)
        } else if a > self.floor && b > self.floor {
            Resolution::Conservative(a.min(b))
        } else if a > 0.0 && a < self.floor {
            Resolution::ForwardDropout(b)
        } else if b > 0.0 && b < self.floor {
            Resolution::BackwardDropout(a)
        } else {
            Resolution::Ambiguous
        }
    }

    /// Resolves a temperature pair; on disagreement the hotter reading wins.
    pub fn temperature(&self, a: f64, b: f64) -> f64 {
        if (a - b).abs() < self.tolerance {
            a
        } else {
            a.max(b)
        }
    }
}

/// Merges voltage buffers into `canonical`, returning the ambiguous channels.
///
/// Ambiguous channels keep whatever `canonical` held before.
pub fn reconcile_voltages(
    arbiter: &Arbiter,
    buffers: &DualBuffer,
    canonical: &mut Grid<f64>,
) -> Vec<(usize, usize)> {
    let forward = buffers.get(Direction::Forward);
    let backward = buffers.get(Direction::Backward);
    let n = buffers.ics();
    let mut ambiguous = Vec::new();

    for ic in 0..n {
        let mirror = n - 1 - ic;
        for ch in 0..buffers.channels() {
            let (Some(a), Some(b)) = (forward.get(ic, ch), backward.get(mirror, ch)) else {
                continue;
            };
            match arbiter.voltage(a, b).value() {
                Some(v) => {
                    canonical.set(ic, ch, v);
                }
                None => ambiguous.push((ic, ch)),
            }
        }
    }
    ambiguous
}

/// Merges temperature buffers (already converted to degrees) into `canonical`.
pub fn reconcile_temperatures(arbiter: &Arbiter, buffers: &DualBuffer, canonical: &mut Grid<f64>) {
    let forward = buffers.get(Direction::Forward);
    let backward = buffers.get(Direction::Backward);
    let n = buffers.ics();

    for ic in 0..n {
        let mirror = n - 1 - ic;
        for ch in 0..buffers.channels() {
            if let (Some(a), Some(b)) = (forward.get(ic, ch), backward.get(mirror, ch)) {
                canonical.set(ic, ch, arbiter.temperature(a, b));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> Arbiter {
        Arbiter::new(1.0, 0.5)
    }

    #[test]
    fn test_within_tolerance_takes_forward() {
        let arb = arbiter();
        for (a, b) in [(4.3, 4.25), (3.0, 3.9), (0.2, 0.0), (-0.3, 0.4)] {
            assert_eq!(arb.voltage(a, b), Resolution::Agree(a));
            assert_eq!(arb.voltage(b, a), Resolution::Agree(b));
        }
    }

    #[test]
    fn test_disagreement_above_floor_takes_min() {
        let arb = arbiter();
        for (a, b) in [(4.2, 2.9), (1.0, 5.9), (0.6, 1.7)] {
            assert_eq!(arb.voltage(a, b), Resolution::Conservative(a.min(b)));
            assert_eq!(arb.voltage(b, a), Resolution::Conservative(a.min(b)));
        }
    }

    #[test]
    fn test_dropouts() {
        let arb = arbiter();
        assert_eq!(arb.voltage(0.2, 3.7), Resolution::ForwardDropout(3.7));
        assert_eq!(arb.voltage(3.7, 0.2), Resolution::BackwardDropout(3.7));
    }

    #[test]
    fn test_ambiguous_region_only() {
        let arb = arbiter();
        // a exactly on the floor, b far above it
        assert_eq!(arb.voltage(0.5, 3.7), Resolution::Ambiguous);
        assert_eq!(arb.voltage(3.7, 0.5), Resolution::Ambiguous);
        // dead channel against a live one
        assert_eq!(arb.voltage(0.0, 3.7), Resolution::Ambiguous);
        assert_eq!(arb.voltage(-1.0, 3.7), Resolution::Ambiguous);
        assert_eq!(arb.voltage(3.7, 0.0), Resolution::Ambiguous);

        // sweep: ambiguity only where no rule applies
        let mut a: f64 = -2.0;
        while a < 7.0 {
            let mut b: f64 = -2.0;
            while b < 7.0 {
                let within = (a - b).abs() < 1.0;
                let both_valid = a > 0.5 && b > 0.5;
                let a_drop = a > 0.0 && a < 0.5;
                let b_drop = b > 0.0 && b < 0.5;
                let expect_ambiguous = !(within || both_valid || a_drop || b_drop);
                assert_eq!(arb.voltage(a, b) == Resolution::Ambiguous, expect_ambiguous, "a={} b={}", a, b);
                b += 0.25;
            }
            a += 0.25;
        }
    }

    #[test]
    fn test_temperature_prefers_hotter() {
        let arb = arbiter();
        assert_eq!(arb.temperature(25.0, 25.5), 25.0);
        assert_eq!(arb.temperature(25.0, 40.0), 40.0);
        assert_eq!(arb.temperature(40.0, 25.0), 40.0);
    }

    #[test]
    fn test_reconcile_uses_mirrored_ic() {
        let mut buffers = DualBuffer::new(6, 18);
        buffers.get_mut(Direction::Forward).set(2, 3, 4.3);
        buffers.get_mut(Direction::Backward).set(3, 3, 4.25);
        // backward reading of an unrelated IC must not matter
        buffers.get_mut(Direction::Backward).set(2, 3, 1.0);

        let mut canonical = Grid::new(6, 18, 0.0);
        reconcile_voltages(&arbiter(), &buffers, &mut canonical);
        assert_eq!(canonical.get(2, 3), Some(4.3));
    }

    #[test]
    fn test_reconcile_keeps_previous_on_ambiguous() {
        let mut buffers = DualBuffer::new(2, 18);
        buffers.get_mut(Direction::Forward).set(0, 0, 0.5);
        buffers.get_mut(Direction::Backward).set(1, 0, 3.7);

        let mut canonical = Grid::new(2, 18, 0.0);
        canonical.set(0, 0, 3.65);
        let ambiguous = reconcile_voltages(&arbiter(), &buffers, &mut canonical);
        assert_eq!(ambiguous, vec![(0, 0)]);
        assert_eq!(canonical.get(0, 0), Some(3.65));
    }
}
