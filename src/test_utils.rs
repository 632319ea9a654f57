/*
 * Test utilities and fixtures for RingBMS
 *
 * Shared builders for configurations, per-cell matrices and clocks used by
 * the unit tests of several modules.
 */

use std::time::Duration;

use crate::clock::ManualClock;
use crate::config::StackConfig;
use crate::matrix::CellMatrix;

/// Reference pack with the startup delay removed
pub fn reference_config() -> StackConfig {
    let mut cfg = StackConfig::reference();
    cfg.timing.startup_delay_ms = 0;
    cfg
}

/// Reference pack plus a short chain-closing monitor
pub fn seven_ic_config(cells: usize) -> StackConfig {
    reference_config().with_short_ic(cells)
}

/// `ics × 15` matrix filled with `fill`, then `(ic, slot, value)` overrides.
pub fn matrix_with(ics: usize, fill: f64, overrides: &[(usize, usize, f64)]) -> CellMatrix {
    let mut m = CellMatrix::cells(ics, fill);
    for &(ic, slot, value) in overrides {
        assert!(m.set(ic, slot, value), "override ({}, {}) out of range", ic, slot);
    }
    m
}

/// Manual clock already advanced by `elapsed`
pub fn clock_at(elapsed: Duration) -> ManualClock {
    let clock = ManualClock::new();
    clock.advance(elapsed);
    clock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn test_fixtures() {
        assert_eq!(seven_ic_config(6).ic_count(), 7);
        assert!(seven_ic_config(6).validate().is_empty());
        let m = matrix_with(2, 3.5, &[(1, 14, 4.0)]);
        assert_eq!(m.get(1, 14), Some(4.0));
        assert_eq!(m.get(0, 0), Some(3.5));
        assert_eq!(clock_at(Duration::from_millis(5)).now(), Duration::from_millis(5));
    }
}
