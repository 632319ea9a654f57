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

//! Plausibility evaluation and the recheck window.
//!
//! Evaluation scans a per-cell matrix and raises category flags, marking the
//! offending (IC, slot) in the location matrix of its group. When a group has
//! any flag raised the controller re-runs that group's acquisition inside a
//! [`RecheckWindow`] until the readings clear or the window runs out.

use std::fmt;
use std::time::Duration;

use crate::config::Thresholds;
use crate::constants::limits::{TEMPERATURE_FLOOR, VOLTAGE_CEILING, VOLTAGE_FLOOR};
use crate::matrix::{CellMatrix, LocationMatrix};

/// Fault categories in flag order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCategory {
    UndervoltageAbsolute,
    OvervoltageAbsolute,
    UndervoltageThreshold,
    OvervoltageThreshold,
    UndertemperatureAbsolute,
    ZeroTemperature,
    OvertemperatureThreshold,
}

impl FaultCategory {
    pub const ALL: [FaultCategory; 7] = [
        FaultCategory::UndervoltageAbsolute,
        FaultCategory::OvervoltageAbsolute,
        FaultCategory::UndervoltageThreshold,
        FaultCategory::OvervoltageThreshold,
        FaultCategory::UndertemperatureAbsolute,
        FaultCategory::ZeroTemperature,
        FaultCategory::OvertemperatureThreshold,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn group(self) -> FaultGroup {
        if self.index() < 4 {
            FaultGroup::Voltage
        } else {
            FaultGroup::Temperature
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FaultCategory::UndervoltageAbsolute => "undervoltage (absolute)",
            FaultCategory::OvervoltageAbsolute => "overvoltage (absolute)",
            FaultCategory::UndervoltageThreshold => "undervoltage",
            FaultCategory::OvervoltageThreshold => "overvoltage",
            FaultCategory::UndertemperatureAbsolute => "undertemperature (absolute)",
            FaultCategory::ZeroTemperature => "implausible temperature",
            FaultCategory::OvertemperatureThreshold => "overtemperature",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Categories that share a recheck window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultGroup {
    Voltage,
    Temperature,
}

impl FaultGroup {
    pub fn categories(self) -> &'static [FaultCategory] {
        match self {
            FaultGroup::Voltage => &FaultCategory::ALL[..4],
            FaultGroup::Temperature => &FaultCategory::ALL[4..],
        }
    }
}

impl fmt::Display for FaultGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultGroup::Voltage => write!(f, "voltage"),
            FaultGroup::Temperature => write!(f, "temperature"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaultState {
    flags: [bool; 7],
    voltage_locations: LocationMatrix,
    temperature_locations: LocationMatrix,
    /// Voltage fault confirmed by the recheck window
    pub voltage_fault: bool,
    /// Temperature fault confirmed by the recheck window
    pub temperature_fault: bool,
}

impl FaultState {
    pub fn new(ics: usize) -> Self {
        Self {
            flags: [false; 7],
            voltage_locations: LocationMatrix::locations(ics),
            temperature_locations: LocationMatrix::locations(ics),
            voltage_fault: false,
            temperature_fault: false,
        }
    }

    /// Top of cycle: every flag, location and confirmed fault cleared.
    pub fn clear(&mut self) {
        self.flags = [false; 7];
        self.voltage_locations.fill(false);
        self.temperature_locations.fill(false);
        self.voltage_fault = false;
        self.temperature_fault = false;
    }

    /// Clears the flags and locations of one group, keeping confirmed faults.
    pub fn clear_group(&mut self, group: FaultGroup) {
        for c in group.categories() {
            self.flags[c.index()] = false;
        }
        self.locations_mut(group).fill(false);
    }

    pub fn raise(&mut self, category: FaultCategory, ic: usize, slot: usize) {
        self.flags[category.index()] = true;
        self.locations_mut(category.group()).set(ic, slot, true);
    }

    pub fn is_set(&self, category: FaultCategory) -> bool {
        self.flags[category.index()]
    }

    pub fn group_active(&self, group: FaultGroup) -> bool {
        group.categories().iter().any(|c| self.is_set(*c))
    }

    pub fn any_active(&self) -> bool {
        self.flags.iter().any(|f| *f)
    }

    pub fn active_categories(&self) -> Vec<FaultCategory> {
        FaultCategory::ALL.iter().copied().filter(|c| self.is_set(*c)).collect()
    }

    pub fn locations(&self, group: FaultGroup) -> &LocationMatrix {
        match group {
            FaultGroup::Voltage => &self.voltage_locations,
            FaultGroup::Temperature => &self.temperature_locations,
        }
    }

    fn locations_mut(&mut self, group: FaultGroup) -> &mut LocationMatrix {
        match group {
            FaultGroup::Voltage => &mut self.voltage_locations,
            FaultGroup::Temperature => &mut self.temperature_locations,
        }
    }

    pub fn confirmed(&self, group: FaultGroup) -> bool {
        match group {
            FaultGroup::Voltage => self.voltage_fault,
            FaultGroup::Temperature => self.temperature_fault,
        }
    }

    pub fn set_confirmed(&mut self, group: FaultGroup, value: bool) {
        match group {
            FaultGroup::Voltage => self.voltage_fault = value,
            FaultGroup::Temperature => self.temperature_fault = value,
        }
    }
}

/// Scans every slot of `volts` against the voltage limits.
pub fn evaluate_voltages(volts: &CellMatrix, thresholds: &Thresholds, state: &mut FaultState) {
    for (ic, slot, v) in volts.iter() {
        if v < VOLTAGE_FLOOR {
            state.raise(FaultCategory::UndervoltageAbsolute, ic, slot);
        }
        if v > VOLTAGE_CEILING {
            state.raise(FaultCategory::OvervoltageAbsolute, ic, slot);
        }
        if v < thresholds.undervoltage && v > VOLTAGE_FLOOR {
            state.raise(FaultCategory::UndervoltageThreshold, ic, slot);
        }
        if v > thresholds.overvoltage && v < VOLTAGE_CEILING {
            state.raise(FaultCategory::OvervoltageThreshold, ic, slot);
        }
    }
}

/// Scans every slot of `temps` against the temperature limits.
pub fn evaluate_temperatures(temps: &CellMatrix, thresholds: &Thresholds, state: &mut FaultState) {
    for (ic, slot, t) in temps.iter() {
        if t < TEMPERATURE_FLOOR {
            state.raise(FaultCategory::UndertemperatureAbsolute, ic, slot);
        }
        if t == TEMPERATURE_FLOOR {
            state.raise(FaultCategory::ZeroTemperature, ic, slot);
        }
        if t > thresholds.overtemperature {
            state.raise(FaultCategory::OvertemperatureThreshold, ic, slot);
        }
    }
}

/// Result of a finished recheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecheckOutcome {
    /// The group cleared inside the window
    Transient { passes: u32 },
    /// The window ran out with the group still raised
    Persistent { passes: u32, elapsed: Duration },
}

impl RecheckOutcome {
    pub fn is_persistent(&self) -> bool {
        matches!(self, RecheckOutcome::Persistent { .. })
    }
}

/// Next step of a running recheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecheckStep {
    Continue,
    Done(RecheckOutcome),
}

/// Time budget for confirming a raised group.
///
/// The caller clears the group, re-acquires, re-evaluates and reports the
/// result through [`RecheckWindow::record`]. At least one pass always runs.
#[derive(Debug, Clone)]
pub struct RecheckWindow {
    started: Duration,
    window: Duration,
    elapsed: Duration,
    passes: u32,
}

impl RecheckWindow {
    /// # Arguments
    /// * `now` - Clock reading when the fault was first seen
    /// * `window` - How long the group may stay raised before it is confirmed
    pub fn start(now: Duration, window: Duration) -> Self {
        Self {
            started: now,
            window,
            elapsed: Duration::ZERO,
            passes: 0,
        }
    }

    pub fn record(&mut self, still_raised: bool, now: Duration) -> RecheckStep {
        self.passes += 1;
        if !still_raised {
            return RecheckStep::Done(RecheckOutcome::Transient { passes: self.passes });
        }
        self.elapsed = now.saturating_sub(self.started);
        if self.elapsed >= self.window {
            RecheckStep::Done(RecheckOutcome::Persistent {
                passes: self.passes,
                elapsed: self.elapsed,
            })
        } else {
            RecheckStep::Continue
        }
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::matrix_with;

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    #[test]
    fn test_category_groups() {
        assert_eq!(FaultGroup::Voltage.categories().len(), 4);
        assert_eq!(FaultGroup::Temperature.categories().len(), 3);
        assert!(FaultGroup::Temperature.categories().contains(&FaultCategory::ZeroTemperature));
        assert_eq!(FaultCategory::OvertemperatureThreshold.index(), 6);
        assert_eq!(FaultCategory::OvervoltageThreshold.group(), FaultGroup::Voltage);
    }

    #[test]
    fn test_overvoltage_scenario() {
        let volts = matrix_with(6, 3.7, &[(2, 3, 4.3)]);
        let mut state = FaultState::new(6);
        evaluate_voltages(&volts, &thresholds(), &mut state);
        assert_eq!(state.active_categories(), vec![FaultCategory::OvervoltageThreshold]);
        assert_eq!(state.locations(FaultGroup::Voltage).marked(), vec![(2, 3)]);
        assert!(!state.group_active(FaultGroup::Temperature));
    }

    #[test]
    fn test_voltage_limits() {
        let volts = matrix_with(1, 3.7, &[(0, 0, 0.2), (0, 1, 6.5), (0, 2, 2.0), (0, 3, 5.0), (0, 4, 0.5)]);
        let mut state = FaultState::new(1);
        evaluate_voltages(&volts, &thresholds(), &mut state);
        assert!(state.is_set(FaultCategory::UndervoltageAbsolute));
        assert!(state.is_set(FaultCategory::OvervoltageAbsolute));
        assert!(state.is_set(FaultCategory::UndervoltageThreshold));
        assert!(state.is_set(FaultCategory::OvervoltageThreshold));
        // exactly on the floor is neither absolute nor threshold undervoltage
        assert_eq!(state.locations(FaultGroup::Voltage).marked(), vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn test_sentinels_are_inert() {
        let volts = matrix_with(2, 3.5, &[]);
        let temps = matrix_with(2, 30.0, &[]);
        let mut state = FaultState::new(2);
        evaluate_voltages(&volts, &thresholds(), &mut state);
        evaluate_temperatures(&temps, &thresholds(), &mut state);
        assert!(!state.any_active());
    }

    #[test]
    fn test_temperature_limits() {
        let temps = matrix_with(1, 25.0, &[(0, 0, -5.0), (0, 1, 0.0), (0, 2, 45.5), (0, 3, 45.0)]);
        let mut state = FaultState::new(1);
        evaluate_temperatures(&temps, &thresholds(), &mut state);
        assert_eq!(
            state.active_categories(),
            vec![
                FaultCategory::UndertemperatureAbsolute,
                FaultCategory::ZeroTemperature,
                FaultCategory::OvertemperatureThreshold,
            ]
        );
        assert_eq!(state.locations(FaultGroup::Temperature).marked(), vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[test]
    fn test_clear_group_keeps_other_group() {
        let mut state = FaultState::new(1);
        state.raise(FaultCategory::OvervoltageThreshold, 0, 1);
        state.raise(FaultCategory::ZeroTemperature, 0, 2);
        state.voltage_fault = true;
        state.clear_group(FaultGroup::Voltage);
        assert!(!state.group_active(FaultGroup::Voltage));
        assert!(!state.locations(FaultGroup::Voltage).any());
        assert!(state.group_active(FaultGroup::Temperature));
        assert!(state.voltage_fault);
        state.clear();
        assert!(!state.any_active());
        assert!(!state.voltage_fault);
    }

    #[test]
    fn test_recheck_transient_clears() {
        let window = Duration::from_millis(400);
        let mut w = RecheckWindow::start(Duration::ZERO, window);
        // fault persists for two passes at 50 ms each, then clears
        assert_eq!(w.record(true, Duration::from_millis(50)), RecheckStep::Continue);
        assert_eq!(w.record(true, Duration::from_millis(100)), RecheckStep::Continue);
        assert_eq!(
            w.record(false, Duration::from_millis(150)),
            RecheckStep::Done(RecheckOutcome::Transient { passes: 3 })
        );
    }

    #[test]
    fn test_recheck_persistent_only_after_window() {
        let window = Duration::from_millis(400);
        let mut w = RecheckWindow::start(Duration::from_millis(1000), window);
        let mut t = 1000;
        loop {
            t += 50;
            match w.record(true, Duration::from_millis(t)) {
                RecheckStep::Continue => assert!(t - 1000 < 400),
                RecheckStep::Done(outcome) => {
                    assert_eq!(
                        outcome,
                        RecheckOutcome::Persistent { passes: 8, elapsed: Duration::from_millis(400) }
                    );
                    assert!(outcome.is_persistent());
                    break;
                }
            }
        }
    }

    #[test]
    fn test_recheck_first_pass_clean() {
        let mut w = RecheckWindow::start(Duration::ZERO, Duration::from_millis(900));
        assert_eq!(
            w.record(false, Duration::ZERO),
            RecheckStep::Done(RecheckOutcome::Transient { passes: 1 })
        );
        assert_eq!(w.passes(), 1);
    }
}
