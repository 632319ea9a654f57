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

//! Pack-wide maximum and minimum readings.

use std::fmt;

use crate::config::IcConfig;
use crate::layout::SlotMask;
use crate::matrix::CellMatrix;

/// A reading and where it was taken, 0-based
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extremum {
    pub value: f64,
    pub ic: usize,
    pub slot: usize,
}

impl fmt::Display for Extremum {
    /// Operator form, 1-based.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} (IC {}, cell {})", self.value, self.ic + 1, self.slot + 1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Extremums {
    pub max_voltage: Option<Extremum>,
    pub min_voltage: Option<Extremum>,
    pub max_temperature: Option<Extremum>,
}

impl Extremums {
    pub fn compute(volts: &CellMatrix, temps: &CellMatrix, ics: &[IcConfig]) -> Self {
        Self {
            max_voltage: scan(volts, ics, |c| c.normalize_voltage, |v, best| v > best),
            min_voltage: scan(volts, ics, |c| c.normalize_voltage, |v, best| v < best),
            max_temperature: scan(temps, ics, |c| c.normalize_temperature, |v, best| v > best),
        }
    }
}

/// Walks each IC's wired cells in chain order. A later value only replaces
/// the current best when `better` holds strictly, so ties keep the first.
fn scan(
    matrix: &CellMatrix,
    ics: &[IcConfig],
    mask: impl Fn(&IcConfig) -> SlotMask,
    better: impl Fn(f64, f64) -> bool,
) -> Option<Extremum> {
    let mut best: Option<Extremum> = None;
    for (ic, cfg) in ics.iter().enumerate() {
        let excluded = mask(cfg);
        for slot in 0..cfg.cells {
            if excluded.contains(slot) {
                continue;
            }
            let Some(value) = matrix.get(ic, slot) else {
                continue;
            };
            match best {
                Some(b) if !better(value, b.value) => {}
                _ => best = Some(Extremum { value, ic, slot }),
            }
        }
    }
    best
}
