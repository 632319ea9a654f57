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

//! Normalization and split averaging on per-cell matrices.
//!
//! Masks are validated at startup (see `config::config_problems`): a slot is
//! never both normalized and split, and split pairs never overlap.

use crate::config::IcConfig;
use crate::constants::sentinel;
use crate::layout::SlotMask;
use crate::matrix::CellMatrix;

/// Overwrites every slot in `mask(ic)` with `value`.
pub fn normalize(matrix: &mut CellMatrix, ics: &[IcConfig], mask: impl Fn(&IcConfig) -> SlotMask, value: f64) {
    for (ic, cfg) in ics.iter().enumerate() {
        for slot in mask(cfg).slots() {
            matrix.set(ic, slot, value);
        }
    }
}

pub fn normalize_voltages(matrix: &mut CellMatrix, ics: &[IcConfig]) {
    normalize(matrix, ics, |c| c.normalize_voltage, sentinel::VOLTAGE);
}

pub fn normalize_temperatures(matrix: &mut CellMatrix, ics: &[IcConfig]) {
    normalize(matrix, ics, |c| c.normalize_temperature, sentinel::TEMPERATURE);
}

/// Replaces both members of each split pair `(i-1, i)` with their mean.
pub fn apply_split(matrix: &mut CellMatrix, ics: &[IcConfig]) {
    for (ic, cfg) in ics.iter().enumerate() {
        for right in cfg.split_voltage.slots().filter(|s| *s > 0) {
            let left = right - 1;
            let (Some(x), Some(y)) = (matrix.get(ic, left), matrix.get(ic, right)) else {
                continue;
            };
            let mean = (x + y) / 2.0;
            matrix.set(ic, left, mean);
            matrix.set(ic, right, mean);
        }
    }
}
