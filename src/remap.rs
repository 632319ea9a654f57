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

//! Raw channel matrices to per-cell matrices.

use crate::config::IcConfig;
use crate::constants::layout::SLOTS_PER_IC;
use crate::constants::sentinel;
use crate::layout::MuxSelect;
use crate::matrix::{CellMatrix, Grid};

/// Sorts reconciled voltage channels into per-cell slots.
///
/// Grounded inputs are skipped; slots a short IC does not wire get the
/// voltage sentinel.
pub fn remap_voltages(raw: &Grid<f64>, ics: &[IcConfig], out: &mut CellMatrix) {
    for (ic, cfg) in ics.iter().enumerate() {
        let layout = cfg.layout();
        for slot in 0..SLOTS_PER_IC {
            let value = match layout.voltage_source(slot) {
                Some(ch) => raw.get(ic, ch).unwrap_or(sentinel::VOLTAGE),
                None => sentinel::VOLTAGE,
            };
            out.set(ic, slot, value);
        }
    }
}

/// Sorts one mux bank of reconciled temperatures into per-cell slots.
///
/// Only the slots belonging to `mux` are written, so calling this for both
/// banks builds the full matrix.
pub fn remap_temperatures(raw: &Grid<f64>, ics: &[IcConfig], mux: MuxSelect, out: &mut CellMatrix) {
    for (ic, cfg) in ics.iter().enumerate() {
        for (slot, source) in cfg.layout().temperature_sources(mux) {
            let value = match source {
                Some(aux) => raw.get(ic, aux).unwrap_or(sentinel::TEMPERATURE),
                None => sentinel::TEMPERATURE,
            };
            out.set(ic, slot, value);
        }
    }
}
