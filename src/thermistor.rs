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

//! NTC divider voltage to temperature.

use crate::constants::layout::AUX_REFERENCE_CHANNEL;
use crate::constants::thermistor::{BETA, KELVIN_OFFSET, R25_KOHMS, SERIES_RESISTOR_OHMS, T0_KELVIN};

/// Converts a divider tap voltage into degrees Celsius.
///
/// # Arguments
/// * `aux` - Tap voltage across the thermistor
/// * `reference` - Divider supply voltage
///
/// Returns 0.0 when the divider is degenerate (tap equal to the reference,
/// or a non-positive resistance). The fault engine treats an exact zero as
/// an implausible reading.
pub fn volt_to_temp(aux: f64, reference: f64) -> f64 {
    if aux == reference {
        return 0.0;
    }
    let r_kohms = SERIES_RESISTOR_OHMS * aux / (reference - aux) * 0.001;
    if r_kohms > 0.0 {
        BETA / ((r_kohms / R25_KOHMS).ln() + BETA / T0_KELVIN) - KELVIN_OFFSET
    } else {
        0.0
    }
}

/// Converts one IC's aux row in place using its own reference channel.
pub fn convert_row(row: &mut [f64]) {
    let Some(&reference) = row.get(AUX_REFERENCE_CHANNEL) else {
        return;
    };
    for v in row.iter_mut() {
        *v = volt_to_temp(*v, reference);
    }
}
