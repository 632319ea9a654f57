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

//! Constants for RingBMS
//!
//! Hardware layout, wire formats and reference defaults live here.
//! Tunables that a pack integrator may change are mirrored in `config`.

/// Cell monitor register layout
pub mod layout {
    /// Raw voltage channels per cell monitor (groups A..F)
    pub const RAW_VOLTAGE_CHANNELS: usize = 18;

    /// Raw aux channels per cell monitor (groups A..D)
    pub const RAW_AUX_CHANNELS: usize = 12;

    /// Logical per-cell slots per cell monitor
    pub const SLOTS_PER_IC: usize = 15;

    /// Channels returned per IC by one register group read
    pub const CHANNELS_PER_GROUP: usize = 3;

    /// Voltage register groups (A..F)
    pub const VOLTAGE_GROUPS: usize = RAW_VOLTAGE_CHANNELS / CHANNELS_PER_GROUP;

    /// Aux register groups (A..D)
    pub const AUX_GROUPS: usize = RAW_AUX_CHANNELS / CHANNELS_PER_GROUP;

    /// Voltage channels tied to ground on the board
    pub const GROUNDED_VOLTAGE_CHANNELS: [usize; 3] = [5, 11, 17];

    /// Aux channel carrying the thermistor divider reference
    pub const AUX_REFERENCE_CHANNEL: usize = 5;

    /// Largest cell count a short IC may wire
    pub const SHORT_IC_MAX_CELLS: usize = 6;

    /// Longest chain; CSV columns carry one letter per IC
    pub const MAX_ICS: usize = 26;

    /// Volts per LSB of a raw conversion code
    pub const RAW_LSB_VOLTS: f64 = 100e-6;
}

/// Neutral values written into unpopulated or ignored slots
pub mod sentinel {
    pub const VOLTAGE: f64 = 3.5;
    pub const TEMPERATURE: f64 = 30.0;

    /// Backward voltage buffer contents before the first backward pass
    pub const BACKWARD_SEED_VOLTAGE: f64 = 6.0;
}

/// Absolute plausibility bounds
pub mod limits {
    /// Below this a voltage reading is considered a dropout
    pub const VOLTAGE_FLOOR: f64 = 0.5;

    /// Above this a voltage reading is implausible
    pub const VOLTAGE_CEILING: f64 = 6.0;

    pub const TEMPERATURE_FLOOR: f64 = 0.0;
}

/// Register block contents
pub mod registers {
    /// Config A byte 0: reference on, ADC option, GPIO pulldowns off
    pub const CFGA_BYTE0: u8 = 0xFC;

    /// Config B byte 0 with the thermistor mux on its high inputs
    pub const CFGB_MUX_HIGH: u8 = 0x0F;

    /// Config B byte 0 with the thermistor mux on its low inputs
    pub const CFGB_MUX_LOW: u8 = 0x07;

    pub const BLOCK_BYTES: usize = 6;
}

/// Thermistor divider and curve (103JT class NTC)
pub mod thermistor {
    pub const SERIES_RESISTOR_OHMS: f64 = 10_000.0;
    pub const BETA: f64 = 3420.507_269_61;
    pub const R25_KOHMS: f64 = 12.11;
    pub const T0_KELVIN: f64 = 293.15;
    pub const KELVIN_OFFSET: f64 = 273.15;
}

/// Charger controller frames
pub mod charger {
    pub const FRAME_LEN: usize = 5;

    pub const STATUS_HARDWARE_FAILURE: u8 = 1;
    pub const STATUS_OVERHEAT: u8 = 2;
    pub const STATUS_INPUT_VOLTAGE: u8 = 4;
    pub const STATUS_BATTERY_DISCONNECTED: u8 = 8;
    pub const STATUS_COMM_FAILED: u8 = 16;

    /// Current below which a charger at voltage is idle
    pub const IDLE_CURRENT_AMPS: f64 = 0.1;

    /// Current above which a charger is delivering
    pub const DELIVERING_CURRENT_AMPS: f64 = 1.0;
}

/// Timing
pub mod timing {
    use std::time::Duration;

    /// Back-off after an aborted cycle
    pub const ERROR_BACKOFF: Duration = Duration::from_millis(100);

    /// Operator console poll interval while blocked on a debug interrupt
    pub const INTERRUPT_POLL: Duration = Duration::from_millis(100);
}

/// Communication paths
pub mod comm {
    pub const PRIMARY_CHIP_SELECT: u8 = 10;
    pub const SECONDARY_CHIP_SELECT: u8 = 37;
}

/// File locations
pub mod paths {
    pub const CONFIG_DIR_NAME: &str = "ringbms";
    pub const CONFIG_FILE: &str = "config.json";
    pub const SYSTEM_CONFIG: &str = "/etc/ringbms/config.json";
    pub const EVENT_LOG: &str = "/var/log/ringbms/events.json";
    pub const EVENT_LOG_FALLBACK: &str = "/tmp/ringbms_events.json";
}
