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

//! Collaborator contracts for the cell monitor chain and the pack monitor.
//!
//! Command encoding, isoSPI transport and PEC checking live behind these
//! traits. Every call reports an [`ErrorCode`] bitfield which the controller
//! folds into one accumulated code per cycle.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::comm::CommPath;
use crate::constants::registers::{BLOCK_BYTES, CFGA_BYTE0, CFGB_MUX_HIGH, CFGB_MUX_LOW};
use crate::layout::MuxSelect;

/// Driver status bitfield. Zero is success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);
    /// Single PEC mismatch
    pub const PEC: ErrorCode = ErrorCode(0x01);
    /// Conversion or handshake timeout
    pub const TIMEOUT: ErrorCode = ErrorCode(0x08);
    pub const OTHER: ErrorCode = ErrorCode(0x80);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// True when the code exceeds the tolerated `ignore_threshold`.
    pub fn is_error(&self, ignore_threshold: u8) -> bool {
        self.0 > ignore_threshold
    }

    /// Row tag: `OK` or `ERR:0xNN`.
    pub fn tag(&self) -> String {
        if self.is_ok() {
            "OK".to_string()
        } else {
            format!("ERR:0x{:X}", self.0)
        }
    }
}

impl BitOr for ErrorCode {
    type Output = ErrorCode;

    fn bitor(self, rhs: ErrorCode) -> ErrorCode {
        ErrorCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorCode {
    fn bitor_assign(&mut self, rhs: ErrorCode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Which conversion and which register file a command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionKind {
    /// Cell voltage ADC, register groups A..F
    Cells,
    /// Auxiliary (GPIO/thermistor) ADC, register groups A..D
    Aux,
}

/// Configuration register block broadcast to every IC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigBlock {
    A([u8; BLOCK_BYTES]),
    B([u8; BLOCK_BYTES]),
}

impl ConfigBlock {
    /// Reference on, discharge off.
    pub fn config_a() -> Self {
        let mut bytes = [0u8; BLOCK_BYTES];
        bytes[0] = CFGA_BYTE0;
        ConfigBlock::A(bytes)
    }

    /// Selects the thermistor mux bank.
    pub fn config_b(mux: MuxSelect) -> Self {
        let mut bytes = [0u8; BLOCK_BYTES];
        bytes[0] = match mux {
            MuxSelect::High => CFGB_MUX_HIGH,
            MuxSelect::Low => CFGB_MUX_LOW,
        };
        ConfigBlock::B(bytes)
    }

    pub fn bytes(&self) -> &[u8; BLOCK_BYTES] {
        match self {
            ConfigBlock::A(b) | ConfigBlock::B(b) => b,
        }
    }

    /// Mux bank selected by a B block, `None` for A blocks.
    pub fn mux(&self) -> Option<MuxSelect> {
        match self {
            ConfigBlock::A(_) => None,
            ConfigBlock::B(b) if b[0] == CFGB_MUX_HIGH => Some(MuxSelect::High),
            ConfigBlock::B(_) => Some(MuxSelect::Low),
        }
    }
}

/// Cell monitor daisy chain.
///
/// `read_group` returns three raw codes per IC, IC 0 first, as seen from the
/// end of the chain the current path is attached to.
#[cfg_attr(test, mockall::automock)]
pub trait CellMonitorDriver {
    /// (Re)initialize the chain through `path`.
    fn init(&mut self, path: CommPath) -> ErrorCode;

    /// Device status word reported in the init banner.
    fn device_status(&self) -> u64;

    fn clear_conversion_registers(&mut self) -> ErrorCode;

    fn write_config(&mut self, block: &ConfigBlock) -> ErrorCode;

    fn trigger_conversion(&mut self, kind: ConversionKind) -> ErrorCode;

    /// End-of-conversion poll.
    fn conversion_done(&mut self) -> bool;

    fn read_group(&mut self, kind: ConversionKind, group: usize) -> (Vec<u16>, ErrorCode);
}

/// Slow channel values of the pack monitor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackSlowSample {
    pub current_a: f64,
    pub power_w: f64,
    pub battery_v: f64,
    pub ntc_c: f64,
    pub internal_c: f64,
}

/// Fast channel values sampled alongside the cell conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackFastSample {
    pub current_a: f64,
    pub battery_v: f64,
}

/// Pack current/voltage monitor sharing the chain
#[cfg_attr(test, mockall::automock)]
pub trait PackMonitor {
    /// New slow channel results are available.
    fn slow_ready(&mut self) -> bool;

    fn read_slow(&mut self) -> Result<PackSlowSample, ErrorCode>;

    fn read_fast(&mut self) -> Result<PackFastSample, ErrorCode>;
}
