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

//! Measurement log lines and the operator report.
//!
//! IC columns are named with a lowercase letter per IC (`a` for IC 0) and
//! the 0-based slot, e.g. `aV0`, `bT14`. Only wired cells get a column.

use std::fmt::Write as _;

use crate::comm::CommPath;
use crate::config::IcConfig;
use crate::driver::{ErrorCode, PackFastSample, PackSlowSample};
use crate::extremum::Extremums;
use crate::fault::{FaultGroup, FaultState};
use crate::matrix::CellMatrix;

fn ic_letter(ic: usize) -> char {
    (b'a' + (ic % 26) as u8) as char
}

/// `INIT,<topology>,CS:<n>,STAT:0x<status>,<OK|ERR:0xNN>`
pub fn init_banner(path: &CommPath, status: u64, code: ErrorCode) -> String {
    format!("INIT,{},STAT:0x{:X},{}", path, status, code.tag())
}

pub fn csv_header(ics: &[IcConfig], pack_monitor: bool) -> String {
    let mut cols: Vec<String> = vec!["tDut".to_string()];
    if pack_monitor {
        cols.extend(["I1", "P1", "BAT", "Tntc", "TIC"].map(String::from));
    }
    for kind in ['V', 'T'] {
        for (ic, cfg) in ics.iter().enumerate() {
            for slot in 0..cfg.cells {
                cols.push(format!("{}{}{}", ic_letter(ic), kind, slot));
            }
        }
    }
    if pack_monitor {
        cols.extend(["fI2", "fBAT"].map(String::from));
    }
    cols.push("OK/ERR".to_string());
    cols.join(",")
}

/// One measurement line
#[derive(Debug, Clone)]
pub struct CycleRow<'a> {
    /// Milliseconds since the previous row
    pub elapsed_ms: u64,
    /// `None` on a cycle without a pack monitor or without fresh slow values
    pub slow: Option<PackSlowSample>,
    pub fast: Option<PackFastSample>,
    pub volts: &'a CellMatrix,
    pub temps: &'a CellMatrix,
    pub code: ErrorCode,
}

impl CycleRow<'_> {
    /// Formats against the same column set as [`csv_header`].
    pub fn format(&self, ics: &[IcConfig], pack_monitor: bool) -> String {
        let mut line = self.elapsed_ms.to_string();

        if pack_monitor {
            match self.slow {
                Some(s) => {
                    let _ = write!(
                        line,
                        ",{:.2},{:.2},{:.2},{:.1},{:.1}",
                        s.current_a, s.power_w, s.battery_v, s.ntc_c, s.internal_c
                    );
                }
                None => line.push_str(",,,,,"),
            }
        }

        for matrix in [self.volts, self.temps] {
            for (ic, cfg) in ics.iter().enumerate() {
                for slot in 0..cfg.cells {
                    let v = matrix.get(ic, slot).unwrap_or(f64::NAN);
                    let _ = write!(line, ",{:.4}", v);
                }
            }
        }

        if pack_monitor {
            match self.fast {
                Some(f) => {
                    let _ = write!(line, ",{:.2},{:.2}", f.current_a, f.battery_v);
                }
                None => line.push_str(",,"),
            }
        }

        line.push(',');
        line.push_str(&self.code.tag());
        line
    }
}

/// Text shown on the operator console during a debug interrupt.
pub fn operator_report(faults: &FaultState, extremums: &Extremums) -> String {
    let mut out = String::new();
    let categories = faults.active_categories();
    if categories.is_empty() {
        out.push_str("Active categories: none\n");
    } else {
        let names: Vec<&str> = categories.iter().map(|c| c.label()).collect();
        let _ = writeln!(out, "Active categories: {}", names.join(", "));
    }
    let _ = writeln!(
        out,
        "Voltage fault: {}, temperature fault: {}",
        faults.voltage_fault, faults.temperature_fault
    );

    for (group, prefix) in [(FaultGroup::Voltage, 'C'), (FaultGroup::Temperature, 'T')] {
        let marked = faults.locations(group).marked();
        if marked.is_empty() {
            continue;
        }
        let _ = write!(out, "{} locations:", group);
        for (ic, slot) in marked {
            let _ = write!(out, " IC{}:{}{}", ic + 1, prefix, slot + 1);
        }
        out.push('\n');
    }

    for (name, value) in [
        ("Max voltage", extremums.max_voltage),
        ("Min voltage", extremums.min_voltage),
        ("Max temperature", extremums.max_temperature),
    ] {
        match value {
            Some(e) => {
                let _ = writeln!(out, "{}: {}", name, e);
            }
            None => {
                let _ = writeln!(out, "{}: n/a", name);
            }
        }
    }
    out
}
