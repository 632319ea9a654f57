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

//! Fault output lines and the debug interrupt.
//!
//! `BmsFault` is active low: high means the pack is healthy. It is pulled
//! high at the start of a cycle only if the previous cycle ended clean, so a
//! fault stays asserted through the cycle that re-checks it.

use std::fmt;
use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::InterruptMode;
use crate::constants::timing::INTERRUPT_POLL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalLine {
    /// Active low pack fault output
    BmsFault,
    VoltageLed,
    TemperatureLed,
    PecLed,
    Fan,
    ChargerEnable,
}

impl fmt::Display for SignalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalLine::BmsFault => "BMS_FLT",
            SignalLine::VoltageLed => "LED_VOLT",
            SignalLine::TemperatureLed => "LED_TEMP",
            SignalLine::PecLed => "LED_PEC",
            SignalLine::Fan => "FAN",
            SignalLine::ChargerEnable => "CHRG_EN",
        };
        f.write_str(name)
    }
}

/// Digital output lines
#[cfg_attr(test, mockall::automock)]
pub trait SignalLines {
    fn set(&mut self, line: SignalLine, high: bool);
}

/// Operator terminal used while a debug interrupt holds the loop
#[cfg_attr(test, mockall::automock)]
pub trait OperatorConsole {
    fn poll_key(&mut self) -> Option<char>;

    fn show(&mut self, report: &str);

    fn is_closed(&self) -> bool;
}

/// Console fed line by line from a reader; the first character of each
/// non-empty line is the key.
pub struct LineConsole {
    keys: Receiver<char>,
    closed: bool,
}

impl LineConsole {
    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> io::Result<Self> {
        let (tx, keys) = mpsc::channel();
        thread::Builder::new().name("operator-console".to_string()).spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if let Some(key) = line.trim().chars().next() {
                    if tx.send(key).is_err() {
                        break;
                    }
                }
            }
        })?;
        Ok(Self { keys, closed: false })
    }

    pub fn stdin() -> io::Result<Self> {
        Self::from_reader(io::BufReader::new(io::stdin()))
    }
}

impl OperatorConsole for LineConsole {
    fn poll_key(&mut self) -> Option<char> {
        match self.keys.try_recv() {
            Ok(key) => Some(key),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    fn show(&mut self, report: &str) {
        println!("{}", report);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Fault flags feeding the outputs at the end of a cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultFlags {
    pub voltage: bool,
    pub temperature: bool,
    pub charger: bool,
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.voltage || self.temperature || self.charger
    }

    /// Which sources tripped, `None` when clean.
    pub fn cause(&self) -> Option<&'static str> {
        match (self.voltage, self.temperature, self.charger) {
            (false, false, false) => None,
            (true, false, false) => Some("voltage"),
            (false, true, false) => Some("temperature"),
            (false, false, true) => Some("charger"),
            (true, true, false) => Some("voltage and temperature"),
            (true, false, true) => Some("voltage and charger"),
            (false, true, true) => Some("temperature and charger"),
            (true, true, true) => Some("voltage, temperature and charger"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaultSignaler {
    mode: InterruptMode,
    bms_flag: bool,
    last: FaultFlags,
}

impl FaultSignaler {
    pub fn new(mode: InterruptMode) -> Self {
        Self { mode, bms_flag: false, last: FaultFlags::default() }
    }

    /// BMS flag of the last finished cycle.
    pub fn bms_flag(&self) -> bool {
        self.bms_flag
    }

    /// Power-on state: fault asserted until the first clean cycle.
    pub fn startup<L: SignalLines + ?Sized>(&mut self, lines: &mut L, fan: bool, charger_enable: bool) {
        lines.set(SignalLine::BmsFault, false);
        lines.set(SignalLine::VoltageLed, false);
        lines.set(SignalLine::TemperatureLed, false);
        lines.set(SignalLine::PecLed, false);
        lines.set(SignalLine::Fan, fan);
        lines.set(SignalLine::ChargerEnable, charger_enable);
        self.bms_flag = true;
        info!(fan, charger_enable, "Signal lines initialized");
    }

    pub fn begin_cycle<L: SignalLines + ?Sized>(&mut self, lines: &mut L) {
        if !self.bms_flag {
            lines.set(SignalLine::BmsFault, true);
        }
        self.refresh_leds(lines);
    }

    pub fn set_pec<L: SignalLines + ?Sized>(&mut self, lines: &mut L, comm_error: bool) {
        lines.set(SignalLine::PecLed, comm_error);
    }

    /// Latches the cycle's flags onto the outputs.
    ///
    /// In debug mode a fault blocks here until the operator resumes: `s`
    /// shows `report` once, `r` resumes, a closed console also resumes.
    pub fn finish_cycle<L, O, C, F>(
        &mut self,
        lines: &mut L,
        console: &mut O,
        clock: &C,
        flags: FaultFlags,
        report: F,
    ) -> bool
    where
        L: SignalLines + ?Sized,
        O: OperatorConsole + ?Sized,
        C: Clock + ?Sized,
        F: FnOnce() -> String,
    {
        self.last = flags;
        self.bms_flag = flags.any();
        let Some(cause) = flags.cause() else {
            debug!("No BMS fault this cycle");
            return false;
        };

        error!(cause, "BMS fault");
        lines.set(SignalLine::BmsFault, false);
        self.refresh_leds(lines);

        if self.mode == InterruptMode::Debug {
            self.hold(lines, console, clock, report);
        }
        true
    }

    fn hold<L, O, C, F>(&mut self, lines: &mut L, console: &mut O, clock: &C, report: F)
    where
        L: SignalLines + ?Sized,
        O: OperatorConsole + ?Sized,
        C: Clock + ?Sized,
        F: FnOnce() -> String,
    {
        info!("Interrupt: press 's' for the report, 'r' to resume");
        let mut report = Some(report);
        loop {
            if console.is_closed() {
                info!("Operator console closed, resuming");
                break;
            }
            match console.poll_key() {
                Some('r') => {
                    info!("Resumed by operator");
                    break;
                }
                Some('s') => {
                    if let Some(build) = report.take() {
                        console.show(&build());
                    }
                }
                _ => {}
            }
            lines.set(SignalLine::BmsFault, false);
            self.refresh_leds(lines);
            clock.sleep(INTERRUPT_POLL);
        }
    }

    fn refresh_leds<L: SignalLines + ?Sized>(&self, lines: &mut L) {
        lines.set(SignalLine::VoltageLed, self.last.voltage);
        lines.set(SignalLine::TemperatureLed, self.last.temperature);
    }
}
