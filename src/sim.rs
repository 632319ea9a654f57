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

//! Simulated collaborators.
//!
//! Every simulated device is a cheap handle around shared state, so a test
//! can keep one clone for fault injection and inspection while the
//! controller owns another.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::charger::{ChargerBus, ChargerRequest, ChargerResponse, ChargerStatus};
use crate::comm::CommPath;
use crate::config::{IcConfig, StackConfig};
use crate::constants::layout::{
    AUX_REFERENCE_CHANNEL, CHANNELS_PER_GROUP, RAW_AUX_CHANNELS, RAW_LSB_VOLTS, RAW_VOLTAGE_CHANNELS,
};
use crate::constants::thermistor::{BETA, KELVIN_OFFSET, R25_KOHMS, SERIES_RESISTOR_OHMS, T0_KELVIN};
use crate::driver::{
    CellMonitorDriver, ConfigBlock, ConversionKind, ErrorCode, PackFastSample, PackMonitor, PackSlowSample,
};
use crate::layout::MuxSelect;
use crate::logger::LogSink;
use crate::matrix::Grid;
use crate::signals::{OperatorConsole, SignalLine, SignalLines};

/// Divider supply on every simulated aux reference channel
pub const AUX_REFERENCE_VOLTS: f64 = 3.0;

pub const DEFAULT_CELL_VOLTS: f64 = 3.7;
pub const DEFAULT_CELL_TEMPERATURE: f64 = 25.0;

/// Reported in the init banner
pub const DEVICE_STATUS: u64 = 0x1000_0000;

/// Error returned for a dead communication path
pub const DEAD_PATH_CODE: ErrorCode = ErrorCode(0x0B);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tap voltage that converts back to `celsius` against `reference`.
pub fn thermistor_tap(celsius: f64, reference: f64) -> f64 {
    let r_kohms = R25_KOHMS * (BETA / (celsius + KELVIN_OFFSET) - BETA / T0_KELVIN).exp();
    let series_kohms = SERIES_RESISTOR_OHMS * 0.001;
    reference * r_kohms / (series_kohms + r_kohms)
}

fn to_code(volts: f64) -> u16 {
    (volts / RAW_LSB_VOLTS).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

struct StackState {
    ics: Vec<IcConfig>,
    circular: bool,
    secondary_chip_select: u8,
    cells: Grid<f64>,
    aux: [Grid<f64>; 2],
    path: Option<CommPath>,
    mux: MuxSelect,
    dead_paths: Vec<CommPath>,
    fail_next: u32,
    inits: Vec<CommPath>,
    conversions: u64,
    polls_until_done: u32,
    polls: u32,
    glitches: Vec<Glitch>,
}

/// Temporary cell voltage that reverts after a number of conversions
#[derive(Debug, Clone, Copy)]
struct Glitch {
    ic: usize,
    channel: usize,
    restore: f64,
    remaining: u32,
}

impl StackState {
    fn path_dead(&self) -> bool {
        self.path.map_or(false, |p| self.dead_paths.contains(&p))
    }

    /// A ring read through the secondary master enters from the far end.
    fn reversed(&self) -> bool {
        self.circular && self.path.map_or(false, |p| p.chip_select == self.secondary_chip_select)
    }
}

/// Cell monitor chain with physically placed cells
#[derive(Clone)]
pub struct SimulatedStack {
    state: Arc<Mutex<StackState>>,
}

impl SimulatedStack {
    /// Every wired cell at 3.7 V and 25 °C.
    pub fn new(cfg: &StackConfig) -> Self {
        let n = cfg.ics.len();
        let mut aux_bank = Grid::new(n, RAW_AUX_CHANNELS, AUX_REFERENCE_VOLTS);
        let tap = thermistor_tap(DEFAULT_CELL_TEMPERATURE, AUX_REFERENCE_VOLTS);
        for ic in 0..n {
            for ch in 0..RAW_AUX_CHANNELS {
                if ch != AUX_REFERENCE_CHANNEL {
                    aux_bank.set(ic, ch, tap);
                }
            }
        }

        let mut cells = Grid::new(n, RAW_VOLTAGE_CHANNELS, 0.0);
        for (ic, cfg_ic) in cfg.ics.iter().enumerate() {
            let layout = cfg_ic.layout();
            for slot in 0..cfg_ic.cells {
                if let Some(ch) = layout.voltage_source(slot) {
                    cells.set(ic, ch, DEFAULT_CELL_VOLTS);
                }
            }
        }

        Self {
            state: Arc::new(Mutex::new(StackState {
                ics: cfg.ics.clone(),
                circular: cfg.comm.circular,
                secondary_chip_select: cfg.comm.secondary_chip_select,
                cells,
                aux: [aux_bank.clone(), aux_bank],
                path: None,
                mux: MuxSelect::High,
                dead_paths: Vec::new(),
                fail_next: 0,
                inits: Vec::new(),
                conversions: 0,
                polls_until_done: 1,
                polls: 0,
                glitches: Vec::new(),
            })),
        }
    }

    /// Places a cell voltage on the raw channel wired to `slot`.
    pub fn set_cell_voltage(&self, ic: usize, slot: usize, volts: f64) -> bool {
        let mut s = lock(&self.state);
        let Some(ch) = s.ics.get(ic).and_then(|c| c.layout().voltage_source(slot)) else {
            return false;
        };
        s.cells.set(ic, ch, volts)
    }

    /// Shows `volts` on `slot` to the next `conversions` cell conversions only.
    pub fn glitch_cell_voltage(&self, ic: usize, slot: usize, volts: f64, conversions: u32) -> bool {
        let mut s = lock(&self.state);
        let Some(channel) = s.ics.get(ic).and_then(|c| c.layout().voltage_source(slot)) else {
            return false;
        };
        let Some(restore) = s.cells.get(ic, channel) else {
            return false;
        };
        s.cells.set(ic, channel, volts);
        s.glitches.push(Glitch { ic, channel, restore, remaining: conversions });
        true
    }

    /// Sets the thermistor of `slot` on whichever mux bank carries it.
    pub fn set_cell_temperature(&self, ic: usize, slot: usize, celsius: f64) -> bool {
        let mut s = lock(&self.state);
        let Some(layout) = s.ics.get(ic).map(|c| c.layout()) else {
            return false;
        };
        for mux in MuxSelect::SEQUENCE {
            let source = layout
                .temperature_sources(mux)
                .into_iter()
                .find_map(|(sl, aux)| if sl == slot { aux } else { None });
            if let Some(aux) = source {
                let reference = s.aux[mux.index()].get(ic, AUX_REFERENCE_CHANNEL).unwrap_or(AUX_REFERENCE_VOLTS);
                return s.aux[mux.index()].set(ic, aux, thermistor_tap(celsius, reference));
            }
        }
        false
    }

    /// Every register access over `path` fails.
    pub fn kill_path(&self, path: CommPath) {
        lock(&self.state).dead_paths.push(path);
    }

    pub fn revive_all(&self) {
        lock(&self.state).dead_paths.clear();
    }

    /// The next `count` register clears fail regardless of path.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).fail_next = count;
    }

    /// End-of-conversion reports ready on the `polls`-th poll.
    pub fn set_polls_until_done(&self, polls: u32) {
        lock(&self.state).polls_until_done = polls;
    }

    /// Paths passed to `init`, oldest first.
    pub fn inits(&self) -> Vec<CommPath> {
        lock(&self.state).inits.clone()
    }

    pub fn conversions(&self) -> u64 {
        lock(&self.state).conversions
    }
}

impl CellMonitorDriver for SimulatedStack {
    fn init(&mut self, path: CommPath) -> ErrorCode {
        let mut s = lock(&self.state);
        s.path = Some(path);
        s.inits.push(path);
        if s.path_dead() {
            DEAD_PATH_CODE
        } else {
            ErrorCode::OK
        }
    }

    fn device_status(&self) -> u64 {
        if lock(&self.state).path_dead() {
            u64::MAX
        } else {
            DEVICE_STATUS
        }
    }

    fn clear_conversion_registers(&mut self) -> ErrorCode {
        let mut s = lock(&self.state);
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return DEAD_PATH_CODE;
        }
        if s.path_dead() {
            DEAD_PATH_CODE
        } else {
            ErrorCode::OK
        }
    }

    fn write_config(&mut self, block: &ConfigBlock) -> ErrorCode {
        let mut s = lock(&self.state);
        if let Some(mux) = block.mux() {
            s.mux = mux;
        }
        if s.path_dead() {
            DEAD_PATH_CODE
        } else {
            ErrorCode::OK
        }
    }

    fn trigger_conversion(&mut self, kind: ConversionKind) -> ErrorCode {
        let mut s = lock(&self.state);
        s.conversions += 1;
        s.polls = 0;
        if kind == ConversionKind::Cells {
            let mut glitches = std::mem::take(&mut s.glitches);
            glitches.retain_mut(|g| {
                if g.remaining == 0 {
                    s.cells.set(g.ic, g.channel, g.restore);
                    false
                } else {
                    g.remaining -= 1;
                    true
                }
            });
            s.glitches = glitches;
        }
        ErrorCode::OK
    }

    fn conversion_done(&mut self) -> bool {
        let mut s = lock(&self.state);
        s.polls += 1;
        s.polls >= s.polls_until_done
    }

    fn read_group(&mut self, kind: ConversionKind, group: usize) -> (Vec<u16>, ErrorCode) {
        let s = lock(&self.state);
        if s.path_dead() {
            return (Vec::new(), DEAD_PATH_CODE);
        }
        let grid = match kind {
            ConversionKind::Cells => &s.cells,
            ConversionKind::Aux => &s.aux[s.mux.index()],
        };
        let n = grid.rows();
        let reversed = s.reversed();
        let mut codes = Vec::with_capacity(n * CHANNELS_PER_GROUP);
        for position in 0..n {
            let ic = if reversed { n - 1 - position } else { position };
            for k in 0..CHANNELS_PER_GROUP {
                codes.push(to_code(grid.get(ic, CHANNELS_PER_GROUP * group + k).unwrap_or(0.0)));
            }
        }
        (codes, ErrorCode::OK)
    }
}

struct ChargerSim {
    default: Option<ChargerResponse>,
    scripted: VecDeque<Option<ChargerResponse>>,
    requests: Vec<ChargerRequest>,
}

/// Charger on the vehicle bus; frames pass through their byte encoding.
#[derive(Clone)]
pub struct SimCharger {
    state: Arc<Mutex<ChargerSim>>,
}

impl SimCharger {
    /// A charger that answers every request with `default`.
    pub fn new(default: Option<ChargerResponse>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChargerSim {
                default,
                scripted: VecDeque::new(),
                requests: Vec::new(),
            })),
        }
    }

    /// Delivering 8 A at 355 V.
    pub fn charging() -> Self {
        Self::new(Some(ChargerResponse { voltage: 355.0, current: 8.0, status: ChargerStatus(0) }))
    }

    pub fn set_default(&self, response: Option<ChargerResponse>) {
        lock(&self.state).default = response;
    }

    /// Queues one answer ahead of the default.
    pub fn push_response(&self, response: Option<ChargerResponse>) {
        lock(&self.state).scripted.push_back(response);
    }

    pub fn requests(&self) -> Vec<ChargerRequest> {
        lock(&self.state).requests.clone()
    }
}

impl ChargerBus for SimCharger {
    fn send_request(&mut self, request: &ChargerRequest) -> bool {
        match ChargerRequest::from_bytes(&request.to_bytes()) {
            Ok(decoded) => {
                lock(&self.state).requests.push(decoded);
                true
            }
            Err(_) => false,
        }
    }

    fn receive_response(&mut self) -> Option<ChargerResponse> {
        let mut s = lock(&self.state);
        let next = match s.scripted.pop_front() {
            Some(scripted) => scripted,
            None => s.default,
        }?;
        ChargerResponse::from_bytes(&next.to_bytes()).ok()
    }
}

/// Output lines with a full write history
#[derive(Clone, Default)]
pub struct SimSignals {
    state: Arc<Mutex<(HashMap<SignalLine, bool>, Vec<(SignalLine, bool)>)>>,
}

impl SimSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, line: SignalLine) -> Option<bool> {
        lock(&self.state).0.get(&line).copied()
    }

    pub fn history(&self) -> Vec<(SignalLine, bool)> {
        lock(&self.state).1.clone()
    }
}

impl SignalLines for SimSignals {
    fn set(&mut self, line: SignalLine, high: bool) {
        let mut s = lock(&self.state);
        s.0.insert(line, high);
        s.1.push((line, high));
    }
}

/// Pack monitor with fixed readings; slow values are ready every cycle.
#[derive(Debug, Clone)]
pub struct SimPack {
    pub slow: PackSlowSample,
    pub fast: PackFastSample,
}

impl Default for SimPack {
    fn default() -> Self {
        Self {
            slow: PackSlowSample { current_a: 8.0, power_w: 2840.0, battery_v: 355.0, ntc_c: 25.0, internal_c: 28.0 },
            fast: PackFastSample { current_a: 8.0, battery_v: 355.0 },
        }
    }
}

impl PackMonitor for SimPack {
    fn slow_ready(&mut self) -> bool {
        true
    }

    fn read_slow(&mut self) -> Result<PackSlowSample, ErrorCode> {
        Ok(self.slow)
    }

    fn read_fast(&mut self) -> Result<PackFastSample, ErrorCode> {
        Ok(self.fast)
    }
}

struct ConsoleScript {
    keys: VecDeque<Option<char>>,
    shown: Vec<String>,
    close_when_done: bool,
}

/// Operator console replaying a fixed key sequence
#[derive(Clone)]
pub struct ScriptedConsole {
    state: Arc<Mutex<ConsoleScript>>,
}

impl ScriptedConsole {
    /// `None` entries are polls without a key. Once the script runs out the
    /// console reports closed if `close_when_done` is set.
    pub fn new(keys: Vec<Option<char>>, close_when_done: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsoleScript {
                keys: keys.into(),
                shown: Vec::new(),
                close_when_done,
            })),
        }
    }

    /// A console that is never attached.
    pub fn detached() -> Self {
        Self::new(Vec::new(), true)
    }

    pub fn shown(&self) -> Vec<String> {
        lock(&self.state).shown.clone()
    }
}

impl OperatorConsole for ScriptedConsole {
    fn poll_key(&mut self) -> Option<char> {
        lock(&self.state).keys.pop_front().flatten()
    }

    fn show(&mut self, report: &str) {
        lock(&self.state).shown.push(report.to_string());
    }

    fn is_closed(&self) -> bool {
        let s = lock(&self.state);
        s.close_when_done && s.keys.is_empty()
    }
}

/// Line sink kept in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
    flushes: Arc<Mutex<u64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn flushes(&self) -> u64 {
        *lock(&self.flushes)
    }
}

impl LogSink for MemorySink {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        lock(&self.lines).push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        *lock(&self.flushes) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermistor::volt_to_temp;

    #[test]
    fn test_thermistor_tap_inverts_curve() {
        for t in [-10.0, 0.5, 25.0, 45.0, 60.0] {
            let v = thermistor_tap(t, AUX_REFERENCE_VOLTS);
            assert!((volt_to_temp(v, AUX_REFERENCE_VOLTS) - t).abs() < 1e-6, "t={}", t);
        }
    }

    #[test]
    fn test_backward_read_reverses_ics() {
        let cfg = StackConfig::reference();
        let mut stack = SimulatedStack::new(&cfg);
        stack.set_cell_voltage(0, 0, 4.0);

        stack.init(CommPath { chip_select: 10, on_top: false });
        let (fwd, code) = stack.read_group(ConversionKind::Cells, 0);
        assert!(code.is_ok());
        assert_eq!(fwd.len(), 18);
        assert_eq!(fwd[0], 40000);

        stack.init(CommPath { chip_select: 37, on_top: false });
        let (bwd, _) = stack.read_group(ConversionKind::Cells, 0);
        assert_eq!(bwd[15], 40000);
        assert_eq!(bwd[0], 37000);
    }

    #[test]
    fn test_glitch_reverts() {
        let cfg = StackConfig::reference();
        let mut stack = SimulatedStack::new(&cfg);
        stack.init(CommPath { chip_select: 10, on_top: false });
        assert!(stack.glitch_cell_voltage(0, 1, 4.4, 1));

        stack.trigger_conversion(ConversionKind::Cells);
        assert_eq!(stack.read_group(ConversionKind::Cells, 0).0[1], 44000);
        stack.trigger_conversion(ConversionKind::Aux);
        assert_eq!(stack.read_group(ConversionKind::Cells, 0).0[1], 44000);
        stack.trigger_conversion(ConversionKind::Cells);
        assert_eq!(stack.read_group(ConversionKind::Cells, 0).0[1], 37000);
    }

    #[test]
    fn test_dead_path_and_fail_next() {
        let cfg = StackConfig::reference();
        let mut stack = SimulatedStack::new(&cfg);
        let path = CommPath { chip_select: 10, on_top: false };
        stack.kill_path(path);
        assert_eq!(stack.init(path), DEAD_PATH_CODE);
        assert_eq!(stack.device_status(), u64::MAX);
        stack.revive_all();
        stack.fail_next(1);
        assert_eq!(stack.clear_conversion_registers(), DEAD_PATH_CODE);
        assert!(stack.clear_conversion_registers().is_ok());
        assert_eq!(stack.inits(), vec![path]);
    }

    #[test]
    fn test_mux_selects_aux_bank() {
        let cfg = StackConfig::reference();
        let mut stack = SimulatedStack::new(&cfg);
        // slot 8 lives on the high bank, aux 0
        assert!(stack.set_cell_temperature(1, 8, 40.0));
        stack.init(CommPath { chip_select: 10, on_top: false });

        stack.write_config(&ConfigBlock::config_b(MuxSelect::High));
        let (high, _) = stack.read_group(ConversionKind::Aux, 0);
        stack.write_config(&ConfigBlock::config_b(MuxSelect::Low));
        let (low, _) = stack.read_group(ConversionKind::Aux, 0);
        assert_ne!(high[3], low[3]);
        assert_eq!(high[0], low[0]);
    }

    #[test]
    fn test_charger_scripted_then_default() {
        let mut charger = SimCharger::charging();
        charger.push_response(None);
        assert!(charger.send_request(&ChargerRequest { max_voltage_dv: 3600, max_current_da: 100, control: 0 }));
        assert_eq!(charger.receive_response(), None);
        let r = charger.receive_response().unwrap();
        assert!((r.voltage - 355.0).abs() < 1e-9);
        assert_eq!(charger.requests().len(), 1);
    }

    #[test]
    fn test_scripted_console_closes() {
        let mut console = ScriptedConsole::new(vec![None, Some('s')], true);
        assert!(!console.is_closed());
        assert_eq!(console.poll_key(), None);
        assert_eq!(console.poll_key(), Some('s'));
        assert!(console.is_closed());
        console.show("x");
        assert_eq!(console.shown(), vec!["x".to_string()]);
    }
}
