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

//! Acquisition cycle orchestration.
//!
//! One cycle reads the chain in the current direction, reconciles it with
//! the last read from the other end, derives the per-cell matrices, checks
//! them, talks to the charger, drives the signal lines and writes a row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::acquisition::{Direction, DualBuffer};
use crate::charger::{ChargerBus, ChargerSession, ChargerState};
use crate::clock::Clock;
use crate::comm::{CommPath, CommState, FailoverAction};
use crate::config::{validate_config, StackConfig};
use crate::constants::layout::{AUX_GROUPS, RAW_AUX_CHANNELS, RAW_VOLTAGE_CHANNELS, VOLTAGE_GROUPS};
use crate::constants::sentinel;
use crate::constants::timing::ERROR_BACKOFF;
use crate::cooling::DynamicCooling;
use crate::driver::{CellMonitorDriver, ConfigBlock, ConversionKind, ErrorCode, PackFastSample, PackMonitor, PackSlowSample};
use crate::error::Result;
use crate::extremum::Extremums;
use crate::fault::{evaluate_temperatures, evaluate_voltages, FaultGroup, FaultState, RecheckOutcome, RecheckStep, RecheckWindow};
use crate::layout::MuxSelect;
use crate::logger::{log_event, LogSink};
use crate::matrix::{CellMatrix, Grid};
use crate::postprocess::{apply_split, normalize_temperatures, normalize_voltages};
use crate::reconcile::{reconcile_temperatures, reconcile_voltages, Arbiter};
use crate::remap::{remap_temperatures, remap_voltages};
use crate::report::{self, CycleRow};
use crate::signals::{FaultFlags, FaultSignaler, OperatorConsole, SignalLine, SignalLines};
use crate::thermistor::convert_row;

/// Everything one cycle reads and writes
#[derive(Debug, Clone)]
pub struct AcquisitionContext {
    pub direction: Direction,
    /// Raw cell voltages per direction
    pub cells: DualBuffer,
    /// Aux tap voltages per direction, one buffer per mux bank
    pub aux_raw: [DualBuffer; 2],
    /// `aux_raw` converted to temperatures
    pub aux: [DualBuffer; 2],
    pub cell_canonical: Grid<f64>,
    pub aux_canonical: [Grid<f64>; 2],
    pub volts: CellMatrix,
    pub temps: CellMatrix,
    pub faults: FaultState,
    pub extremums: Extremums,
    pub charger: ChargerSession,
    pub comm: CommState,
    /// Ambiguous channels of the last voltage reconciliation
    pub ambiguous: usize,
}

impl AcquisitionContext {
    pub fn new(cfg: &StackConfig) -> Self {
        let n = cfg.ic_count();
        Self {
            direction: Direction::Forward,
            cells: DualBuffer::seeded(n, RAW_VOLTAGE_CHANNELS, 0.0, sentinel::BACKWARD_SEED_VOLTAGE),
            aux_raw: [DualBuffer::new(n, RAW_AUX_CHANNELS), DualBuffer::new(n, RAW_AUX_CHANNELS)],
            aux: [DualBuffer::new(n, RAW_AUX_CHANNELS), DualBuffer::new(n, RAW_AUX_CHANNELS)],
            cell_canonical: Grid::new(n, RAW_VOLTAGE_CHANNELS, 0.0),
            aux_canonical: [Grid::new(n, RAW_AUX_CHANNELS, 0.0), Grid::new(n, RAW_AUX_CHANNELS, 0.0)],
            volts: CellMatrix::cells(n, sentinel::VOLTAGE),
            temps: CellMatrix::cells(n, sentinel::TEMPERATURE),
            faults: FaultState::new(n),
            extremums: Extremums::default(),
            charger: ChargerSession::new(&cfg.charger),
            comm: CommState::new(&cfg.comm),
            ambiguous: 0,
        }
    }
}

/// Hardware the controller drives
pub struct Peripherals {
    pub driver: Box<dyn CellMonitorDriver>,
    pub charger: Box<dyn ChargerBus>,
    pub lines: Box<dyn SignalLines>,
    pub console: Box<dyn OperatorConsole>,
    pub sink: Box<dyn LogSink>,
    pub pack: Option<Box<dyn PackMonitor>>,
    pub clock: Box<dyn Clock>,
}

/// Summary of one finished cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub direction: Direction,
    pub code: ErrorCode,
    /// Register preparation failed; nothing was acquired
    pub aborted: bool,
    pub failover: Option<FailoverAction>,
    pub ambiguous: usize,
    pub voltage_recheck: Option<RecheckOutcome>,
    pub temperature_recheck: Option<RecheckOutcome>,
    pub charger: ChargerState,
    pub bms_fault: bool,
    pub fan_on: bool,
    /// Line written to the sink
    pub row: String,
}

pub struct BmsController {
    cfg: StackConfig,
    hw: Peripherals,
    ctx: AcquisitionContext,
    arbiter: Arbiter,
    cooling: DynamicCooling,
    signaler: FaultSignaler,
    last_row_at: Option<Duration>,
    cycles: u64,
}

#[cfg(test)]
impl std::fmt::Debug for BmsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BmsController").finish_non_exhaustive()
    }
}

impl BmsController {
    /// Validates `cfg` and takes ownership of the hardware.
    pub fn new(cfg: StackConfig, hw: Peripherals) -> Result<Self> {
        validate_config(&cfg)?;
        Ok(Self {
            ctx: AcquisitionContext::new(&cfg),
            arbiter: Arbiter::from_config(&cfg.reconcile),
            cooling: DynamicCooling::from_config(&cfg.cooling, cfg.signals.fan_request),
            signaler: FaultSignaler::new(cfg.signals.interrupt_mode),
            last_row_at: None,
            cycles: 0,
            cfg,
            hw,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn context(&self) -> &AcquisitionContext {
        &self.ctx
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Drives the power-on signal state and brings up the first path.
    pub fn startup(&mut self) -> Result<()> {
        let delay = Duration::from_millis(self.cfg.timing.startup_delay_ms);
        if !delay.is_zero() {
            self.hw.clock.sleep(delay);
        }
        self.signaler.startup(
            &mut *self.hw.lines,
            self.cfg.signals.fan_request,
            self.cfg.signals.charger_enable_request,
        );

        let path = self.ctx.comm.active();
        let code = self.hw.driver.init(path);
        self.write_banner(path, code)?;

        log_event(
            "startup",
            json!({
                "ics": self.cfg.ic_count(),
                "circular": self.cfg.comm.circular,
                "path": path.to_string(),
                "code": code.0,
            }),
        );
        Ok(())
    }

    /// Runs cycles until `shutdown` is set or `max_cycles` have run.
    pub fn run(&mut self, max_cycles: Option<u64>, shutdown: &AtomicBool) -> Result<u64> {
        let mut done = 0u64;
        while !shutdown.load(Ordering::SeqCst) {
            if max_cycles.map_or(false, |max| done >= max) {
                break;
            }
            let report = self.run_cycle()?;
            debug!(
                cycle = self.cycles,
                direction = %report.direction,
                code = %report.code,
                bms_fault = report.bms_fault,
                "Cycle finished"
            );
            done += 1;
        }
        info!(cycles = done, "Acquisition stopped");
        Ok(done)
    }

    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let direction = self.ctx.direction;
        let circular = self.cfg.comm.circular;

        self.signaler.begin_cycle(&mut *self.hw.lines);
        self.ctx.faults.clear();

        let mut code = ErrorCode::OK;
        if circular {
            let path = self.ctx.comm.path_for(direction, true);
            debug!(%direction, %path, "Entering chain");
            code |= self.hw.driver.init(path);
        }
        code |= self.hw.driver.clear_conversion_registers();
        code |= self.hw.driver.write_config(&ConfigBlock::config_a());
        code |= self.hw.driver.write_config(&ConfigBlock::config_b(MuxSelect::High));

        if self.ctx.comm.is_error(code) {
            return self.abort_cycle(direction, code);
        }

        let slow = self.read_pack_slow(&mut code);
        code |= self.acquire_voltages();
        code |= self.acquire_temperatures();

        self.evaluate(FaultGroup::Voltage);
        self.evaluate(FaultGroup::Temperature);
        let voltage_recheck = self.confirm(FaultGroup::Voltage, &mut code);
        let temperature_recheck = self.confirm(FaultGroup::Temperature, &mut code);

        // after the rechecks, which may have re-read either matrix
        self.ctx.extremums = Extremums::compute(&self.ctx.volts, &self.ctx.temps, &self.cfg.ics);
        let fan_on = self.update_cooling();

        let fast = self.read_pack_fast(&mut code);

        let voltage_fault = self.ctx.faults.confirmed(FaultGroup::Voltage);
        let temperature_fault = self.ctx.faults.confirmed(FaultGroup::Temperature);
        let faults_active = voltage_fault || temperature_fault;
        let was_charger_fault = self.ctx.charger.charger_fault;
        let charger = self.ctx.charger.run_cycle(&mut *self.hw.charger, &*self.hw.clock, faults_active);
        if charger.is_fault() && !was_charger_fault {
            let data = match (charger, self.ctx.charger.last_response()) {
                // the kept response predates the timeout
                (ChargerState::CommTimeout, _) | (_, None) => json!({ "state": charger.to_string() }),
                (_, Some(r)) => json!({
                    "state": charger.to_string(),
                    "voltage": r.voltage,
                    "current": r.current,
                    "status": r.status.0,
                }),
            };
            log_event("charger_fault", data);
        }

        let comm_error = self.ctx.comm.is_error(code);
        self.signaler.set_pec(&mut *self.hw.lines, comm_error);
        let flags = FaultFlags {
            voltage: voltage_fault,
            temperature: temperature_fault,
            charger: self.ctx.charger.charger_fault,
        };
        let ctx = &self.ctx;
        let bms_fault = self.signaler.finish_cycle(
            &mut *self.hw.lines,
            &mut *self.hw.console,
            &*self.hw.clock,
            flags,
            || report::operator_report(&ctx.faults, &ctx.extremums),
        );

        let row = self.emit_row(slow, fast, code)?;

        if comm_error {
            warn!(code = %code, "Communication error during acquisition");
            self.hw.clock.sleep(ERROR_BACKOFF);
        }
        if self.ctx.charger.enabled() {
            self.hw.clock.sleep(self.ctx.charger.settle_delay());
        }
        if circular {
            self.ctx.direction = direction.toggled();
        }

        Ok(CycleReport {
            direction,
            code,
            aborted: false,
            failover: None,
            ambiguous: self.ctx.ambiguous,
            voltage_recheck,
            temperature_recheck,
            charger,
            bms_fault,
            fan_on,
            row,
        })
    }

    /// Reports the failed preparation, backs off and re-initializes. The
    /// direction is kept so the same end is read again.
    fn abort_cycle(&mut self, direction: Direction, code: ErrorCode) -> Result<CycleReport> {
        warn!(code = %code, %direction, "Chain communication failed, aborting cycle");
        self.signaler.set_pec(&mut *self.hw.lines, true);

        let row = code.tag();
        self.hw.sink.append_line(&row)?;
        self.hw.sink.flush()?;
        self.hw.clock.sleep(ERROR_BACKOFF);

        let action = self.ctx.comm.on_error();
        match action {
            FailoverAction::Reinit(path) => {
                info!(%path, retries_left = self.ctx.comm.retries_left(), "Re-initializing communication path");
            }
            FailoverAction::Switch { from, to } => {
                warn!(%from, %to, "Switching communication path");
                log_event(
                    "failover",
                    json!({
                        "from": from.to_string(),
                        "to": to.to_string(),
                        "index": self.ctx.comm.active_index(),
                        "code": code.0,
                    }),
                );
            }
        }
        let path = action.path();
        let init_code = self.hw.driver.init(path);
        self.write_banner(path, init_code)?;

        Ok(CycleReport {
            direction,
            code,
            aborted: true,
            failover: Some(action),
            ambiguous: 0,
            voltage_recheck: None,
            temperature_recheck: None,
            charger: ChargerState::Disabled,
            bms_fault: self.signaler.bms_flag(),
            fan_on: self.cooling.fan_on(),
            row,
        })
    }

    fn write_banner(&mut self, path: CommPath, code: ErrorCode) -> Result<()> {
        let banner = report::init_banner(&path, self.hw.driver.device_status(), code);
        if self.ctx.comm.is_error(code) {
            warn!("{}", banner);
        } else {
            info!("{}", banner);
        }
        self.hw.sink.append_line(&banner)?;
        self.hw
            .sink
            .append_line(&report::csv_header(&self.cfg.ics, self.hw.pack.is_some()))?;
        self.hw.sink.flush()?;
        Ok(())
    }

    fn emit_row(
        &mut self,
        slow: Option<PackSlowSample>,
        fast: Option<PackFastSample>,
        code: ErrorCode,
    ) -> Result<String> {
        let now = self.hw.clock.now();
        let elapsed_ms = self
            .last_row_at
            .map_or(0, |last| now.saturating_sub(last).as_millis() as u64);
        self.last_row_at = Some(now);

        let row = CycleRow {
            elapsed_ms,
            slow,
            fast,
            volts: &self.ctx.volts,
            temps: &self.ctx.temps,
            code,
        }
        .format(&self.cfg.ics, self.hw.pack.is_some());
        self.hw.sink.append_line(&row)?;
        self.hw.sink.flush()?;
        Ok(row)
    }

    fn wait_for_conversion(&mut self) -> ErrorCode {
        let timing = &self.cfg.timing;
        let clock = &*self.hw.clock;
        if !timing.poll_end_of_conversion {
            clock.sleep(Duration::from_micros(timing.conversion_us));
            return ErrorCode::OK;
        }

        let deadline = clock.now() + Duration::from_micros(timing.poll_timeout_us);
        let driver = &mut self.hw.driver;
        let done = clock.wait_until(
            deadline,
            Duration::from_micros(timing.poll_interval_us),
            &mut || driver.conversion_done(),
        );
        if done {
            ErrorCode::OK
        } else {
            warn!(timeout_us = timing.poll_timeout_us, "Conversion did not finish in time");
            ErrorCode::TIMEOUT
        }
    }

    /// Reads the cell voltages and rebuilds `volts`.
    fn acquire_voltages(&mut self) -> ErrorCode {
        let direction = self.ctx.direction;
        let mut code = self.hw.driver.trigger_conversion(ConversionKind::Cells);
        code |= self.wait_for_conversion();
        for group in 0..VOLTAGE_GROUPS {
            let (codes, read) = self.hw.driver.read_group(ConversionKind::Cells, group);
            code |= read;
            self.ctx.cells.store_group(direction, group, &codes);
        }

        if self.cfg.comm.circular {
            let ambiguous = reconcile_voltages(&self.arbiter, &self.ctx.cells, &mut self.ctx.cell_canonical);
            self.ctx.ambiguous = ambiguous.len();
            if !ambiguous.is_empty() {
                warn!(count = ambiguous.len(), "Ambiguous voltage reconciliation, keeping previous values");
                log_event(
                    "ambiguous_reconciliation",
                    json!({ "direction": direction.to_string(), "channels": ambiguous }),
                );
            }
        } else {
            self.ctx.cell_canonical.clone_from(self.ctx.cells.get(Direction::Forward));
        }

        remap_voltages(&self.ctx.cell_canonical, &self.cfg.ics, &mut self.ctx.volts);
        normalize_voltages(&mut self.ctx.volts, &self.cfg.ics);
        apply_split(&mut self.ctx.volts, &self.cfg.ics);
        code
    }

    /// Reads both thermistor mux banks and rebuilds `temps`.
    fn acquire_temperatures(&mut self) -> ErrorCode {
        let direction = self.ctx.direction;
        let mut code = ErrorCode::OK;
        for mux in MuxSelect::SEQUENCE {
            code |= self.hw.driver.write_config(&ConfigBlock::config_b(mux));
            code |= self.hw.driver.trigger_conversion(ConversionKind::Aux);
            code |= self.wait_for_conversion();

            let bank = mux.index();
            let raw = &mut self.ctx.aux_raw[bank];
            for group in 0..AUX_GROUPS {
                let (codes, read) = self.hw.driver.read_group(ConversionKind::Aux, group);
                code |= read;
                raw.store_group(direction, group, &codes);
            }
            // a short read keeps the previous taps, never a converted value
            let buffer = &mut self.ctx.aux[bank];
            for ic in 0..raw.ics() {
                let row = buffer.row_mut(direction, ic);
                row.copy_from_slice(raw.get(direction).row(ic));
                convert_row(row);
            }

            if self.cfg.comm.circular {
                reconcile_temperatures(&self.arbiter, buffer, &mut self.ctx.aux_canonical[bank]);
            } else {
                self.ctx.aux_canonical[bank].clone_from(buffer.get(Direction::Forward));
            }
            remap_temperatures(&self.ctx.aux_canonical[bank], &self.cfg.ics, mux, &mut self.ctx.temps);
        }
        normalize_temperatures(&mut self.ctx.temps, &self.cfg.ics);
        code
    }

    fn evaluate(&mut self, group: FaultGroup) {
        match group {
            FaultGroup::Voltage => evaluate_voltages(&self.ctx.volts, &self.cfg.thresholds, &mut self.ctx.faults),
            FaultGroup::Temperature => {
                evaluate_temperatures(&self.ctx.temps, &self.cfg.thresholds, &mut self.ctx.faults)
            }
        }
    }

    /// Re-acquires a raised group until it clears or its window runs out.
    fn confirm(&mut self, group: FaultGroup, code: &mut ErrorCode) -> Option<RecheckOutcome> {
        if !self.ctx.faults.group_active(group) {
            self.ctx.faults.set_confirmed(group, false);
            return None;
        }

        let window = match group {
            FaultGroup::Voltage => self.cfg.recheck.voltage_window(),
            FaultGroup::Temperature => self.cfg.recheck.temperature_window(),
        };
        debug!(%group, window_ms = window.as_millis() as u64, "Rechecking raised group");
        let mut recheck = RecheckWindow::start(self.hw.clock.now(), window);

        let outcome = loop {
            self.ctx.faults.clear_group(group);
            *code |= match group {
                FaultGroup::Voltage => self.acquire_voltages(),
                FaultGroup::Temperature => self.acquire_temperatures(),
            };
            self.evaluate(group);
            let still_raised = self.ctx.faults.group_active(group);
            if let RecheckStep::Done(outcome) = recheck.record(still_raised, self.hw.clock.now()) {
                break outcome;
            }
        };

        self.ctx.faults.set_confirmed(group, outcome.is_persistent());
        match outcome {
            RecheckOutcome::Transient { passes } => {
                info!(%group, passes, "Fault cleared on recheck");
            }
            RecheckOutcome::Persistent { passes, elapsed } => {
                let categories: Vec<&str> = self
                    .ctx
                    .faults
                    .active_categories()
                    .into_iter()
                    .filter(|c| c.group() == group)
                    .map(|c| c.label())
                    .collect();
                let locations = self.ctx.faults.locations(group).marked();
                warn!(%group, passes, elapsed_ms = elapsed.as_millis() as u64, "Persistent fault: {}", categories.join(", "));
                log_event(
                    "persistent_fault",
                    json!({
                        "group": group.to_string(),
                        "passes": passes,
                        "elapsed_ms": elapsed.as_millis() as u64,
                        "categories": categories,
                        "locations": locations,
                    }),
                );
            }
        }
        Some(outcome)
    }

    fn update_cooling(&mut self) -> bool {
        if !self.cfg.cooling.enabled {
            return self.cooling.fan_on();
        }
        let before = self.cooling.fan_on();
        let hottest = self.ctx.extremums.max_temperature.map(|e| e.value);
        let fan_on = self.cooling.update(hottest);
        if fan_on != before {
            info!(fan_on, max_temperature = ?hottest, "Cooling fan switched");
        }
        self.hw.lines.set(SignalLine::Fan, fan_on);
        fan_on
    }

    fn read_pack_slow(&mut self, code: &mut ErrorCode) -> Option<PackSlowSample> {
        let pack = self.hw.pack.as_mut()?;
        if !pack.slow_ready() {
            return None;
        }
        match pack.read_slow() {
            Ok(sample) => Some(sample),
            Err(e) => {
                *code |= e;
                None
            }
        }
    }

    fn read_pack_fast(&mut self, code: &mut ErrorCode) -> Option<PackFastSample> {
        let pack = self.hw.pack.as_mut()?;
        match pack.read_fast() {
            Ok(sample) => Some(sample),
            Err(e) => {
                *code |= e;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charger::{ChargerResponse, ChargerStatus};
    use crate::clock::ManualClock;
    use crate::driver::MockCellMonitorDriver;
    use crate::sim::{MemorySink, ScriptedConsole, SimCharger, SimPack, SimSignals, SimulatedStack};
    use crate::test_utils::{reference_config, seven_ic_config};

    struct Rig {
        stack: SimulatedStack,
        charger: SimCharger,
        signals: SimSignals,
        sink: MemorySink,
        clock: ManualClock,
    }

    fn rig(cfg: &StackConfig) -> (Rig, Peripherals) {
        let rig = Rig {
            stack: SimulatedStack::new(cfg),
            charger: SimCharger::charging(),
            signals: SimSignals::new(),
            sink: MemorySink::new(),
            clock: ManualClock::new(),
        };
        let hw = Peripherals {
            driver: Box::new(rig.stack.clone()),
            charger: Box::new(rig.charger.clone()),
            lines: Box::new(rig.signals.clone()),
            console: Box::new(ScriptedConsole::detached()),
            sink: Box::new(rig.sink.clone()),
            pack: None,
            clock: Box::new(rig.clock.clone()),
        };
        (rig, hw)
    }

    fn controller(cfg: StackConfig) -> (Rig, BmsController) {
        let (rig, hw) = rig(&cfg);
        let mut ctl = BmsController::new(cfg, hw).unwrap();
        ctl.startup().unwrap();
        (rig, ctl)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut cfg = reference_config();
        cfg.timing.conversion_us = 0;
        let (_rig, hw) = rig(&cfg);
        assert!(BmsController::new(cfg, hw).unwrap_err().is_config());
    }

    #[test]
    fn test_startup_writes_banner_and_header() {
        let (rig, _ctl) = controller(reference_config());
        let lines = rig.sink.lines();
        assert_eq!(lines[0], "INIT,PARALLEL TO DAISYCHAIN,CS:10,STAT:0x10000000,OK");
        assert!(lines[1].starts_with("tDut,aV0,"));
        assert!(lines[1].ends_with("fT14,OK/ERR"));
        assert_eq!(rig.signals.level(SignalLine::BmsFault), Some(false));
    }

    #[test]
    fn test_clean_cycles_alternate_direction() {
        let (rig, mut ctl) = controller(reference_config());

        let first = ctl.run_cycle().unwrap();
        assert_eq!(first.direction, Direction::Forward);
        assert!(first.code.is_ok());
        assert!(!first.bms_fault);
        assert_eq!(first.charger, ChargerState::Charging);
        // grounded inputs read 0 V against the 6 V backward seed
        assert_eq!(first.ambiguous, 3 * 6);
        assert!(first.row.starts_with("0,3.7000,"));
        assert!(first.row.ends_with(",OK"));

        let second = ctl.run_cycle().unwrap();
        assert_eq!(second.direction, Direction::Backward);
        assert_eq!(second.ambiguous, 0);
        assert_eq!(ctl.context().direction, Direction::Forward);

        // each cycle enters the chain from its own end
        let inits: Vec<u8> = rig.stack.inits().iter().map(|p| p.chip_select).collect();
        assert_eq!(inits, vec![10, 10, 37]);

        // healthy first cycle releases the fault line on the second
        assert_eq!(rig.signals.level(SignalLine::BmsFault), Some(true));
    }

    #[test]
    fn test_short_monitor_closes_ring() {
        let (rig, mut ctl) = controller(seven_ic_config(4));
        ctl.run_cycle().unwrap();
        let report = ctl.run_cycle().unwrap();
        assert!(!report.bms_fault);
        assert_eq!(ctl.context().volts.get(6, 4), Some(3.5));
        assert_eq!(ctl.context().temps.get(6, 12), Some(30.0));
        assert!(rig.sink.lines()[1].contains(",gV3,aT0,"));
        assert_eq!(rig.sink.lines()[2].split(',').count(), 1 + 2 * (6 * 15 + 4) + 1);
    }

    #[test]
    fn test_reconciled_matrix_matches_physical_cells() {
        let cfg = reference_config();
        let (rig, mut ctl) = controller(cfg);
        rig.stack.set_cell_voltage(1, 4, 3.9);
        rig.stack.set_cell_temperature(3, 2, 31.5);
        ctl.run_cycle().unwrap();
        ctl.run_cycle().unwrap();

        let ctx = ctl.context();
        assert!((ctx.volts.get(1, 4).unwrap() - 3.9).abs() < 1e-3);
        assert!((ctx.volts.get(4, 1).unwrap() - 3.7).abs() < 1e-3);
        assert!((ctx.temps.get(3, 2).unwrap() - 31.5).abs() < 0.01);
        // IC0 slot 9 is normalized
        assert_eq!(ctx.temps.get(0, 9), Some(30.0));
        let max = ctx.extremums.max_voltage.unwrap();
        assert_eq!((max.ic, max.slot), (1, 4));
    }

    #[test]
    fn test_overvoltage_is_confirmed_and_signaled() {
        let (rig, mut ctl) = controller(reference_config());
        rig.stack.set_cell_voltage(2, 3, 4.3);

        let report = ctl.run_cycle().unwrap();
        match report.voltage_recheck {
            Some(RecheckOutcome::Persistent { elapsed, .. }) => assert!(elapsed >= Duration::from_millis(400)),
            other => panic!("expected persistent outcome, got {:?}", other),
        }
        assert!(report.bms_fault);
        assert_eq!(report.charger, ChargerState::Disabled);
        assert!(ctl.context().faults.voltage_fault);
        assert_eq!(ctl.context().faults.locations(FaultGroup::Voltage).marked(), vec![(2, 3)]);
        assert_eq!(rig.signals.level(SignalLine::BmsFault), Some(false));
        assert_eq!(rig.signals.level(SignalLine::VoltageLed), Some(true));
        assert!(rig.charger.requests().is_empty());
    }

    #[test]
    fn test_recovered_cell_releases_fault_next_cycle() {
        let (rig, mut ctl) = controller(reference_config());
        rig.stack.set_cell_voltage(2, 3, 4.3);
        assert!(ctl.run_cycle().unwrap().bms_fault);

        rig.stack.set_cell_voltage(2, 3, 3.7);
        // backward pass agrees with the stale forward reading within tolerance
        assert!(ctl.run_cycle().unwrap().bms_fault);

        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.direction, Direction::Forward);
        assert!(!report.bms_fault);
        assert_eq!(report.voltage_recheck, None);
        // still low through the cycle that followed the fault
        assert_eq!(rig.signals.level(SignalLine::BmsFault), Some(false));

        ctl.run_cycle().unwrap();
        assert_eq!(rig.signals.level(SignalLine::BmsFault), Some(true));
        assert_eq!(rig.signals.level(SignalLine::VoltageLed), Some(false));
    }

    #[test]
    fn test_failover_after_exhausted_retries() {
        let mut cfg = reference_config();
        cfg.comm.circular = false;
        let (rig, mut ctl) = controller(cfg);
        let path0 = CommPath { chip_select: 10, on_top: false };
        let path1 = CommPath { chip_select: 37, on_top: false };
        rig.stack.kill_path(path0);

        let first = ctl.run_cycle().unwrap();
        assert!(first.aborted);
        assert_eq!(first.row, "ERR:0xB");
        assert_eq!(first.failover, Some(FailoverAction::Reinit(path0)));

        let second = ctl.run_cycle().unwrap();
        assert_eq!(second.failover, Some(FailoverAction::Switch { from: path0, to: path1 }));

        let third = ctl.run_cycle().unwrap();
        assert!(!third.aborted);
        assert!(third.code.is_ok());
        assert_eq!(rig.stack.inits(), vec![path0, path0, path1]);

        // banner and header again after every re-init
        let banners = rig.sink.lines().iter().filter(|l| l.starts_with("INIT,")).count();
        assert_eq!(banners, 3);
        // back-off slept on each abort
        assert!(rig.clock.now() >= Duration::from_millis(200));
    }

    #[test]
    fn test_aborted_cycle_keeps_direction() {
        let (rig, mut ctl) = controller(reference_config());
        rig.stack.fail_next(1);
        let report = ctl.run_cycle().unwrap();
        assert!(report.aborted);
        assert_eq!(ctl.context().direction, Direction::Forward);
        assert_eq!(rig.signals.level(SignalLine::PecLed), Some(true));

        let report = ctl.run_cycle().unwrap();
        assert!(!report.aborted);
        assert_eq!(report.direction, Direction::Forward);
        assert_eq!(rig.signals.level(SignalLine::PecLed), Some(false));
    }

    #[test]
    fn test_pec_only_errors_are_tolerated() {
        let cfg = reference_config();
        let mut driver = MockCellMonitorDriver::new();
        driver.expect_init().returning(|_| ErrorCode::OK);
        driver.expect_device_status().return_const(0u64);
        driver.expect_clear_conversion_registers().returning(|| ErrorCode::PEC);
        driver.expect_write_config().returning(|_| ErrorCode::OK);
        driver.expect_trigger_conversion().returning(|_| ErrorCode::OK);
        driver.expect_conversion_done().return_const(true);
        driver.expect_read_group().returning(|kind, group| {
            // aux group B carries the divider reference in its last channel
            let triple: [u16; 3] = match (kind, group) {
                (ConversionKind::Cells, _) => [37_000; 3],
                (ConversionKind::Aux, 1) => [15_000, 15_000, 30_000],
                (ConversionKind::Aux, _) => [15_000; 3],
            };
            (triple.repeat(6), ErrorCode::OK)
        });

        let (rig, mut hw) = rig(&cfg);
        hw.driver = Box::new(driver);
        let mut ctl = BmsController::new(cfg, hw).unwrap();
        ctl.startup().unwrap();
        let report = ctl.run_cycle().unwrap();
        assert!(!report.aborted);
        assert_eq!(report.code, ErrorCode::PEC);
        assert!(report.row.ends_with(",ERR:0x1"));
        assert_eq!(rig.signals.level(SignalLine::PecLed), Some(false));
    }

    #[test]
    fn test_short_aux_read_keeps_previous_temperatures() {
        let mut cfg = reference_config();
        cfg.comm.circular = false;
        let mut driver = MockCellMonitorDriver::new();
        driver.expect_init().returning(|_| ErrorCode::OK);
        driver.expect_device_status().return_const(0u64);
        driver.expect_clear_conversion_registers().returning(|| ErrorCode::OK);
        driver.expect_write_config().returning(|_| ErrorCode::OK);
        driver.expect_trigger_conversion().returning(|_| ErrorCode::OK);
        driver.expect_conversion_done().return_const(true);
        let mut aux_a_reads = 0u32;
        driver.expect_read_group().returning(move |kind, group| {
            let triple: [u16; 3] = match (kind, group) {
                (ConversionKind::Cells, _) => [37_000; 3],
                (ConversionKind::Aux, 0) => {
                    aux_a_reads += 1;
                    // both banks of the second cycle lose group A
                    if aux_a_reads > 2 {
                        return (Vec::new(), ErrorCode::PEC);
                    }
                    [15_000; 3]
                }
                (ConversionKind::Aux, 1) => [15_000, 15_000, 30_000],
                (ConversionKind::Aux, _) => [15_000; 3],
            };
            (triple.repeat(6), ErrorCode::OK)
        });

        let (_rig, mut hw) = rig(&cfg);
        hw.driver = Box::new(driver);
        let mut ctl = BmsController::new(cfg, hw).unwrap();
        ctl.startup().unwrap();
        ctl.run_cycle().unwrap();
        let before = ctl.context().temps.get(1, 0).unwrap();
        assert!((before - 24.9).abs() < 0.5, "got {}", before);

        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.code, ErrorCode::PEC);
        assert_eq!(report.temperature_recheck, None);
        assert!(!report.bms_fault);
        assert!((ctl.context().temps.get(1, 0).unwrap() - before).abs() < 1e-9);
    }

    #[test]
    fn test_conversion_timeout_reported() {
        let mut cfg = reference_config();
        cfg.timing.poll_end_of_conversion = true;
        let (rig, mut ctl) = controller(cfg);
        rig.stack.set_polls_until_done(1000);
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.code, ErrorCode::TIMEOUT);
        assert!(ctl.context().comm.is_error(report.code));
        assert!(report.row.ends_with(",ERR:0x8"));
    }

    #[test]
    fn test_charger_runs_when_healthy() {
        let mut cfg = reference_config();
        cfg.charger.enabled = true;
        let (rig, mut ctl) = controller(cfg);
        let start = rig.clock.now();
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.charger, ChargerState::Charging);
        assert_eq!(rig.charger.requests()[0].control, 0);
        // one-shot settle plus the per-cycle settle wait
        assert!(rig.clock.now() - start >= Duration::from_millis(2000));
    }

    #[test]
    fn test_charger_fault_sets_bms_flag() {
        let mut cfg = reference_config();
        cfg.charger.enabled = true;
        let (rig, mut ctl) = controller(cfg);
        rig.charger.set_default(Some(ChargerResponse { voltage: 0.0, current: 0.0, status: ChargerStatus(1) }));
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.charger, ChargerState::ErrorClassify(ChargerStatus(1)));
        assert!(report.bms_fault);

        ctl.run_cycle().unwrap();
        assert_eq!(rig.charger.requests()[1].control, 1);
    }

    #[test]
    fn test_fan_follows_hottest_cell() {
        let (rig, mut ctl) = controller(reference_config());
        rig.stack.set_cell_temperature(2, 5, 36.0);
        assert!(ctl.run_cycle().unwrap().fan_on);
        assert_eq!(rig.signals.level(SignalLine::Fan), Some(true));

        rig.stack.set_cell_temperature(2, 5, 34.0);
        assert!(ctl.run_cycle().unwrap().fan_on);
        // the hotter of the two ends wins until both have been re-read
        rig.stack.set_cell_temperature(2, 5, 25.0);
        assert!(ctl.run_cycle().unwrap().fan_on);
        assert!(!ctl.run_cycle().unwrap().fan_on);
        assert_eq!(rig.signals.level(SignalLine::Fan), Some(false));
    }

    #[test]
    fn test_pack_monitor_columns() {
        let cfg = reference_config();
        let (rig, mut hw) = rig(&cfg);
        hw.pack = Some(Box::new(SimPack::default()));
        let mut ctl = BmsController::new(cfg, hw).unwrap();
        ctl.startup().unwrap();
        let report = ctl.run_cycle().unwrap();
        assert!(report.row.starts_with("0,8.00,2840.00,355.00,25.0,28.0,3.7000"));
        assert!(report.row.ends_with(",8.00,355.00,OK"));
        assert!(rig.sink.lines()[1].starts_with("tDut,I1,P1,BAT,Tntc,TIC,aV0"));
    }

    #[test]
    fn test_run_honours_cycle_limit_and_shutdown() {
        let (rig, mut ctl) = controller(reference_config());
        let shutdown = AtomicBool::new(false);
        assert_eq!(ctl.run(Some(3), &shutdown).unwrap(), 3);
        // banner, header and three rows
        assert_eq!(rig.sink.lines().len(), 5);

        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(ctl.run(Some(3), &shutdown).unwrap(), 0);
        assert_eq!(ctl.cycles(), 3);
    }
}
