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

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{comm, layout::MAX_ICS, layout::SHORT_IC_MAX_CELLS, layout::SLOTS_PER_IC, paths};
use crate::error::{BmsError, Result};
use crate::layout::{IcLayout, SlotMask};

/// One cell monitor in chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IcConfig {
    /// Physically wired cells. 15 for a full monitor, at most 6 for a short one.
    #[serde(default = "default_cells")]
    pub cells: usize,
    #[serde(default)]
    pub normalize_voltage: SlotMask,
    #[serde(default)]
    pub normalize_temperature: SlotMask,
    /// Bit `i` marks slot `i` as the right member of the split pair `(i-1, i)`.
    #[serde(default)]
    pub split_voltage: SlotMask,
}

fn default_cells() -> usize { SLOTS_PER_IC }

impl IcConfig {
    pub fn full() -> Self {
        Self {
            cells: SLOTS_PER_IC,
            normalize_voltage: SlotMask::EMPTY,
            normalize_temperature: SlotMask::EMPTY,
            split_voltage: SlotMask::EMPTY,
        }
    }

    pub fn short(cells: usize) -> Self {
        Self { cells, ..Self::full() }
    }

    pub fn layout(&self) -> IcLayout {
        IcLayout::for_cells(self.cells)
    }

    /// Slots touched by a split, both members of every pair.
    pub fn split_members(&self) -> SlotMask {
        let right = self.split_voltage.0;
        SlotMask(right | (right >> 1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_overvoltage")]
    pub overvoltage: f64,
    #[serde(default = "default_undervoltage")]
    pub undervoltage: f64,
    #[serde(default = "default_overtemperature")]
    pub overtemperature: f64,
}

fn default_overvoltage() -> f64 { 4.2 }
fn default_undervoltage() -> f64 { 2.8 }
fn default_overtemperature() -> f64 { 45.0 }

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            overvoltage: default_overvoltage(),
            undervoltage: default_undervoltage(),
            overtemperature: default_overtemperature(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_validity_floor")]
    pub validity_floor: f64,
}

fn default_tolerance() -> f64 { 1.0 }
fn default_validity_floor() -> f64 { 0.5 }

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { tolerance: default_tolerance(), validity_floor: default_validity_floor() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecheckConfig {
    #[serde(default = "default_voltage_window_ms")]
    pub voltage_window_ms: u64,
    #[serde(default = "default_temperature_window_ms")]
    pub temperature_window_ms: u64,
}

fn default_voltage_window_ms() -> u64 { 400 }
fn default_temperature_window_ms() -> u64 { 900 }

impl Default for RecheckConfig {
    fn default() -> Self {
        Self {
            voltage_window_ms: default_voltage_window_ms(),
            temperature_window_ms: default_temperature_window_ms(),
        }
    }
}

impl RecheckConfig {
    pub fn voltage_window(&self) -> Duration { Duration::from_millis(self.voltage_window_ms) }
    pub fn temperature_window(&self) -> Duration { Duration::from_millis(self.temperature_window_ms) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommConfig {
    #[serde(default = "default_primary_cs")]
    pub primary_chip_select: u8,
    #[serde(default = "default_secondary_cs")]
    pub secondary_chip_select: u8,
    /// Re-initializations of the same path before failing over.
    #[serde(default = "default_retries")]
    pub retries: u8,
    /// Driver status codes up to and including this value are not errors.
    #[serde(default = "default_ignore_threshold")]
    pub ignore_threshold: u8,
    /// Ring topology: alternate read direction every cycle.
    #[serde(default = "default_true")]
    pub circular: bool,
}

fn default_primary_cs() -> u8 { comm::PRIMARY_CHIP_SELECT }
fn default_secondary_cs() -> u8 { comm::SECONDARY_CHIP_SELECT }
fn default_retries() -> u8 { 1 }
fn default_ignore_threshold() -> u8 { 3 }
fn default_true() -> bool { true }

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            primary_chip_select: default_primary_cs(),
            secondary_chip_select: default_secondary_cs(),
            retries: default_retries(),
            ignore_threshold: default_ignore_threshold(),
            circular: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Poll the chain for end of conversion instead of sleeping the full conversion time.
    #[serde(default)]
    pub poll_end_of_conversion: bool,
    #[serde(default = "default_conversion_us")]
    pub conversion_us: u64,
    #[serde(default = "default_poll_timeout_us")]
    pub poll_timeout_us: u64,
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Settling delay before the first initialization.
    #[serde(default)]
    pub startup_delay_ms: u64,
}

fn default_conversion_us() -> u64 { 2_400 }
fn default_poll_timeout_us() -> u64 { 5_000 }
fn default_poll_interval_us() -> u64 { 100 }

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_end_of_conversion: false,
            conversion_us: default_conversion_us(),
            poll_timeout_us: default_poll_timeout_us(),
            poll_interval_us: default_poll_interval_us(),
            startup_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requested voltage limit in 0.1 V
    #[serde(default = "default_max_voltage_dv")]
    pub max_voltage_dv: u16,
    /// Requested current limit in 0.1 A
    #[serde(default = "default_max_current_da")]
    pub max_current_da: u16,
    /// Charger output voltage above which a pack is considered connected
    #[serde(default = "default_connect_voltage")]
    pub connect_voltage: f64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_max_voltage_dv() -> u16 { 3600 }
fn default_max_current_da() -> u16 { 100 }
fn default_connect_voltage() -> f64 { 250.0 }
fn default_settle_delay_ms() -> u64 { 1000 }

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_voltage_dv: default_max_voltage_dv(),
            max_current_da: default_max_current_da(),
            connect_voltage: default_connect_voltage(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoolingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fan_on_above")]
    pub on_above: f64,
    #[serde(default = "default_fan_off_at_or_below")]
    pub off_at_or_below: f64,
}

fn default_fan_on_above() -> f64 { 35.0 }
fn default_fan_off_at_or_below() -> f64 { 33.0 }

impl Default for CoolingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_above: default_fan_on_above(),
            off_at_or_below: default_fan_off_at_or_below(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Signal and keep cycling.
    Production,
    /// Block on the operator console until resumed.
    Debug,
}

fn default_interrupt_mode() -> InterruptMode { InterruptMode::Production }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_interrupt_mode")]
    pub interrupt_mode: InterruptMode,
    /// Fan request line asserted at startup
    #[serde(default)]
    pub fan_request: bool,
    /// Charger enable line asserted at startup
    #[serde(default)]
    pub charger_enable_request: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            interrupt_mode: default_interrupt_mode(),
            fan_request: false,
            charger_enable_request: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Cell monitors in chain order
    pub ics: Vec<IcConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub recheck: RecheckConfig,
    #[serde(default)]
    pub comm: CommConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub charger: ChargerConfig,
    #[serde(default)]
    pub cooling: CoolingConfig,
    #[serde(default)]
    pub signals: SignalConfig,
    /// A pack current/voltage monitor shares the chain.
    #[serde(default)]
    pub pack_monitor: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::reference()
    }
}

impl StackConfig {
    /// Six full monitors as fitted in the reference pack.
    pub fn reference() -> Self {
        let mut ics = vec![IcConfig::full(); 6];
        ics[0].normalize_temperature = SlotMask(0x201);
        ics[0].split_voltage = SlotMask(0x80);
        ics[4].normalize_temperature = SlotMask(0x20);
        Self {
            ics,
            thresholds: Thresholds::default(),
            reconcile: ReconcileConfig::default(),
            recheck: RecheckConfig::default(),
            comm: CommConfig::default(),
            timing: TimingConfig::default(),
            charger: ChargerConfig::default(),
            cooling: CoolingConfig::default(),
            signals: SignalConfig::default(),
            pack_monitor: false,
        }
    }

    /// Appends a short chain-closing monitor.
    pub fn with_short_ic(mut self, cells: usize) -> Self {
        self.ics.push(IcConfig::short(cells));
        self
    }

    pub fn ic_count(&self) -> usize {
        self.ics.len()
    }

    /// Every violation found, empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        config_problems(self)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join(paths::CONFIG_DIR_NAME).join(paths::CONFIG_FILE);
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home)
            .join(".config")
            .join(paths::CONFIG_DIR_NAME)
            .join(paths::CONFIG_FILE);
    }
    PathBuf::from(paths::SYSTEM_CONFIG)
}

/// Every configuration problem found, in field order.
pub fn config_problems(cfg: &StackConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if cfg.ics.is_empty() {
        problems.push("at least one cell monitor is required".to_string());
    }
    if cfg.ics.len() > MAX_ICS {
        problems.push(format!("too many cell monitors (max {})", MAX_ICS));
    }

    for (i, ic) in cfg.ics.iter().enumerate() {
        let name = format!("ics[{}]", i);
        if ic.cells == 0 || ic.cells > SLOTS_PER_IC {
            problems.push(format!("{}: cells must be 1..={}", name, SLOTS_PER_IC));
        } else if ic.cells < SLOTS_PER_IC && ic.cells > SHORT_IC_MAX_CELLS {
            problems.push(format!(
                "{}: a short monitor wires at most {} cells, got {}",
                name, SHORT_IC_MAX_CELLS, ic.cells
            ));
        }
        if ic.cells < SLOTS_PER_IC && i + 1 != cfg.ics.len() {
            problems.push(format!("{}: only the chain-closing (last) monitor may be short", name));
        }

        for (field, mask) in [
            ("normalize_voltage", ic.normalize_voltage),
            ("normalize_temperature", ic.normalize_temperature),
            ("split_voltage", ic.split_voltage),
        ] {
            if mask.out_of_range() != 0 {
                problems.push(format!("{}.{}: bits above slot {} set ({})", name, field, SLOTS_PER_IC - 1, mask));
            }
        }

        let split = ic.split_voltage;
        if split.contains(0) {
            problems.push(format!("{}.split_voltage: slot 0 has no left neighbour", name));
        }
        if split.0 & (split.0 >> 1) != 0 {
            problems.push(format!("{}.split_voltage: adjacent split bits overlap ({})", name, split));
        }
        if ic.split_members().intersects(ic.normalize_voltage) {
            problems.push(format!(
                "{}: slots both normalized and split (normalize {}, split {})",
                name, ic.normalize_voltage, split
            ));
        }
        if ic.cells < SLOTS_PER_IC {
            let beyond = !((1u16 << ic.cells.min(15)) - 1) & ((1u16 << SLOTS_PER_IC) - 1);
            if ic.split_members().0 & beyond != 0 {
                problems.push(format!("{}.split_voltage: split beyond the {} wired cells", name, ic.cells));
            }
            if (ic.normalize_voltage.0 | ic.normalize_temperature.0) & beyond != 0 {
                problems.push(format!("{}: normalized slot beyond the {} wired cells", name, ic.cells));
            }
        }
    }

    let t = &cfg.thresholds;
    if !(t.undervoltage < t.overvoltage) {
        problems.push("thresholds: undervoltage must be below overvoltage".to_string());
    }
    if !t.overtemperature.is_finite() {
        problems.push("thresholds: overtemperature must be a number".to_string());
    }
    if !(cfg.reconcile.tolerance > 0.0 && cfg.reconcile.tolerance.is_finite()) {
        problems.push("reconcile.tolerance must be positive".to_string());
    }
    if !(cfg.reconcile.validity_floor > 0.0 && cfg.reconcile.validity_floor.is_finite()) {
        problems.push("reconcile.validity_floor must be positive".to_string());
    }
    if cfg.recheck.voltage_window_ms == 0 || cfg.recheck.temperature_window_ms == 0 {
        problems.push("recheck windows must be non-zero".to_string());
    }
    if cfg.timing.conversion_us == 0 {
        problems.push("timing.conversion_us must be non-zero".to_string());
    }
    if cfg.timing.poll_end_of_conversion && (cfg.timing.poll_interval_us == 0 || cfg.timing.poll_timeout_us == 0) {
        problems.push("timing: polling needs a non-zero interval and timeout".to_string());
    }
    if cfg.comm.primary_chip_select == cfg.comm.secondary_chip_select {
        problems.push("comm: primary and secondary chip select must differ".to_string());
    }
    if !(cfg.cooling.off_at_or_below <= cfg.cooling.on_above) {
        problems.push("cooling: off temperature above on temperature".to_string());
    }
    if !(cfg.charger.connect_voltage > 0.0 && cfg.charger.connect_voltage.is_finite()) {
        problems.push("charger.connect_voltage must be positive".to_string());
    }
    problems
}

pub fn validate_config(cfg: &StackConfig) -> Result<()> {
    let problems = config_problems(cfg);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(BmsError::config(problems.join("; ")))
    }
}

pub fn load_config(path: &Path) -> Result<StackConfig> {
    let data = fs::read_to_string(path).map_err(|source| BmsError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: StackConfig = serde_json::from_str(&data)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Loads from the default location, falling back to the reference stack.
pub fn load_saved_config() -> Result<StackConfig> {
    let path = config_path();
    if path.exists() {
        load_config(&path)
    } else {
        Ok(StackConfig::reference())
    }
}

pub fn save_config(path: &Path, cfg: &StackConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let json = serde_json::to_string_pretty(cfg)?;
    fs::write(path, json).map_err(|source| BmsError::FileWrite {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_reference_is_valid() {
        let cfg = StackConfig::reference();
        assert_eq!(cfg.ic_count(), 6);
        assert!(validate_config(&cfg).is_ok());
        assert!(validate_config(&cfg.with_short_ic(6)).is_ok());
    }

    #[test]
    fn test_reference_masks() {
        let cfg = StackConfig::reference();
        assert!(cfg.ics[0].normalize_temperature.contains(0));
        assert!(cfg.ics[0].normalize_temperature.contains(9));
        assert!(cfg.ics[4].normalize_temperature.contains(5));
        assert_eq!(cfg.ics[0].split_members(), SlotMask(0xC0));
    }

    #[test]
    fn test_normalized_and_split_rejected() {
        let mut cfg = StackConfig::reference();
        cfg.ics[0].normalize_voltage = SlotMask::from_slots(&[6]);
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("both normalized and split"));
    }

    #[test]
    fn test_split_rules() {
        let mut cfg = StackConfig::reference();
        cfg.ics[1].split_voltage = SlotMask(0x1);
        cfg.ics[2].split_voltage = SlotMask(0x6);
        cfg.ics[3].split_voltage = SlotMask(0x8000);
        let problems = config_problems(&cfg);
        assert!(problems.iter().any(|p| p.contains("ics[1]") && p.contains("slot 0")));
        assert!(problems.iter().any(|p| p.contains("ics[2]") && p.contains("adjacent")));
        assert!(problems.iter().any(|p| p.contains("ics[3]") && p.contains("bits above")));
    }

    #[test]
    fn test_short_ic_limits() {
        let cfg = StackConfig::reference().with_short_ic(7);
        assert!(config_problems(&cfg).iter().any(|p| p.contains("at most 6")));

        let mut cfg = StackConfig::reference().with_short_ic(6);
        cfg.ics[6].split_voltage = SlotMask::from_slots(&[7]);
        assert!(config_problems(&cfg).iter().any(|p| p.contains("split beyond")));

        let mut cfg = StackConfig::reference().with_short_ic(6);
        cfg.ics[6].normalize_temperature = SlotMask::from_slots(&[10]);
        assert_eq!(cfg.validate().len(), 1);
        assert!(cfg.validate()[0].contains("normalized slot beyond"));
    }

    #[test]
    fn test_short_ic_must_close_chain() {
        let cfg: StackConfig = serde_json::from_str(r#"{"ics":[{"cells":6},{}]}"#).unwrap();
        let problems = config_problems(&cfg);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("ics[0]") && problems[0].contains("chain-closing"));

        let cfg: StackConfig = serde_json::from_str(r#"{"ics":[{},{"cells":6}]}"#).unwrap();
        assert!(config_problems(&cfg).is_empty());
    }

    #[test]
    fn test_chain_length_limited_to_ic_letters() {
        let mut cfg = StackConfig::reference();
        cfg.ics = vec![IcConfig::full(); MAX_ICS];
        assert!(config_problems(&cfg).is_empty());
        cfg.ics.push(IcConfig::full());
        assert!(config_problems(&cfg).iter().any(|p| p.contains("too many")));
    }

    #[test]
    fn test_nan_tunables_rejected() {
        let mut cfg = StackConfig::reference();
        cfg.reconcile.tolerance = f64::NAN;
        cfg.reconcile.validity_floor = f64::NAN;
        cfg.thresholds.overvoltage = f64::NAN;
        cfg.thresholds.overtemperature = f64::NAN;
        cfg.charger.connect_voltage = f64::NAN;
        cfg.cooling.on_above = f64::NAN;
        let problems = config_problems(&cfg);
        assert_eq!(problems.len(), 6, "{:?}", problems);
    }

    #[test]
    fn test_timing_and_windows_rejected() {
        let mut cfg = StackConfig::reference();
        cfg.timing.conversion_us = 0;
        cfg.recheck.voltage_window_ms = 0;
        cfg.comm.secondary_chip_select = cfg.comm.primary_chip_select;
        let problems = config_problems(&cfg);
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let cfg: StackConfig = serde_json::from_str(r#"{"ics":[{},{"cells":6}]}"#).unwrap();
        assert_eq!(cfg.ics[0].cells, 15);
        assert_eq!(cfg.ics[1].layout(), IcLayout::Short { cells: 6 });
        assert_eq!(cfg.thresholds.overvoltage, 4.2);
        assert_eq!(cfg.recheck.temperature_window_ms, 900);
        assert_eq!(cfg.comm.ignore_threshold, 3);
        assert_eq!(cfg.charger.max_voltage_dv, 3600);
        assert_eq!(cfg.signals.interrupt_mode, InterruptMode::Production);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let res: std::result::Result<StackConfig, _> = serde_json::from_str(r#"{"ics":[],"bogus":1}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&StackConfig::reference()).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let loaded = load_config(file.path()).unwrap();
        assert_eq!(loaded, StackConfig::reference());
    }

    #[test]
    fn test_load_config_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"ics":[{"split_voltage":1}]}"#).unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.is_config());

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        assert!(matches!(load_config(file.path()), Err(BmsError::JsonParse(_))));
    }

    #[test]
    fn test_save_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = StackConfig::reference().with_short_ic(6);
        save_config(&path, &cfg).unwrap();
        assert_eq!(load_config(&path).unwrap(), cfg);
    }

    #[test]
    #[serial]
    fn test_config_path_with_xdg() {
        std::env::set_var("XDG_CONFIG_HOME", "/custom/config");
        let path = config_path();
        assert!(path.to_string_lossy().contains("/custom/config/ringbms/config.json"));
        std::env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    #[serial]
    fn test_config_path_with_home() {
        std::env::remove_var("XDG_CONFIG_HOME");
        let old_home = std::env::var("HOME").ok();
        std::env::set_var("HOME", "/home/testuser");
        let path = config_path();
        assert!(path.to_string_lossy().contains("/home/testuser/.config/ringbms/config.json"));
        if let Some(h) = old_home {
            std::env::set_var("HOME", h);
        }
    }
}
