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

//! Charger coordination over the vehicle bus.
//!
//! Once per cycle the controller sends a limit request and classifies the
//! charger's answer. The first time the charger reports a connected pack the
//! session waits for the output to settle and reads again before classifying.

use std::fmt;
use std::time::Duration;

use tracing::{info, trace, warn};

use crate::clock::Clock;
use crate::config::ChargerConfig;
use crate::constants::charger::{
    DELIVERING_CURRENT_AMPS, FRAME_LEN, IDLE_CURRENT_AMPS, STATUS_BATTERY_DISCONNECTED, STATUS_COMM_FAILED,
    STATUS_HARDWARE_FAILURE, STATUS_INPUT_VOLTAGE, STATUS_OVERHEAT,
};
use crate::error::{BmsError, Result};

/// Limit request sent every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargerRequest {
    /// 0.1 V units
    pub max_voltage_dv: u16,
    /// 0.1 A units
    pub max_current_da: u16,
    /// 0 = charge allowed, 1 = do not charge
    pub control: u8,
}

impl ChargerRequest {
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let v = self.max_voltage_dv.to_be_bytes();
        let c = self.max_current_da.to_be_bytes();
        [v[0], v[1], c[0], c[1], self.control]
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_LEN {
            return Err(BmsError::ChargerBus(format!("request frame too short: {} bytes", data.len())));
        }
        Ok(Self {
            max_voltage_dv: u16::from_be_bytes([data[0], data[1]]),
            max_current_da: u16::from_be_bytes([data[2], data[3]]),
            control: data[4],
        })
    }
}

/// Charger status frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargerResponse {
    pub voltage: f64,
    pub current: f64,
    pub status: ChargerStatus,
}

impl ChargerResponse {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_LEN {
            return Err(BmsError::ChargerBus(format!("response frame too short: {} bytes", data.len())));
        }
        Ok(Self {
            voltage: f64::from(u16::from_be_bytes([data[0], data[1]])) / 10.0,
            current: f64::from(u16::from_be_bytes([data[2], data[3]])) / 10.0,
            status: ChargerStatus(data[4]),
        })
    }

    /// Encodes with the charger's resolution, rounding to 0.1.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let v = ((self.voltage * 10.0).round().clamp(0.0, 65535.0) as u16).to_be_bytes();
        let c = ((self.current * 10.0).round().clamp(0.0, 65535.0) as u16).to_be_bytes();
        [v[0], v[1], c[0], c[1], self.status.0]
    }
}

/// Status byte bitfield
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChargerStatus(pub u8);

impl ChargerStatus {
    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// Battery disconnected with no other cause than a lost link.
    pub fn battery_disconnected(&self) -> bool {
        self.0 & !STATUS_COMM_FAILED == STATUS_BATTERY_DISCONNECTED
    }

    pub fn describe(&self) -> String {
        match self.0 {
            0 => return "OK".to_string(),
            12 => return "Battery disconnected and incorrect input voltage".to_string(),
            24 => return "Battery disconnected and communication failed".to_string(),
            _ => {}
        }
        let names = [
            (STATUS_HARDWARE_FAILURE, "Hardware failure"),
            (STATUS_OVERHEAT, "Charger overheated"),
            (STATUS_INPUT_VOLTAGE, "Incorrect input voltage"),
            (STATUS_BATTERY_DISCONNECTED, "Battery disconnected"),
            (STATUS_COMM_FAILED, "Communication failed"),
        ];
        let mut parts: Vec<String> = names
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| name.to_string())
            .collect();
        let unknown = self.0 & !0x1F;
        if unknown != 0 {
            parts.push(format!("unknown bits 0x{:02X}", unknown));
        }
        parts.join(", ")
    }
}

impl fmt::Display for ChargerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargerState {
    Disabled,
    Requesting,
    AwaitingResponse,
    ErrorClassify(ChargerStatus),
    Charging,
    ReadyNoCurrent,
    CommTimeout,
    BatteryDisconnected,
    Unclassified,
}

impl ChargerState {
    /// Whether this outcome raises the charger fault.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ChargerState::ErrorClassify(_)
                | ChargerState::ReadyNoCurrent
                | ChargerState::CommTimeout
                | ChargerState::Unclassified
        )
    }
}

impl fmt::Display for ChargerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargerState::Disabled => write!(f, "disabled"),
            ChargerState::Requesting => write!(f, "requesting"),
            ChargerState::AwaitingResponse => write!(f, "awaiting response"),
            ChargerState::ErrorClassify(s) => write!(f, "charger error: {}", s.describe()),
            ChargerState::Charging => write!(f, "charging"),
            ChargerState::ReadyNoCurrent => write!(f, "ready, no current"),
            ChargerState::CommTimeout => write!(f, "no response"),
            ChargerState::BatteryDisconnected => write!(f, "battery disconnected"),
            ChargerState::Unclassified => write!(f, "unclassified response"),
        }
    }
}

/// Vehicle bus transport for the charger frames
#[cfg_attr(test, mockall::automock)]
pub trait ChargerBus {
    /// Queues the request; false if the bus refused it.
    fn send_request(&mut self, request: &ChargerRequest) -> bool;

    /// The charger's latest status frame, if one arrived.
    fn receive_response(&mut self) -> Option<ChargerResponse>;
}

#[derive(Debug, Clone)]
pub struct ChargerSession {
    enabled: bool,
    max_voltage_dv: u16,
    max_current_da: u16,
    connect_voltage: f64,
    settle: Duration,
    /// Latched fault, sent back to the charger as the control byte
    pub charger_fault: bool,
    /// One-shot settle read still pending
    charging_started: bool,
    last_response: Option<ChargerResponse>,
    state: ChargerState,
}

impl ChargerSession {
    pub fn new(cfg: &ChargerConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            max_voltage_dv: cfg.max_voltage_dv,
            max_current_da: cfg.max_current_da,
            connect_voltage: cfg.connect_voltage,
            settle: Duration::from_millis(cfg.settle_delay_ms),
            charger_fault: false,
            charging_started: true,
            last_response: None,
            state: ChargerState::Disabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_response(&self) -> Option<ChargerResponse> {
        self.last_response
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle
    }

    pub fn request(&self) -> ChargerRequest {
        ChargerRequest {
            max_voltage_dv: self.max_voltage_dv,
            max_current_da: self.max_current_da,
            control: u8::from(self.charger_fault),
        }
    }

    /// Runs one request/response exchange.
    ///
    /// With a voltage or temperature fault active nothing is sent and the
    /// state is `Disabled`.
    pub fn run_cycle<B, C>(&mut self, bus: &mut B, clock: &C, faults_active: bool) -> ChargerState
    where
        B: ChargerBus + ?Sized,
        C: Clock + ?Sized,
    {
        if !self.enabled || faults_active {
            self.state = ChargerState::Disabled;
            return self.state;
        }

        self.state = ChargerState::Requesting;
        let request = self.request();
        trace!(state = %self.state, control = request.control, "Charger request");
        if !bus.send_request(&request) {
            warn!("Charger request was not accepted by the bus");
        }

        self.state = ChargerState::AwaitingResponse;
        trace!(state = %self.state, "Waiting for charger");
        let Some(mut response) = bus.receive_response() else {
            return self.finish(ChargerState::CommTimeout);
        };

        if response.voltage > self.connect_voltage && self.charging_started {
            self.charging_started = false;
            clock.sleep(self.settle);
            match bus.receive_response() {
                Some(settled) => response = settled,
                None => return self.finish(ChargerState::CommTimeout),
            }
        }

        self.last_response = Some(response);
        let state = self.classify(&response);
        self.finish(state)
    }

    fn classify(&self, r: &ChargerResponse) -> ChargerState {
        if r.voltage < self.connect_voltage && r.status.battery_disconnected() && r.current < DELIVERING_CURRENT_AMPS {
            ChargerState::BatteryDisconnected
        } else if !r.status.is_ok() {
            ChargerState::ErrorClassify(r.status)
        } else if r.voltage > self.connect_voltage && r.current < IDLE_CURRENT_AMPS {
            ChargerState::ReadyNoCurrent
        } else if r.voltage > self.connect_voltage && r.current > DELIVERING_CURRENT_AMPS {
            ChargerState::Charging
        } else {
            ChargerState::Unclassified
        }
    }

    fn finish(&mut self, state: ChargerState) -> ChargerState {
        self.state = state;
        self.charger_fault = state.is_fault();
        match (state, self.last_response) {
            (ChargerState::CommTimeout, _) => warn!("Charger did not respond"),
            (s, Some(r)) if s.is_fault() => {
                warn!(voltage = r.voltage, current = r.current, status = r.status.0, "Charger fault: {}", s)
            }
            (s, Some(r)) => info!(voltage = r.voltage, current = r.current, "Charger {}", s),
            (s, None) => info!("Charger {}", s),
        }
        state
    }
}
