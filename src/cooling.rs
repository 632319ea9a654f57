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

use crate::config::CoolingConfig;

/// Two-point fan control on the hottest cell.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicCooling {
    on_above: f64,
    off_at_or_below: f64,
    fan_on: bool,
}

impl DynamicCooling {
    pub fn new(on_above: f64) -> Self {
        Self { on_above, off_at_or_below: on_above, fan_on: false }
    }

    /// Fan turns off only once the temperature drops to `off_at_or_below`.
    pub fn with_hysteresis(mut self, off_at_or_below: f64) -> Self {
        self.off_at_or_below = off_at_or_below.min(self.on_above);
        self
    }

    pub fn with_initial(mut self, fan_on: bool) -> Self {
        self.fan_on = fan_on;
        self
    }

    pub fn from_config(cfg: &CoolingConfig, fan_on: bool) -> Self {
        Self::new(cfg.on_above).with_hysteresis(cfg.off_at_or_below).with_initial(fan_on)
    }

    pub fn fan_on(&self) -> bool {
        self.fan_on
    }

    /// Feeds the hottest reading and returns the new fan state.
    /// Without a reading the fan keeps its state.
    pub fn update(&mut self, max_temperature: Option<f64>) -> bool {
        if let Some(t) = max_temperature {
            if self.fan_on {
                if t <= self.off_at_or_below {
                    self.fan_on = false;
                }
            } else if t > self.on_above {
                self.fan_on = true;
            }
        }
        self.fan_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis_band() {
        let mut fan = DynamicCooling::from_config(&CoolingConfig::default(), false);
        assert!(!fan.update(Some(35.0)));
        assert!(fan.update(Some(35.1)));
        // inside the band the fan stays on
        assert!(fan.update(Some(34.0)));
        assert!(fan.update(Some(33.1)));
        assert!(!fan.update(Some(33.0)));
        // and stays off while below the upper point
        assert!(!fan.update(Some(34.9)));
    }

    #[test]
    fn test_missing_reading_keeps_state() {
        let mut fan = DynamicCooling::new(35.0).with_hysteresis(33.0).with_initial(true);
        assert!(fan.update(None));
        let mut fan = DynamicCooling::new(35.0);
        assert!(!fan.update(None));
    }

    #[test]
    fn test_hysteresis_clamped_to_on_point() {
        let mut fan = DynamicCooling::new(30.0).with_hysteresis(40.0);
        assert!(fan.update(Some(31.0)));
        assert!(fan.update(Some(30.5)));
        assert!(!fan.update(Some(30.0)));
    }
}
