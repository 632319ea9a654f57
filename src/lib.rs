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

//! RingBMS - battery management core for a ring of cell monitors
//!
//! This library reads a daisy chain of cell monitors alternately from both
//! ends, reconciles the two views, maps raw channels onto cells, checks the
//! cells against their limits and coordinates the charger and fault outputs.

pub mod acquisition;
pub mod charger;
pub mod clock;
pub mod comm;
pub mod config;
pub mod constants;
pub mod controller;
pub mod cooling;
pub mod driver;
pub mod error;
pub mod extremum;
pub mod fault;
pub mod layout;
pub mod logger;
pub mod matrix;
pub mod postprocess;
pub mod reconcile;
pub mod remap;
pub mod report;
pub mod signals;
pub mod sim;
pub mod thermistor;

#[cfg(test)]
pub mod test_utils;

pub use config::StackConfig;
pub use controller::{BmsController, CycleReport, Peripherals};
pub use error::{BmsError, Result};
