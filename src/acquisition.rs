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

//! Dual-direction raw reading buffers.
//!
//! A forward cycle fills the forward buffer and a backward cycle fills the
//! backward buffer, both indexed by the IC position as the driver reports it.
//! Reconciliation later pairs forward IC `i` with backward IC `N-1-i`, so each
//! merge combines the current pass with the opposite pass from the previous
//! cycle.

use std::fmt;

use crate::constants::layout::{CHANNELS_PER_GROUP, RAW_LSB_VOLTS};
use crate::matrix::Grid;

/// Ring traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn toggled(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Backward => write!(f, "backward"),
        }
    }
}

/// Forward and backward readings of one physical quantity
#[derive(Debug, Clone)]
pub struct DualBuffer {
    forward: Grid<f64>,
    backward: Grid<f64>,
}

impl DualBuffer {
    pub fn new(ics: usize, channels: usize) -> Self {
        Self::seeded(ics, channels, 0.0, 0.0)
    }

    /// Buffers with explicit start values; `backward` covers the cycles
    /// before the first backward pass.
    pub fn seeded(ics: usize, channels: usize, forward: f64, backward: f64) -> Self {
        Self {
            forward: Grid::new(ics, channels, forward),
            backward: Grid::new(ics, channels, backward),
        }
    }

    pub fn ics(&self) -> usize {
        self.forward.rows()
    }

    pub fn channels(&self) -> usize {
        self.forward.width()
    }

    pub fn get(&self, direction: Direction) -> &Grid<f64> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut Grid<f64> {
        match direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        }
    }

    /// Scales one register group read into `direction`'s buffer.
    ///
    /// `codes` holds three codes per IC, IC 0 first. Entries beyond the end
    /// of a short read are left untouched.
    pub fn store_group(&mut self, direction: Direction, group: usize, codes: &[u16]) {
        let buffer = self.get_mut(direction);
        for ic in 0..buffer.rows() {
            for k in 0..CHANNELS_PER_GROUP {
                if let Some(code) = codes.get(CHANNELS_PER_GROUP * ic + k) {
                    buffer.set(ic, k + CHANNELS_PER_GROUP * group, f64::from(*code) * RAW_LSB_VOLTS);
                }
            }
        }
    }

    /// Writes one IC's row of `direction` directly.
    pub fn row_mut(&mut self, direction: Direction, ic: usize) -> &mut [f64] {
        self.get_mut(direction).row_mut(ic)
    }
}
