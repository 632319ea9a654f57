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

//! Communication path table and retry/fail-over bookkeeping.
//!
//! The master can reach the chain through two isoSPI masters (chip selects)
//! and the pack monitor can sit on top of or parallel to the chain, giving
//! four combinations. After the retry budget is spent the next combination in
//! the table is tried, wrapping around until one works.

use std::fmt;

use crate::acquisition::Direction;
use crate::config::CommConfig;
use crate::driver::ErrorCode;

/// One way of talking to the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommPath {
    pub chip_select: u8,
    /// Pack monitor on top of the daisy chain rather than parallel to it
    pub on_top: bool,
}

impl CommPath {
    pub fn topology(&self) -> &'static str {
        if self.on_top {
            "ON TOP OF DAISYCHAIN"
        } else {
            "PARALLEL TO DAISYCHAIN"
        }
    }
}

impl fmt::Display for CommPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},CS:{}", self.topology(), self.chip_select)
    }
}

pub const PATH_COUNT: usize = 4;

/// Fail-over order: primary, secondary, primary on top, secondary on top.
pub fn path_table(primary: u8, secondary: u8) -> [CommPath; PATH_COUNT] {
    [
        CommPath { chip_select: primary, on_top: false },
        CommPath { chip_select: secondary, on_top: false },
        CommPath { chip_select: primary, on_top: true },
        CommPath { chip_select: secondary, on_top: true },
    ]
}

/// What to do after a failed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// Retry budget left: re-initialize the same path
    Reinit(CommPath),
    /// Budget exhausted: move on to the next path
    Switch { from: CommPath, to: CommPath },
}

impl FailoverAction {
    pub fn path(&self) -> CommPath {
        match self {
            FailoverAction::Reinit(p) => *p,
            FailoverAction::Switch { to, .. } => *to,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommState {
    table: [CommPath; PATH_COUNT],
    index: usize,
    retries_left: u8,
    budget: u8,
    ignore_threshold: u8,
    primary: u8,
    secondary: u8,
}

impl CommState {
    pub fn new(cfg: &CommConfig) -> Self {
        Self {
            table: path_table(cfg.primary_chip_select, cfg.secondary_chip_select),
            index: 0,
            retries_left: cfg.retries,
            budget: cfg.retries,
            ignore_threshold: cfg.ignore_threshold,
            primary: cfg.primary_chip_select,
            secondary: cfg.secondary_chip_select,
        }
    }

    pub fn active(&self) -> CommPath {
        self.table[self.index]
    }

    pub fn active_index(&self) -> usize {
        self.index
    }

    pub fn retries_left(&self) -> u8 {
        self.retries_left
    }

    pub fn is_error(&self, code: ErrorCode) -> bool {
        code.is_error(self.ignore_threshold)
    }

    pub fn ignore_threshold(&self) -> u8 {
        self.ignore_threshold
    }

    /// Path used to reach the chain for a read in `direction`.
    ///
    /// On a ring the backward pass enters from the other end, which is wired
    /// to the other chip select.
    pub fn path_for(&self, direction: Direction, circular: bool) -> CommPath {
        let active = self.active();
        if !circular || direction == Direction::Forward {
            return active;
        }
        let mirrored = if active.chip_select == self.primary { self.secondary } else { self.primary };
        CommPath { chip_select: mirrored, on_top: active.on_top }
    }

    /// Consumes one retry or advances to the next path.
    pub fn on_error(&mut self) -> FailoverAction {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            return FailoverAction::Reinit(self.active());
        }
        let from = self.active();
        self.index = (self.index + 1) % PATH_COUNT;
        self.retries_left = self.budget;
        FailoverAction::Switch { from, to: self.active() }
    }
}
