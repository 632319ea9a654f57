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

//! Board pin layout: which raw channel feeds which logical slot.
//!
//! A full IC wires 15 cells onto 18 voltage inputs with every sixth input
//! grounded. A short IC (the chain-closing monitor on packs with an odd
//! module) wires at most six cells onto the first two inputs of each group
//! of six. Slots with no source are filled with the sentinel value of their
//! matrix by the remap engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::layout::{
    AUX_REFERENCE_CHANNEL, GROUNDED_VOLTAGE_CHANNELS, RAW_VOLTAGE_CHANNELS, SHORT_IC_MAX_CELLS, SLOTS_PER_IC,
};

/// 15-bit per-slot policy mask. Bit `i` refers to logical slot `i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotMask(pub u16);

impl SlotMask {
    pub const EMPTY: SlotMask = SlotMask(0);

    pub fn from_slots(slots: &[usize]) -> Self {
        SlotMask(
            slots
                .iter()
                .filter(|s| **s < 16)
                .fold(0u16, |acc, s| acc | (1 << s)),
        )
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot < 16 && (self.0 >> slot) & 1 == 1
    }

    /// Set slots in ascending order, including any out-of-range bit 15.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..16).filter(move |s| self.contains(*s))
    }

    /// Bits that do not address one of the 15 logical slots.
    pub fn out_of_range(&self) -> u16 {
        self.0 & !((1u16 << SLOTS_PER_IC) - 1)
    }

    pub fn intersects(&self, other: SlotMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl fmt::Display for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Thermistor multiplexer input bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxSelect {
    High,
    Low,
}

impl MuxSelect {
    /// Order in which the banks are converted every cycle.
    pub const SEQUENCE: [MuxSelect; 2] = [MuxSelect::High, MuxSelect::Low];

    /// Position in [`MuxSelect::SEQUENCE`], used to index per-bank buffers.
    pub fn index(self) -> usize {
        match self {
            MuxSelect::High => 0,
            MuxSelect::Low => 1,
        }
    }
}

/// Physical wiring class of one cell monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcLayout {
    Full,
    Short { cells: usize },
}

impl IcLayout {
    pub fn for_cells(cells: usize) -> Self {
        if cells >= SLOTS_PER_IC {
            IcLayout::Full
        } else {
            IcLayout::Short { cells }
        }
    }

    /// Raw voltage channel feeding `slot`, or `None` for an unwired slot.
    pub fn voltage_source(&self, slot: usize) -> Option<usize> {
        if slot >= SLOTS_PER_IC {
            return None;
        }
        match self {
            IcLayout::Full => (0..RAW_VOLTAGE_CHANNELS).filter(|ch| !is_grounded(*ch)).nth(slot),
            IcLayout::Short { cells } => {
                if slot < (*cells).min(SHORT_IC_MAX_CELLS) {
                    Some((slot / 2) * 6 + slot % 2)
                } else {
                    None
                }
            }
        }
    }

    /// `(slot, aux channel)` pairs written while the mux sits on `mux`.
    ///
    /// A `None` channel means the slot is written with the temperature
    /// sentinel. Slots not listed are left to the other mux bank.
    pub fn temperature_sources(&self, mux: MuxSelect) -> Vec<(usize, Option<usize>)> {
        match (self, mux) {
            (IcLayout::Full, MuxSelect::High) => (0..8)
                .filter(|aux| *aux != AUX_REFERENCE_CHANNEL)
                .map(|aux| if aux < 5 { (aux + 8, Some(aux)) } else { (aux + 7, Some(aux)) })
                .collect(),
            (IcLayout::Full, MuxSelect::Low) => (0..9)
                .filter(|aux| *aux != AUX_REFERENCE_CHANNEL)
                .map(|aux| if aux < 5 { (aux, Some(aux)) } else { (aux - 1, Some(aux)) })
                .collect(),
            (IcLayout::Short { .. }, MuxSelect::High) => (8..SLOTS_PER_IC).map(|s| (s, None)).collect(),
            (IcLayout::Short { cells }, MuxSelect::Low) => (0..8)
                .map(|slot| {
                    if slot < *cells {
                        let aux = if slot < 5 { slot } else { slot + 1 };
                        (slot, Some(aux))
                    } else {
                        (slot, None)
                    }
                })
                .collect(),
        }
    }
}

/// True when `channel` is one of the grounded voltage inputs.
pub fn is_grounded(channel: usize) -> bool {
    GROUNDED_VOLTAGE_CHANNELS.contains(&channel)
}
