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

//! Fixed-width per-IC grids.
//!
//! Every buffer in the acquisition pipeline is a grid with one row per IC in
//! chain order. Raw buffers are 18 or 12 channels wide, per-cell matrices are
//! 15 slots wide, fault location matrices hold booleans of the same shape.

use crate::constants::layout::SLOTS_PER_IC;

#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    width: usize,
    cells: Vec<T>,
}

/// Per-cell voltage or temperature values, `ics × 15`
pub type CellMatrix = Grid<f64>;

/// Which (IC, slot) tripped a fault category, `ics × 15`
pub type LocationMatrix = Grid<bool>;

impl<T: Copy> Grid<T> {
    pub fn new(rows: usize, width: usize, fill: T) -> Self {
        Self {
            width,
            cells: vec![fill; rows * width],
        }
    }

    pub fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.cells.len() / self.width
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns `None` when the index falls outside the grid.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if col >= self.width {
            return None;
        }
        self.cells.get(row * self.width + col).copied()
    }

    /// Writes a value; out of range writes are ignored and reported as `false`.
    pub fn set(&mut self, row: usize, col: usize, value: T) -> bool {
        if col >= self.width {
            return false;
        }
        match self.cells.get_mut(row * self.width + col) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    pub fn row(&self, row: usize) -> &[T] {
        let start = (row * self.width).min(self.cells.len());
        let end = (start + self.width).min(self.cells.len());
        &self.cells[start..end]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        let start = (row * self.width).min(self.cells.len());
        let end = (start + self.width).min(self.cells.len());
        &mut self.cells[start..end]
    }

    pub fn fill(&mut self, value: T) {
        self.cells.iter_mut().for_each(|c| *c = value);
    }

    /// Iterates `(row, col, value)` in chain order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let width = self.width.max(1);
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, v)| (i / width, i % width, *v))
    }
}

impl CellMatrix {
    /// A `ics × 15` matrix filled with `fill`.
    pub fn cells(ics: usize, fill: f64) -> Self {
        Self::new(ics, SLOTS_PER_IC, fill)
    }
}

impl LocationMatrix {
    pub fn locations(ics: usize) -> Self {
        Self::new(ics, SLOTS_PER_IC, false)
    }

    /// All marked `(ic, slot)` pairs in chain order.
    pub fn marked(&self) -> Vec<(usize, usize)> {
        self.iter()
            .filter(|(_, _, hit)| *hit)
            .map(|(ic, slot, _)| (ic, slot))
            .collect()
    }

    pub fn any(&self) -> bool {
        self.cells.iter().any(|c| *c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions() {
        let g: Grid<f64> = Grid::new(6, 18, 0.0);
        assert_eq!(g.rows(), 6);
        assert_eq!(g.width(), 18);
        assert_eq!(g.row(5).len(), 18);
    }

    #[test]
    fn test_get_set_bounds() {
        let mut g = CellMatrix::cells(2, 1.0);
        assert!(g.set(1, 14, 4.2));
        assert_eq!(g.get(1, 14), Some(4.2));
        assert!(!g.set(1, 15, 4.2));
        assert!(!g.set(2, 0, 4.2));
        assert_eq!(g.get(2, 0), None);
        assert_eq!(g.get(0, 15), None);
    }

    #[test]
    fn test_row_mut_and_fill() {
        let mut g = CellMatrix::cells(3, 0.0);
        g.row_mut(1)[3] = 2.5;
        assert_eq!(g.get(1, 3), Some(2.5));
        g.fill(3.5);
        assert!(g.iter().all(|(_, _, v)| v == 3.5));
    }

    #[test]
    fn test_location_marked_order() {
        let mut loc = LocationMatrix::locations(3);
        assert!(!loc.any());
        loc.set(2, 3, true);
        loc.set(0, 9, true);
        assert!(loc.any());
        assert_eq!(loc.marked(), vec![(0, 9), (2, 3)]);
    }
}
