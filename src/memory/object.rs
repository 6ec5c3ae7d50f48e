// SPDX-License-Identifier: BSD-3-Clause
use serde::Serialize;

use super::value::Value;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    /// Described by the secrecy specification at function entry
    Input,
    /// An `alloca`, dies when its frame returns
    Stack,
    /// Conjured on demand for unconstrained pointers
    Lazy,
}

/// A unit of storage: a flat sequence of leaf cells.
///
/// A *summarized* object stands for an unbounded array whose elements are
/// all described by one period of cells. Offsets into it are taken modulo
/// the period, and every write to it is weak.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    name: String,
    cells: Vec<Value>,
    summarized: bool,
    region: Region,
    alive: bool,
}

impl Object {
    pub fn new(name: String, region: Region, cells: Vec<Value>) -> Self {
        Object {
            name,
            cells,
            summarized: false,
            region,
            alive: true,
        }
    }

    /// An unbounded array, each element described by `period`.
    pub fn summarized(name: String, region: Region, period: Vec<Value>) -> Self {
        Object {
            name,
            cells: period,
            summarized: true,
            region,
            alive: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn is_summarized(&self) -> bool {
        self.summarized
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub(super) fn kill(&mut self) {
        self.alive = false;
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    pub(super) fn set_cells(&mut self, cells: Vec<Value>) {
        self.cells = cells;
    }

    /// The cell index an offset denotes, if any.
    pub fn cell_index(&self, offset: i128) -> Option<usize> {
        let len = self.cells.len() as i128;
        if len == 0 {
            return None;
        }
        if self.summarized {
            Some(offset.rem_euclid(len) as usize)
        } else if (0..len).contains(&offset) {
            Some(offset as usize)
        } else {
            None
        }
    }

    pub(super) fn cell_mut(&mut self, idx: usize) -> Option<&mut Value> {
        self.cells.get_mut(idx)
    }
}
