//! Table instance: a bounded run of optional function addresses.

use crate::model::{Limits, RefType, TableType};

use super::FuncAddr;

#[derive(Debug, Clone)]
pub struct TableInstance {
    elem: RefType,
    entries: Vec<Option<FuncAddr>>,
    min: u32,
    max: Option<u32>,
}

impl TableInstance {
    /// Allocate a table with `min` uninitialized slots.
    pub fn new(ty: &TableType) -> Self {
        Self {
            elem: ty.elem,
            entries: vec![None; ty.limits.min as usize],
            min: ty.limits.min,
            max: ty.limits.max,
        }
    }

    pub fn elem_type(&self) -> RefType {
        self.elem
    }

    pub fn size(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Declared limits of this table.
    pub fn limits(&self) -> Limits {
        Limits::new(self.min, self.max)
    }

    /// `None` when `idx` is outside the table; `Some(None)` for an
    /// uninitialized slot.
    pub fn get(&self, idx: u32) -> Option<Option<FuncAddr>> {
        self.entries.get(idx as usize).copied()
    }

    pub fn set(&mut self, idx: u32, val: Option<FuncAddr>) -> bool {
        match self.entries.get_mut(idx as usize) {
            Some(slot) => {
                *slot = val;
                true
            }
            None => false,
        }
    }

    /// Write a run of function addresses starting at `offset`. Returns false
    /// without writing anything if the run does not fit.
    pub fn fill(&mut self, offset: u32, funcs: &[FuncAddr]) -> bool {
        let start = offset as usize;
        let Some(end) = start.checked_add(funcs.len()) else {
            return false;
        };
        if end > self.entries.len() {
            return false;
        }
        for (slot, &f) in self.entries[start..end].iter_mut().zip(funcs) {
            *slot = Some(f);
        }
        true
    }

    /// Grow by `delta` slots. Returns the previous size, or `None` when the
    /// declared max would be exceeded.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let prev = self.size();
        let new = prev.checked_add(delta)?;
        if let Some(max) = self.max {
            if new > max {
                return None;
            }
        }
        self.entries.resize(new as usize, None);
        Some(prev)
    }
}
