//! Simple handle -> value table.

use alloc::vec::Vec;

use crate::status::{Error, Result};

/// An opaque handle into an [`HTable`]. Zero is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HTableHandle(u32);

impl HTableHandle {
    /// The sentinel returned nowhere and mapped to no slot.
    pub const INVALID: Self = Self(0);

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    fn from_index(index: u32) -> Self {
        Self(index + 1)
    }

    fn index(self) -> u32 {
        self.0.wrapping_sub(1)
    }
}

/// Sparse handle table. Handles are stable across growth; slots are
/// claimed by a circular probe from a cached cursor and reused eagerly
/// after removal.
#[derive(Debug)]
pub struct HTable<T> {
    slots: Vec<Option<T>>,
    count: u32,
    next_search: u32,
}

impl<T> HTable<T> {
    pub fn new(initial_size: u32) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(initial_size as usize)
            .map_err(|_| Error::OutOfResources)?;
        slots.resize_with(initial_size as usize, || None);
        Ok(Self {
            slots,
            count: 0,
            next_search: 0,
        })
    }

    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Grows the table to `new_size` slots. Existing handles keep their
    /// mapping. Shrinking is unsupported by design.
    pub fn realloc(&mut self, new_size: u32) -> Result<()> {
        let size = self.size();
        if new_size > size {
            let grow_by = (new_size - size) as usize;
            self.slots
                .try_reserve_exact(grow_by)
                .map_err(|_| Error::OutOfResources)?;
            self.slots.resize_with(new_size as usize, || None);
            self.next_search = size;
            return Ok(());
        }
        if new_size >= self.count {
            log::warn!("shrinking an HTable ({size} -> {new_size}) is not supported");
            return Err(Error::NotSupported);
        }
        Err(Error::InvalidParameter)
    }

    /// Inserts `value`, growing the table when full, and returns its
    /// handle.
    pub fn put(&mut self, value: T) -> Result<HTableHandle> {
        if self.count == self.size() {
            let size = self.size();
            self.realloc(size + (size / 4).max(10))?;
        }
        let size = self.size();
        let mut i = self.next_search % size;
        loop {
            debug_assert!(i < size);
            if self.slots[i as usize].is_none() {
                self.slots[i as usize] = Some(value);
                self.count += 1;
                debug_assert!(self.count <= size);
                self.next_search = (i + 1) % size;
                return Ok(HTableHandle::from_index(i));
            }
            // a free slot exists since occupancy < size
            i = (i + 1) % size;
        }
    }

    /// Removes the value behind `handle`, or `None` if the handle is out
    /// of range or the slot is empty. The freed slot becomes the next
    /// probe target.
    pub fn remove(&mut self, handle: HTableHandle) -> Option<T> {
        let index = handle.index();
        if index >= self.size() {
            return None;
        }
        let value = self.slots[index as usize].take();
        if value.is_some() {
            self.count -= 1;
            self.next_search = index;
        }
        value
    }

    /// O(1) lookup. An empty slot reports `None`; the caller treats that
    /// as "handle not found".
    pub fn get(&self, handle: HTableHandle) -> Option<&T> {
        let index = handle.index();
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn iter_mut(&mut self) -> HTableIter<'_, T> {
        let left = self.count;
        HTableIter {
            table: self,
            cur: None,
            left,
        }
    }
}

/// Forward traversal over occupied slots, with support for removing the
/// current entry mid-iteration.
#[derive(Debug)]
pub struct HTableIter<'a, T> {
    table: &'a mut HTable<T>,
    cur: Option<u32>,
    left: u32,
}

impl<T> HTableIter<'_, T> {
    pub fn has_next(&self) -> bool {
        self.left != 0
    }

    pub fn next(&mut self) -> Option<HTableHandle> {
        if !self.has_next() {
            return None;
        }
        let start = self.cur.map_or(0, |i| i + 1);
        for i in start..self.table.size() {
            if self.table.slots[i as usize].is_some() {
                self.cur = Some(i);
                self.left -= 1;
                return Some(HTableHandle::from_index(i));
            }
        }
        debug_assert!(!self.has_next());
        None
    }

    pub fn value(&self) -> Option<&T> {
        self.table.get(HTableHandle::from_index(self.cur?))
    }

    pub fn remove_current(&mut self) -> Option<T> {
        self.table.remove(HTableHandle::from_index(self.cur?))
    }
}
