//! Request table: fixed pool of rows mapping sequence positions to KV slots.
//!
//! Each initialized request owns one row. Position `p` of the row holds the
//! KV slot backing token `p` of the request's sequence.

use std::collections::BTreeSet;

use crate::core::slot_allocator::SlotIndex;
use crate::error::{Error, Result};

/// Fixed-capacity table of per-request slot rows.
#[derive(Debug)]
pub struct RequestTable {
    free_rows: BTreeSet<u32>,
    rows: Vec<Vec<SlotIndex>>,
}

impl RequestTable {
    /// Create a table with `max_req_num` rows.
    pub fn new(max_req_num: usize) -> Self {
        Self {
            free_rows: (0..max_req_num as u32).collect(),
            rows: vec![Vec::new(); max_req_num],
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    pub fn num_free(&self) -> usize {
        self.free_rows.len()
    }

    /// Take the lowest free row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRequestSlots`] when every row is in use.
    pub fn alloc(&mut self) -> Result<u32> {
        self.free_rows
            .pop_first()
            .ok_or(Error::OutOfRequestSlots {
                capacity: self.capacity(),
            })
    }

    /// Record `slots` at positions `start..start + slots.len()` of `req_idx`.
    ///
    /// Anything previously stored past `start` is discarded.
    pub fn assign(&mut self, req_idx: u32, start: usize, slots: &[SlotIndex]) {
        let row = &mut self.rows[req_idx as usize];
        row.truncate(start);
        row.resize(start, 0);
        row.extend_from_slice(slots);
    }

    /// Slots stored for the first `len` positions of `req_idx`.
    pub fn slots(&self, req_idx: u32, len: usize) -> &[SlotIndex] {
        let row = &self.rows[req_idx as usize];
        &row[..len.min(row.len())]
    }

    /// Release `req_idx` and return the slots of its first `kv_len` positions.
    pub fn free(&mut self, req_idx: u32, kv_len: usize) -> Vec<SlotIndex> {
        let row = std::mem::take(&mut self.rows[req_idx as usize]);
        self.free_rows.insert(req_idx);
        row.into_iter().take(kv_len).collect()
    }

    /// Release every row.
    pub fn free_all(&mut self) {
        let capacity = self.capacity();
        self.free_rows = (0..capacity as u32).collect();
        self.rows.iter_mut().for_each(Vec::clear);
    }
}
