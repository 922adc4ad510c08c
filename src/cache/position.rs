//! Per-slot write cursors and logical → physical address arithmetic.

use std::ops::Range;

use crate::config::{BufferPolicy, CacheConfig};
use crate::error::{Error, Result};

/// Physical time-axis address of logical position `pos`.
///
/// Ring buffers wrap modulo `capacity`. Left-aligned buffers address
/// positions directly; range checking belongs to the caller.
#[inline]
pub fn physical_address(policy: BufferPolicy, capacity: usize, pos: usize) -> usize {
    match policy {
        BufferPolicy::Ring => pos % capacity,
        BufferPolicy::LeftAligned => pos,
    }
}

/// A contiguous span of tokens landing on contiguous addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRun {
    /// Offset of the first token inside the written block.
    pub offset: usize,
    /// First physical address written.
    pub address: usize,
    pub len: usize,
}

/// Logical window `[start, start + n)` of a write and its physical addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBounds {
    pub slot: usize,
    pub start: usize,
    /// One address per token, computed independently as `(start + i) mod capacity`
    /// for ring buffers.
    pub addresses: Vec<usize>,
}

impl WindowBounds {
    pub fn positions(&self) -> Range<usize> {
        self.start..self.end()
    }

    /// One past the last logical position written.
    pub fn end(&self) -> usize {
        self.start + self.addresses.len()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Split the addresses into contiguous runs, in write order.
    ///
    /// Applying the runs in order gives last-write-wins when a single block is
    /// longer than a ring buffer.
    pub fn runs(&self) -> Vec<AddressRun> {
        let mut runs: Vec<AddressRun> = Vec::new();
        for (offset, &address) in self.addresses.iter().enumerate() {
            match runs.last_mut() {
                Some(run) if run.address + run.len == address => run.len += 1,
                _ => runs.push(AddressRun {
                    offset,
                    address,
                    len: 1,
                }),
            }
        }
        runs
    }
}

/// Write cursors for every slot of a batch.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    policy: BufferPolicy,
    capacity: usize,
    cursors: Vec<usize>,
    // Ring slots that have already reported their first eviction.
    evicting: Vec<bool>,
}

impl PositionTracker {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            policy: config.policy,
            capacity: config.capacity,
            cursors: vec![0; config.batch_size],
            evicting: vec![false; config.batch_size],
        }
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_slots(&self) -> usize {
        self.cursors.len()
    }

    pub fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.cursors.len() {
            return Err(Error::InvalidArgument {
                arg: "slot",
                reason: format!("slot {slot} out of range for batch of {}", self.cursors.len()),
            });
        }
        Ok(())
    }

    /// Next logical position to be written on `slot`.
    pub fn cursor(&self, slot: usize) -> Result<usize> {
        self.check_slot(slot)?;
        Ok(self.cursors[slot])
    }

    pub fn cursors(&self) -> &[usize] {
        &self.cursors
    }

    /// Compute the window for `n_tokens` new tokens without moving the cursor.
    pub fn plan(&self, slot: usize, n_tokens: usize) -> Result<WindowBounds> {
        let start = self.cursor(slot)?;
        self.plan_from(slot, start, n_tokens)
    }

    /// Window for an explicit start position; the slot's cursor is not consulted.
    pub fn plan_from(&self, slot: usize, start: usize, n_tokens: usize) -> Result<WindowBounds> {
        self.check_slot(slot)?;
        let end = start + n_tokens;
        if self.policy == BufferPolicy::LeftAligned && end > self.capacity {
            return Err(Error::CapacityExceeded {
                slot,
                requested: end - 1,
                capacity: self.capacity,
            });
        }
        let addresses = (start..end)
            .map(|pos| physical_address(self.policy, self.capacity, pos))
            .collect();
        Ok(WindowBounds {
            slot,
            start,
            addresses,
        })
    }

    /// Move the slot's cursor past a planned window.
    pub fn commit(&mut self, bounds: &WindowBounds) {
        let slot = bounds.slot;
        let end = bounds.end();
        if self.policy == BufferPolicy::Ring && end > self.capacity && !self.evicting[slot] {
            self.evicting[slot] = true;
            tracing::warn!(
                slot,
                position = end - 1,
                capacity = self.capacity,
                "ring buffer wrapped, overwriting oldest cache entries"
            );
        }
        self.cursors[slot] = end;
    }

    /// Reserve `n_tokens` positions on `slot` and return where they land.
    pub fn advance(&mut self, slot: usize, n_tokens: usize) -> Result<WindowBounds> {
        let bounds = self.plan(slot, n_tokens)?;
        self.commit(&bounds);
        Ok(bounds)
    }

    pub fn reset(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.cursors[slot] = 0;
        self.evicting[slot] = false;
        Ok(())
    }

    pub fn reset_all(&mut self) {
        self.cursors.fill(0);
        self.evicting.fill(false);
    }
}
