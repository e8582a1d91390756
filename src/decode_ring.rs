//! Decode Ring: fixed-capacity ring of staging slots for ring-batched
//! decode (§3 "Decode Ring", §4.7 "Decode batched").
//!
//! Each slot holds a `tokens` buffer (capacity `batch * readback_interval
//! + 1`) and a mapped-staging buffer used for the single post-submit
//! readback. Stop detection itself runs CPU-side over the read-back
//! tokens (§4.7, §8 `resolve_batch_stop`) rather than via a GPU-computed
//! flags buffer, since no kernel in this stack produces one.

use crate::error::{Error, Result};

pub struct RingSlot {
    pub tokens: wgpu::Buffer,
    pub staging: wgpu::Buffer,
    pub capacity: u32,
}

pub struct DecodeRing {
    slots: Vec<RingSlot>,
    cursor: usize,
}

impl DecodeRing {
    pub fn new(device: &wgpu::Device, num_slots: u32, batch: u32, readback_interval: u32) -> Self {
        let capacity = batch * readback_interval + 1;
        let slots = (0..num_slots)
            .map(|i| {
                let tokens = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("decode-ring-{i}-tokens")),
                    size: capacity as u64 * 4,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("decode-ring-{i}-staging")),
                    size: capacity as u64 * 4,
                    usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                    mapped_at_creation: false,
                });
                RingSlot { tokens, staging, capacity }
            })
            .collect();
        DecodeRing { slots, cursor: 0 }
    }

    /// Returns the slot the next batch should record into.
    pub fn acquire(&self) -> Result<&RingSlot> {
        self.slots.get(self.cursor).ok_or(Error::ReadbackDenied { stage: "decode_ring_acquire" })
    }

    /// Rotates to the next slot, wrapping at capacity.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.slots.len().max(1);
    }

    /// Zeros the rotation counter back to the first slot (§3 "Decode
    /// Ring"), e.g. when a conversation's decode state is discarded and
    /// reused for a fresh one rather than allocating a new ring.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_capacity(&self) -> u32 {
        self.slots.first().map(|s| s.capacity).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    // Rotation arithmetic is pure; buffer allocation needs a device and is
    // covered by the `tests/` integration suite under a GPU-available gate.
    #[test]
    fn cursor_wraps_mod_slot_count() {
        let num_slots = 3usize;
        let mut cursor = 0usize;
        for expected in [1, 2, 0, 1] {
            cursor = (cursor + 1) % num_slots;
            assert_eq!(cursor, expected);
        }
    }

    #[test]
    fn reset_arithmetic_returns_to_zero() {
        let num_slots = 3usize;
        let mut cursor = 0usize;
        for _ in 0..5 {
            cursor = (cursor + 1) % num_slots;
        }
        assert_ne!(cursor, 0);
        cursor = 0;
        assert_eq!(cursor, 0);
    }
}
