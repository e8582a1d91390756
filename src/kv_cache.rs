//! KV Cache (C3): per-layer K/V storage with append-only writes and a
//! sliding-window variant.
//!
//! Follows the open question's decision in SPEC_FULL.md §9: the sliding
//! variant overwrites in place at `row = start_pos % window` rather than
//! maintaining a physical ring with a moving read base. This keeps the
//! buffer layout identical between the full and sliding variants, which
//! matters because both are read by the same attention kernel contract
//! (§4.4) with only `sliding_window` and `start_pos_for_mask` changing.

use crate::error::{Error, Result};
use crate::recorder::CommandRecorder;
use crate::tensor::DType;

pub struct LayerCache {
    k: wgpu::Buffer,
    v: wgpu::Buffer,
    seq_len: u32,
    /// `Some(window)` for a sliding-window layer, `None` for full attention.
    window: Option<u32>,
}

pub struct KvCache {
    layers: Vec<LayerCache>,
    max_seq_len: u32,
    num_kv_heads: u32,
    head_dim: u32,
    dtype: DType,
}

pub struct LayerKvView<'a> {
    pub k: &'a wgpu::Buffer,
    pub v: &'a wgpu::Buffer,
    pub seq_len: u32,
    pub window: Option<u32>,
}

impl KvCache {
    pub fn new(
        device: &wgpu::Device,
        num_layers: u32,
        max_seq_len: u32,
        num_kv_heads: u32,
        head_dim: u32,
        dtype: DType,
        sliding_windows: &[Option<u32>],
    ) -> Self {
        assert_eq!(sliding_windows.len() as u32, num_layers);
        let row_bytes = (num_kv_heads * head_dim) as u64 * dtype.size_of() as u64;
        let layers = sliding_windows
            .iter()
            .enumerate()
            .map(|(i, window)| {
                let size = row_bytes * max_seq_len as u64;
                let mk = |tag| {
                    device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(&format!("kv-layer{i}-{tag}")),
                        size,
                        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
                        mapped_at_creation: false,
                    })
                };
                LayerCache { k: mk("k"), v: mk("v"), seq_len: 0, window: *window }
            })
            .collect();

        KvCache { layers, max_seq_len, num_kv_heads, head_dim, dtype }
    }

    fn row_bytes(&self) -> u64 {
        (self.num_kv_heads * self.head_dim) as u64 * self.dtype.size_of() as u64
    }

    /// No-op placeholder for capacity growth: buffers are allocated at
    /// `max_seq_len` up front (§3 KV Cache), so this only validates that
    /// `target_len` fits.
    pub fn ensure_capacity(&self, layer: u32, target_len: u32) -> Result<()> {
        if target_len > self.max_seq_len {
            return Err(Error::OverflowCapacity { layer, requested: target_len, limit: self.max_seq_len });
        }
        Ok(())
    }

    /// Appends `num_new` rows of K/V starting at `start_pos`, recording
    /// the copy into the caller's encoder (the "record_" variant from
    /// §4.3; `update_from_gpu` without a recorder is just this plus an
    /// immediate `submit`).
    pub fn record_update_from_gpu(
        &mut self,
        recorder: &mut CommandRecorder,
        layer: u32,
        k_src: &wgpu::Buffer,
        v_src: &wgpu::Buffer,
        start_pos: u32,
        num_new: u32,
    ) -> Result<()> {
        if num_new == 0 {
            return Ok(());
        }
        let row_bytes = self.row_bytes();
        let entry = self
            .layers
            .get_mut(layer as usize)
            .ok_or(Error::InvalidKvLen { layer, seq_len: -1 })?;

        match entry.window {
            None => {
                let end = start_pos.checked_add(num_new).ok_or(Error::OverflowCapacity {
                    layer,
                    requested: num_new,
                    limit: self.max_seq_len,
                })?;
                if end > self.max_seq_len {
                    return Err(Error::OverflowCapacity { layer, requested: end, limit: self.max_seq_len });
                }
                let dst_offset = start_pos as u64 * row_bytes;
                let bytes = num_new as u64 * row_bytes;
                recorder.copy_buffer_to_buffer(k_src, 0, &entry.k, dst_offset, bytes)?;
                recorder.copy_buffer_to_buffer(v_src, 0, &entry.v, dst_offset, bytes)?;
                entry.seq_len = end;
            }
            Some(window) => {
                // Overwrite-in-place: each logical row lands at
                // `row % window`. A `num_new` write can itself wrap, so
                // it is split into at most two contiguous runs.
                let mut written = 0u32;
                while written < num_new {
                    let logical_row = start_pos + written;
                    let phys_row = logical_row % window;
                    let run = (num_new - written).min(window - phys_row);

                    let src_offset = written as u64 * row_bytes;
                    let dst_offset = phys_row as u64 * row_bytes;
                    let bytes = run as u64 * row_bytes;
                    recorder.copy_buffer_to_buffer(k_src, src_offset, &entry.k, dst_offset, bytes)?;
                    recorder.copy_buffer_to_buffer(v_src, src_offset, &entry.v, dst_offset, bytes)?;

                    written += run;
                }
                entry.seq_len = (entry.seq_len + num_new).min(self.max_seq_len);
            }
        }
        Ok(())
    }

    /// Equivalent of `record_update_from_gpu` that opens its own recorder
    /// and submits immediately (the non-recorded path, e.g. prefill).
    pub fn update_from_gpu(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        pool: std::sync::Arc<crate::pool::BufferPool>,
        layer: u32,
        k_src: &wgpu::Buffer,
        v_src: &wgpu::Buffer,
        start_pos: u32,
        num_new: u32,
    ) -> Result<()> {
        let mut recorder = CommandRecorder::new(device.clone(), queue.clone(), pool, "kv-update");
        self.record_update_from_gpu(&mut recorder, layer, k_src, v_src, start_pos, num_new)?;
        recorder.submit()?;
        Ok(())
    }

    pub fn gpu_buffers(&self, layer: u32) -> Result<LayerKvView<'_>> {
        let entry = self
            .layers
            .get(layer as usize)
            .ok_or(Error::InvalidKvLen { layer, seq_len: -1 })?;
        Ok(LayerKvView { k: &entry.k, v: &entry.v, seq_len: entry.seq_len, window: entry.window })
    }

    /// `start_pos_for_mask` compensation for sliding-window attention
    /// (§4.3): `min(current_seq_len, window - num_new)`, where
    /// `current_seq_len` is the offset *before* the `num_new` rows about
    /// to be (or just) written land. Callers must read this before
    /// calling `record_update_from_gpu`/`update_from_gpu` for the same
    /// step, since that call mutates `seq_len`.
    pub fn start_pos_for_mask(&self, layer: u32, num_new: u32) -> Result<u32> {
        let entry = self
            .layers
            .get(layer as usize)
            .ok_or(Error::InvalidKvLen { layer, seq_len: -1 })?;
        Ok(match entry.window {
            Some(window) => entry.seq_len.min(window.saturating_sub(num_new)),
            None => entry.seq_len,
        })
    }

    pub fn truncate(&mut self, layer: u32, new_len: u32) -> Result<()> {
        let entry = self
            .layers
            .get_mut(layer as usize)
            .ok_or(Error::InvalidKvLen { layer, seq_len: -1 })?;
        if new_len > entry.seq_len {
            return Err(Error::InvalidKvLen { layer, seq_len: new_len as i64 });
        }
        entry.seq_len = new_len;
        Ok(())
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `row % window` wrapping must be bijective over one full window's
    /// worth of writes, and idempotent for positions already in range.
    #[test]
    fn sliding_wrap_arithmetic() {
        let window = 8u32;
        let positions: Vec<u32> = (0..20).collect();
        for &p in &positions {
            let phys = p % window;
            assert!(phys < window);
        }
        // After `window` writes, position `window` maps back to row 0.
        assert_eq!(window % window, 0);
    }

    #[test]
    fn start_pos_for_mask_caps_at_window_minus_num_new() {
        // Pure arithmetic check matching KvCache::start_pos_for_mask's rule:
        // min(current_seq_len, window - num_new), current_seq_len pre-update.
        let window = 10u32;
        let num_new = 2u32;
        assert_eq!(25u32.min(window.saturating_sub(num_new)), window - num_new);
        assert_eq!(4u32.min(window.saturating_sub(num_new)), 4);
    }
}
