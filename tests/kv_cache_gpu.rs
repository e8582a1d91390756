//! Cross-module integration tests for the KV cache's GPU-backed behavior
//! (§8: KV append, sliding window). Gated on a real device; see
//! `tests/common/mod.rs`. `KvCache::record_update_from_gpu` only issues
//! `copy_buffer_to_buffer`, so these exercise real buffer contents without
//! needing a Kernel Backend implementation.

#![cfg(gpu_test)]

mod common;

use infer_core::kv_cache::KvCache;
use infer_core::pool::BufferPool;
use infer_core::DType;
use std::sync::Arc;

fn row_f32(head_dim: usize, fill: f32) -> Vec<u8> {
    bytemuck::cast_slice(&vec![fill; head_dim]).to_vec()
}

#[test]
fn append_updates_seq_len_and_writes_exact_rows() {
    let Some((device, queue)) = common::gpu_device() else {
        eprintln!("skipping: no gpu adapter available");
        return;
    };
    let num_kv_heads = 1u32;
    let head_dim = 4u32;
    let max_seq_len = 16u32;
    let dtype = DType::F32;
    let row_bytes = (num_kv_heads * head_dim) as u64 * dtype.size_of() as u64;

    let mut kv = KvCache::new(&device, 1, max_seq_len, num_kv_heads, head_dim, dtype, &[None]);

    let pool = Arc::new(BufferPool::new(device.clone(), 1 << 24));
    let k_src = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, 1.0), "k-src");
    let v_src = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, 2.0), "v-src");

    kv.update_from_gpu(&device, &queue, pool.clone(), 0, &k_src, &v_src, 0, 1).unwrap();

    let view = kv.gpu_buffers(0).unwrap();
    assert_eq!(view.seq_len, 1);

    let staging = common::staging_buffer(&device, row_bytes);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encoder.copy_buffer_to_buffer(view.k, 0, &staging, 0, row_bytes);
    queue.submit(Some(encoder.finish()));
    let bytes = common::read_buffer(&device, &staging);
    let values: &[f32] = bytemuck::cast_slice(&bytes);
    assert_eq!(values, &[1.0, 1.0, 1.0, 1.0]);
}

#[test]
fn sliding_window_wraps_and_hides_evicted_rows() {
    let Some((device, queue)) = common::gpu_device() else {
        eprintln!("skipping: no gpu adapter available");
        return;
    };
    let num_kv_heads = 1u32;
    let head_dim = 4u32;
    let window = 4u32;
    let max_seq_len = 64u32;
    let dtype = DType::F32;
    let row_bytes = (num_kv_heads * head_dim) as u64 * dtype.size_of() as u64;

    let mut kv = KvCache::new(&device, 1, max_seq_len, num_kv_heads, head_dim, dtype, &[Some(window)]);
    let pool = Arc::new(BufferPool::new(device.clone(), 1 << 24));

    // Write a synthetic "spike" at logical position 0, then advance past
    // one full window's worth of writes so position 0 is evicted.
    let spike = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, 99.0), "spike-k");
    let spike_v = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, 99.0), "spike-v");
    kv.update_from_gpu(&device, &queue, pool.clone(), 0, &spike, &spike_v, 0, 1).unwrap();

    // Writes at positions 1..window: seq_len stays below window, so
    // start_pos_for_mask never clips yet.
    for pos in 1..window {
        let row = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, pos as f32), "k");
        let row_v = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, pos as f32), "v");
        kv.update_from_gpu(&device, &queue, pool.clone(), 0, &row, &row_v, pos, 1).unwrap();
    }

    // Per §4.3, start_pos_for_mask must be read *before* the write that
    // pushes seq_len past window, using the pre-update seq_len (= window
    // at this point) and num_new = 1: min(window, window - 1) = window - 1.
    let mask_before_eviction = kv.start_pos_for_mask(0, 1).unwrap();
    assert_eq!(mask_before_eviction, window - 1);

    let row = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, window as f32), "k");
    let row_v = common::upload_buffer(&device, &queue, &row_f32(head_dim as usize, window as f32), "v");
    kv.update_from_gpu(&device, &queue, pool.clone(), 0, &row, &row_v, window, 1).unwrap();

    // Logical position `window` physically lands on row 0, overwriting
    // the position-0 spike: the spike is no longer observable anywhere
    // in the physical buffer.
    let view = kv.gpu_buffers(0).unwrap();
    let staging = common::staging_buffer(&device, row_bytes * window as u64);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encoder.copy_buffer_to_buffer(view.k, 0, &staging, 0, row_bytes * window as u64);
    queue.submit(Some(encoder.finish()));
    let bytes = common::read_buffer(&device, &staging);
    let values: &[f32] = bytemuck::cast_slice(&bytes);
    assert!(!values.contains(&99.0), "evicted spike row must not survive a full window of writes");
}
