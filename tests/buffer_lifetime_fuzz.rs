//! Buffer-lifetime safety property (§8, C0.7): a fuzzed sequence of
//! recorder operations releases every transient exactly once, and never
//! before its submission completes. Uses `proptest`, following
//! `anibjoshi-in-mem`'s lead (the only pack repo with a fuzz property).
//!
//! Gated on a real device; see `tests/common/mod.rs`.

#![cfg(gpu_test)]

mod common;

use infer_core::pool::BufferPool;
use infer_core::recorder::CommandRecorder;
use proptest::prelude::*;
use std::sync::Arc;

/// One fuzzed recorder submission: acquire `n` transient buffers from the
/// pool, track them all, submit, and wait. If `track_temporary` or
/// `submit`'s deferred-release path ever released a buffer early, the
/// pool's `live_bytes` would either double-count a release (underflow the
/// saturating subtract, silently wrong) or leave bytes stuck live forever.
/// Waiting for every submission's completion and then asserting
/// `live_bytes() == 0` catches both failure modes.
fn run_batch(device: &wgpu::Device, queue: &wgpu::Queue, pool: &Arc<BufferPool>, sizes: &[u64]) {
    let mut recorder = CommandRecorder::new(device.clone(), queue.clone(), pool.clone(), "fuzz-batch");
    for &size in sizes {
        let buf = pool.acquire(size.max(4), "fuzz-transient").unwrap();
        recorder.track_temporary(buf);
    }
    recorder.submit_and_wait().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_transient_is_released_exactly_once_after_submit(
        batches in prop::collection::vec(prop::collection::vec(1u64..4096, 0..8), 1..6),
    ) {
        let Some((device, queue)) = common::gpu_device() else {
            eprintln!("skipping: no gpu adapter available");
            return Ok(());
        };
        let pool = Arc::new(BufferPool::new(device.clone(), 1 << 26));

        for sizes in &batches {
            run_batch(&device, &queue, &pool, sizes);
            // `submit_and_wait` blocks for the GPU signal but the release
            // callback runs on `queue.on_submitted_work_done`, which the
            // same `device.poll(Wait)` call inside `submit_and_wait`
            // already drains on this backend.
            prop_assert_eq!(pool.live_bytes(), 0);
        }
    }
}
