//! Black-box checks against the public API for the decode-side concrete
//! scenarios in §8 that don't require a Kernel Backend to exercise: ring
//! decode stop detection and layer-plan compile-time safety. The
//! GPU-dependent scenarios (greedy prefill/decode determinism, MoE
//! routing/overflow, fused-sampling fallback) need an actual compute
//! dispatch through a concrete `RawKernels` implementation, which is an
//! external collaborator this crate does not supply; they're out of this
//! suite's reach the same way device/adapter creation is.

use infer_core::sampler::resolve_batch_stop;

/// §8 scenario 4: N=16, eos=2, model emits [5,7,2,...] -> actual_count==3,
/// returned slice is [5,7,2].
#[test]
fn ring_decode_stops_on_eos_mid_batch() {
    let tokens = [5u32, 7, 2, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59];
    let flags = [0u32; 16];
    let stop_ids: [u32; 0] = [];
    let count = resolve_batch_stop(&tokens, &flags, &stop_ids, 2);
    assert_eq!(count, 3);
    assert_eq!(&tokens[..count], &[5, 7, 2]);
}

#[test]
fn ring_decode_runs_to_full_length_without_a_stop() {
    let tokens = [5u32, 7, 11, 13];
    let flags = [0u32; 4];
    let stop_ids: [u32; 0] = [];
    assert_eq!(resolve_batch_stop(&tokens, &flags, &stop_ids, 2), 4);
}

#[test]
fn ring_decode_honors_an_explicit_stop_id_over_eos() {
    let tokens = [5u32, 9, 7, 2];
    let flags = [0u32; 4];
    // token 9 isn't eos (2) but is in the caller's stop set.
    let count = resolve_batch_stop(&tokens, &flags, &[9], 2);
    assert_eq!(count, 2);
    assert_eq!(&tokens[..count], &[5, 9]);
}
