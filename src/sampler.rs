//! Sampler (C9): greedy argmax, temperature+top-k stochastic sampling,
//! and stop detection (§4.8).

use std::sync::Arc;

use crate::error::Result;
use crate::kernels::{ArgmaxArgs, KernelOps, RawKernels};
use crate::recorder::CommandRecorder;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub greedy_threshold: f32,
    pub top_k: u32,
    pub softcap: Option<f32>,
    /// Externally supplied uniform draw in `[0, 1)`, consumed only by
    /// [`Sampler::cpu_stochastic`] if a `NumericInvalid` fallback fires
    /// for this step (the core never owns an RNG, §9 design note).
    pub fallback_draw: f32,
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature < self.greedy_threshold
    }
}

pub struct Sampler<K: RawKernels> {
    ops: Arc<KernelOps<K>>,
}

impl<K: RawKernels> Sampler<K> {
    pub fn new(ops: Arc<KernelOps<K>>) -> Self {
        Sampler { ops }
    }

    /// Records a greedy argmax dispatch into `out_token` (a 4-byte u32
    /// slot, possibly a sub-range of a larger ring buffer for batched
    /// decode).
    pub fn record_greedy(&self, recorder: &mut CommandRecorder, logits: &wgpu::Buffer, out_token: &wgpu::Buffer, vocab_size: u32, softcap: Option<f32>) -> Result<()> {
        self.ops.record_argmax(recorder, ArgmaxArgs { logits, logits_offset: 0, out_token, out_offset: 0, vocab_size, softcap })
    }

    /// CPU-side greedy argmax, ties broken by lowest index (§8 "Sampler
    /// determinism"). Used by the fused-decode fallback path.
    pub fn cpu_greedy(logits: &[f32]) -> u32 {
        let mut best_idx = 0u32;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in logits.iter().enumerate() {
            if v > best_val {
                best_val = v;
                best_idx = i as u32;
            }
        }
        best_idx
    }

    /// CPU fallback for stochastic sampling: softcap → scale by `1/T` →
    /// top-k → softmax → sample, driven by an externally supplied random
    /// draw in `[0, 1)` so the core itself never owns an RNG.
    pub fn cpu_stochastic(logits: &[f32], params: &SamplingParams, uniform_draw: f32) -> u32 {
        let mut scored: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let capped = match params.softcap {
                    Some(c) => (v / c).tanh() * c,
                    None => v,
                };
                (i as u32, capped / params.temperature.max(1e-6))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(params.top_k.max(1) as usize);

        let max = scored.iter().map(|(_, v)| *v).fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = scored.iter().map(|(_, v)| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();

        let target = uniform_draw.clamp(0.0, 1.0) * sum;
        let mut acc = 0.0f32;
        for (i, &e) in exps.iter().enumerate() {
            acc += e;
            if acc >= target {
                return scored[i].0;
            }
        }
        scored.last().map(|(idx, _)| *idx).unwrap_or(0)
    }

    /// Writes a `u32` stop flag: `(token == eos) || (pos >= max_seq_len)`.
    pub fn stop_flag(token: u32, eos: u32, pos: u32, max_seq_len: u32) -> u32 {
        u32::from(token == eos || pos >= max_seq_len)
    }
}

/// `resolve_batch_stop` (§8): the smallest `i+1` such that `flags[i] == 1`
/// or `tokens[i]` is a stop id, else `tokens.len()`.
pub fn resolve_batch_stop(tokens: &[u32], flags: &[u32], stop_ids: &[u32], eos: u32) -> usize {
    for (i, (&tok, &flag)) in tokens.iter().zip(flags.iter()).enumerate() {
        if flag == 1 || tok == eos || stop_ids.contains(&tok) {
            return i + 1;
        }
    }
    tokens.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_breaks_ties_by_lowest_index() {
        let logits = [1.0, 3.0, 3.0, 2.0];
        assert_eq!(Sampler::<crate::tests_support::NullKernels>::cpu_greedy(&logits), 1);
    }

    #[test]
    fn resolve_batch_stop_on_explicit_flag() {
        let tokens = [5u32, 7, 2, 9];
        let flags = [0u32, 0, 1, 0];
        assert_eq!(resolve_batch_stop(&tokens, &flags, &[], 2), 3);
    }

    #[test]
    fn resolve_batch_stop_on_eos_without_flag() {
        let tokens = [5u32, 7, 2, 9];
        let flags = [0u32, 0, 0, 0];
        assert_eq!(resolve_batch_stop(&tokens, &flags, &[], 2), 3);
    }

    #[test]
    fn resolve_batch_stop_falls_through_to_full_length() {
        let tokens = [5u32, 7, 9, 11];
        let flags = [0u32, 0, 0, 0];
        assert_eq!(resolve_batch_stop(&tokens, &flags, &[], 2), 4);
    }

    #[test]
    fn stop_flag_triggers_on_max_seq_len() {
        assert_eq!(Sampler::<crate::tests_support::NullKernels>::stop_flag(5, 2, 8192, 8192), 1);
        assert_eq!(Sampler::<crate::tests_support::NullKernels>::stop_flag(5, 2, 10, 8192), 0);
    }
}
