//! FFN Stage (C6): dense SwiGLU/GeGLU and mixture-of-experts
//! (router → softmax+top-k → gather → per-expert FFN → scatter-add), §4.5.

use std::sync::Arc;

use crate::config::{ActivationKind, FfnConfig, MoeConfig};
use crate::dequant_cache::{DequantCache, DequantKey};
use crate::error::{Error, Result};
use crate::kernels::{
    ActivationArgs, KernelOps, MatmulArgs, MoeGatherArgs, MoeRouteArgs, MoeScatterArgs, RawKernels,
};
use crate::pool::BufferPool;
use crate::recorder::CommandRecorder;
use crate::tensor::DType;

pub struct DenseFfnWeights {
    pub gate: wgpu::Buffer,
    pub up: wgpu::Buffer,
    pub down: wgpu::Buffer,
}

pub struct RouterWeights {
    pub weight: wgpu::Buffer,
    pub bias: Option<wgpu::Buffer>,
}

pub struct FfnStage<K: RawKernels> {
    ops: Arc<KernelOps<K>>,
    pool: Arc<BufferPool>,
    ffn_cfg: FfnConfig,
}

impl<K: RawKernels> FfnStage<K> {
    pub fn new(ops: Arc<KernelOps<K>>, pool: Arc<BufferPool>, ffn_cfg: FfnConfig) -> Self {
        FfnStage { ops, pool, ffn_cfg }
    }

    fn alloc(&self, bytes: u64, label: &str) -> Result<wgpu::Buffer> {
        self.pool.acquire(bytes, label)
    }

    /// Gated (SwiGLU/GeGLU): `down(act(gate(x)) * up(x))`. Ungated
    /// (`gated_activation: false`): `down(act(up(x)))`, skipping the gate
    /// projection entirely (§6).
    pub fn record_dense(
        &self,
        recorder: &mut CommandRecorder,
        weights: &DenseFfnWeights,
        input: &wgpu::Buffer,
        num_tokens: u32,
        hidden_dim: u32,
        dtype: DType,
    ) -> Result<wgpu::Buffer> {
        let elem = dtype.size_of() as u64;
        let inter = self.ffn_cfg.hidden_dim;

        let up = self.alloc(num_tokens as u64 * inter as u64 * elem, "ffn-up")?;
        self.ops.record_matmul(
            recorder,
            MatmulArgs { a: input, b: &weights.up, out: &up, out_offset: 0, bias: None, m: num_tokens, n: inter, k: hidden_dim, dtype, fused_residual: None },
            "ffn-up",
        )?;

        let gate = if self.ffn_cfg.gated_activation {
            let gate = self.alloc(num_tokens as u64 * inter as u64 * elem, "ffn-gate")?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs { a: input, b: &weights.gate, out: &gate, out_offset: 0, bias: None, m: num_tokens, n: inter, k: hidden_dim, dtype, fused_residual: None },
                "ffn-gate",
            )?;
            Some(gate)
        } else {
            None
        };

        let activated = self.alloc(num_tokens as u64 * inter as u64 * elem, "ffn-act")?;
        self.ops.record_activation(
            recorder,
            ActivationArgs { gate: gate.as_ref(), up: &up, out: &activated, rows: num_tokens, dim: inter, kind: self.ffn_cfg.activation, clamp: self.ffn_cfg.clamp },
        )?;
        if let Some(gate) = gate {
            recorder.track_temporary(gate);
        }
        recorder.track_temporary(up);
        recorder.track_temporary(activated.clone());

        let out = self.alloc(num_tokens as u64 * hidden_dim as u64 * elem, "ffn-down")?;
        self.ops.record_matmul(
            recorder,
            MatmulArgs { a: &activated, b: &weights.down, out: &out, out_offset: 0, bias: None, m: num_tokens, n: hidden_dim, k: inter, dtype, fused_residual: None },
            "ffn-down",
        )?;
        Ok(out)
    }
}

/// Per-expert weights as resolved from [`WeightSource::get_expert`],
/// tagged by the declared storage format (§4.5 step 5).
pub enum ExpertKind {
    Mixtral(DenseFfnWeights),
    GptOss(crate::tensor::ExpertWeights),
}

pub struct MoeStage<K: RawKernels> {
    ops: Arc<KernelOps<K>>,
    device: wgpu::Device,
    pool: Arc<BufferPool>,
    moe_cfg: MoeConfig,
    dequant: DequantCache,
}

impl<K: RawKernels> MoeStage<K> {
    pub fn new(ops: Arc<KernelOps<K>>, device: wgpu::Device, pool: Arc<BufferPool>, moe_cfg: MoeConfig) -> Self {
        let dequant = DequantCache::new(moe_cfg.dequant_cache_max_entries);
        MoeStage { ops, device, pool, moe_cfg, dequant }
    }

    fn alloc(&self, bytes: u64, label: &str) -> Result<wgpu::Buffer> {
        self.pool.acquire(bytes, label)
    }

    /// Routes, gathers, runs each active expert, and scatter-adds results
    /// back into `[N, H]`. `expert_of` resolves an expert index to its
    /// weights (typically `weight_source.get_expert(layer, e)`), called
    /// lazily so unreferenced experts never load.
    #[allow(clippy::too_many_arguments)]
    pub fn record_forward(
        &self,
        recorder: &mut CommandRecorder,
        router: &RouterWeights,
        input: &wgpu::Buffer,
        num_tokens: u32,
        hidden_dim: u32,
        dtype: DType,
        layer: u32,
        mut expert_of: impl FnMut(u32) -> Result<ExpertKind>,
    ) -> Result<wgpu::Buffer> {
        let elem = dtype.size_of() as u64;
        let e = self.moe_cfg.num_experts;
        let k = self.moe_cfg.top_k;

        let logits = self.alloc(num_tokens as u64 * e as u64 * elem, "moe-router-logits")?;
        self.ops.record_matmul(
            recorder,
            MatmulArgs { a: input, b: &router.weight, out: &logits, out_offset: 0, bias: router.bias.as_ref(), m: num_tokens, n: e, k: hidden_dim, dtype, fused_residual: None },
            "moe-router",
        )?;

        let indices = self.alloc(num_tokens as u64 * k as u64 * 4, "moe-indices")?;
        let route_weights = self.alloc(num_tokens as u64 * k as u64 * 4, "moe-weights")?;
        self.ops.record_moe_route(
            recorder,
            MoeRouteArgs {
                logits: &logits,
                bias: None,
                indices_out: &indices,
                weights_out: &route_weights,
                num_tokens,
                num_experts: e,
                top_k: k,
                normalize_after_topk: self.moe_cfg.normalize_after_topk,
            },
        )?;
        recorder.track_temporary(logits);

        let mut max_per_expert = self
            .moe_cfg
            .max_tokens_per_expert
            .unwrap_or_else(|| ((num_tokens * k) / e.max(1) + 1).max(1));

        // Overflow-reschedule loop (§4.5 step 3): at most a handful of
        // retries before treating overflow past `N` as fatal.
        let (gathered, token_counts, token_map) = loop {
            let gathered = self.alloc(e as u64 * max_per_expert as u64 * hidden_dim as u64 * elem, "moe-gathered")?;
            let token_counts = self.alloc(e as u64 * 4, "moe-counts")?;
            let token_map = self.alloc(e as u64 * max_per_expert as u64 * 2 * 4, "moe-token-map")?;
            self.ops.record_moe_gather(
                recorder,
                MoeGatherArgs {
                    input,
                    indices: &indices,
                    gathered_out: &gathered,
                    token_counts_out: &token_counts,
                    token_map_out: &token_map,
                    num_tokens,
                    top_k: k,
                    num_experts: e,
                    hidden_dim,
                    max_per_expert,
                },
            )?;

            let observed_max = self.read_max_count(recorder, &token_counts, e)?;
            if observed_max <= max_per_expert {
                break (gathered, token_counts, token_map);
            }
            if observed_max > num_tokens * k {
                return Err(Error::OverflowCapacity { layer, requested: observed_max, limit: num_tokens * k });
            }
            max_per_expert = ((observed_max as f32 * 1.2).max(max_per_expert as f32 * 2.0)).ceil() as u32;
        };
        recorder.track_temporary(indices.clone());

        let expert_out = self.alloc(e as u64 * max_per_expert as u64 * hidden_dim as u64 * elem, "moe-expert-out")?;
        for expert in 0..e {
            let kind = expert_of(expert)?;
            let slot_offset = expert as u64 * max_per_expert as u64 * hidden_dim as u64 * elem;
            self.record_one_expert(recorder, layer, expert, kind, &gathered, slot_offset, max_per_expert, hidden_dim, dtype, &expert_out)?;
        }
        recorder.track_temporary(gathered);

        let out = self.alloc(num_tokens as u64 * hidden_dim as u64 * elem, "moe-scatter-out")?;
        self.ops.record_moe_scatter_add(
            recorder,
            MoeScatterArgs {
                expert_outputs: &expert_out,
                token_map: &token_map,
                route_weights: &route_weights,
                out: &out,
                num_tokens,
                top_k: k,
                num_experts: e,
                hidden_dim,
                max_per_expert,
            },
        )?;
        recorder.track_temporary(expert_out);
        recorder.track_temporary(token_map);
        recorder.track_temporary(token_counts);
        recorder.track_temporary(route_weights);

        Ok(out)
    }

    /// Reads back `[E]` token counts to detect gather overflow. This is
    /// the CPU-side variant of §4.5 step 4; a pure-GPU budget-fixed
    /// variant would skip this readback entirely and is left to the
    /// caller when `max_tokens_per_expert` is set explicitly (no retry
    /// loop needed in that case).
    ///
    /// Forces a submit-wait-reopen on `recorder` so the copy below
    /// observes the gather dispatch's actual output rather than racing
    /// it; every later call still appends to the same recorder, so
    /// callers outside this loop never see the mid-function submit.
    fn read_max_count(&self, recorder: &mut CommandRecorder, token_counts: &wgpu::Buffer, num_experts: u32) -> Result<u32> {
        let staging = self.alloc(num_experts as u64 * 4, "moe-counts-staging")?;
        recorder.copy_buffer_to_buffer(token_counts, 0, &staging, 0, num_experts as u64 * 4)?;
        recorder.submit_wait_and_reopen()?;

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().ok().and_then(std::result::Result::ok).ok_or(Error::ReadbackDenied { stage: "moe_read_max_count" })?;
        let data = slice.get_mapped_range();
        let counts: &[u32] = bytemuck::cast_slice(&data);
        let max = counts.iter().copied().max().unwrap_or(0);
        drop(data);
        staging.unmap();
        self.pool.release(staging);
        Ok(max)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_one_expert(
        &self,
        recorder: &mut CommandRecorder,
        layer: u32,
        expert: u32,
        kind: ExpertKind,
        gathered: &wgpu::Buffer,
        slot_offset: u64,
        max_per_expert: u32,
        hidden_dim: u32,
        dtype: DType,
        expert_out: &wgpu::Buffer,
    ) -> Result<()> {
        match kind {
            ExpertKind::Mixtral(weights) => {
                let elem = dtype.size_of() as u64;
                let inter = self.moe_cfg.expert_hidden_dim;
                let up = self.alloc(max_per_expert as u64 * inter as u64 * elem, "expert-up")?;
                self.ops.record_matmul(
                    recorder,
                    MatmulArgs { a: gathered, b: &weights.up, out: &up, out_offset: 0, bias: None, m: max_per_expert, n: inter, k: hidden_dim, dtype, fused_residual: None },
                    "expert-up",
                )?;
                let gate = if self.moe_cfg.gated_activation {
                    let gate = self.alloc(max_per_expert as u64 * inter as u64 * elem, "expert-gate")?;
                    self.ops.record_matmul(
                        recorder,
                        MatmulArgs { a: gathered, b: &weights.gate, out: &gate, out_offset: 0, bias: None, m: max_per_expert, n: inter, k: hidden_dim, dtype, fused_residual: None },
                        "expert-gate",
                    )?;
                    Some(gate)
                } else {
                    None
                };
                let activated = self.alloc(max_per_expert as u64 * inter as u64 * elem, "expert-act")?;
                self.ops.record_activation(
                    recorder,
                    ActivationArgs { gate: gate.as_ref(), up: &up, out: &activated, rows: max_per_expert, dim: inter, kind: self.moe_cfg.activation, clamp: self.moe_cfg.clamp },
                )?;
                if let Some(gate) = gate {
                    recorder.track_temporary(gate);
                }
                recorder.track_temporary(up);
                recorder.track_temporary(activated.clone());
                self.ops.record_matmul(
                    recorder,
                    MatmulArgs {
                        a: &activated,
                        b: &weights.down,
                        out: expert_out, out_offset: slot_offset,
                        bias: None,
                        m: max_per_expert,
                        n: hidden_dim,
                        k: inter,
                        dtype,
                        fused_residual: None,
                    },
                    "expert-down",
                )?;
                Ok(())
            }
            ExpertKind::GptOss(weights) => {
                let key = DequantKey::new(layer, expert, dtype);
                let dequant_gate_up = match self.dequant.get(key) {
                    Some(buf) => buf,
                    None => {
                        // The actual block-unpack dispatch belongs to the
                        // kernel backend; this facade only owns the cache
                        // bookkeeping around it (§5 "Dequant cache").
                        let elem = dtype.size_of() as u64;
                        let buf = self.alloc(max_per_expert as u64 * self.moe_cfg.expert_hidden_dim as u64 * 2 * elem, "expert-dequant-gate-up")?;
                        self.ops.record_cast(
                            recorder,
                            crate::kernels::CastArgs {
                                src: &weights.gate_up_blocks,
                                dst: &buf,
                                count: max_per_expert * self.moe_cfg.expert_hidden_dim * 2,
                                src_dtype: DType::F16,
                                dst_dtype: dtype,
                            },
                        )?;
                        self.dequant.insert(key, buf.clone());
                        buf
                    }
                };
                let elem = dtype.size_of() as u64;
                let inter = self.moe_cfg.expert_hidden_dim;
                let activated = self.alloc(max_per_expert as u64 * inter as u64 * elem, "expert-act")?;
                self.ops.record_activation(
                    recorder,
                    ActivationArgs { gate: Some(&dequant_gate_up), up: &dequant_gate_up, out: &activated, rows: max_per_expert, dim: inter, kind: ActivationKind::SiLU, clamp: self.moe_cfg.clamp },
                )?;
                recorder.track_temporary(activated.clone());
                self.ops.record_matmul(
                    recorder,
                    MatmulArgs {
                        a: &activated,
                        b: &weights.down_blocks,
                        out: expert_out, out_offset: slot_offset,
                        bias: weights.down_bias.as_ref(),
                        m: max_per_expert,
                        n: hidden_dim,
                        k: inter,
                        dtype,
                        fused_residual: None,
                    },
                    "expert-down-mxfp4",
                )?;
                Ok(())
            }
        }
    }
}
