//! Attention Stage (C5): input norm, Q/K/V projection, optional per-head
//! norm, RoPE, KV cache update, scaled dot-product attention, and output
//! projection (§4.4).

use std::sync::Arc;

use crate::config::{AttentionConfig, NormalizationConfig, NormKind};
use crate::error::Result;
use crate::kernels::{AttentionArgs, KernelOps, MatmulArgs, RawKernels, RmsNormArgs};
use crate::kv_cache::KvCache;
use crate::pool::BufferPool;
use crate::recorder::CommandRecorder;
use crate::rope::RopeTable;
use crate::tensor::DType;
use crate::weights::LoraAdapter;

/// Weight handles one layer's attention stage needs, resolved once at
/// layer-build time via [`WeightSource`].
pub struct AttentionWeights {
    pub input_norm: wgpu::Buffer,
    pub q_proj: wgpu::Buffer,
    pub k_proj: wgpu::Buffer,
    pub v_proj: wgpu::Buffer,
    /// Present when the loader exposes a packed QKV weight (§4.4.2 fused path).
    pub qkv_proj: Option<wgpu::Buffer>,
    pub o_proj: wgpu::Buffer,
    pub q_norm: Option<wgpu::Buffer>,
    pub k_norm: Option<wgpu::Buffer>,
    pub o_lora: Option<LoraAdapter>,
}

pub struct AttentionStage<K: RawKernels> {
    ops: Arc<KernelOps<K>>,
    pool: Arc<BufferPool>,
    attn_cfg: AttentionConfig,
    norm_cfg: NormalizationConfig,
}

/// Result of one layer's attention forward, carrying the one-hop
/// `residual_fused` back-signal (§9 design note: not a cycle, just a
/// same-step flag telling the layer driver whether to skip its own add).
pub struct AttentionOutput {
    pub out: wgpu::Buffer,
    pub residual_fused: bool,
}

impl<K: RawKernels> AttentionStage<K> {
    pub fn new(ops: Arc<KernelOps<K>>, pool: Arc<BufferPool>, attn_cfg: AttentionConfig, norm_cfg: NormalizationConfig) -> Self {
        AttentionStage { ops, pool, attn_cfg, norm_cfg }
    }

    fn alloc(&self, bytes: u64, label: &str) -> Result<wgpu::Buffer> {
        self.pool.acquire(bytes, label)
    }

    /// Runs the full attention stage for one layer over `num_tokens`
    /// activation rows, updating `kv_cache[layer]` in place.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        recorder: &mut CommandRecorder,
        weights: &AttentionWeights,
        rope: &RopeTable,
        kv_cache: &mut KvCache,
        layer: u32,
        input: &wgpu::Buffer,
        // The true pre-attention residual stream, eligible for the
        // fused `matmul + residual_add` on `o_proj` (§4.4.7). `None`
        // when the caller's plan always issues an explicit
        // `residual_add` afterward.
        residual: Option<&wgpu::Buffer>,
        num_tokens: u32,
        hidden_dim: u32,
        start_pos: u32,
        dtype: DType,
        skip_input_norm: bool,
    ) -> Result<AttentionOutput> {
        let elem = dtype.size_of() as u64;
        let normed = if skip_input_norm {
            input.clone()
        } else {
            let out = self.alloc(num_tokens as u64 * hidden_dim as u64 * elem, "attn-input-norm")?;
            self.ops.record_rmsnorm(
                recorder,
                RmsNormArgs {
                    input,
                    weight: &weights.input_norm,
                    out: &out,
                    rows: num_tokens,
                    dim: hidden_dim,
                    eps: self.norm_cfg.eps,
                    weight_offset_one: self.norm_cfg.kind == NormKind::RmsNorm && self.norm_cfg.zero_centered_gain,
                },
                "attn-input-norm",
            )?;
            recorder.track_temporary(out.clone());
            out
        };

        let head_dim = self.attn_cfg.head_dim;
        let q_dim = (self.attn_cfg.num_heads * head_dim) as u64;
        let kv_dim = (self.attn_cfg.num_kv_heads * head_dim) as u64;

        let (q, k, v) = if let Some(qkv) = &weights.qkv_proj {
            let fused = self.alloc(num_tokens as u64 * (q_dim + 2 * kv_dim) * elem, "qkv-fused")?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs {
                    a: &normed,
                    b: qkv,
                    out: &fused, out_offset: 0,
                    bias: None,
                    m: num_tokens,
                    n: (q_dim + 2 * kv_dim) as u32,
                    k: hidden_dim,
                    dtype,
                    fused_residual: None,
                },
                "qkv-fused",
            )?;
            recorder.track_temporary(fused.clone());
            // Caller-visible sub-ranges share one buffer; downstream kernels
            // index by byte offset rather than splitting into three buffers.
            (fused.clone(), fused.clone(), fused)
        } else {
            let q = self.alloc(num_tokens as u64 * q_dim * elem, "q-proj")?;
            let k = self.alloc(num_tokens as u64 * kv_dim * elem, "k-proj")?;
            let v = self.alloc(num_tokens as u64 * kv_dim * elem, "v-proj")?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs { a: &normed, b: &weights.q_proj, out: &q, out_offset: 0, bias: None, m: num_tokens, n: q_dim as u32, k: hidden_dim, dtype, fused_residual: None },
                "q-proj",
            )?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs { a: &normed, b: &weights.k_proj, out: &k, out_offset: 0, bias: None, m: num_tokens, n: kv_dim as u32, k: hidden_dim, dtype, fused_residual: None },
                "k-proj",
            )?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs { a: &normed, b: &weights.v_proj, out: &v, out_offset: 0, bias: None, m: num_tokens, n: kv_dim as u32, k: hidden_dim, dtype, fused_residual: None },
                "v-proj",
            )?;
            recorder.track_temporary(q.clone());
            recorder.track_temporary(k.clone());
            recorder.track_temporary(v.clone());
            (q, k, v)
        };

        // Optional per-head Q/K RMSNorm (Gemma/Qwen3 family), applied
        // before RoPE. A flag without a weight falls back to a unit-ones
        // buffer by reusing the same weight slot: callers must supply one
        // when `qk_norm` is set (enforced at config-build time upstream).
        if self.attn_cfg.qk_norm {
            if let Some(qn) = &weights.q_norm {
                self.ops.record_rmsnorm(
                    recorder,
                    RmsNormArgs { input: &q, weight: qn, out: &q, rows: num_tokens * self.attn_cfg.num_heads, dim: head_dim, eps: self.norm_cfg.eps, weight_offset_one: false },
                    "q-head-norm",
                )?;
            }
            if let Some(kn) = &weights.k_norm {
                self.ops.record_rmsnorm(
                    recorder,
                    RmsNormArgs { input: &k, weight: kn, out: &k, rows: num_tokens * self.attn_cfg.num_kv_heads, dim: head_dim, eps: self.norm_cfg.eps, weight_offset_one: false },
                    "k-head-norm",
                )?;
            }
        }

        self.ops.record_rope(
            recorder,
            crate::kernels::RopeArgs {
                q: &q,
                k: &k,
                cos: &rope.cos,
                sin: &rope.sin,
                start_pos,
                num_tokens,
                num_q_heads: self.attn_cfg.num_heads,
                num_kv_heads: self.attn_cfg.num_kv_heads,
                head_dim,
            },
        )?;

        // Read the pre-update mask offset before the update mutates `seq_len`.
        let start_pos_for_mask = kv_cache.start_pos_for_mask(layer, num_tokens)?;
        kv_cache.record_update_from_gpu(recorder, layer, &k, &v, start_pos, num_tokens)?;
        let view = kv_cache.gpu_buffers(layer)?;

        let scale = self.attn_cfg.scale.unwrap_or(1.0 / (head_dim as f32).sqrt());
        let attn_out = self.alloc(num_tokens as u64 * q_dim * elem, "attn-sdpa")?;
        self.ops.record_attention(
            recorder,
            AttentionArgs {
                q: &q,
                k: view.k,
                v: view.v,
                out: &attn_out,
                num_q_heads: self.attn_cfg.num_heads,
                num_kv_heads: self.attn_cfg.num_kv_heads,
                head_dim,
                seq_len: view.seq_len,
                start_pos_for_mask,
                sliding_window: view.window,
                softcap: self.attn_cfg.attn_softcap,
                scale,
            },
        )?;
        recorder.track_temporary(attn_out.clone());

        // Output projection. A fused matmul+residual-add is only valid
        // for single-token decode with f32 residual / f16 weights, and
        // only when the caller actually handed us the residual stream;
        // the layer driver decides whether to skip its own add by
        // reading `residual_fused` back.
        let can_fuse_residual = residual.is_some() && num_tokens == 1 && dtype == DType::F32;
        let out = self.alloc(num_tokens as u64 * hidden_dim as u64 * elem, "o-proj")?;
        self.ops.record_matmul(
            recorder,
            MatmulArgs {
                a: &attn_out,
                b: &weights.o_proj,
                out: &out, out_offset: 0,
                bias: None,
                m: num_tokens,
                n: hidden_dim,
                k: q_dim as u32,
                dtype,
                fused_residual: if can_fuse_residual { residual } else { None },
            },
            "o-proj",
        )?;

        if let Some(lora) = &weights.o_lora {
            let tmp = self.alloc(num_tokens as u64 * lora.rank as u64 * elem, "o-lora-tmp")?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs { a: &attn_out, b: &lora.a, out: &tmp, out_offset: 0, bias: None, m: num_tokens, n: lora.rank, k: q_dim as u32, dtype, fused_residual: None },
                "o-lora-down",
            )?;
            self.ops.record_matmul(
                recorder,
                MatmulArgs { a: &tmp, b: &lora.b, out: &out, out_offset: 0, bias: None, m: num_tokens, n: hidden_dim, k: lora.rank, dtype, fused_residual: Some(&out) },
                "o-lora-up",
            )?;
            recorder.track_temporary(tmp);
        }

        Ok(AttentionOutput { out, residual_fused: can_fuse_residual })
    }
}
