//! Forward Driver (C8): prefill (batch of N) and decode (single-token or
//! ring-batched-N) loops (§4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::attention::{AttentionStage, AttentionWeights};
use crate::config::ModelConfig;
use crate::decode_ring::DecodeRing;
use crate::error::{Error, Result};
use crate::ffn::{DenseFfnWeights, ExpertKind, FfnStage, MoeStage, RouterWeights};
use crate::kernels::{ArgmaxArgs, GatherArgs, KernelOps, RawKernels};
use crate::kv_cache::KvCache;
use crate::layer_plan::{FfnVariant, LayerPlanSet, PlanOp, SlotId, DEFAULT_SLOT};
use crate::pool::BufferPool;
use crate::recorder::CommandRecorder;
use crate::rope::RopeTable;
use crate::sampler::{resolve_batch_stop, SamplingParams};
use crate::tensor::DType;
use crate::weights::WeightSource;

/// Per-layer resolved weight handles, looked up once via [`WeightSource`]
/// before a forward pass begins.
pub struct LayerWeights {
    pub attn: AttentionWeights,
    pub ffn_norm: wgpu::Buffer,
    pub dense_ffn: Option<DenseFfnWeights>,
    pub router: Option<RouterWeights>,
    /// One entry per MoE expert, resolved via [`WeightSource::get_expert`]
    /// (§4.5 step 5); empty for dense layers.
    pub experts: Vec<Arc<crate::tensor::ExpertWeights>>,
}

pub struct ModelWeights {
    pub embed_tokens: wgpu::Buffer,
    pub final_norm: wgpu::Buffer,
    pub lm_head: wgpu::Buffer,
    pub layers: Vec<LayerWeights>,
}

pub struct ForwardDriver<K: RawKernels> {
    ops: Arc<KernelOps<K>>,
    pool: Arc<BufferPool>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: ModelConfig,
    plans: LayerPlanSet,
    rope_global: RopeTable,
    rope_local: Option<RopeTable>,
    attention: AttentionStage<K>,
    ffn: FfnStage<K>,
    moe: Option<MoeStage<K>>,
    dtype: DType,
    /// Latched once a `NumericInvalid` sample forces CPU sampling for the
    /// rest of the session (§4.7 "Validation & fallback").
    fused_decode_disabled: AtomicBool,
}

impl<K: RawKernels> ForwardDriver<K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ops: Arc<KernelOps<K>>,
        pool: Arc<BufferPool>,
        device: wgpu::Device,
        queue: wgpu::Queue,
        config: ModelConfig,
        plans: LayerPlanSet,
        rope_global: RopeTable,
        rope_local: Option<RopeTable>,
        dtype: DType,
    ) -> Self {
        let attention = AttentionStage::new(ops.clone(), pool.clone(), config.attention, config.normalization);
        let ffn = FfnStage::new(ops.clone(), pool.clone(), config.ffn);
        let moe = config.moe.map(|m| MoeStage::new(ops.clone(), device.clone(), pool.clone(), m));
        ForwardDriver {
            ops,
            pool,
            device,
            queue,
            config,
            plans,
            rope_global,
            rope_local,
            attention,
            ffn,
            moe,
            dtype,
            fused_decode_disabled: AtomicBool::new(false),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn rope_for(&self, layer: u32) -> &RopeTable {
        if self.config.layers.is_sliding(layer) {
            self.rope_local.as_ref().unwrap_or(&self.rope_global)
        } else {
            &self.rope_global
        }
    }

    fn check_cancel(&self, cancel: &AtomicBool) -> Result<()> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn embed(&self, recorder: &mut CommandRecorder, weights: &ModelWeights, token_ids: &wgpu::Buffer, token_offset: u64, num_tokens: u32) -> Result<wgpu::Buffer> {
        let hidden = self.config.hidden_dim;
        let elem = self.dtype.size_of() as u64;
        let out = self.pool.acquire(num_tokens as u64 * hidden as u64 * elem, "embed-out")?;
        self.ops.record_gather(
            recorder,
            GatherArgs { table: &weights.embed_tokens, indices: token_ids, indices_offset: token_offset, out: &out, num_indices: num_tokens, row_dim: hidden },
        )?;
        recorder.track_temporary(out.clone());
        Ok(out)
    }

    /// Executes one layer's compiled plan against a slot map seeded with
    /// `{state: input}`.
    #[allow(clippy::too_many_arguments)]
    fn run_layer(
        &self,
        recorder: &mut CommandRecorder,
        weights: &LayerWeights,
        layer: u32,
        kv_cache: &mut KvCache,
        input: wgpu::Buffer,
        num_tokens: u32,
        start_pos: u32,
    ) -> Result<wgpu::Buffer> {
        let plan = self.plans.plan_for(layer);
        let mut slots: HashMap<String, wgpu::Buffer> = HashMap::new();
        slots.insert(DEFAULT_SLOT.to_string(), input);
        let rope = self.rope_for(layer);
        // Set by an `Attention` op that fused its residual add internally;
        // names the residual slot whose very next `ResidualAdd` use must be
        // skipped so the add isn't applied twice (§4.4.7 / §9 design note).
        let mut fused_residual_consumed: Option<SlotId> = None;

        for op in plan.ops() {
            match op {
                PlanOp::Save { slot } => {
                    let current = slots.get(DEFAULT_SLOT).expect("state seeded at entry").clone();
                    slots.insert(slot.clone(), current);
                }
                PlanOp::Load { slot } => {
                    let v = slots.get(slot).expect("compiled plan guarantees prior write").clone();
                    slots.insert(DEFAULT_SLOT.to_string(), v);
                }
                PlanOp::RmsNorm { src, dst, weight, residual: _ } => {
                    let input = slots.get(src).expect("compiled plan guarantees prior write").clone();
                    let w = if weight == "attn_norm" {
                        &weights.attn.input_norm
                    } else {
                        &weights.ffn_norm
                    };
                    let out = self.pool.acquire(num_tokens as u64 * self.config.hidden_dim as u64 * self.dtype.size_of() as u64, "layer-norm-out")?;
                    self.ops.record_rmsnorm(
                        recorder,
                        crate::kernels::RmsNormArgs {
                            input: &input,
                            weight: w,
                            out: &out,
                            rows: num_tokens,
                            dim: self.config.hidden_dim,
                            eps: self.config.normalization.eps,
                            weight_offset_one: self.config.normalization.zero_centered_gain,
                        },
                        "plan-rmsnorm",
                    )?;
                    recorder.track_temporary(out.clone());
                    slots.insert(dst.clone(), out);
                }
                PlanOp::Attention { src, dst, residual, skip_input_norm } => {
                    let input = slots.get(src).expect("compiled plan guarantees prior write").clone();
                    let residual_buf = residual.as_ref().map(|slot| slots.get(slot).expect("compiled plan guarantees prior write").clone());
                    let out = self.attention.forward(
                        recorder,
                        &weights.attn,
                        rope,
                        kv_cache,
                        layer,
                        &input,
                        residual_buf.as_ref(),
                        num_tokens,
                        self.config.hidden_dim,
                        start_pos,
                        self.dtype,
                        *skip_input_norm,
                    )?;
                    if out.residual_fused {
                        // The residual stream is already folded into `out.out`;
                        // skip the plan's next explicit add of (dst, residual slot)
                        // so it isn't applied twice.
                        fused_residual_consumed = residual.clone();
                    }
                    slots.insert(dst.clone(), out.out);
                }
                PlanOp::Ffn { src, dst, variant } => {
                    let input = slots.get(src).expect("compiled plan guarantees prior write").clone();
                    let is_moe = match variant {
                        FfnVariant::Dense => false,
                        FfnVariant::Moe => true,
                        FfnVariant::Auto => self.config.layers.is_moe(layer),
                    };
                    let out = if is_moe {
                        let moe = self.moe.as_ref().expect("moe ffn requested without moe config");
                        let router = weights.router.as_ref().expect("moe layer missing router weights");
                        let experts = &weights.experts;
                        moe.record_forward(recorder, router, &input, num_tokens, self.config.hidden_dim, self.dtype, layer, |expert| {
                            experts
                                .get(expert as usize)
                                .map(|w| ExpertKind::GptOss((**w).clone()))
                                .ok_or(Error::MissingExpert { layer, expert })
                        })?
                    } else {
                        let dense = weights.dense_ffn.as_ref().expect("dense ffn requested without dense weights");
                        self.ffn.record_dense(recorder, dense, &input, num_tokens, self.config.hidden_dim, self.dtype)?
                    };
                    slots.insert(dst.clone(), out);
                }
                PlanOp::ResidualAdd { a, b, dst } => {
                    if fused_residual_consumed.as_deref() == Some(b.as_str()) {
                        fused_residual_consumed = None;
                        let a_buf = slots.get(a).expect("compiled plan guarantees prior write").clone();
                        slots.insert(dst.clone(), a_buf);
                        continue;
                    }
                    let a_buf = slots.get(a).expect("compiled plan guarantees prior write").clone();
                    let b_buf = slots.get(b).expect("compiled plan guarantees prior write").clone();
                    let out = self.pool.acquire(num_tokens as u64 * self.config.hidden_dim as u64 * self.dtype.size_of() as u64, "residual-add-out")?;
                    self.ops.record_add(
                        recorder,
                        crate::kernels::AddArgs { a: &a_buf, b: &b_buf, out: &out, count: num_tokens * self.config.hidden_dim },
                    )?;
                    recorder.track_temporary(out.clone());
                    slots.insert(dst.clone(), out);
                }
                PlanOp::Noop => {}
            }
        }
        Ok(slots.remove(DEFAULT_SLOT).expect("state always present"))
    }

    /// Prefill: embed → layers → final norm → LM head → argmax of the
    /// last position. Runs without the decode ring.
    pub fn prefill(&self, weights: &ModelWeights, kv_cache: &mut KvCache, token_ids: &wgpu::Buffer, num_tokens: u32, start_pos: u32) -> Result<u32> {
        let mut recorder = CommandRecorder::new(self.device.clone(), self.queue.clone(), self.pool.clone(), "prefill");
        let mut hidden = self.embed(&mut recorder, weights, token_ids, 0, num_tokens)?;
        for (layer, lw) in weights.layers.iter().enumerate() {
            hidden = self.run_layer(&mut recorder, lw, layer as u32, kv_cache, hidden, num_tokens, start_pos)?;
        }

        let normed = self.pool.acquire(num_tokens as u64 * self.config.hidden_dim as u64 * self.dtype.size_of() as u64, "final-norm-out")?;
        self.ops.record_rmsnorm(
            &mut recorder,
            crate::kernels::RmsNormArgs {
                input: &hidden,
                weight: &weights.final_norm,
                out: &normed,
                rows: num_tokens,
                dim: self.config.hidden_dim,
                eps: self.config.normalization.eps,
                weight_offset_one: self.config.normalization.zero_centered_gain,
            },
            "final-norm",
        )?;
        recorder.track_temporary(normed.clone());

        let vocab = self.config.output.vocab_size;
        let logits = self.pool.acquire(num_tokens as u64 * vocab as u64 * self.dtype.size_of() as u64, "lm-head-logits")?;
        self.ops.record_matmul(
            &mut recorder,
            crate::kernels::MatmulArgs {
                a: &normed,
                b: &weights.lm_head,
                out: &logits, out_offset: 0,
                bias: None,
                m: num_tokens,
                n: vocab,
                k: self.config.hidden_dim,
                dtype: self.dtype,
                fused_residual: None,
            },
            "lm-head",
        )?;

        let last_row_offset = (num_tokens.saturating_sub(1)) as u64 * vocab as u64 * self.dtype.size_of() as u64;
        let out_token = self.pool.acquire(4, "prefill-argmax-out")?;
        self.ops.record_argmax(
            &mut recorder,
            ArgmaxArgs { logits: &logits, logits_offset: last_row_offset, out_token: &out_token, out_offset: 0, vocab_size: vocab, softcap: self.config.output.logit_softcap },
        )?;
        recorder.track_temporary(logits);
        recorder.track_temporary(out_token.clone());

        recorder.submit_and_wait()?;
        self.readback_u32(&out_token)
    }

    /// Reads back a single `u32` from a mapped buffer (the map-read-4-bytes
    /// step common to both prefill's last-token argmax and single-token
    /// decode).
    fn readback_u32(&self, buffer: &wgpu::Buffer) -> Result<u32> {
        let slice = buffer.slice(..4);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().ok().and_then(std::result::Result::ok).ok_or(Error::ReadbackDenied { stage: "readback_u32" })?;
        let data = slice.get_mapped_range();
        let value = bytemuck::cast_slice::<u8, u32>(&data)[0];
        drop(data);
        buffer.unmap();
        Ok(value)
    }

    /// Validates a sampled token id — invalid if `>= vocab_size` or equal
    /// to `pad_token_id` (§7 `NumericInvalid`). On failure latches
    /// `fused_decode_disabled` for the rest of the session.
    fn validate_token(&self, token: u32) -> Result<()> {
        let invalid = token >= self.config.output.vocab_size || Some(token) == self.config.output.pad_token_id;
        if invalid {
            self.fused_decode_disabled.store(true, Ordering::Relaxed);
            return Err(Error::NumericInvalid { token_id: token, vocab_size: self.config.output.vocab_size });
        }
        Ok(())
    }

    pub fn fused_decode_disabled(&self) -> bool {
        self.fused_decode_disabled.load(Ordering::Relaxed)
    }

    /// Reads back `count` logits in `self.dtype` and widens them to `f32`,
    /// the CPU-sampling fallback's input shape (§7 `NumericInvalid`
    /// recovery; `Sampler::cpu_greedy`/`cpu_stochastic` only accept f32).
    fn readback_logits(&self, buffer: &wgpu::Buffer, count: u32) -> Result<Vec<f32>> {
        let bytes = count as u64 * self.dtype.size_of() as u64;
        let slice = buffer.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().ok().and_then(std::result::Result::ok).ok_or(Error::ReadbackDenied { stage: "readback_logits" })?;
        let data = slice.get_mapped_range();
        let values = match self.dtype {
            DType::F32 => bytemuck::cast_slice::<u8, f32>(&data).to_vec(),
            DType::F16 => bytemuck::cast_slice::<u8, half::f16>(&data).iter().map(|v| v.to_f32()).collect(),
        };
        drop(data);
        buffer.unmap();
        Ok(values)
    }

    /// Recovers from a `NumericInvalid` sample by CPU-sampling the same
    /// logits the GPU argmax just rejected (§4.7 "Validation & fallback").
    fn cpu_fallback_sample(&self, logits: &wgpu::Buffer, vocab: u32, sampling: &SamplingParams) -> Result<u32> {
        let values = self.readback_logits(logits, vocab)?;
        Ok(if sampling.is_greedy() {
            crate::sampler::Sampler::<K>::cpu_greedy(&values)
        } else {
            crate::sampler::Sampler::<K>::cpu_stochastic(&values, sampling, sampling.fallback_draw)
        })
    }

    /// Single-token decode: one recorder spanning all layers + LM head +
    /// sample, staged to a ring slot, one `submit_and_wait`, then a
    /// 4-byte map-read.
    pub fn decode_single(
        &self,
        weights: &ModelWeights,
        kv_cache: &mut KvCache,
        token_id: &wgpu::Buffer,
        start_pos: u32,
        sampling: &SamplingParams,
        cancel: &AtomicBool,
    ) -> Result<u32> {
        self.check_cancel(cancel)?;
        let mut recorder = CommandRecorder::new(self.device.clone(), self.queue.clone(), self.pool.clone(), "decode-single");
        let mut hidden = self.embed(&mut recorder, weights, token_id, 0, 1)?;
        for (layer, lw) in weights.layers.iter().enumerate() {
            hidden = self.run_layer(&mut recorder, lw, layer as u32, kv_cache, hidden, 1, start_pos)?;
        }

        let normed = self.pool.acquire(self.config.hidden_dim as u64 * self.dtype.size_of() as u64, "final-norm-out")?;
        self.ops.record_rmsnorm(
            &mut recorder,
            crate::kernels::RmsNormArgs {
                input: &hidden,
                weight: &weights.final_norm,
                out: &normed,
                rows: 1,
                dim: self.config.hidden_dim,
                eps: self.config.normalization.eps,
                weight_offset_one: self.config.normalization.zero_centered_gain,
            },
            "final-norm",
        )?;
        recorder.track_temporary(normed.clone());

        let vocab = self.config.output.vocab_size;
        let logits = self.pool.acquire(vocab as u64 * self.dtype.size_of() as u64, "lm-head-logits")?;
        self.ops.record_matmul(
            &mut recorder,
            crate::kernels::MatmulArgs { a: &normed, b: &weights.lm_head, out: &logits, out_offset: 0, bias: None, m: 1, n: vocab, k: self.config.hidden_dim, dtype: self.dtype, fused_residual: None },
            "lm-head",
        )?;

        let out_token = self.pool.acquire(4, "decode-sample-out");
        let out_token = out_token?;
        // Both branches dispatch the same GPU argmax kernel: the
        // stochastic CPU path only ever runs via `cpu_fallback_sample`
        // below, when `NumericInvalid` forces a fallback for this step
        // (§4.7). `logits` is kept alive past `submit_and_wait` so the
        // fallback can read it back without needing a second forward pass.
        self.ops.record_argmax(
            &mut recorder,
            ArgmaxArgs { logits: &logits, logits_offset: 0, out_token: &out_token, out_offset: 0, vocab_size: vocab, softcap: self.config.output.logit_softcap },
        )?;
        recorder.track_temporary(logits.clone());
        recorder.track_temporary(out_token.clone());

        recorder.submit_and_wait()?;
        let token = self.readback_u32(&out_token)?;
        match self.validate_token(token) {
            Ok(()) => Ok(token),
            Err(Error::NumericInvalid { .. }) => self.cpu_fallback_sample(&logits, vocab, sampling),
            Err(e) => Err(e),
        }
    }

    /// Ring-batched decode: unrolls `ring.slot_capacity() - 1` decode
    /// steps into one recorder and resolves the actual emitted count with
    /// [`resolve_batch_stop`] after a single post-submit readback of the
    /// sampled tokens. Stop flags (`tok == eos ∨ pos >= max_seq_len`, §8)
    /// are computed CPU-side from those tokens rather than read back from
    /// a GPU buffer, since nothing in this stack dispatches one.
    pub fn decode_batched(
        &self,
        weights: &ModelWeights,
        kv_cache: &mut KvCache,
        ring: &mut DecodeRing,
        first_token: &wgpu::Buffer,
        start_pos: u32,
        eos: u32,
        stop_ids: &[u32],
        max_seq_len: u32,
        cancel: &AtomicBool,
    ) -> Result<Vec<u32>> {
        self.check_cancel(cancel)?;
        // Pull owned handles out of the acquired slot up front so the
        // borrow doesn't outlive this function (`ring.advance()` below
        // needs `&mut ring` again once decoding is done).
        let (tokens_buf, staging_buf, capacity) = {
            let slot = ring.acquire()?;
            (slot.tokens.clone(), slot.staging.clone(), slot.capacity)
        };
        let steps = capacity.saturating_sub(1);

        let mut recorder = CommandRecorder::new(self.device.clone(), self.queue.clone(), self.pool.clone(), "decode-batched");
        // Seed `tokens[0]`; step `i` samples into `tokens[i+1]` and the
        // next step reads it back via the embed kernel with
        // `index_offset = i` (§4.7 "Decode batched").
        recorder.copy_buffer_to_buffer(first_token, 0, &tokens_buf, 0, 4)?;
        let mut pos = start_pos;

        for step in 0..steps {
            let token_offset = step as u64 * 4;
            let mut hidden = self.embed(&mut recorder, weights, &tokens_buf, token_offset, 1)?;
            for (layer, lw) in weights.layers.iter().enumerate() {
                hidden = self.run_layer(&mut recorder, lw, layer as u32, kv_cache, hidden, 1, pos)?;
            }
            let normed = self.pool.acquire(self.config.hidden_dim as u64 * self.dtype.size_of() as u64, "final-norm-out")?;
            self.ops.record_rmsnorm(
                &mut recorder,
                crate::kernels::RmsNormArgs {
                    input: &hidden,
                    weight: &weights.final_norm,
                    out: &normed,
                    rows: 1,
                    dim: self.config.hidden_dim,
                    eps: self.config.normalization.eps,
                    weight_offset_one: self.config.normalization.zero_centered_gain,
                },
                "final-norm",
            )?;
            recorder.track_temporary(normed.clone());

            let vocab = self.config.output.vocab_size;
            let logits = self.pool.acquire(vocab as u64 * self.dtype.size_of() as u64, "lm-head-logits")?;
            self.ops.record_matmul(
                &mut recorder,
                crate::kernels::MatmulArgs { a: &normed, b: &weights.lm_head, out: &logits, out_offset: 0, bias: None, m: 1, n: vocab, k: self.config.hidden_dim, dtype: self.dtype, fused_residual: None },
                "lm-head",
            )?;
            recorder.track_temporary(logits.clone());

            let next_token_offset = (step + 1) as u64 * 4;
            self.ops.record_argmax(
                &mut recorder,
                ArgmaxArgs { logits: &logits, logits_offset: 0, out_token: &tokens_buf, out_offset: next_token_offset, vocab_size: vocab, softcap: self.config.output.logit_softcap },
            )?;
            recorder.track_temporary(logits);

            pos += 1;
        }

        recorder.copy_buffer_to_buffer(&tokens_buf, 0, &staging_buf, 0, tokens_buf.size())?;
        recorder.submit_and_wait()?;
        ring.advance();

        let raw = self.readback_tokens(&staging_buf, steps + 1)?;
        let generated = &raw[1..];
        let flags: Vec<u32> = generated
            .iter()
            .enumerate()
            .map(|(i, &tok)| crate::sampler::Sampler::<K>::stop_flag(tok, eos, start_pos + i as u32 + 1, max_seq_len))
            .collect();
        let emitted = resolve_batch_stop(generated, &flags, stop_ids, eos);

        // A chained GPU argmax can't be corrected mid-sequence (every step
        // after the invalid one already embedded from it), so a
        // `NumericInvalid` token here truncates the batch at that point
        // instead of the single-step CPU resample §4.7 describes for
        // `decode_single`; `fused_decode_disabled` still latches, so the
        // next call routes through the real fallback one token at a time.
        let valid_upto = generated.iter().position(|&tok| self.validate_token(tok).is_err()).unwrap_or(generated.len());
        Ok(generated[..emitted.min(valid_upto)].to_vec())
    }

    fn readback_tokens(&self, staging: &wgpu::Buffer, count: u32) -> Result<Vec<u32>> {
        let bytes = count as u64 * 4;
        let slice = staging.slice(0..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().ok().and_then(std::result::Result::ok).ok_or(Error::ReadbackDenied { stage: "readback_tokens" })?;
        let data = slice.get_mapped_range();
        let values: Vec<u32> = bytemuck::cast_slice::<u8, u32>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(values)
    }
}
