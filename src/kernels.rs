//! Kernel Ops Facade (C4): a dtype-aware wrapper over the compiled
//! compute kernels (matmul, RMSNorm, RoPE, attention, activation, gather,
//! sampling, cast). The kernels themselves are an external collaborator
//! (§1: "Kernel Backend") supplied by the host application; this module
//! only validates shapes/dtypes and exposes both a `record_*` variant
//! (append to a caller-owned recorder) and a `run_*` convenience variant
//! (opens its own recorder and `submit_and_wait`s) for every op, mirroring
//! the split in `webgpu::pipeline`'s `with_error_scope` helper around
//! pipeline creation.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::recorder::CommandRecorder;
use crate::tensor::DType;

/// The raw dispatch surface a concrete kernel backend implements. This is
/// the out-of-scope "Kernel Backend" collaborator (§1); the facade below
/// is what the rest of the core actually calls.
pub trait RawKernels: Send + Sync {
    fn dispatch_matmul(&self, pass: &mut wgpu::ComputePass<'_>, args: MatmulArgs<'_>);
    fn dispatch_rmsnorm(&self, pass: &mut wgpu::ComputePass<'_>, args: RmsNormArgs<'_>);
    fn dispatch_rope(&self, pass: &mut wgpu::ComputePass<'_>, args: RopeArgs<'_>);
    fn dispatch_attention(&self, pass: &mut wgpu::ComputePass<'_>, args: AttentionArgs<'_>);
    fn dispatch_activation(&self, pass: &mut wgpu::ComputePass<'_>, args: ActivationArgs<'_>);
    fn dispatch_gather(&self, pass: &mut wgpu::ComputePass<'_>, args: GatherArgs<'_>);
    fn dispatch_argmax(&self, pass: &mut wgpu::ComputePass<'_>, args: ArgmaxArgs<'_>);
    fn dispatch_cast(&self, pass: &mut wgpu::ComputePass<'_>, args: CastArgs<'_>);
    fn dispatch_add(&self, pass: &mut wgpu::ComputePass<'_>, args: AddArgs<'_>);
    fn dispatch_moe_route(&self, pass: &mut wgpu::ComputePass<'_>, args: MoeRouteArgs<'_>);
    fn dispatch_moe_gather(&self, pass: &mut wgpu::ComputePass<'_>, args: MoeGatherArgs<'_>);
    fn dispatch_moe_scatter_add(&self, pass: &mut wgpu::ComputePass<'_>, args: MoeScatterArgs<'_>);
}

pub struct MoeRouteArgs<'a> {
    pub logits: &'a wgpu::Buffer,
    pub bias: Option<&'a wgpu::Buffer>,
    pub indices_out: &'a wgpu::Buffer,
    pub weights_out: &'a wgpu::Buffer,
    pub num_tokens: u32,
    pub num_experts: u32,
    pub top_k: u32,
    pub normalize_after_topk: bool,
}

pub struct MoeGatherArgs<'a> {
    pub input: &'a wgpu::Buffer,
    pub indices: &'a wgpu::Buffer,
    pub gathered_out: &'a wgpu::Buffer,
    pub token_counts_out: &'a wgpu::Buffer,
    pub token_map_out: &'a wgpu::Buffer,
    pub num_tokens: u32,
    pub top_k: u32,
    pub num_experts: u32,
    pub hidden_dim: u32,
    pub max_per_expert: u32,
}

pub struct MoeScatterArgs<'a> {
    pub expert_outputs: &'a wgpu::Buffer,
    pub token_map: &'a wgpu::Buffer,
    pub route_weights: &'a wgpu::Buffer,
    pub out: &'a wgpu::Buffer,
    pub num_tokens: u32,
    pub top_k: u32,
    pub num_experts: u32,
    pub hidden_dim: u32,
    pub max_per_expert: u32,
}

pub struct MatmulArgs<'a> {
    pub a: &'a wgpu::Buffer,
    pub b: &'a wgpu::Buffer,
    pub out: &'a wgpu::Buffer,
    /// Byte offset into `out` where this dispatch's `[m, n]` result
    /// lands (MoE per-expert dispatches all write into disjoint slot
    /// ranges of one shared `expert_out` buffer rather than allocating
    /// per-expert, mirroring `GatherArgs::indices_offset`).
    pub out_offset: u64,
    pub bias: Option<&'a wgpu::Buffer>,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub dtype: DType,
    /// When set, the kernel adds `residual` to its own output in the same
    /// dispatch and the caller must skip a separate residual-add (§4.4.7).
    pub fused_residual: Option<&'a wgpu::Buffer>,
}

pub struct RmsNormArgs<'a> {
    pub input: &'a wgpu::Buffer,
    pub weight: &'a wgpu::Buffer,
    pub out: &'a wgpu::Buffer,
    pub rows: u32,
    pub dim: u32,
    pub eps: f32,
    pub weight_offset_one: bool,
}

pub struct RopeArgs<'a> {
    pub q: &'a wgpu::Buffer,
    pub k: &'a wgpu::Buffer,
    pub cos: &'a wgpu::Buffer,
    pub sin: &'a wgpu::Buffer,
    pub start_pos: u32,
    pub num_tokens: u32,
    pub num_q_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
}

pub struct AttentionArgs<'a> {
    pub q: &'a wgpu::Buffer,
    pub k: &'a wgpu::Buffer,
    pub v: &'a wgpu::Buffer,
    pub out: &'a wgpu::Buffer,
    pub num_q_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub seq_len: u32,
    pub start_pos_for_mask: u32,
    pub sliding_window: Option<u32>,
    pub softcap: Option<f32>,
    pub scale: f32,
}

pub struct ActivationArgs<'a> {
    /// `None` for an ungated activation (`act(up)`); `Some` applies the
    /// GLU product `act(gate) * up` (§6 `gated_activation`).
    pub gate: Option<&'a wgpu::Buffer>,
    pub up: &'a wgpu::Buffer,
    pub out: &'a wgpu::Buffer,
    pub rows: u32,
    pub dim: u32,
    pub kind: crate::config::ActivationKind,
    pub clamp: Option<f32>,
}

pub struct GatherArgs<'a> {
    pub table: &'a wgpu::Buffer,
    pub indices: &'a wgpu::Buffer,
    /// Byte offset into `indices` where this dispatch's index list starts
    /// (ring-batched decode reads one index per step out of a shared
    /// tokens buffer rather than allocating a fresh one-element buffer).
    pub indices_offset: u64,
    pub out: &'a wgpu::Buffer,
    pub num_indices: u32,
    pub row_dim: u32,
}

pub struct ArgmaxArgs<'a> {
    pub logits: &'a wgpu::Buffer,
    pub logits_offset: u64,
    pub out_token: &'a wgpu::Buffer,
    pub out_offset: u64,
    pub vocab_size: u32,
    pub softcap: Option<f32>,
}

pub struct CastArgs<'a> {
    pub src: &'a wgpu::Buffer,
    pub dst: &'a wgpu::Buffer,
    pub count: u32,
    pub src_dtype: DType,
    pub dst_dtype: DType,
}

/// Plain elementwise `out = a + b`, used for the `residual_add` plan op
/// whenever the preceding stage did not already fuse its own residual
/// add (§4.6).
pub struct AddArgs<'a> {
    pub a: &'a wgpu::Buffer,
    pub b: &'a wgpu::Buffer,
    pub out: &'a wgpu::Buffer,
    pub count: u32,
}

fn expect_dtype(expected: DType, found: DType) -> Result<()> {
    if expected != found {
        return Err(Error::DtypeMismatch { expected, found });
    }
    Ok(())
}

/// Dtype-validating facade over a [`RawKernels`] backend. Every method
/// comes in a `record_*` (append to `recorder`) and `run_*` (open a
/// scratch recorder, dispatch, `submit_and_wait`) pair.
pub struct KernelOps<K: RawKernels> {
    backend: K,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pool: Arc<BufferPool>,
}

impl<K: RawKernels> KernelOps<K> {
    pub fn new(backend: K, device: wgpu::Device, queue: wgpu::Queue, pool: Arc<BufferPool>) -> Self {
        KernelOps { backend, device, queue, pool }
    }

    fn scratch_recorder(&self, label: &str) -> CommandRecorder {
        CommandRecorder::new(self.device.clone(), self.queue.clone(), self.pool.clone(), label)
    }

    pub fn record_matmul(&self, recorder: &mut CommandRecorder, args: MatmulArgs<'_>, label: &str) -> Result<()> {
        let mut pass = recorder.begin_compute_pass(label)?;
        self.backend.dispatch_matmul(&mut pass, args);
        Ok(())
    }

    pub fn run_matmul(&self, args: MatmulArgs<'_>) -> Result<()> {
        let mut recorder = self.scratch_recorder("kernel-matmul");
        self.record_matmul(&mut recorder, args, "matmul")?;
        recorder.submit_and_wait()?;
        Ok(())
    }

    pub fn record_rmsnorm(&self, recorder: &mut CommandRecorder, args: RmsNormArgs<'_>, label: &str) -> Result<()> {
        let mut pass = recorder.begin_compute_pass(label)?;
        self.backend.dispatch_rmsnorm(&mut pass, args);
        Ok(())
    }

    pub fn run_rmsnorm(&self, args: RmsNormArgs<'_>) -> Result<()> {
        let mut recorder = self.scratch_recorder("kernel-rmsnorm");
        self.record_rmsnorm(&mut recorder, args, "rmsnorm")?;
        recorder.submit_and_wait()?;
        Ok(())
    }

    /// RoPE rotates Q and K in place; caller guarantees both buffers hold
    /// `num_tokens * {num_q_heads,num_kv_heads} * head_dim` elements.
    pub fn record_rope(&self, recorder: &mut CommandRecorder, args: RopeArgs<'_>) -> Result<()> {
        if args.head_dim % 2 != 0 {
            return Err(Error::ShapeMismatch { expected: vec![2], found: vec![args.head_dim as usize % 2] });
        }
        let mut pass = recorder.begin_compute_pass("rope")?;
        self.backend.dispatch_rope(&mut pass, args);
        Ok(())
    }

    pub fn record_attention(&self, recorder: &mut CommandRecorder, args: AttentionArgs<'_>) -> Result<()> {
        if args.num_q_heads % args.num_kv_heads != 0 {
            return Err(Error::ShapeMismatch { expected: vec![args.num_kv_heads as usize], found: vec![args.num_q_heads as usize] });
        }
        let mut pass = recorder.begin_compute_pass("attention")?;
        self.backend.dispatch_attention(&mut pass, args);
        Ok(())
    }

    pub fn record_activation(&self, recorder: &mut CommandRecorder, args: ActivationArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("activation")?;
        self.backend.dispatch_activation(&mut pass, args);
        Ok(())
    }

    pub fn record_gather(&self, recorder: &mut CommandRecorder, args: GatherArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("gather")?;
        self.backend.dispatch_gather(&mut pass, args);
        Ok(())
    }

    pub fn record_argmax(&self, recorder: &mut CommandRecorder, args: ArgmaxArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("argmax")?;
        self.backend.dispatch_argmax(&mut pass, args);
        Ok(())
    }

    /// Softmax + top-k over router logits, yielding `[N,k]` indices and
    /// weights (§4.5 MoE step 2).
    pub fn record_moe_route(&self, recorder: &mut CommandRecorder, args: MoeRouteArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("moe-route")?;
        self.backend.dispatch_moe_route(&mut pass, args);
        Ok(())
    }

    /// Gathers routed tokens into per-expert slot ranges (§4.5 step 3).
    /// Callers that need CPU-side overflow detection read back
    /// `token_counts_out` after `submit_and_wait`; the GPU-native variant
    /// (§4.5 step 4) never reads it back and instead runs every expert
    /// with a fixed row budget.
    pub fn record_moe_gather(&self, recorder: &mut CommandRecorder, args: MoeGatherArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("moe-gather")?;
        self.backend.dispatch_moe_gather(&mut pass, args);
        Ok(())
    }

    /// Weighted scatter-add of per-expert outputs back to token rows
    /// (§4.5 step 6).
    pub fn record_moe_scatter_add(&self, recorder: &mut CommandRecorder, args: MoeScatterArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("moe-scatter-add")?;
        self.backend.dispatch_moe_scatter_add(&mut pass, args);
        Ok(())
    }

    pub fn record_add(&self, recorder: &mut CommandRecorder, args: AddArgs<'_>) -> Result<()> {
        let mut pass = recorder.begin_compute_pass("residual-add")?;
        self.backend.dispatch_add(&mut pass, args);
        Ok(())
    }

    pub fn record_cast(&self, recorder: &mut CommandRecorder, args: CastArgs<'_>) -> Result<()> {
        expect_dtype(args.src_dtype, args.src_dtype)?;
        if args.src_dtype == args.dst_dtype {
            recorder.copy_buffer_to_buffer(args.src, 0, args.dst, 0, (args.count as u64) * args.src_dtype.size_of() as u64)?;
            return Ok(());
        }
        let mut pass = recorder.begin_compute_pass("cast")?;
        self.backend.dispatch_cast(&mut pass, args);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_mismatch_reported() {
        let err = expect_dtype(DType::F16, DType::F32).unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { expected: DType::F16, found: DType::F32 }));
    }
}
