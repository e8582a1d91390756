//! Tensor handles and the dtype/ownership tags carried alongside every
//! device-resident buffer.
//!
//! Resource handles follow `webgpu::Buffer`'s shape:
//! a small `Copy` struct wrapping a `wgpu::Buffer` plus enough metadata
//! (size, dtype) for kernels to validate without touching the GPU.

use std::sync::Arc;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DType {
    F16,
    F32,
}

impl DType {
    pub fn size_of(self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Row,
    Column,
}

/// Rank-bounded shape, matching the data model's "rank ≤ 4" invariant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        assert!(dims.len() <= 4, "tensor rank must be <= 4, got {}", dims.len());
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }
}

/// Who releases the backing `wgpu::Buffer` when this tensor is dropped.
enum Backing {
    /// Released directly on drop.
    Owned(wgpu::Buffer),
    /// Released back to a pool bucket on drop.
    Pooled { buffer: wgpu::Buffer, pool: Arc<crate::pool::BufferPool> },
    /// A view into a buffer this tensor does not own (e.g. a weight,
    /// or a slice of a larger decode-ring buffer). Never released here.
    Borrowed(wgpu::Buffer),
}

/// A typed, device-resident view: owning or borrowing a byte range with
/// a dtype, a shape, and a debug label.
///
/// Tensors never hold element arrays on the host once uploaded — all
/// numeric content lives in the `wgpu::Buffer`.
pub struct Tensor {
    backing: Backing,
    dtype: DType,
    shape: Shape,
    label: String,
}

impl Tensor {
    pub fn owned(buffer: wgpu::Buffer, dtype: DType, shape: Shape, label: impl Into<String>) -> Self {
        Tensor { backing: Backing::Owned(buffer), dtype, shape, label: label.into() }
    }

    pub fn pooled(
        buffer: wgpu::Buffer,
        pool: Arc<crate::pool::BufferPool>,
        dtype: DType,
        shape: Shape,
        label: impl Into<String>,
    ) -> Self {
        Tensor { backing: Backing::Pooled { buffer, pool }, dtype, shape, label: label.into() }
    }

    pub fn borrowed(buffer: wgpu::Buffer, dtype: DType, shape: Shape, label: impl Into<String>) -> Self {
        Tensor { backing: Backing::Borrowed(buffer), dtype, shape, label: label.into() }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        match &self.backing {
            Backing::Owned(b) => b,
            Backing::Pooled { buffer, .. } => buffer,
            Backing::Borrowed(b) => b,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn byte_len(&self) -> u64 {
        (self.shape.numel() * self.dtype.size_of()) as u64
    }

    /// True if dropping this tensor hands its buffer back to a pool rather
    /// than freeing the underlying `wgpu::Buffer` immediately.
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled { .. })
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if let Backing::Pooled { buffer, pool } = &self.backing {
            // Buffer is cloned out (wgpu::Buffer is Arc-backed internally)
            // so the pool can reuse it; this tensor's handle is discarded.
            pool.release(buffer.clone());
        }
    }
}

/// MoE expert weight bundle, GPT-OSS MXFP4 layout (§3 Weight Buffer).
#[derive(Clone)]
pub struct ExpertWeights {
    pub gate_up_blocks: wgpu::Buffer,
    pub gate_up_scales: wgpu::Buffer,
    pub gate_up_bias: Option<wgpu::Buffer>,
    pub down_blocks: wgpu::Buffer,
    pub down_scales: wgpu::Buffer,
    pub down_bias: Option<wgpu::Buffer>,
}

/// A weight tensor with model-scoped lifetime plus layout/dtype metadata.
/// MoE experts additionally carry `ExpertWeights`; dense weights do not.
pub struct WeightBuffer {
    pub tensor: Tensor,
    pub layout: Layout,
    pub format: WeightFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightFormat {
    F16,
    F32,
    Mxfp4Packed,
}

/// Host-resident fallback weight (CPU-only path, §9 design note: a tagged
/// variant replaces runtime `instanceof` checks against GPU vs CPU weights).
pub struct HostTensor {
    pub data: Vec<f32>,
    pub shape: Shape,
}

/// Exhaustive tag distinguishing where a weight actually lives, replacing
/// the source's runtime `instanceof GPUBuffer` checks (design note §9).
pub enum ResidentTensor {
    Device(Tensor),
    Host(HostTensor),
    Packed(ExpertWeights),
}
