//! Per-token decoder-only transformer inference core on a WebGPU-class
//! compute device: kernel dispatch orchestration, KV cache management,
//! optional mixture-of-experts routing, and command recording for batched
//! decode.
//!
//! The Weight Loader, Tokenizer, Manifest/Config parsing, and Kernel
//! Backend (the compiled compute kernels themselves) are external
//! collaborators; this crate consumes them through [`weights::WeightSource`]
//! and [`kernels::RawKernels`] rather than implementing them.

pub mod attention;
pub mod config;
pub mod context;
pub mod decode_ring;
pub mod dequant_cache;
pub mod driver;
pub mod error;
pub mod ffn;
pub mod kernels;
pub mod kv_cache;
pub mod layer_plan;
pub mod pool;
pub mod probes;
pub mod recorder;
pub mod rope;
pub mod sampler;
pub mod tensor;
pub mod weights;

#[cfg(test)]
mod tests_support;

pub use config::ModelConfig;
pub use context::{build_model_weights, Context, ConversationKey, StepContext};
pub use driver::{ForwardDriver, LayerWeights, ModelWeights};
pub use error::{Error, Result};
pub use kernels::{KernelOps, RawKernels};
pub use sampler::SamplingParams;
pub use tensor::DType;
