//! Model and runtime configuration (§6). Plain structs with public fields,
//! grounded on `webgpu::ContextDesc`/`BufferDesc`: no builder, no
//! trait-object config backend, just data validated once at construction.
//!
//! Per SPEC_FULL.md §9 decision: the surface carries only numeric/enum
//! fields describing shapes and behavior, never a model "family" flag.
//! Family-specific behavior (e.g. Gemma's sandwich norm) is expressed by
//! the values these fields take, combined with per-layer plan overrides
//! in `layer_plan`, not by branching on a family tag anywhere downstream.

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RopeScaling {
    Linear { factor: f32 },
    Yarn { factor: f32, beta_fast: f32, beta_slow: f32, original_max_pos: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RopeConfig {
    pub theta: f32,
    /// Set when layers alternate between a global and a local theta
    /// (Gemma-style interleaved sliding/global attention).
    pub local_theta: Option<f32>,
    pub scaling: Option<RopeScaling>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttentionConfig {
    pub num_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    /// Per-head RMSNorm applied to Q and K before RoPE (Qwen3/Gemma2 style).
    pub qk_norm: bool,
    /// Logit softcap applied before the softmax, `None` to disable.
    pub attn_softcap: Option<f32>,
    pub scale: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NormKind {
    RmsNorm,
    LayerNorm,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizationConfig {
    pub kind: NormKind,
    pub eps: f32,
    /// Gemma-style `(1 + weight)` scale instead of a plain weight multiply.
    pub zero_centered_gain: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ActivationKind {
    SiLU,
    GeLU,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FfnConfig {
    pub hidden_dim: u32,
    pub activation: ActivationKind,
    /// `true` for SwiGLU/GeGLU (gate and up projections, §6); `false` for
    /// a plain ungated activation over a single up projection.
    pub gated_activation: bool,
    /// Clamp applied to the gate/up projections before multiplying
    /// (GPT-OSS clamps to bound the SwiGLU product).
    pub clamp: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoeConfig {
    pub num_experts: u32,
    pub top_k: u32,
    pub expert_hidden_dim: u32,
    pub activation: ActivationKind,
    /// Same meaning as [`FfnConfig::gated_activation`], applied to
    /// Mixtral-style dense experts (the GPT-OSS MXFP4 path always packs
    /// gate and up into one dequant buffer regardless of this flag).
    pub gated_activation: bool,
    pub clamp: Option<f32>,
    /// Router logits are softmaxed before or after the top-k select.
    pub normalize_after_topk: bool,
    /// Bound on how many tokens a single expert batch may absorb before
    /// overflow tokens are rescheduled into a follow-up pass (§4.6).
    pub max_tokens_per_expert: Option<u32>,
    pub dequant_cache_max_entries: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputConfig {
    pub vocab_size: u32,
    pub logit_softcap: Option<f32>,
    /// Input and output embeddings share storage (Gemma, Qwen).
    pub tied_embeddings: bool,
    /// A sampled id equal to this is as invalid as one `>= vocab_size`
    /// (§7 `NumericInvalid`), `None` when the model has no pad token.
    pub pad_token_id: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerPattern {
    pub num_layers: u32,
    /// `true` at index `i` marks layer `i` as sliding-window attention;
    /// empty means every layer uses full attention.
    pub sliding_layers: Vec<bool>,
    pub sliding_window: u32,
    /// `true` at index `i` marks layer `i` as an MoE layer; empty means
    /// every layer is dense.
    pub moe_layers: Vec<bool>,
}

impl LayerPattern {
    pub fn is_sliding(&self, layer: u32) -> bool {
        self.sliding_layers.get(layer as usize).copied().unwrap_or(false)
    }

    pub fn is_moe(&self, layer: u32) -> bool {
        self.moe_layers.get(layer as usize).copied().unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchingConfig {
    pub decode_ring_capacity: u32,
    pub max_prefill_chunk: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub hidden_dim: u32,
    pub max_seq_len: u32,
    pub attention: AttentionConfig,
    pub normalization: NormalizationConfig,
    pub ffn: FfnConfig,
    pub moe: Option<MoeConfig>,
    pub rope: RopeConfig,
    pub output: OutputConfig,
    pub layers: LayerPattern,
    pub batching: BatchingConfig,
}

impl ModelConfig {
    /// Validates cross-field invariants the individual structs can't
    /// enforce on their own, returning `Error::ConfigIncomplete` naming
    /// the first offending field rather than panicking (SPEC_FULL.md §3).
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim == 0 {
            return Err(Error::ConfigIncomplete { field: "hidden_dim" });
        }
        if self.attention.num_heads == 0 || self.attention.num_kv_heads == 0 {
            return Err(Error::ConfigIncomplete { field: "attention.num_heads" });
        }
        if self.attention.num_heads % self.attention.num_kv_heads != 0 {
            return Err(Error::ConfigIncomplete { field: "attention.num_kv_heads" });
        }
        if self.attention.head_dim == 0 || self.attention.head_dim % 2 != 0 {
            return Err(Error::ConfigIncomplete { field: "attention.head_dim" });
        }
        if self.layers.num_layers == 0 {
            return Err(Error::ConfigIncomplete { field: "layers.num_layers" });
        }
        if !self.layers.sliding_layers.is_empty() && self.layers.sliding_layers.len() as u32 != self.layers.num_layers {
            return Err(Error::ConfigIncomplete { field: "layers.sliding_layers" });
        }
        if !self.layers.moe_layers.is_empty() && self.layers.moe_layers.len() as u32 != self.layers.num_layers {
            return Err(Error::ConfigIncomplete { field: "layers.moe_layers" });
        }
        if self.layers.moe_layers.iter().any(|&m| m) && self.moe.is_none() {
            return Err(Error::ConfigIncomplete { field: "moe" });
        }
        if self.output.vocab_size == 0 {
            return Err(Error::ConfigIncomplete { field: "output.vocab_size" });
        }
        if self.batching.decode_ring_capacity == 0 {
            return Err(Error::ConfigIncomplete { field: "batching.decode_ring_capacity" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ModelConfig {
        ModelConfig {
            hidden_dim: 4096,
            max_seq_len: 8192,
            attention: AttentionConfig {
                num_heads: 32,
                num_kv_heads: 8,
                head_dim: 128,
                qk_norm: false,
                attn_softcap: None,
                scale: None,
            },
            normalization: NormalizationConfig { kind: NormKind::RmsNorm, eps: 1e-5, zero_centered_gain: false },
            ffn: FfnConfig { hidden_dim: 14336, activation: ActivationKind::SiLU, gated_activation: true, clamp: None },
            moe: None,
            rope: RopeConfig { theta: 10000.0, local_theta: None, scaling: None },
            output: OutputConfig { vocab_size: 32000, logit_softcap: None, tied_embeddings: false, pad_token_id: None },
            layers: LayerPattern { num_layers: 32, sliding_layers: vec![], sliding_window: 0, moe_layers: vec![] },
            batching: BatchingConfig { decode_ring_capacity: 8, max_prefill_chunk: 512 },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn mismatched_gqa_heads_rejected() {
        let mut cfg = base_config();
        cfg.attention.num_kv_heads = 7;
        assert!(matches!(cfg.validate(), Err(Error::ConfigIncomplete { field: "attention.num_kv_heads" })));
    }

    #[test]
    fn moe_layers_without_moe_config_rejected() {
        let mut cfg = base_config();
        cfg.layers.moe_layers = vec![true; 32];
        assert!(matches!(cfg.validate(), Err(Error::ConfigIncomplete { field: "moe" })));
    }
}
