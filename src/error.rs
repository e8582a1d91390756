//! Error taxonomy for the inference core.
//!
//! One flat `enum` covers every failure kind named by the component
//! contracts (buffer pool, recorder, KV cache, MoE dataflow, sampler).
//! `Display` is written by hand rather than derived, the same way
//! `webgpu::PlatformError` does it: these are small, enumerable failure
//! surfaces, not library-wide error trees.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A manifest field required by the active configuration was `undefined`.
    ConfigIncomplete { field: &'static str },
    /// No compute device/adapter was available.
    DeviceUnavailable,
    /// A GPU allocation exceeded device limits.
    OutOfMemory { requested_bytes: u64 },
    /// A KV cache write would exceed `max_seq_len` (non-sliding cache only).
    OverflowCapacity { layer: u32, requested: u32, limit: u32 },
    /// A kernel received tensors of mismatched dtype.
    DtypeMismatch { expected: crate::tensor::DType, found: crate::tensor::DType },
    /// A kernel received a tensor of the wrong shape.
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    /// Expert weights did not match the configured `expert_format`.
    FormatMismatch { layer: u32, expert: u32 },
    /// A second `submit()` was attempted on an already-finished recorder.
    RecorderFinalized,
    /// `seq_len <= 0` reached the attention kernel boundary.
    InvalidKvLen { layer: u32, seq_len: i64 },
    /// The caller's external stop signal fired mid-generation.
    Cancelled,
    /// A readback was attempted while a recorder was active (would force a sync).
    ReadbackDenied { stage: &'static str },
    /// The weight loader had no expert for an index the router selected.
    MissingExpert { layer: u32, expert: u32 },
    /// A plan references a slot that was never written on its path.
    UndefinedSlot { slot: String },
    /// Sampler produced a token id outside `[0, vocab_size)`. Recovered once
    /// per session by falling back to CPU sampling for the current step.
    NumericInvalid { token_id: u32, vocab_size: u32 },
    /// A caller addressed a conversation handle that was never opened, or
    /// was already closed.
    UnknownConversation,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigIncomplete { field } => {
                write!(f, "config field `{field}` is required but was not set")
            }
            Error::DeviceUnavailable => write!(f, "no compute device is available"),
            Error::OutOfMemory { requested_bytes } => {
                write!(f, "allocation of {requested_bytes} bytes exceeds device limits")
            }
            Error::OverflowCapacity { layer, requested, limit } => write!(
                f,
                "kv cache layer {layer}: write of {requested} rows exceeds capacity {limit}"
            ),
            Error::DtypeMismatch { expected, found } => {
                write!(f, "dtype mismatch: expected {expected:?}, found {found:?}")
            }
            Error::ShapeMismatch { expected, found } => {
                write!(f, "shape mismatch: expected {expected:?}, found {found:?}")
            }
            Error::FormatMismatch { layer, expert } => write!(
                f,
                "layer {layer} expert {expert}: weight format does not match configured expert_format"
            ),
            Error::RecorderFinalized => write!(f, "command recorder was already submitted"),
            Error::InvalidKvLen { layer, seq_len } => {
                write!(f, "layer {layer}: invalid kv seq_len {seq_len}")
            }
            Error::Cancelled => write!(f, "generation was cancelled"),
            Error::ReadbackDenied { stage } => {
                write!(f, "readback denied at stage `{stage}`: a recorder is active")
            }
            Error::MissingExpert { layer, expert } => {
                write!(f, "layer {layer}: no weights for active expert {expert}")
            }
            Error::UndefinedSlot { slot } => {
                write!(f, "plan reads slot `{slot}` before it is written")
            }
            Error::NumericInvalid { token_id, vocab_size } => write!(
                f,
                "sampled token {token_id} is outside [0, {vocab_size}); falling back to CPU sampling"
            ),
            Error::UnknownConversation => write!(f, "conversation handle is not open"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
