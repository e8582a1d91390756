//! Layer Pipeline (C7): a compiled plan of typed ops over named slots,
//! decoupling architectural variants (post-attention vs. sandwich norms)
//! from kernel code (§4.6).

use std::collections::HashSet;

use crate::error::{Error, Result};

pub type SlotId = String;

#[derive(Clone, Debug)]
pub enum PlanOp {
    Save { slot: SlotId },
    Load { slot: SlotId },
    RmsNorm { src: SlotId, dst: SlotId, weight: String, residual: Option<SlotId> },
    Attention { src: SlotId, dst: SlotId, residual: Option<SlotId>, skip_input_norm: bool },
    Ffn { src: SlotId, dst: SlotId, variant: FfnVariant },
    ResidualAdd { a: SlotId, b: SlotId, dst: SlotId },
    Noop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FfnVariant {
    Auto,
    Dense,
    Moe,
}

pub const DEFAULT_SLOT: &str = "state";
pub const RESIDUAL_SLOT: &str = "residual";

/// An ordered list of [`PlanOp`]s, already checked for slot-lifetime
/// safety (every read references a slot previously written on this path).
#[derive(Clone, Debug)]
pub struct CompiledPlan {
    ops: Vec<PlanOp>,
}

impl CompiledPlan {
    pub fn ops(&self) -> &[PlanOp] {
        &self.ops
    }
}

fn op_reads(op: &PlanOp) -> Vec<&SlotId> {
    match op {
        PlanOp::Save { slot } => vec![slot],
        PlanOp::Load { .. } => vec![],
        PlanOp::RmsNorm { src, residual, .. } => {
            let mut r = vec![src];
            r.extend(residual.iter());
            r
        }
        PlanOp::Attention { src, residual, .. } => {
            let mut r = vec![src];
            r.extend(residual.iter());
            r
        }
        PlanOp::Ffn { src, .. } => vec![src],
        PlanOp::ResidualAdd { a, b, .. } => vec![a, b],
        PlanOp::Noop => vec![],
    }
}

fn op_writes(op: &PlanOp) -> Vec<&SlotId> {
    match op {
        PlanOp::Save { .. } => vec![],
        PlanOp::Load { slot } => vec![slot],
        PlanOp::RmsNorm { dst, .. } => vec![dst],
        PlanOp::Attention { dst, .. } => vec![dst],
        PlanOp::Ffn { dst, .. } => vec![dst],
        PlanOp::ResidualAdd { dst, .. } => vec![dst],
        PlanOp::Noop => vec![],
    }
}

/// Compiles `ops` into a [`CompiledPlan`], seeding the known-written set
/// with `{state}` (the input activation slot every layer starts from).
/// Fails with `UndefinedSlot` the first time an op reads a slot nothing
/// before it has written (§8 "Layer plan safety").
pub fn compile(ops: Vec<PlanOp>) -> Result<CompiledPlan> {
    let mut written: HashSet<SlotId> = HashSet::new();
    written.insert(DEFAULT_SLOT.to_string());

    for op in &ops {
        for read in op_reads(op) {
            if !written.contains(read) {
                return Err(Error::UndefinedSlot { slot: read.clone() });
            }
        }
        for write in op_writes(op) {
            written.insert(write.clone());
        }
    }
    Ok(CompiledPlan { ops })
}

/// The default post-attention-norm layer: `attn(norm(state))`, residual
/// add, then `ffn(norm(state))`, residual add.
pub fn default_layer_plan() -> Vec<PlanOp> {
    vec![
        PlanOp::Save { slot: RESIDUAL_SLOT.to_string() },
        PlanOp::RmsNorm { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), weight: "attn_norm".to_string(), residual: None },
        PlanOp::Attention { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), residual: Some(RESIDUAL_SLOT.to_string()), skip_input_norm: true },
        PlanOp::ResidualAdd { a: DEFAULT_SLOT.to_string(), b: RESIDUAL_SLOT.to_string(), dst: DEFAULT_SLOT.to_string() },
        PlanOp::Save { slot: RESIDUAL_SLOT.to_string() },
        PlanOp::RmsNorm { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), weight: "ffn_norm".to_string(), residual: None },
        PlanOp::Ffn { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), variant: FfnVariant::Auto },
        PlanOp::ResidualAdd { a: DEFAULT_SLOT.to_string(), b: RESIDUAL_SLOT.to_string(), dst: DEFAULT_SLOT.to_string() },
    ]
}

/// Gemma-style "sandwich norm": an extra post-attention and
/// post-feedforward RMSNorm before each residual add, selectable per
/// layer via an override (§4.6).
pub fn sandwich_norm_layer_plan() -> Vec<PlanOp> {
    vec![
        PlanOp::Save { slot: RESIDUAL_SLOT.to_string() },
        PlanOp::RmsNorm { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), weight: "attn_norm".to_string(), residual: None },
        PlanOp::Attention { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), residual: None, skip_input_norm: true },
        PlanOp::RmsNorm { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), weight: "post_attn_norm".to_string(), residual: None },
        PlanOp::ResidualAdd { a: DEFAULT_SLOT.to_string(), b: RESIDUAL_SLOT.to_string(), dst: DEFAULT_SLOT.to_string() },
        PlanOp::Save { slot: RESIDUAL_SLOT.to_string() },
        PlanOp::RmsNorm { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), weight: "pre_ffn_norm".to_string(), residual: None },
        PlanOp::Ffn { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), variant: FfnVariant::Auto },
        PlanOp::RmsNorm { src: DEFAULT_SLOT.to_string(), dst: DEFAULT_SLOT.to_string(), weight: "post_ffn_norm".to_string(), residual: None },
        PlanOp::ResidualAdd { a: DEFAULT_SLOT.to_string(), b: RESIDUAL_SLOT.to_string(), dst: DEFAULT_SLOT.to_string() },
    ]
}

/// Per-layer plan selection: most layers use `default`, a subset named by
/// index may override with a different compiled plan entirely.
pub struct LayerPlanSet {
    pub default: CompiledPlan,
    pub overrides: std::collections::HashMap<u32, CompiledPlan>,
}

impl LayerPlanSet {
    pub fn plan_for(&self, layer: u32) -> &CompiledPlan {
        self.overrides.get(&layer).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_compiles() {
        assert!(compile(default_layer_plan()).is_ok());
    }

    #[test]
    fn sandwich_plan_compiles() {
        assert!(compile(sandwich_norm_layer_plan()).is_ok());
    }

    #[test]
    fn reading_undefined_slot_fails() {
        let ops = vec![PlanOp::RmsNorm { src: "ghost".to_string(), dst: DEFAULT_SLOT.to_string(), weight: "w".to_string(), residual: None }];
        let err = compile(ops).unwrap_err();
        assert!(matches!(err, Error::UndefinedSlot { slot } if slot == "ghost"));
    }

    #[test]
    fn writing_then_reading_same_slot_ok() {
        let ops = vec![
            PlanOp::Save { slot: "tmp".to_string() },
            PlanOp::ResidualAdd { a: DEFAULT_SLOT.to_string(), b: "tmp".to_string(), dst: DEFAULT_SLOT.to_string() },
        ];
        assert!(compile(ops).is_ok());
    }
}
