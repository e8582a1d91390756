//! Test-only scaffolding shared across unit tests: a [`RawKernels`]
//! implementation that panics if actually dispatched, used purely to
//! instantiate generic facades (`KernelOps<K>`, `Sampler<K>`, ...) in
//! tests that only exercise the pure-Rust paths around them.

use crate::kernels::{
    ActivationArgs, AddArgs, ArgmaxArgs, AttentionArgs, CastArgs, GatherArgs, MatmulArgs, MoeGatherArgs,
    MoeRouteArgs, MoeScatterArgs, RawKernels, RmsNormArgs, RopeArgs,
};

pub struct NullKernels;

impl RawKernels for NullKernels {
    fn dispatch_matmul(&self, _pass: &mut wgpu::ComputePass<'_>, _args: MatmulArgs<'_>) {
        unreachable!("NullKernels is for type instantiation in unit tests only")
    }
    fn dispatch_rmsnorm(&self, _pass: &mut wgpu::ComputePass<'_>, _args: RmsNormArgs<'_>) {
        unreachable!()
    }
    fn dispatch_rope(&self, _pass: &mut wgpu::ComputePass<'_>, _args: RopeArgs<'_>) {
        unreachable!()
    }
    fn dispatch_attention(&self, _pass: &mut wgpu::ComputePass<'_>, _args: AttentionArgs<'_>) {
        unreachable!()
    }
    fn dispatch_activation(&self, _pass: &mut wgpu::ComputePass<'_>, _args: ActivationArgs<'_>) {
        unreachable!()
    }
    fn dispatch_gather(&self, _pass: &mut wgpu::ComputePass<'_>, _args: GatherArgs<'_>) {
        unreachable!()
    }
    fn dispatch_argmax(&self, _pass: &mut wgpu::ComputePass<'_>, _args: ArgmaxArgs<'_>) {
        unreachable!()
    }
    fn dispatch_cast(&self, _pass: &mut wgpu::ComputePass<'_>, _args: CastArgs<'_>) {
        unreachable!()
    }
    fn dispatch_add(&self, _pass: &mut wgpu::ComputePass<'_>, _args: AddArgs<'_>) {
        unreachable!()
    }
    fn dispatch_moe_route(&self, _pass: &mut wgpu::ComputePass<'_>, _args: MoeRouteArgs<'_>) {
        unreachable!()
    }
    fn dispatch_moe_gather(&self, _pass: &mut wgpu::ComputePass<'_>, _args: MoeGatherArgs<'_>) {
        unreachable!()
    }
    fn dispatch_moe_scatter_add(&self, _pass: &mut wgpu::ComputePass<'_>, _args: MoeScatterArgs<'_>) {
        unreachable!()
    }
}
