//! Light propagation volumes.
//!
//! The injection pass gathers RSM texels into per-cell second-order SH
//! coefficients. Propagation then pushes the SH through the grid in
//! ping-pong fashion, summing every step into the accumulated volume that
//! the lighting pass samples. Each volume stacks its red, green and blue
//! coefficient slabs along Z.

use windows::Win32::Graphics::Direct3D12::*;

use super::{FrameInputs, LPV_SIZE, PassContext, RenderPass, Targets, missing_view, read};
use crate::dx12::pipeline::{Pipeline, Range, RootParam, RootSignatureDesc, ShaderCompiler};
use crate::dx12::{GpuResultExt, Texture};
use crate::error::Result;
use crate::graph::{PassId, Recording};
use crate::resource::ResourceState;

/// Threads per group along each axis, matching `[numthreads(4, 4, 4)]`.
const GROUP_SIZE: u32 = 4;
const GROUPS: u32 = LPV_SIZE / GROUP_SIZE;

fn uav(texture: &Texture) -> Result<crate::descriptor::DescriptorHandle> {
    texture.uav(0).ok_or_else(|| missing_view(texture, "UAV"))
}

pub struct LpvInjectPass {
    pipeline: Pipeline,
}

impl LpvInjectPass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let cs = compiler.compile("lpv_inject.hlsl", "CSMain", "cs_5_1")?;
        let root = RootSignatureDesc::new(vec![
            RootParam::Cbv { register: 0, space: 0 },
            RootParam::Table(vec![Range::srv(0, 3), Range::uav(0, 1)]),
        ]);
        Ok(Self {
            pipeline: Pipeline::compute(device, &root, &cs)?,
        })
    }
}

impl RenderPass for LpvInjectPass {
    fn id(&self) -> PassId {
        PassId::LpvInject
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, _inputs: &FrameInputs<'_>) -> Result<()> {
        let state = ResourceState::NonPixelShaderResource;
        let flux = read(&mut targets.rsm_flux, ctx.barriers, state)?;
        let normal = read(&mut targets.rsm_normal, ctx.barriers, state)?;
        let position = read(&mut targets.rsm_position, ctx.barriers, state)?;
        targets
            .lpv_injected
            .transition_to(ctx.barriers, ResourceState::UnorderedAccess);
        let injected = uav(&targets.lpv_injected)?;
        ctx.flush_barriers()?;

        let table = ctx.stage(&[flux, normal, position, injected])?;
        self.pipeline.bind_compute(ctx.list);
        unsafe {
            ctx.list.SetComputeRootConstantBufferView(0, ctx.frame_constants);
            ctx.list.SetComputeRootDescriptorTable(1, table);
            ctx.list.Dispatch(GROUPS, GROUPS, GROUPS);
        }
        Ok(())
    }
}

/// One root constant at b2: 1 on the first step, which seeds the accumulation.
const STEP_CONSTANTS: u32 = 0;
const STEP_TABLE: u32 = 1;

/// Propagation runs on the direct list so the dispatch can be replayed from
/// a bundle.
pub struct LpvPropagatePass {
    pipeline: Pipeline,
    _bundle_allocator: ID3D12CommandAllocator,
    bundle: ID3D12GraphicsCommandList,
}

impl LpvPropagatePass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let cs = compiler.compile("lpv_propagate.hlsl", "CSMain", "cs_5_1")?;
        let root = RootSignatureDesc::new(vec![
            RootParam::Constants { register: 2, count: 1 },
            RootParam::Table(vec![Range::srv(0, 1), Range::uav(0, 2)]),
        ]);
        let pipeline = Pipeline::compute(device, &root, &cs)?;

        // Root arguments are inherited from the executing list, so the
        // bundle only re-declares the signature and dispatches.
        let (bundle_allocator, bundle) = unsafe {
            let allocator: ID3D12CommandAllocator = device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_BUNDLE)
                .context("CreateCommandAllocator")?;
            let bundle: ID3D12GraphicsCommandList = device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_BUNDLE, &allocator, &pipeline.state)
                .context("CreateCommandList")?;
            bundle.SetComputeRootSignature(&pipeline.root_signature);
            bundle.Dispatch(GROUPS, GROUPS, GROUPS);
            bundle.Close().context("Close")?;
            (allocator, bundle)
        };
        log::debug!("recorded lpv propagation bundle");

        Ok(Self {
            pipeline,
            _bundle_allocator: bundle_allocator,
            bundle,
        })
    }
}

impl RenderPass for LpvPropagatePass {
    fn id(&self) -> PassId {
        PassId::LpvPropagate
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        let replay = inputs.recording(PassId::LpvPropagate) == Some(Recording::Bundle);
        let iterations = inputs.gi.lpv_iterations.max(1);

        self.pipeline.bind_compute(ctx.list);
        for step in 0..iterations {
            let (src, dst) = if step == 0 {
                (&mut targets.lpv_injected, &mut targets.lpv_scratch[0])
            } else {
                let [a, b] = &mut targets.lpv_scratch;
                if step % 2 == 1 { (a, b) } else { (b, a) }
            };
            let src = read(src, ctx.barriers, ResourceState::NonPixelShaderResource)?;
            dst.transition_to(ctx.barriers, ResourceState::UnorderedAccess);
            let dst = uav(dst)?;

            let accumulated = &mut targets.lpv_accumulated;
            if !accumulated.transition_to(ctx.barriers, ResourceState::UnorderedAccess) {
                accumulated.uav_barrier(ctx.barriers);
            }
            let accumulated = uav(accumulated)?;
            ctx.flush_barriers()?;

            let table = ctx.stage(&[src, dst, accumulated])?;
            unsafe {
                ctx.list
                    .SetComputeRoot32BitConstant(STEP_CONSTANTS, u32::from(step == 0), 0);
                ctx.list.SetComputeRootDescriptorTable(STEP_TABLE, table);
                if replay {
                    ctx.list.ExecuteBundle(&self.bundle);
                } else {
                    ctx.list.Dispatch(GROUPS, GROUPS, GROUPS);
                }
            }
        }
        log::trace!("lpv propagated {iterations} step(s){}", if replay { " from bundle" } else { "" });
        Ok(())
    }
}
