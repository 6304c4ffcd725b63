//! Voxel cone tracing: voxelize the lit scene into a 3D texture, build its
//! mip chain and trace diffuse cones from every G-buffer texel.

use windows::Win32::Graphics::Direct3D12::*;

use super::{FrameInputs, PassContext, RenderPass, Targets, VOXEL_GRID_SIZE, VOXEL_MIPS, missing_view, read};
use crate::dx12::heap::cpu;
use crate::dx12::pipeline::{
    GraphicsPipelineDesc, InputLayout, Pipeline, Range, RootParam, RootSignatureDesc, ShaderCompiler, StaticSampler,
};
use crate::error::Result;
use crate::graph::PassId;
use crate::resource::ResourceState;

const VOXEL_GROUP: u32 = 4;
const TRACE_GROUP: u32 = 8;

fn groups(size: u32, group: u32) -> u32 {
    size.div_ceil(group).max(1)
}

/// Renders the scene once per major axis into a 64^3 grid, writing lit
/// albedo from the pixel shader through a UAV.
pub struct VctVoxelizePass {
    pipeline: Pipeline,
}

impl VctVoxelizePass {
    const AXIS: u32 = 2;
    const TABLE: u32 = 3;

    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let vs = compiler.compile("vct_voxelize.hlsl", "VSMain", "vs_5_1")?;
        let ps = compiler.compile("vct_voxelize.hlsl", "PSMain", "ps_5_1")?;
        let root = RootSignatureDesc::new(vec![
            RootParam::Cbv { register: 0, space: 0 },
            RootParam::Cbv { register: 1, space: 0 },
            RootParam::Constants { register: 2, count: 1 },
            RootParam::Table(vec![Range::uav(0, 1), Range::srv(0, 1)]),
        ])
        .with_samplers(&[StaticSampler::Shadow(1)])
        .with_input_assembler();
        let pipeline = Pipeline::graphics(
            device,
            &root,
            &GraphicsPipelineDesc {
                input: InputLayout::Mesh,
                ..GraphicsPipelineDesc::new(&vs, Some(&ps), &[])
            },
        )?;
        Ok(Self { pipeline })
    }
}

impl RenderPass for VctVoxelizePass {
    fn id(&self) -> PassId {
        PassId::VctVoxelize
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        let shadow = if inputs.gi.shadows {
            read(&mut targets.shadow_map, ctx.barriers, ResourceState::PixelShaderResource)?
        } else {
            targets.null.texture_2d
        };
        let voxels = &mut targets.voxels;
        voxels.transition_to(ctx.barriers, ResourceState::UnorderedAccess);
        let uav = voxels.uav(0).ok_or_else(|| missing_view(voxels, "UAV"))?;
        ctx.flush_barriers()?;

        let table = ctx.stage(&[uav, shadow])?;
        unsafe {
            ctx.list
                .ClearUnorderedAccessViewFloat(table, cpu(uav), voxels.resource(), &[0.0; 4], None);
        }
        // The clear and the voxel writes both go through the UAV.
        voxels.uav_barrier(ctx.barriers);
        ctx.flush_barriers()?;

        ctx.set_viewport(VOXEL_GRID_SIZE, VOXEL_GRID_SIZE);
        unsafe { ctx.list.OMSetRenderTargets(0, None, false, None) };
        self.pipeline.bind_graphics(ctx.list);
        unsafe {
            ctx.list.SetGraphicsRootConstantBufferView(0, ctx.frame_constants);
            ctx.list.SetGraphicsRootDescriptorTable(Self::TABLE, table);
        }
        for axis in 0..3u32 {
            unsafe { ctx.list.SetGraphicsRoot32BitConstant(Self::AXIS, axis, 0) };
            crate::dx12::mesh::draw_models(ctx.list, inputs.meshes, inputs.models);
        }
        Ok(())
    }
}

/// Box-filters each mip of the voxel grid from the one above it.
pub struct VctMipmapPass {
    pipeline: Pipeline,
}

impl VctMipmapPass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let cs = compiler.compile("vct_mipmap.hlsl", "CSMain", "cs_5_1")?;
        let root = RootSignatureDesc::new(vec![RootParam::Table(vec![Range::uav(0, 2)])]);
        Ok(Self {
            pipeline: Pipeline::compute(device, &root, &cs)?,
        })
    }
}

impl RenderPass for VctMipmapPass {
    fn id(&self) -> PassId {
        PassId::VctMipmap
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, _inputs: &FrameInputs<'_>) -> Result<()> {
        let voxels = &mut targets.voxels;
        voxels.transition_to(ctx.barriers, ResourceState::UnorderedAccess);

        self.pipeline.bind_compute(ctx.list);
        for mip in 1..VOXEL_MIPS {
            voxels.uav_barrier(ctx.barriers);
            ctx.flush_barriers()?;

            let src = voxels.uav(mip - 1).ok_or_else(|| missing_view(voxels, "UAV"))?;
            let dst = voxels.uav(mip).ok_or_else(|| missing_view(voxels, "UAV"))?;
            let table = ctx.stage(&[src, dst])?;
            let size = groups(VOXEL_GRID_SIZE >> mip, VOXEL_GROUP);
            unsafe {
                ctx.list.SetComputeRootDescriptorTable(0, table);
                ctx.list.Dispatch(size, size, size);
            }
        }
        voxels.uav_barrier(ctx.barriers);
        Ok(())
    }
}

/// Traces a fan of diffuse cones through the voxel mips per pixel.
pub struct VctTracePass {
    pipeline: Pipeline,
}

impl VctTracePass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let cs = compiler.compile("vct_trace.hlsl", "CSMain", "cs_5_1")?;
        let root = RootSignatureDesc::new(vec![
            RootParam::Cbv { register: 0, space: 0 },
            RootParam::Table(vec![Range::srv(0, 3), Range::uav(0, 1)]),
        ])
        .with_samplers(&[StaticSampler::Linear(0)]);
        Ok(Self {
            pipeline: Pipeline::compute(device, &root, &cs)?,
        })
    }
}

impl RenderPass for VctTracePass {
    fn id(&self) -> PassId {
        PassId::VctTrace
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, _inputs: &FrameInputs<'_>) -> Result<()> {
        let state = ResourceState::NonPixelShaderResource;
        let normal = read(&mut targets.normal, ctx.barriers, state)?;
        let position = read(&mut targets.position, ctx.barriers, state)?;
        let voxels = read(&mut targets.voxels, ctx.barriers, state)?;
        let indirect = &mut targets.vct_indirect;
        indirect.transition_to(ctx.barriers, ResourceState::UnorderedAccess);
        let output = indirect.uav(0).ok_or_else(|| missing_view(indirect, "UAV"))?;
        ctx.flush_barriers()?;

        let table = ctx.stage(&[normal, position, voxels, output])?;
        self.pipeline.bind_compute(ctx.list);
        unsafe {
            ctx.list.SetComputeRootConstantBufferView(0, ctx.frame_constants);
            ctx.list.SetComputeRootDescriptorTable(1, table);
            ctx.list
                .Dispatch(groups(ctx.width, TRACE_GROUP), groups(ctx.height, TRACE_GROUP), 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mip_gets_at_least_one_group() {
        let sizes: Vec<u32> = (0..VOXEL_MIPS)
            .map(|mip| groups(VOXEL_GRID_SIZE >> mip, VOXEL_GROUP))
            .collect();
        assert_eq!(sizes, vec![16, 8, 4, 2, 1, 1]);
        assert_eq!(groups(1921, TRACE_GROUP), 241);
    }
}
