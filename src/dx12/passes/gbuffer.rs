//! Rasterized scene passes: the G-buffer, the shadow map and the reflective
//! shadow map. All three draw every model with the mesh input layout and the
//! frame/model constants at b0/b1.

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::{FrameInputs, PassContext, RSM_SIZE, RenderPass, SHADOW_MAP_SIZE, Targets, bind_targets};
use crate::dx12::mesh::draw_models;
use crate::dx12::pipeline::{GraphicsPipelineDesc, InputLayout, Pipeline, RootParam, RootSignatureDesc, ShaderCompiler};
use crate::error::Result;
use crate::graph::PassId;

const DEPTH: DXGI_FORMAT = DXGI_FORMAT_D32_FLOAT;

pub(crate) fn mesh_root_signature() -> RootSignatureDesc {
    RootSignatureDesc::new(vec![
        RootParam::Cbv { register: 0, space: 0 },
        RootParam::Cbv { register: 1, space: 0 },
    ])
    .with_input_assembler()
}

fn draw_scene(ctx: &mut PassContext<'_>, pipeline: &Pipeline, inputs: &FrameInputs<'_>) {
    pipeline.bind_graphics(ctx.list);
    unsafe { ctx.list.SetGraphicsRootConstantBufferView(0, ctx.frame_constants) };
    draw_models(ctx.list, inputs.meshes, inputs.models);
}

/// Albedo, world normal and world position plus scene depth.
pub struct GBufferPass {
    pipeline: Pipeline,
}

impl GBufferPass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let vs = compiler.compile("gbuffer.hlsl", "VSMain", "vs_5_1")?;
        let ps = compiler.compile("gbuffer.hlsl", "PSMain", "ps_5_1")?;
        let formats = [
            DXGI_FORMAT_R8G8B8A8_UNORM,
            DXGI_FORMAT_R16G16B16A16_FLOAT,
            DXGI_FORMAT_R32G32B32A32_FLOAT,
        ];
        let pipeline = Pipeline::graphics(
            device,
            &mesh_root_signature(),
            &GraphicsPipelineDesc {
                input: InputLayout::Mesh,
                depth: Some((DEPTH, true)),
                ..GraphicsPipelineDesc::new(&vs, Some(&ps), &formats)
            },
        )?;
        Ok(Self { pipeline })
    }
}

impl RenderPass for GBufferPass {
    fn id(&self) -> PassId {
        PassId::GBuffer
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        let Targets {
            albedo,
            normal,
            position,
            depth,
            ..
        } = targets;
        bind_targets(ctx, &mut [albedo, normal, position], Some(depth))?;
        ctx.set_viewport(ctx.width, ctx.height);
        draw_scene(ctx, &self.pipeline, inputs);
        Ok(())
    }
}

/// Depth from the light's point of view.
pub struct ShadowPass {
    pipeline: Pipeline,
}

impl ShadowPass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let vs = compiler.compile("shadow.hlsl", "VSMain", "vs_5_1")?;
        let pipeline = Pipeline::graphics(
            device,
            &mesh_root_signature(),
            &GraphicsPipelineDesc {
                input: InputLayout::Mesh,
                depth: Some((DEPTH, true)),
                depth_bias: 1000,
                ..GraphicsPipelineDesc::new(&vs, None, &[])
            },
        )?;
        Ok(Self { pipeline })
    }
}

impl RenderPass for ShadowPass {
    fn id(&self) -> PassId {
        PassId::Shadow
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        bind_targets(ctx, &mut [], Some(&mut targets.shadow_map))?;
        ctx.set_viewport(SHADOW_MAP_SIZE, SHADOW_MAP_SIZE);
        draw_scene(ctx, &self.pipeline, inputs);
        Ok(())
    }
}

/// Flux, normal and position of every texel the light sees.
pub struct RsmPass {
    pipeline: Pipeline,
}

impl RsmPass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let vs = compiler.compile("rsm.hlsl", "VSMain", "vs_5_1")?;
        let ps = compiler.compile("rsm.hlsl", "PSMain", "ps_5_1")?;
        let formats = [
            DXGI_FORMAT_R16G16B16A16_FLOAT,
            DXGI_FORMAT_R16G16B16A16_FLOAT,
            DXGI_FORMAT_R32G32B32A32_FLOAT,
        ];
        let pipeline = Pipeline::graphics(
            device,
            &mesh_root_signature(),
            &GraphicsPipelineDesc {
                input: InputLayout::Mesh,
                depth: Some((DEPTH, true)),
                ..GraphicsPipelineDesc::new(&vs, Some(&ps), &formats)
            },
        )?;
        Ok(Self { pipeline })
    }
}

impl RenderPass for RsmPass {
    fn id(&self) -> PassId {
        PassId::Rsm
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        let Targets {
            rsm_flux,
            rsm_normal,
            rsm_position,
            rsm_depth,
            ..
        } = targets;
        bind_targets(ctx, &mut [rsm_flux, rsm_normal, rsm_position], Some(rsm_depth))?;
        ctx.set_viewport(RSM_SIZE, RSM_SIZE);
        draw_scene(ctx, &self.pipeline, inputs);
        Ok(())
    }
}
