use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R16G16B16A16_FLOAT;

use super::{FrameInputs, PassContext, RenderPass, Targets, bind_targets, draw_fullscreen, read};
use crate::dx12::pipeline::{GraphicsPipelineDesc, Pipeline, Range, RootParam, RootSignatureDesc, ShaderCompiler, StaticSampler};
use crate::error::Result;
use crate::graph::PassId;
use crate::resource::ResourceState;

/// Deferred shading of the G-buffer: direct light with optional shadows,
/// plus whichever indirect terms are enabled. Disabled inputs are bound as
/// null views and weighted out through the frame constants.
pub struct LightingPass {
    pipeline: Pipeline,
}

impl LightingPass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let vs = compiler.compile("lighting.hlsl", "VSMain", "vs_5_1")?;
        let ps = compiler.compile("lighting.hlsl", "PSMain", "ps_5_1")?;
        let root = RootSignatureDesc::new(vec![
            RootParam::Cbv { register: 0, space: 0 },
            RootParam::Table(vec![Range::srv(0, 6)]),
        ])
        .with_samplers(&[StaticSampler::Linear(0), StaticSampler::Shadow(1)]);
        let pipeline = Pipeline::graphics(
            device,
            &root,
            &GraphicsPipelineDesc::new(&vs, Some(&ps), &[DXGI_FORMAT_R16G16B16A16_FLOAT]),
        )?;
        Ok(Self { pipeline })
    }
}

impl RenderPass for LightingPass {
    fn id(&self) -> PassId {
        PassId::Lighting
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        let state = ResourceState::PixelShaderResource;
        let gi = inputs.gi;
        let mut views = vec![
            read(&mut targets.albedo, ctx.barriers, state)?,
            read(&mut targets.normal, ctx.barriers, state)?,
            read(&mut targets.position, ctx.barriers, state)?,
        ];
        views.push(if gi.shadows {
            read(&mut targets.shadow_map, ctx.barriers, state)?
        } else {
            targets.null.texture_2d
        });
        views.push(if gi.lpv {
            read(&mut targets.lpv_accumulated, ctx.barriers, state)?
        } else {
            targets.null.texture_3d
        });
        views.push(if gi.vct {
            read(&mut targets.vct_indirect, ctx.barriers, state)?
        } else {
            targets.null.texture_2d
        });

        bind_targets(ctx, &mut [&mut targets.lighting], None)?;
        let table = ctx.stage(&views)?;
        ctx.set_viewport(ctx.width, ctx.height);
        self.pipeline.bind_graphics(ctx.list);
        unsafe {
            ctx.list.SetGraphicsRootConstantBufferView(0, ctx.frame_constants);
            ctx.list.SetGraphicsRootDescriptorTable(1, table);
        }
        draw_fullscreen(ctx.list);
        Ok(())
    }
}
