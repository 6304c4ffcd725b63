use windows::Win32::Graphics::Direct3D12::*;

use super::{FrameInputs, PassContext, RenderPass, Targets, draw_fullscreen, read};
use crate::dx12::device::BACK_BUFFER_VIEW_FORMAT;
use crate::dx12::heap::cpu;
use crate::dx12::pipeline::{GraphicsPipelineDesc, Pipeline, Range, RootParam, RootSignatureDesc, ShaderCompiler, StaticSampler};
use crate::error::Result;
use crate::graph::PassId;
use crate::resource::ResourceState;

/// Adds reflections to the lit image, tone maps it and writes the back
/// buffer.
pub struct CompositePass {
    pipeline: Pipeline,
}

impl CompositePass {
    pub fn new(device: &ID3D12Device, compiler: &ShaderCompiler) -> Result<Self> {
        let vs = compiler.compile("composite.hlsl", "VSMain", "vs_5_1")?;
        let ps = compiler.compile("composite.hlsl", "PSMain", "ps_5_1")?;
        let root = RootSignatureDesc::new(vec![
            RootParam::Cbv { register: 0, space: 0 },
            RootParam::Table(vec![Range::srv(0, 2)]),
        ])
        .with_samplers(&[StaticSampler::Linear(0)]);
        let pipeline = Pipeline::graphics(
            device,
            &root,
            &GraphicsPipelineDesc::new(&vs, Some(&ps), &[BACK_BUFFER_VIEW_FORMAT]),
        )?;
        Ok(Self { pipeline })
    }
}

impl RenderPass for CompositePass {
    fn id(&self) -> PassId {
        PassId::Composite
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()> {
        let state = ResourceState::PixelShaderResource;
        let lighting = read(&mut targets.lighting, ctx.barriers, state)?;
        let reflections = if inputs.gi.reflections && inputs.tlas.is_some() {
            read(&mut targets.reflections, ctx.barriers, state)?
        } else {
            targets.null.texture_2d
        };
        ctx.back_buffer.transition_to(ctx.barriers, ResourceState::RenderTarget);
        ctx.flush_barriers()?;

        let rtv = cpu(ctx.back_buffer.rtv());
        let table = ctx.stage(&[lighting, reflections])?;
        ctx.set_viewport(ctx.width, ctx.height);
        self.pipeline.bind_graphics(ctx.list);
        unsafe {
            ctx.list.ClearRenderTargetView(rtv, &[0.0, 0.0, 0.0, 1.0], None);
            ctx.list.OMSetRenderTargets(1, Some(&rtv), false, None);
            ctx.list.SetGraphicsRootConstantBufferView(0, ctx.frame_constants);
            ctx.list.SetGraphicsRootDescriptorTable(1, table);
        }
        draw_fullscreen(ctx.list);
        Ok(())
    }
}
