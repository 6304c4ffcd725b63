use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM;

use super::{FrameInputs, PassContext, RenderPass, Targets, read};
use crate::dx12::buffer::{Buffer, MappedResource, create_buffer_resource};
use crate::dx12::device::BACK_BUFFER_VIEW_FORMAT;
use crate::dx12::heap::{Heaps, cpu};
use crate::dx12::pipeline::{
    Blend, GraphicsPipelineDesc, InputLayout, Pipeline, Range, RootParam, RootSignatureDesc, ShaderCompiler,
    StaticSampler,
};
use crate::dx12::texture::Texture;
use crate::error::Result;
use crate::graph::PassId;
use crate::overlay::{OverlayOutput, OverlayVertex, TexturesDelta};
use crate::resource::{BufferDesc, LazyMapping, MemoryKind, ResourceState, TextureDesc, TextureFormat, Views, align_up};

/// Upload space for one slot's overlay vertices.
const VERTEX_BUDGET: u64 = 1024 * 1024;

/// Draws the egui panel onto the back buffer after composition.
pub struct OverlayPass {
    pipeline: Pipeline,
    /// One upload buffer per back-buffer slot.
    vertices: Vec<Buffer>,
    font: Option<Texture>,
    /// Staging buffers and replaced font textures, dropped once their slot
    /// comes round again.
    retired: Vec<Vec<ID3D12Resource>>,
    pending: Option<OverlayOutput>,
    vertex_count: u32,
}

impl OverlayPass {
    pub fn new(device: &ID3D12Device, heaps: &mut Heaps, compiler: &ShaderCompiler, slots: usize) -> Result<Self> {
        let vs = compiler.compile("overlay.hlsl", "VSMain", "vs_5_1")?;
        let ps = compiler.compile("overlay.hlsl", "PSMain", "ps_5_1")?;
        let root = RootSignatureDesc::new(vec![RootParam::Table(vec![Range::srv(0, 1)])])
            .with_samplers(&[StaticSampler::Linear(0)])
            .with_input_assembler();
        let pipeline = Pipeline::graphics(
            device,
            &root,
            &GraphicsPipelineDesc {
                input: InputLayout::Overlay,
                blend: Blend::Alpha,
                ..GraphicsPipelineDesc::new(&vs, Some(&ps), &[BACK_BUFFER_VIEW_FORMAT])
            },
        )?;

        let vertices = (0..slots)
            .map(|_| Buffer::new(device, heaps, BufferDesc::upload("overlay vertices", VERTEX_BUDGET)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pipeline,
            vertices,
            font: None,
            retired: (0..slots).map(|_| Vec::new()).collect(),
            pending: None,
            vertex_count: 0,
        })
    }

    /// Hands over this frame's tessellated panel.
    pub fn prepare(&mut self, output: OverlayOutput) {
        self.pending = Some(output);
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Uploads new or changed font texels. Only the font atlas is handled.
    fn update_font_texture(&mut self, ctx: &mut PassContext<'_>, delta: &TexturesDelta) -> Result<()> {
        let slot = ctx.frame.slot;
        for (id, delta) in &delta.set {
            if *id != egui::TextureId::Managed(0) {
                continue;
            }

            let egui::ImageData::Color(color) = &delta.image;
            let width = color.width() as u32;
            let height = color.height() as u32;
            if width == 0 || height == 0 {
                continue;
            }
            let pixels: Vec<u8> = color.pixels.iter().flat_map(|c| [c.r(), c.g(), c.b(), c.a()]).collect();

            let (x, y) = match delta.pos {
                Some([x, y]) => (x as u32, y as u32),
                None => {
                    if let Some(mut old) = self.font.take() {
                        old.release(ctx.heaps)?;
                        self.retired[slot].push(old.resource().clone());
                    }
                    self.font = Some(Texture::new(
                        ctx.device,
                        ctx.heaps,
                        TextureDesc {
                            views: Views::SRV,
                            initial_state: ResourceState::CopyDest,
                            ..TextureDesc::render_target("overlay font", width, height, TextureFormat::Rgba8Unorm)
                        },
                    )?);
                    log::debug!("overlay font atlas {width}x{height}");
                    (0, 0)
                }
            };
            // A partial update before the first full one has nothing to patch.
            let Some(font) = self.font.as_mut() else {
                continue;
            };

            let row_pitch = align_up(width as u64 * 4, D3D12_TEXTURE_DATA_PITCH_ALIGNMENT as u64);
            let size = row_pitch * height as u64;
            let staging = create_buffer_resource(
                ctx.device,
                size,
                MemoryKind::Upload,
                D3D12_RESOURCE_FLAG_NONE,
                ResourceState::GenericRead,
            )?;
            let mut mapping = LazyMapping::new(MappedResource(staging.clone()), size as usize);
            for (row, texels) in pixels.chunks_exact(width as usize * 4).enumerate() {
                mapping.write_bytes(row * row_pitch as usize, texels)?;
            }
            drop(mapping);

            font.transition_to(ctx.barriers, ResourceState::CopyDest);
            ctx.flush_barriers()?;

            let dst = D3D12_TEXTURE_COPY_LOCATION {
                pResource: unsafe { std::mem::transmute_copy(font.resource()) },
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
            };
            let src = D3D12_TEXTURE_COPY_LOCATION {
                pResource: unsafe { std::mem::transmute_copy(&staging) },
                Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                        Offset: 0,
                        Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                            Width: width,
                            Height: height,
                            Depth: 1,
                            RowPitch: row_pitch as u32,
                        },
                    },
                },
            };
            unsafe { ctx.list.CopyTextureRegion(&dst, x, y, 0, &src, None) };
            self.retired[slot].push(staging);
        }
        Ok(())
    }
}

impl RenderPass for OverlayPass {
    fn id(&self) -> PassId {
        PassId::Overlay
    }

    fn record(&mut self, ctx: &mut PassContext<'_>, _targets: &mut Targets, _inputs: &FrameInputs<'_>) -> Result<()> {
        let slot = ctx.frame.slot;
        // The slot's previous frame has completed.
        self.retired[slot].clear();
        self.vertex_count = 0;

        let Some(output) = self.pending.take() else {
            return Ok(());
        };
        self.update_font_texture(ctx, &output.textures_delta)?;
        let Some(font) = self.font.as_mut() else {
            return Ok(());
        };
        if output.vertices.is_empty() {
            return Ok(());
        }

        let stride = std::mem::size_of::<OverlayVertex>();
        let capacity = VERTEX_BUDGET as usize / stride;
        if output.vertices.len() > capacity {
            log::warn!(
                "overlay emitted {} vertices, drawing the first {capacity}",
                output.vertices.len()
            );
        }
        let vertices = &output.vertices[..output.vertices.len().min(capacity)];
        let buffer = &mut self.vertices[slot];
        buffer.write_bytes(0, bytemuck::cast_slice(vertices))?;

        let font_srv = read(font, ctx.barriers, ResourceState::PixelShaderResource)?;
        ctx.back_buffer.transition_to(ctx.barriers, ResourceState::RenderTarget);
        ctx.flush_barriers()?;

        let table = ctx.stage(&[font_srv])?;
        let rtv = cpu(ctx.back_buffer.rtv());
        ctx.set_viewport(ctx.width, ctx.height);
        self.pipeline.bind_graphics(ctx.list);
        unsafe {
            ctx.list.SetGraphicsRootDescriptorTable(0, table);
            ctx.list.OMSetRenderTargets(1, Some(&rtv), false, None);
            ctx.list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            ctx.list.IASetVertexBuffers(
                0,
                Some(&[D3D12_VERTEX_BUFFER_VIEW {
                    BufferLocation: buffer.gpu_address(),
                    SizeInBytes: std::mem::size_of_val(vertices) as u32,
                    StrideInBytes: stride as u32,
                }]),
            );
            ctx.list.DrawInstanced(vertices.len() as u32, 1, 0, 0);
        }
        self.vertex_count = vertices.len() as u32;
        Ok(())
    }
}
