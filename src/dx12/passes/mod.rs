//! Render passes and the targets they exchange.
//!
//! Each pass owns its pipelines and records into whichever list the frame
//! plan hands it. Inputs are transitioned by the reading pass, outputs by the
//! writing pass; nothing is transitioned behind a pass's back except the
//! hand-off states a compute segment needs.

mod composite;
mod gbuffer;
mod lighting;
mod lpv;
mod overlay;
mod reflections;
mod vct;

pub use composite::CompositePass;
pub use gbuffer::{GBufferPass, RsmPass, ShadowPass};
pub use lighting::LightingPass;
pub use lpv::{LpvInjectPass, LpvPropagatePass};
pub use overlay::OverlayPass;
pub use reflections::ReflectionsPass;
pub use vct::{VctMipmapPass, VctTracePass, VctVoxelizePass};

use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D12::*;

use super::device::BackBuffer;
use super::heap::{Heaps, gpu, stage_views};
use super::mesh::{Mesh, Model};
use super::texture::{NullViews, Texture};
use super::record_barriers;
use crate::config::GiSettings;
use crate::descriptor::DescriptorHandle;
use crate::error::{RenderError, Result};
use crate::frame::FrameContext;
use crate::graph::{FramePlan, PassId, Recording, TargetId};
use crate::resource::{BarrierList, ResourceState, TextureDesc, TextureFormat, Views};

pub const SHADOW_MAP_SIZE: u32 = 2048;
pub const RSM_SIZE: u32 = 512;
pub const LPV_SIZE: u32 = 32;
pub const VOXEL_GRID_SIZE: u32 = 64;
pub const VOXEL_MIPS: u32 = 6;

/// What a pass may touch while recording.
pub struct PassContext<'a> {
    pub device: &'a ID3D12Device,
    pub list: &'a ID3D12GraphicsCommandList4,
    pub heaps: &'a mut Heaps,
    pub barriers: &'a mut BarrierList<ID3D12Resource>,
    pub back_buffer: &'a mut BackBuffer,
    pub frame: FrameContext,
    /// GPU address of this frame's `FrameConstants`.
    pub frame_constants: u64,
    pub width: u32,
    pub height: u32,
}

impl PassContext<'_> {
    /// Copies `views` into a frame block and returns the table start.
    pub fn stage(&mut self, views: &[DescriptorHandle]) -> Result<D3D12_GPU_DESCRIPTOR_HANDLE> {
        let block = stage_views(self.device, self.heaps, self.frame, views)?;
        Ok(gpu(&block))
    }

    pub fn flush_barriers(&mut self) -> Result<()> {
        let list = self.list;
        self.barriers.flush(|barriers| {
            record_barriers(list, barriers);
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_viewport(&self, width: u32, height: u32) {
        unsafe {
            self.list.RSSetViewports(&[D3D12_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: width as f32,
                Height: height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]);
            self.list.RSSetScissorRects(&[RECT {
                left: 0,
                top: 0,
                right: width as i32,
                bottom: height as i32,
            }]);
        }
    }
}

/// Scene data every pass can read.
pub struct FrameInputs<'a> {
    pub meshes: &'a [Mesh],
    pub models: &'a [Model],
    pub gi: &'a GiSettings,
    /// Present when the acceleration structures were built.
    pub tlas: Option<u64>,
    pub plan: &'a FramePlan,
}

impl FrameInputs<'_> {
    pub fn recording(&self, pass: PassId) -> Option<Recording> {
        self.plan.recording(pass)
    }
}

pub trait RenderPass {
    fn id(&self) -> PassId;

    fn record(&mut self, ctx: &mut PassContext<'_>, targets: &mut Targets, inputs: &FrameInputs<'_>) -> Result<()>;
}

/// Every intermediate texture of the frame. Created once at startup, the
/// screen-sized ones again on resize.
pub struct Targets {
    pub albedo: Texture,
    pub normal: Texture,
    pub position: Texture,
    pub depth: Texture,
    pub shadow_map: Texture,
    pub rsm_flux: Texture,
    pub rsm_normal: Texture,
    pub rsm_position: Texture,
    pub rsm_depth: Texture,
    pub lpv_injected: Texture,
    /// Ping-pong volumes of the propagation.
    pub lpv_scratch: [Texture; 2],
    pub lpv_accumulated: Texture,
    pub voxels: Texture,
    pub vct_indirect: Texture,
    pub reflections: Texture,
    pub lighting: Texture,
    pub null: NullViews,
}

fn storage_target(name: &'static str, width: u32, height: u32) -> TextureDesc {
    TextureDesc {
        views: Views::SRV | Views::UAV,
        initial_state: ResourceState::UnorderedAccess,
        ..TextureDesc::render_target(name, width, height, TextureFormat::Rgba16Float)
    }
}

/// The three SH color channels are stacked along Z.
fn lpv_volume(name: &'static str) -> TextureDesc {
    TextureDesc {
        depth: LPV_SIZE * 3,
        ..TextureDesc::volume(name, LPV_SIZE, 1, TextureFormat::Rgba16Float)
    }
}

impl Targets {
    pub fn new(device: &ID3D12Device, heaps: &mut Heaps, width: u32, height: u32) -> Result<Self> {
        let mut texture = |desc| Texture::new(device, heaps, desc);

        let albedo = texture(TextureDesc::render_target("gbuffer albedo", width, height, TextureFormat::Rgba8Unorm))?;
        let normal = texture(TextureDesc::render_target("gbuffer normal", width, height, TextureFormat::Rgba16Float))?;
        let position =
            texture(TextureDesc::render_target("gbuffer position", width, height, TextureFormat::Rgba32Float))?;
        let depth = texture(TextureDesc::depth("depth", width, height))?;
        let shadow_map = texture(TextureDesc::depth("shadow map", SHADOW_MAP_SIZE, SHADOW_MAP_SIZE))?;
        let rsm_flux = texture(TextureDesc::render_target("rsm flux", RSM_SIZE, RSM_SIZE, TextureFormat::Rgba16Float))?;
        let rsm_normal =
            texture(TextureDesc::render_target("rsm normal", RSM_SIZE, RSM_SIZE, TextureFormat::Rgba16Float))?;
        let rsm_position =
            texture(TextureDesc::render_target("rsm position", RSM_SIZE, RSM_SIZE, TextureFormat::Rgba32Float))?;
        let rsm_depth = texture(TextureDesc::depth("rsm depth", RSM_SIZE, RSM_SIZE))?;
        let lpv_injected = texture(lpv_volume("lpv injected"))?;
        let lpv_scratch = [texture(lpv_volume("lpv ping"))?, texture(lpv_volume("lpv pong"))?];
        let lpv_accumulated = texture(lpv_volume("lpv accumulated"))?;
        let voxels = texture(TextureDesc::volume(
            "voxel grid",
            VOXEL_GRID_SIZE,
            VOXEL_MIPS,
            TextureFormat::Rgba16Float,
        ))?;
        let vct_indirect = texture(storage_target("vct indirect", width, height))?;
        let reflections = texture(storage_target("reflections", width, height))?;
        let lighting = texture(TextureDesc::render_target("lighting", width, height, TextureFormat::Rgba16Float))?;
        let null = NullViews::new(device, heaps)?;

        Ok(Self {
            albedo,
            normal,
            position,
            depth,
            shadow_map,
            rsm_flux,
            rsm_normal,
            rsm_position,
            rsm_depth,
            lpv_injected,
            lpv_scratch,
            lpv_accumulated,
            voxels,
            vct_indirect,
            reflections,
            lighting,
            null,
        })
    }

    /// Recreates the screen-sized targets. The GPU must be idle.
    pub fn resize(&mut self, device: &ID3D12Device, heaps: &mut Heaps, width: u32, height: u32) -> Result<()> {
        let screen = [
            (&mut self.albedo, TextureDesc::render_target("gbuffer albedo", width, height, TextureFormat::Rgba8Unorm)),
            (&mut self.normal, TextureDesc::render_target("gbuffer normal", width, height, TextureFormat::Rgba16Float)),
            (
                &mut self.position,
                TextureDesc::render_target("gbuffer position", width, height, TextureFormat::Rgba32Float),
            ),
            (&mut self.depth, TextureDesc::depth("depth", width, height)),
            (&mut self.vct_indirect, storage_target("vct indirect", width, height)),
            (&mut self.reflections, storage_target("reflections", width, height)),
            (&mut self.lighting, TextureDesc::render_target("lighting", width, height, TextureFormat::Rgba16Float)),
        ];
        for (target, desc) in screen {
            target.release(heaps)?;
            *target = Texture::new(device, heaps, desc)?;
        }
        Ok(())
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Texture> {
        Some(match id {
            TargetId::GBufferAlbedo => &mut self.albedo,
            TargetId::GBufferNormal => &mut self.normal,
            TargetId::GBufferPosition => &mut self.position,
            TargetId::Depth => &mut self.depth,
            TargetId::ShadowMap => &mut self.shadow_map,
            TargetId::RsmFlux => &mut self.rsm_flux,
            TargetId::RsmNormal => &mut self.rsm_normal,
            TargetId::RsmPosition => &mut self.rsm_position,
            TargetId::LpvInjected => &mut self.lpv_injected,
            TargetId::LpvAccumulated => &mut self.lpv_accumulated,
            TargetId::VoxelGrid => &mut self.voxels,
            TargetId::VctIndirect => &mut self.vct_indirect,
            TargetId::Reflections => &mut self.reflections,
            TargetId::Lighting => &mut self.lighting,
            TargetId::BackBuffer => return None,
        })
    }
}

/// Transitions `texture` and returns its SRV, for a pass input that is
/// always produced.
pub(crate) fn read(
    texture: &mut Texture,
    barriers: &mut BarrierList<ID3D12Resource>,
    state: ResourceState,
) -> Result<DescriptorHandle> {
    texture.transition_to(barriers, state);
    texture.srv().ok_or_else(|| missing_view(texture, "SRV"))
}

pub(crate) fn missing_view(texture: &Texture, view: &'static str) -> RenderError {
    RenderError::MissingView {
        resource: texture.desc().name,
        view,
    }
}

/// Clears and binds color targets plus an optional depth buffer.
pub(crate) fn bind_targets(
    ctx: &mut PassContext<'_>,
    colors: &mut [&mut Texture],
    depth: Option<&mut Texture>,
) -> Result<()> {
    let mut rtvs = Vec::with_capacity(colors.len());
    for color in colors.iter_mut() {
        color.transition_to(ctx.barriers, ResourceState::RenderTarget);
        rtvs.push(super::heap::cpu(color.rtv().ok_or_else(|| missing_view(&**color, "RTV"))?));
    }
    let dsv = match depth {
        Some(depth) => {
            depth.transition_to(ctx.barriers, ResourceState::DepthWrite);
            Some(super::heap::cpu(depth.dsv().ok_or_else(|| missing_view(depth, "DSV"))?))
        }
        None => None,
    };
    ctx.flush_barriers()?;

    unsafe {
        for rtv in &rtvs {
            ctx.list.ClearRenderTargetView(*rtv, &[0.0; 4], None);
        }
        if let Some(dsv) = dsv {
            ctx.list.ClearDepthStencilView(dsv, D3D12_CLEAR_FLAG_DEPTH, 1.0, 0, None);
        }
        ctx.list.OMSetRenderTargets(
            rtvs.len() as u32,
            (!rtvs.is_empty()).then_some(rtvs.as_ptr()),
            false,
            dsv.as_ref().map(|d| d as *const _),
        );
    }
    Ok(())
}

/// Draws a triangle covering the viewport; the vertex shader derives it from
/// `SV_VertexID`.
pub(crate) fn draw_fullscreen(list: &ID3D12GraphicsCommandList4) {
    unsafe {
        list.IASetPrimitiveTopology(windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
        list.DrawInstanced(3, 1, 0, 0);
    }
}
