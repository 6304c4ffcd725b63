//! Direct3D 12 backend.
//!
//! Everything in here talks to the native API. The allocators, trackers and
//! pacing logic it drives live in the platform-independent modules.

pub mod buffer;
pub mod device;
pub mod heap;
pub mod mesh;
pub mod passes;
pub mod pipeline;
pub mod raytracing;
pub mod renderer;
pub mod sync;
pub mod texture;

use std::mem::ManuallyDrop;

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::error::{RenderError, Result};
use crate::resource::{Barrier, BarrierKind, ResourceState, TextureFormat};

pub use buffer::Buffer;
pub use device::Graphics;
pub use heap::D3dHeap;
pub use renderer::Renderer;
pub use texture::Texture;

/// Attaches the failing API call to a `windows` error.
pub trait GpuResultExt<T> {
    fn context(self, call: &'static str) -> Result<T>;
}

impl<T> GpuResultExt<T> for windows::core::Result<T> {
    fn context(self, call: &'static str) -> Result<T> {
        self.map_err(|e| RenderError::Gpu {
            call,
            message: e.message().to_string(),
        })
    }
}

/// Unwraps an out-parameter that a successful call should have filled.
pub(crate) fn created<T>(value: Option<T>, call: &'static str) -> Result<T> {
    value.ok_or_else(|| RenderError::Gpu {
        call,
        message: "returned no object".to_owned(),
    })
}

pub(crate) fn native_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::DepthRead => D3D12_RESOURCE_STATE_DEPTH_READ,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        ResourceState::NonPixelShaderResource => D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        ResourceState::AllShaderResource => D3D12_RESOURCE_STATE_ALL_SHADER_RESOURCE,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
        ResourceState::VertexAndConstantBuffer => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::AccelerationStructure => D3D12_RESOURCE_STATE_RAYTRACING_ACCELERATION_STRUCTURE,
    }
}

/// Formats used when creating a texture and its views.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FormatSet {
    pub resource: DXGI_FORMAT,
    pub view: DXGI_FORMAT,
    pub depth: DXGI_FORMAT,
}

pub(crate) fn native_format(format: TextureFormat) -> FormatSet {
    let same = |f| FormatSet {
        resource: f,
        view: f,
        depth: DXGI_FORMAT_UNKNOWN,
    };
    match format {
        TextureFormat::Rgba8Unorm => same(DXGI_FORMAT_R8G8B8A8_UNORM),
        TextureFormat::Rgba16Float => same(DXGI_FORMAT_R16G16B16A16_FLOAT),
        TextureFormat::Rgba32Float => same(DXGI_FORMAT_R32G32B32A32_FLOAT),
        TextureFormat::Rg16Float => same(DXGI_FORMAT_R16G16_FLOAT),
        TextureFormat::R32Float => same(DXGI_FORMAT_R32_FLOAT),
        // Typeless so the same memory can be bound as DSV and SRV.
        TextureFormat::D32Float => FormatSet {
            resource: DXGI_FORMAT_R32_TYPELESS,
            view: DXGI_FORMAT_R32_FLOAT,
            depth: DXGI_FORMAT_D32_FLOAT,
        },
    }
}

/// Records a batch of tracked barriers on `list`.
///
/// The barrier structs borrow the resources without touching their reference
/// counts; `ResourceBarrier` only reads the pointers during the call.
pub(crate) fn record_barriers(list: &ID3D12GraphicsCommandList4, barriers: &[Barrier<ID3D12Resource>]) {
    let native: Vec<D3D12_RESOURCE_BARRIER> = barriers
        .iter()
        .map(|barrier| match barrier.kind {
            BarrierKind::Transition { before, after } => D3D12_RESOURCE_BARRIER {
                Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                    Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                        pResource: unsafe { std::mem::transmute_copy(&barrier.resource) },
                        StateBefore: native_state(before),
                        StateAfter: native_state(after),
                        Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    }),
                },
            },
            BarrierKind::Uav => D3D12_RESOURCE_BARRIER {
                Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
                Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                    UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                        pResource: unsafe { std::mem::transmute_copy(&barrier.resource) },
                    }),
                },
            },
        })
        .collect();

    unsafe { list.ResourceBarrier(&native) };
    // The ManuallyDrop fields never release the borrowed resources.
}

/// Records a UAV barrier that covers every UAV access.
pub(crate) fn global_uav_barrier(list: &ID3D12GraphicsCommandList4) {
    let barrier = D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                pResource: ManuallyDrop::new(None),
            }),
        },
    };
    unsafe { list.ResourceBarrier(&[barrier]) };
}
