use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::heap::{Heaps, cpu};
use super::{GpuResultExt, created, native_format, native_state};
use crate::descriptor::{DescriptorHandle, HeapKind};
use crate::error::Result;
use crate::resource::{BarrierList, ResourceState, StateTracker, TextureDesc, Views};

/// A 2D or 3D texture: render targets, depth buffers and compute volumes.
///
/// Depth formats get a typeless resource with a DSV and an optional SRV;
/// color formats get whichever of RTV/SRV/UAV the description asks for,
/// with one UAV per mip level.
pub struct Texture {
    resource: ID3D12Resource,
    desc: TextureDesc,
    tracker: StateTracker,
    rtv: Option<DescriptorHandle>,
    dsv: Option<DescriptorHandle>,
    srv: Option<DescriptorHandle>,
    uavs: Vec<DescriptorHandle>,
}

impl Texture {
    pub fn new(device: &ID3D12Device, heaps: &mut Heaps, desc: TextureDesc) -> Result<Self> {
        let formats = native_format(desc.format);

        let mut flags = D3D12_RESOURCE_FLAG_NONE;
        if desc.views.contains(Views::RTV) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
        }
        if desc.views.contains(Views::DSV) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        }
        if desc.views.contains(Views::UAV) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
        }

        let clear = if desc.views.contains(Views::DSV) {
            Some(D3D12_CLEAR_VALUE {
                Format: formats.depth,
                Anonymous: D3D12_CLEAR_VALUE_0 {
                    DepthStencil: D3D12_DEPTH_STENCIL_VALUE { Depth: 1.0, Stencil: 0 },
                },
            })
        } else if desc.views.contains(Views::RTV) {
            Some(D3D12_CLEAR_VALUE {
                Format: formats.view,
                Anonymous: D3D12_CLEAR_VALUE_0 { Color: [0.0; 4] },
            })
        } else {
            None
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            device
                .CreateCommittedResource(
                    &D3D12_HEAP_PROPERTIES {
                        Type: D3D12_HEAP_TYPE_DEFAULT,
                        ..Default::default()
                    },
                    D3D12_HEAP_FLAG_NONE,
                    &D3D12_RESOURCE_DESC {
                        Dimension: if desc.is_volume() {
                            D3D12_RESOURCE_DIMENSION_TEXTURE3D
                        } else {
                            D3D12_RESOURCE_DIMENSION_TEXTURE2D
                        },
                        Width: desc.width as u64,
                        Height: desc.height,
                        DepthOrArraySize: desc.depth as u16,
                        MipLevels: desc.mip_levels as u16,
                        Format: formats.resource,
                        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                        Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                        Flags: flags,
                        ..Default::default()
                    },
                    native_state(desc.initial_state),
                    clear.as_ref().map(|c| c as *const _),
                    &mut resource,
                )
                .context("CreateCommittedResource")?;
        }
        let resource = created(resource, "CreateCommittedResource")?;

        let mut texture = Self {
            resource,
            tracker: StateTracker::new(desc.initial_state),
            rtv: None,
            dsv: None,
            srv: None,
            uavs: Vec::new(),
            desc,
        };
        texture.create_views(device, heaps)?;
        log::debug!(
            "texture {:?}: {}x{}x{} {:?}",
            texture.desc.name,
            texture.desc.width,
            texture.desc.height,
            texture.desc.depth,
            texture.desc.format
        );
        Ok(texture)
    }

    fn create_views(&mut self, device: &ID3D12Device, heaps: &mut Heaps) -> Result<()> {
        let formats = native_format(self.desc.format);
        let volume = self.desc.is_volume();

        if self.desc.views.contains(Views::RTV) {
            let handle = heaps.allocate(HeapKind::Rtv)?;
            let desc = if volume {
                D3D12_RENDER_TARGET_VIEW_DESC {
                    Format: formats.view,
                    ViewDimension: D3D12_RTV_DIMENSION_TEXTURE3D,
                    Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                        Texture3D: D3D12_TEX3D_RTV {
                            MipSlice: 0,
                            FirstWSlice: 0,
                            WSize: self.desc.depth,
                        },
                    },
                }
            } else {
                D3D12_RENDER_TARGET_VIEW_DESC {
                    Format: formats.view,
                    ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                    ..Default::default()
                }
            };
            unsafe { device.CreateRenderTargetView(&self.resource, Some(&desc), cpu(handle)) };
            self.rtv = Some(handle);
        }

        if self.desc.views.contains(Views::DSV) {
            let handle = heaps.allocate(HeapKind::Dsv)?;
            unsafe {
                device.CreateDepthStencilView(
                    &self.resource,
                    Some(&D3D12_DEPTH_STENCIL_VIEW_DESC {
                        Format: formats.depth,
                        ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                        ..Default::default()
                    }),
                    cpu(handle),
                );
            }
            self.dsv = Some(handle);
        }

        if self.desc.views.contains(Views::SRV) {
            let handle = heaps.allocate(HeapKind::CbvSrvUav)?;
            let desc = srv_desc(formats.view, volume, self.desc.mip_levels);
            unsafe { device.CreateShaderResourceView(&self.resource, Some(&desc), cpu(handle)) };
            self.srv = Some(handle);
        }

        if self.desc.views.contains(Views::UAV) {
            for mip in 0..self.desc.mip_levels {
                let handle = heaps.allocate(HeapKind::CbvSrvUav)?;
                let desc = if volume {
                    D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: formats.view,
                        ViewDimension: D3D12_UAV_DIMENSION_TEXTURE3D,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Texture3D: D3D12_TEX3D_UAV {
                                MipSlice: mip,
                                FirstWSlice: 0,
                                WSize: (self.desc.depth >> mip).max(1),
                            },
                        },
                    }
                } else {
                    D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: formats.view,
                        ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_UAV {
                                MipSlice: mip,
                                PlaneSlice: 0,
                            },
                        },
                    }
                };
                unsafe { device.CreateUnorderedAccessView(&self.resource, None, Some(&desc), cpu(handle)) };
                self.uavs.push(handle);
            }
        }
        Ok(())
    }

    pub fn resource(&self) -> &ID3D12Resource {
        &self.resource
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    pub fn state(&self) -> ResourceState {
        self.tracker.state()
    }

    pub fn rtv(&self) -> Option<DescriptorHandle> {
        self.rtv
    }

    pub fn dsv(&self) -> Option<DescriptorHandle> {
        self.dsv
    }

    pub fn srv(&self) -> Option<DescriptorHandle> {
        self.srv
    }

    pub fn uav(&self, mip: u32) -> Option<DescriptorHandle> {
        self.uavs.get(mip as usize).copied()
    }

    pub fn transition_to(&mut self, barriers: &mut BarrierList<ID3D12Resource>, state: ResourceState) -> bool {
        self.tracker.transition_to(&self.resource, barriers, state)
    }

    pub fn uav_barrier(&self, barriers: &mut BarrierList<ID3D12Resource>) {
        self.tracker.uav_barrier(&self.resource, barriers);
    }

    /// Returns every view to its heap. Called before the texture is dropped
    /// on resize.
    pub fn release(&mut self, heaps: &mut Heaps) -> Result<()> {
        if let Some(rtv) = self.rtv.take() {
            heaps.free(HeapKind::Rtv, rtv)?;
        }
        if let Some(dsv) = self.dsv.take() {
            heaps.free(HeapKind::Dsv, dsv)?;
        }
        if let Some(srv) = self.srv.take() {
            heaps.free(HeapKind::CbvSrvUav, srv)?;
        }
        for uav in self.uavs.drain(..) {
            heaps.free(HeapKind::CbvSrvUav, uav)?;
        }
        Ok(())
    }
}

fn srv_desc(format: DXGI_FORMAT, volume: bool, mip_levels: u32) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
    if volume {
        D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: format,
            ViewDimension: D3D12_SRV_DIMENSION_TEXTURE3D,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture3D: D3D12_TEX3D_SRV {
                    MipLevels: mip_levels,
                    ..Default::default()
                },
            },
        }
    } else {
        D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: format,
            ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_SRV {
                    MipLevels: mip_levels,
                    ..Default::default()
                },
            },
        }
    }
}

/// SRVs that read as zero, bound in place of disabled inputs.
pub struct NullViews {
    pub texture_2d: DescriptorHandle,
    pub texture_3d: DescriptorHandle,
}

impl NullViews {
    pub fn new(device: &ID3D12Device, heaps: &mut Heaps) -> Result<Self> {
        let texture_2d = heaps.allocate(HeapKind::CbvSrvUav)?;
        let texture_3d = heaps.allocate(HeapKind::CbvSrvUav)?;
        unsafe {
            device.CreateShaderResourceView(
                None,
                Some(&srv_desc(DXGI_FORMAT_R8G8B8A8_UNORM, false, 1)),
                cpu(texture_2d),
            );
            device.CreateShaderResourceView(
                None,
                Some(&srv_desc(DXGI_FORMAT_R16G16B16A16_FLOAT, true, 1)),
                cpu(texture_3d),
            );
        }
        Ok(Self { texture_2d, texture_3d })
    }
}
