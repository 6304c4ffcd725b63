use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::heap::{Heaps, cpu};
use super::{GpuResultExt, created, native_state};
use crate::descriptor::{DescriptorHandle, HeapKind};
use crate::error::{RenderError, Result};
use crate::resource::{
    BarrierList, BufferDesc, LazyMapping, Mappable, MemoryKind, ResourceState, StateTracker, Views,
};

/// Upload-heap memory mapped for CPU writes.
pub struct MappedResource(pub ID3D12Resource);

impl Mappable for MappedResource {
    fn map(&self) -> Result<*mut u8> {
        let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
        unsafe { self.0.Map(0, None, Some(&mut ptr)) }.context("Map")?;
        Ok(ptr as *mut u8)
    }

    fn unmap(&self) {
        unsafe { self.0.Unmap(0, None) };
    }
}

pub(crate) fn create_buffer_resource(
    device: &ID3D12Device,
    size: u64,
    memory: MemoryKind,
    flags: D3D12_RESOURCE_FLAGS,
    state: ResourceState,
) -> Result<ID3D12Resource> {
    let mut resource: Option<ID3D12Resource> = None;
    unsafe {
        device
            .CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: match memory {
                        MemoryKind::Default => D3D12_HEAP_TYPE_DEFAULT,
                        MemoryKind::Upload => D3D12_HEAP_TYPE_UPLOAD,
                    },
                    ..Default::default()
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Width: size,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    Flags: flags,
                    ..Default::default()
                },
                native_state(state),
                None,
                &mut resource,
            )
            .context("CreateCommittedResource")?;
    }
    created(resource, "CreateCommittedResource")
}

/// One committed buffer plus the views its description asked for.
pub struct Buffer {
    resource: ID3D12Resource,
    desc: BufferDesc,
    tracker: StateTracker,
    cbv: Option<DescriptorHandle>,
    srv: Option<DescriptorHandle>,
    uav: Option<DescriptorHandle>,
    mapping: Option<LazyMapping<MappedResource>>,
}

impl Buffer {
    pub fn new(device: &ID3D12Device, heaps: &mut Heaps, desc: BufferDesc) -> Result<Self> {
        let flags = if desc.views.contains(Views::UAV) {
            D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            D3D12_RESOURCE_FLAG_NONE
        };
        let resource = create_buffer_resource(device, desc.size, desc.memory, flags, desc.initial_state)?;
        let address = unsafe { resource.GetGPUVirtualAddress() };

        let mut buffer = Self {
            mapping: (desc.memory == MemoryKind::Upload)
                .then(|| LazyMapping::new(MappedResource(resource.clone()), desc.size as usize)),
            resource,
            tracker: StateTracker::new(desc.initial_state),
            cbv: None,
            srv: None,
            uav: None,
            desc,
        };

        if buffer.desc.views.contains(Views::CBV) {
            let handle = heaps.allocate(HeapKind::CbvSrvUav)?;
            unsafe {
                device.CreateConstantBufferView(
                    Some(&D3D12_CONSTANT_BUFFER_VIEW_DESC {
                        BufferLocation: address,
                        SizeInBytes: buffer.desc.size as u32,
                    }),
                    cpu(handle),
                );
            }
            buffer.cbv = Some(handle);
        }

        if buffer.desc.views.contains(Views::SRV) {
            let handle = heaps.allocate(HeapKind::CbvSrvUav)?;
            unsafe {
                device.CreateShaderResourceView(&buffer.resource, Some(&buffer.srv_desc()), cpu(handle));
            }
            buffer.srv = Some(handle);
        }

        if buffer.desc.views.contains(Views::UAV) {
            let handle = heaps.allocate(HeapKind::CbvSrvUav)?;
            unsafe {
                device.CreateUnorderedAccessView(
                    &buffer.resource,
                    None,
                    Some(&D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: DXGI_FORMAT_UNKNOWN,
                        ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Buffer: D3D12_BUFFER_UAV {
                                NumElements: buffer.desc.element_count(),
                                StructureByteStride: buffer.desc.stride,
                                ..Default::default()
                            },
                        },
                    }),
                    cpu(handle),
                );
            }
            buffer.uav = Some(handle);
        }

        log::trace!("buffer {:?}: {} bytes, views {:?}", buffer.desc.name, buffer.desc.size, buffer.desc.views);
        Ok(buffer)
    }

    fn srv_desc(&self) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
        // Structured when a stride is known, raw otherwise.
        let (format, stride, count, flags) = if self.desc.stride > 0 {
            (DXGI_FORMAT_UNKNOWN, self.desc.stride, self.desc.element_count(), D3D12_BUFFER_SRV_FLAG_NONE)
        } else {
            (DXGI_FORMAT_R32_TYPELESS, 0, (self.desc.size / 4) as u32, D3D12_BUFFER_SRV_FLAG_RAW)
        };
        D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: format,
            ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Buffer: D3D12_BUFFER_SRV {
                    FirstElement: 0,
                    NumElements: count,
                    StructureByteStride: stride,
                    Flags: flags,
                },
            },
        }
    }

    /// A default-heap buffer filled from `bytes` through a staging copy
    /// recorded on `list`. The staging buffer is parked in `uploads`.
    pub fn with_data(
        device: &ID3D12Device,
        heaps: &mut Heaps,
        desc: BufferDesc,
        bytes: &[u8],
        list: &ID3D12GraphicsCommandList4,
        uploads: &mut UploadBatch,
    ) -> Result<Self> {
        debug_assert_eq!(desc.memory, MemoryKind::Default);
        debug_assert!(bytes.len() as u64 <= desc.size);

        let buffer = Self::new(
            device,
            heaps,
            BufferDesc {
                initial_state: ResourceState::CopyDest,
                ..desc
            },
        )?;

        let staging = create_buffer_resource(
            device,
            bytes.len() as u64,
            MemoryKind::Upload,
            D3D12_RESOURCE_FLAG_NONE,
            ResourceState::GenericRead,
        )?;
        let mut mapping = LazyMapping::new(MappedResource(staging.clone()), bytes.len());
        mapping.write_bytes(0, bytes)?;
        drop(mapping);

        unsafe { list.CopyBufferRegion(&buffer.resource, 0, &staging, 0, bytes.len() as u64) };
        uploads.keep(staging);
        Ok(buffer)
    }

    pub fn resource(&self) -> &ID3D12Resource {
        &self.resource
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn gpu_address(&self) -> u64 {
        unsafe { self.resource.GetGPUVirtualAddress() }
    }

    pub fn state(&self) -> ResourceState {
        self.tracker.state()
    }

    pub fn cbv(&self) -> Option<DescriptorHandle> {
        self.cbv
    }

    pub fn srv(&self) -> Option<DescriptorHandle> {
        self.srv
    }

    pub fn uav(&self) -> Option<DescriptorHandle> {
        self.uav
    }

    pub fn transition_to(&mut self, barriers: &mut BarrierList<ID3D12Resource>, state: ResourceState) -> bool {
        self.tracker.transition_to(&self.resource, barriers, state)
    }

    pub fn uav_barrier(&self, barriers: &mut BarrierList<ID3D12Resource>) {
        self.tracker.uav_barrier(&self.resource, barriers);
    }

    /// Writes into an upload buffer, mapping it on first use.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        match &mut self.mapping {
            Some(mapping) => mapping.write_bytes(offset, bytes),
            None => Err(RenderError::Gpu {
                call: "Map",
                message: format!("buffer {:?} lives in a default heap", self.desc.name),
            }),
        }
    }

    pub fn write<T: bytemuck::Pod>(&mut self, value: &T) -> Result<()> {
        self.write_bytes(0, bytemuck::bytes_of(value))
    }

    /// Returns the views to their heaps. The buffer must not be used again.
    pub fn release(&mut self, heaps: &mut Heaps) -> Result<()> {
        for handle in [self.cbv.take(), self.srv.take(), self.uav.take()].into_iter().flatten() {
            heaps.free(HeapKind::CbvSrvUav, handle)?;
        }
        Ok(())
    }
}

/// Staging buffers kept alive until the copies that read them have executed.
#[derive(Default)]
pub struct UploadBatch {
    staging: Vec<ID3D12Resource>,
}

impl UploadBatch {
    pub fn keep(&mut self, resource: ID3D12Resource) {
        self.staging.push(resource);
    }

    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Drops every staging buffer. Only call once the GPU is done with them.
    pub fn clear(&mut self) {
        self.staging.clear();
    }
}
