use windows::Win32::Graphics::Direct3D12::*;

use super::GpuResultExt;
use crate::descriptor::{
    DescriptorBlock, DescriptorHandle, DescriptorHeapManager, HeapCapacities, HeapKind, HeapLayout, NativeHeap,
};
use crate::error::Result;
use crate::frame::FrameContext;

pub(crate) fn heap_type(kind: HeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        HeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        HeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        HeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
        HeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
    }
}

pub struct D3dHeap {
    heap: ID3D12DescriptorHeap,
    layout: HeapLayout,
}

impl D3dHeap {
    pub fn new(device: &ID3D12Device, kind: HeapKind, capacity: u32, shader_visible: bool) -> Result<Self> {
        unsafe {
            let heap: ID3D12DescriptorHeap = device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: heap_type(kind),
                    NumDescriptors: capacity,
                    Flags: if shader_visible {
                        D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                    } else {
                        D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                    },
                    NodeMask: 0,
                })
                .context("CreateDescriptorHeap")?;

            let layout = HeapLayout {
                cpu_start: heap.GetCPUDescriptorHandleForHeapStart().ptr,
                gpu_start: shader_visible.then(|| heap.GetGPUDescriptorHandleForHeapStart().ptr),
                increment: device.GetDescriptorHandleIncrementSize(heap_type(kind)),
                capacity,
            };
            Ok(Self { heap, layout })
        }
    }

    pub fn native(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }
}

impl NativeHeap for D3dHeap {
    fn layout(&self) -> HeapLayout {
        self.layout
    }
}

pub type Heaps = DescriptorHeapManager<D3dHeap>;

pub fn create_heaps(device: &ID3D12Device, back_buffer_count: usize, capacities: &HeapCapacities) -> Result<Heaps> {
    DescriptorHeapManager::new(back_buffer_count, capacities, |kind, capacity, shader_visible| {
        D3dHeap::new(device, kind, capacity, shader_visible)
    })
}

pub(crate) fn cpu(handle: DescriptorHandle) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE { ptr: handle.cpu() }
}

pub(crate) fn gpu(block: &DescriptorBlock) -> D3D12_GPU_DESCRIPTOR_HANDLE {
    D3D12_GPU_DESCRIPTOR_HANDLE { ptr: block.gpu() }
}

/// Copies persistent CPU views into a fresh frame block, in order.
///
/// The returned block is only valid for `frame`.
pub fn stage_views(
    device: &ID3D12Device,
    heaps: &mut Heaps,
    frame: FrameContext,
    views: &[DescriptorHandle],
) -> Result<DescriptorBlock> {
    let block = heaps.get_handle_block(frame, HeapKind::CbvSrvUav, views.len() as u32)?;
    for (i, view) in views.iter().enumerate() {
        debug_assert!(view.is_valid(), "staging an unallocated view");
        unsafe {
            device.CopyDescriptorsSimple(
                1,
                cpu(block.handle(i as u32)),
                cpu(*view),
                D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            );
        }
    }
    Ok(block)
}

/// Binds both shader-visible heaps of `frame`'s slot.
pub fn bind_frame_heaps(list: &ID3D12GraphicsCommandList4, heaps: &Heaps, frame: FrameContext) -> Result<()> {
    let views = heaps.gpu_heap(frame, HeapKind::CbvSrvUav)?.native().native().clone();
    let samplers = heaps.gpu_heap(frame, HeapKind::Sampler)?.native().native().clone();
    unsafe { list.SetDescriptorHeaps(&[Some(views), Some(samplers)]) };
    Ok(())
}
