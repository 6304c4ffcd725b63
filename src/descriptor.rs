//! Descriptor heap allocators.
//!
//! CPU heaps hold the persistent views created alongside each resource. They
//! allocate monotonically until full and then recycle freed slots. GPU
//! (shader-visible) heaps are bump allocators with a one-frame lifetime: each
//! back-buffer slot has its own, reset at the start of the frame, so a block
//! handed out in frame N stays untouched while frame N's command list is in
//! flight.

use crate::error::{RenderError, Result};
use crate::frame::FrameContext;

/// The four descriptor heap types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    CbvSrvUav,
    Rtv,
    Dsv,
    Sampler,
}

impl HeapKind {
    pub const ALL: [HeapKind; 4] = [HeapKind::CbvSrvUav, HeapKind::Rtv, HeapKind::Dsv, HeapKind::Sampler];

    /// Heap kinds that can be bound to the pipeline.
    pub const SHADER_VISIBLE: [HeapKind; 2] = [HeapKind::CbvSrvUav, HeapKind::Sampler];

    pub fn index(self) -> usize {
        match self {
            HeapKind::CbvSrvUav => 0,
            HeapKind::Rtv => 1,
            HeapKind::Dsv => 2,
            HeapKind::Sampler => 3,
        }
    }

    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, HeapKind::CbvSrvUav | HeapKind::Sampler)
    }

    fn visible_index(self) -> Result<usize> {
        match self {
            HeapKind::CbvSrvUav => Ok(0),
            HeapKind::Sampler => Ok(1),
            kind => Err(RenderError::NotShaderVisible { kind }),
        }
    }
}

/// A slot in a descriptor heap.
///
/// Plain value; it does not keep the heap alive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorHandle {
    cpu: usize,
    gpu: Option<u64>,
    index: u32,
}

impl DescriptorHandle {
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn gpu(&self) -> Option<u64> {
        self.gpu
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_valid(&self) -> bool {
        self.cpu != 0
    }
}

/// Address arithmetic of one native heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapLayout {
    pub cpu_start: usize,
    pub gpu_start: Option<u64>,
    pub increment: u32,
    pub capacity: u32,
}

impl HeapLayout {
    pub fn handle(&self, index: u32) -> DescriptorHandle {
        debug_assert!(index < self.capacity);
        let offset = index as u64 * self.increment as u64;
        DescriptorHandle {
            cpu: self.cpu_start + offset as usize,
            gpu: self.gpu_start.map(|start| start + offset),
            index,
        }
    }

    fn owns(&self, handle: &DescriptorHandle) -> bool {
        handle.index < self.capacity && self.handle(handle.index).cpu == handle.cpu
    }
}

/// A heap created by the GPU backend.
pub trait NativeHeap {
    fn layout(&self) -> HeapLayout;
}

/// Persistent allocator over a non-shader-visible heap.
pub struct CpuDescriptorHeap<H> {
    kind: HeapKind,
    native: H,
    layout: HeapLayout,
    next: u32,
    free_list: Vec<u32>,
    live: Vec<bool>,
    active: u32,
}

impl<H: NativeHeap> CpuDescriptorHeap<H> {
    pub fn new(kind: HeapKind, native: H) -> Self {
        let layout = native.layout();
        Self {
            kind,
            native,
            layout,
            next: 0,
            free_list: Vec::new(),
            live: vec![false; layout.capacity as usize],
            active: 0,
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn native(&self) -> &H {
        &self.native
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn active_count(&self) -> u32 {
        self.active
    }

    pub fn get_new_handle(&mut self) -> Result<DescriptorHandle> {
        let index = if self.next < self.layout.capacity {
            self.next += 1;
            self.next - 1
        } else if let Some(index) = self.free_list.pop() {
            index
        } else {
            return Err(RenderError::HeapExhausted {
                kind: self.kind,
                capacity: self.layout.capacity,
            });
        };

        debug_assert!(!self.live[index as usize]);
        self.live[index as usize] = true;
        self.active += 1;
        Ok(self.layout.handle(index))
    }

    pub fn free_handle(&mut self, handle: DescriptorHandle) -> Result<()> {
        if !self.layout.owns(&handle) {
            return Err(RenderError::ForeignHandle {
                kind: self.kind,
                index: handle.index,
            });
        }
        if self.active == 0 {
            return Err(RenderError::OverFree { kind: self.kind });
        }
        let live = &mut self.live[handle.index as usize];
        if !*live {
            return Err(RenderError::DoubleFree {
                kind: self.kind,
                index: handle.index,
            });
        }
        *live = false;
        self.active -= 1;
        self.free_list.push(handle.index);
        Ok(())
    }
}

/// A contiguous run of shader-visible slots, valid for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBlock {
    first: DescriptorHandle,
    count: u32,
    increment: u32,
}

impl DescriptorBlock {
    pub fn first(&self) -> DescriptorHandle {
        self.first
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The GPU address of the table start, for root descriptor tables.
    pub fn gpu(&self) -> u64 {
        self.first.gpu.unwrap_or_default()
    }

    pub fn handle(&self, i: u32) -> DescriptorHandle {
        assert!(i < self.count, "block index {i} out of {}", self.count);
        let offset = i as u64 * self.increment as u64;
        DescriptorHandle {
            cpu: self.first.cpu + offset as usize,
            gpu: self.first.gpu.map(|g| g + offset),
            index: self.first.index + i,
        }
    }
}

/// Per-frame bump allocator over a shader-visible heap.
pub struct GpuDescriptorHeap<H> {
    kind: HeapKind,
    slot: usize,
    native: H,
    layout: HeapLayout,
    cursor: u32,
    frame: Option<u64>,
}

impl<H: NativeHeap> GpuDescriptorHeap<H> {
    pub fn new(kind: HeapKind, slot: usize, native: H) -> Self {
        let layout = native.layout();
        Self {
            kind,
            slot,
            native,
            layout,
            cursor: 0,
            frame: None,
        }
    }

    pub fn native(&self) -> &H {
        &self.native
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn used(&self) -> u32 {
        self.cursor
    }

    /// Rewinds the bump pointer for `frame`. Earlier blocks become invalid.
    ///
    /// Only once per frame: a second reset would hand out blocks the open
    /// command list still references.
    pub fn reset(&mut self, frame: FrameContext) -> Result<()> {
        debug_assert_eq!(frame.slot, self.slot);
        if self.frame == Some(frame.number) {
            return Err(RenderError::FrameHeapResetTwice {
                kind: self.kind,
                slot: self.slot,
                frame: frame.number,
            });
        }
        self.cursor = 0;
        self.frame = Some(frame.number);
        Ok(())
    }

    pub fn get_handle_block(&mut self, frame: FrameContext, count: u32) -> Result<DescriptorBlock> {
        if frame.slot != self.slot || self.frame != Some(frame.number) {
            return Err(RenderError::StaleFrameHeap {
                kind: self.kind,
                slot: self.slot,
                frame: frame.number,
            });
        }
        if count > self.layout.capacity - self.cursor {
            return Err(RenderError::FrameHeapOverflow {
                kind: self.kind,
                slot: self.slot,
                requested: count,
                used: self.cursor,
                capacity: self.layout.capacity,
            });
        }

        let first = if count == 0 {
            DescriptorHandle::default()
        } else {
            self.layout.handle(self.cursor)
        };
        self.cursor += count;
        Ok(DescriptorBlock {
            first,
            count,
            increment: self.layout.increment,
        })
    }
}

/// Capacities of every heap the manager creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapCapacities {
    pub cbv_srv_uav: u32,
    pub rtv: u32,
    pub dsv: u32,
    pub sampler: u32,
    pub frame_cbv_srv_uav: u32,
    pub frame_sampler: u32,
}

impl HeapCapacities {
    pub fn cpu(&self, kind: HeapKind) -> u32 {
        match kind {
            HeapKind::CbvSrvUav => self.cbv_srv_uav,
            HeapKind::Rtv => self.rtv,
            HeapKind::Dsv => self.dsv,
            HeapKind::Sampler => self.sampler,
        }
    }

    pub fn frame(&self, kind: HeapKind) -> u32 {
        match kind {
            HeapKind::Sampler => self.frame_sampler,
            _ => self.frame_cbv_srv_uav,
        }
    }
}

impl Default for HeapCapacities {
    fn default() -> Self {
        Self {
            cbv_srv_uav: 1024,
            rtv: 64,
            dsv: 16,
            sampler: 16,
            frame_cbv_srv_uav: 4096,
            frame_sampler: 64,
        }
    }
}

/// Usage counters for the debug overlay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub kind: Option<HeapKind>,
    pub used: u32,
    pub capacity: u32,
}

/// Owns every descriptor heap of the renderer.
pub struct DescriptorHeapManager<H> {
    cpu: Vec<CpuDescriptorHeap<H>>,
    gpu: Vec<[GpuDescriptorHeap<H>; 2]>,
}

impl<H: NativeHeap> DescriptorHeapManager<H> {
    /// Creates all heaps through `create(kind, capacity, shader_visible)`.
    pub fn new<F>(back_buffer_count: usize, capacities: &HeapCapacities, mut create: F) -> Result<Self>
    where
        F: FnMut(HeapKind, u32, bool) -> Result<H>,
    {
        let cpu = HeapKind::ALL
            .iter()
            .map(|&kind| -> Result<_> { Ok(CpuDescriptorHeap::new(kind, create(kind, capacities.cpu(kind), false)?)) })
            .collect::<Result<Vec<_>>>()?;

        let gpu = (0..back_buffer_count)
            .map(|slot| -> Result<_> {
                let [a, b] = HeapKind::SHADER_VISIBLE;
                Ok([
                    GpuDescriptorHeap::new(a, slot, create(a, capacities.frame(a), true)?),
                    GpuDescriptorHeap::new(b, slot, create(b, capacities.frame(b), true)?),
                ])
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "descriptor heaps: {:?}, {} frame slot(s)",
            capacities,
            back_buffer_count
        );
        Ok(Self { cpu, gpu })
    }

    pub fn cpu_heap(&self, kind: HeapKind) -> &CpuDescriptorHeap<H> {
        &self.cpu[kind.index()]
    }

    pub fn cpu_heap_mut(&mut self, kind: HeapKind) -> &mut CpuDescriptorHeap<H> {
        &mut self.cpu[kind.index()]
    }

    pub fn allocate(&mut self, kind: HeapKind) -> Result<DescriptorHandle> {
        self.cpu[kind.index()].get_new_handle()
    }

    pub fn free(&mut self, kind: HeapKind, handle: DescriptorHandle) -> Result<()> {
        self.cpu[kind.index()].free_handle(handle)
    }

    /// Resets both shader-visible heaps belonging to `frame`'s slot.
    pub fn begin_frame(&mut self, frame: FrameContext) -> Result<()> {
        for heap in &mut self.gpu[frame.slot] {
            heap.reset(frame)?;
        }
        Ok(())
    }

    pub fn gpu_heap(&self, frame: FrameContext, kind: HeapKind) -> Result<&GpuDescriptorHeap<H>> {
        Ok(&self.gpu[frame.slot][kind.visible_index()?])
    }

    pub fn gpu_heap_mut(&mut self, frame: FrameContext, kind: HeapKind) -> Result<&mut GpuDescriptorHeap<H>> {
        Ok(&mut self.gpu[frame.slot][kind.visible_index()?])
    }

    pub fn get_handle_block(&mut self, frame: FrameContext, kind: HeapKind, count: u32) -> Result<DescriptorBlock> {
        self.gpu_heap_mut(frame, kind)?.get_handle_block(frame, count)
    }

    pub fn usage(&self, frame: FrameContext) -> Vec<HeapUsage> {
        let cpu = self.cpu.iter().map(|h| HeapUsage {
            kind: Some(h.kind),
            used: h.active_count(),
            capacity: h.capacity(),
        });
        let gpu = self.gpu[frame.slot].iter().map(|h| HeapUsage {
            kind: Some(h.kind),
            used: h.used(),
            capacity: h.capacity(),
        });
        cpu.chain(gpu).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeHeap(HeapLayout);

    impl NativeHeap for FakeHeap {
        fn layout(&self) -> HeapLayout {
            self.0
        }
    }

    fn fake(capacity: u32, visible: bool) -> FakeHeap {
        FakeHeap(HeapLayout {
            cpu_start: 0x1000,
            gpu_start: visible.then_some(0x8000_0000),
            increment: 32,
            capacity,
        })
    }

    fn frame(slot: usize, number: u64) -> FrameContext {
        FrameContext::new(slot, number)
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut heap = CpuDescriptorHeap::new(HeapKind::CbvSrvUav, fake(4, false));
        let handles: Vec<_> = (0..4).map(|_| heap.get_new_handle().unwrap()).collect();
        assert_eq!(handles.iter().map(|h| h.index()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        heap.free_handle(handles[1]).unwrap();
        assert_eq!(heap.active_count(), 3);

        let again = heap.get_new_handle().unwrap();
        assert_eq!(again.index(), 1);
        assert_eq!(again.cpu(), handles[1].cpu());
        assert_eq!(heap.active_count(), 4);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut heap = CpuDescriptorHeap::new(HeapKind::Rtv, fake(2, false));
        heap.get_new_handle().unwrap();
        heap.get_new_handle().unwrap();
        assert!(matches!(
            heap.get_new_handle(),
            Err(RenderError::HeapExhausted { kind: HeapKind::Rtv, capacity: 2 })
        ));
    }

    #[test]
    fn double_free_and_over_free_are_rejected() {
        let mut heap = CpuDescriptorHeap::new(HeapKind::Dsv, fake(4, false));
        let a = heap.get_new_handle().unwrap();
        let b = heap.get_new_handle().unwrap();
        heap.free_handle(a).unwrap();
        assert!(matches!(heap.free_handle(a), Err(RenderError::DoubleFree { index: 0, .. })));
        heap.free_handle(b).unwrap();
        assert!(matches!(heap.free_handle(b), Err(RenderError::OverFree { .. })));
    }

    #[test]
    fn handles_from_elsewhere_are_rejected() {
        let mut heap = CpuDescriptorHeap::new(HeapKind::CbvSrvUav, fake(4, false));
        heap.get_new_handle().unwrap();
        let stranger = FakeHeap(HeapLayout {
            cpu_start: 0x9000,
            gpu_start: None,
            increment: 32,
            capacity: 4,
        })
        .layout()
        .handle(0);
        assert!(matches!(heap.free_handle(stranger), Err(RenderError::ForeignHandle { .. })));
    }

    #[test]
    fn live_handles_never_alias_under_churn() {
        let capacity = 16;
        let mut heap = CpuDescriptorHeap::new(HeapKind::CbvSrvUav, fake(capacity, false));
        let mut live: Vec<DescriptorHandle> = Vec::new();
        let mut seed = 0x2545_f491u32;

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let allocate = live.is_empty() || (seed % 3 != 0 && live.len() < capacity as usize);
            if allocate {
                live.push(heap.get_new_handle().unwrap());
            } else {
                let victim = live.swap_remove(seed as usize % live.len());
                heap.free_handle(victim).unwrap();
            }
            let distinct: HashSet<u32> = live.iter().map(|h| h.index()).collect();
            assert_eq!(distinct.len(), live.len());
            assert_eq!(heap.active_count() as usize, live.len());
        }
    }

    #[test]
    fn recycling_does_not_grow_the_heap() {
        let mut heap = CpuDescriptorHeap::new(HeapKind::Sampler, fake(3, false));
        for _ in 0..10 {
            let handles: Vec<_> = (0..3).map(|_| heap.get_new_handle().unwrap()).collect();
            assert!(handles.iter().all(|h| h.index() < 3));
            for h in handles {
                heap.free_handle(h).unwrap();
            }
        }
        assert_eq!(heap.active_count(), 0);
    }

    #[test]
    fn frame_heap_overflow_and_reset() {
        let mut heap = GpuDescriptorHeap::new(HeapKind::CbvSrvUav, 0, fake(100, true));
        heap.reset(frame(0, 0)).unwrap();
        heap.get_handle_block(frame(0, 0), 60).unwrap();
        assert!(matches!(
            heap.get_handle_block(frame(0, 0), 41),
            Err(RenderError::FrameHeapOverflow { requested: 41, used: 60, capacity: 100, .. })
        ));
        assert_eq!(heap.used(), 60);

        heap.reset(frame(0, 2)).unwrap();
        let block = heap.get_handle_block(frame(0, 2), 41).unwrap();
        assert_eq!(block.first().index(), 0);
    }

    #[test]
    fn frame_heap_fits_exactly_its_capacity() {
        let mut heap = GpuDescriptorHeap::new(HeapKind::CbvSrvUav, 1, fake(100, true));
        heap.reset(frame(1, 5)).unwrap();
        for size in [10, 40, 25, 25] {
            heap.get_handle_block(frame(1, 5), size).unwrap();
        }
        assert!(heap.get_handle_block(frame(1, 5), 1).is_err());
    }

    #[test]
    fn frame_heap_refuses_allocation_without_reset() {
        let mut heap = GpuDescriptorHeap::new(HeapKind::CbvSrvUav, 0, fake(8, true));
        assert!(matches!(
            heap.get_handle_block(frame(0, 0), 1),
            Err(RenderError::StaleFrameHeap { .. })
        ));
        heap.reset(frame(0, 0)).unwrap();
        heap.get_handle_block(frame(0, 0), 1).unwrap();
        assert!(heap.get_handle_block(frame(0, 2), 1).is_err());
    }

    #[test]
    fn frame_heap_refuses_second_reset_in_same_frame() {
        let mut heap = GpuDescriptorHeap::new(HeapKind::CbvSrvUav, 0, fake(32, true));
        heap.reset(frame(0, 7)).unwrap();
        let first = heap.get_handle_block(frame(0, 7), 10).unwrap();
        assert!(matches!(
            heap.reset(frame(0, 7)),
            Err(RenderError::FrameHeapResetTwice { frame: 7, .. })
        ));
        // The live block is not handed out again.
        let second = heap.get_handle_block(frame(0, 7), 10).unwrap();
        assert_eq!(second.gpu(), first.gpu() + 10 * 32);
        assert_eq!(heap.used(), 20);

        heap.reset(frame(0, 10)).unwrap();
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn block_handles_are_contiguous() {
        let mut heap = GpuDescriptorHeap::new(HeapKind::CbvSrvUav, 0, fake(8, true));
        heap.reset(frame(0, 0)).unwrap();
        heap.get_handle_block(frame(0, 0), 2).unwrap();
        let block = heap.get_handle_block(frame(0, 0), 3).unwrap();
        assert_eq!(block.len(), 3);
        assert_eq!(block.gpu(), 0x8000_0000 + 2 * 32);
        assert_eq!(block.handle(2).cpu(), 0x1000 + 4 * 32);
        assert_eq!(block.handle(2).gpu(), Some(0x8000_0000 + 4 * 32));
    }

    #[test]
    fn manager_keeps_one_frame_heap_per_slot() {
        let mut manager = DescriptorHeapManager::new(3, &HeapCapacities::default(), |kind, capacity, visible| {
            assert!(!visible || kind.can_be_shader_visible());
            Ok(fake(capacity, visible))
        })
        .unwrap();

        manager.begin_frame(frame(0, 0)).unwrap();
        manager.get_handle_block(frame(0, 0), HeapKind::CbvSrvUav, 10).unwrap();
        manager.begin_frame(frame(1, 1)).unwrap();
        manager.get_handle_block(frame(1, 1), HeapKind::CbvSrvUav, 3).unwrap();

        assert_eq!(manager.gpu_heap(frame(0, 0), HeapKind::CbvSrvUav).unwrap().used(), 10);
        assert_eq!(manager.gpu_heap(frame(1, 1), HeapKind::CbvSrvUav).unwrap().used(), 3);
        assert!(matches!(
            manager.gpu_heap(frame(0, 0), HeapKind::Rtv),
            Err(RenderError::NotShaderVisible { kind: HeapKind::Rtv })
        ));

        let rtv = manager.allocate(HeapKind::Rtv).unwrap();
        assert_eq!(manager.cpu_heap(HeapKind::Rtv).active_count(), 1);
        manager.free(HeapKind::Rtv, rtv).unwrap();
        assert_eq!(manager.cpu_heap(HeapKind::Rtv).active_count(), 0);
    }
}
