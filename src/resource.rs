//! Resource state tracking.
//!
//! Each GPU resource wrapper owns a [`StateTracker`]. Transitions are queued
//! into a [`BarrierList`] and flushed by the caller before the first GPU
//! command that depends on them; transitions to the state a resource is
//! already in are elided.

use crate::error::{RenderError, Result};

/// The subset of D3D12 resource states the renderer uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    PixelShaderResource,
    NonPixelShaderResource,
    AllShaderResource,
    UnorderedAccess,
    CopySource,
    CopyDest,
    GenericRead,
    VertexAndConstantBuffer,
    IndexBuffer,
    AccelerationStructure,
}

impl ResourceState {
    /// Present and Common share the same bit pattern on the GPU.
    pub fn is_equivalent(self, other: ResourceState) -> bool {
        self.canonical() == other.canonical()
    }

    fn canonical(self) -> ResourceState {
        match self {
            ResourceState::Present => ResourceState::Common,
            s => s,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            ResourceState::DepthRead
                | ResourceState::PixelShaderResource
                | ResourceState::NonPixelShaderResource
                | ResourceState::AllShaderResource
                | ResourceState::CopySource
                | ResourceState::GenericRead
                | ResourceState::VertexAndConstantBuffer
                | ResourceState::IndexBuffer
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    Transition { before: ResourceState, after: ResourceState },
    Uav,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Barrier<R> {
    pub resource: R,
    pub kind: BarrierKind,
}

/// Barriers waiting to be flushed to a command list.
#[derive(Debug)]
pub struct BarrierList<R> {
    pending: Vec<Barrier<R>>,
}

impl<R> Default for BarrierList<R> {
    fn default() -> Self {
        Self { pending: Vec::new() }
    }
}

impl<R> BarrierList<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, barrier: Barrier<R>) {
        self.pending.push(barrier);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn as_slice(&self) -> &[Barrier<R>] {
        &self.pending
    }

    /// Hands every pending barrier to `record` in one call and clears the list.
    pub fn flush<F>(&mut self, record: F) -> Result<usize>
    where
        F: FnOnce(&[Barrier<R>]) -> Result<()>,
    {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let count = self.pending.len();
        record(&self.pending)?;
        self.pending.clear();
        Ok(count)
    }
}

/// The last known state of one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateTracker {
    state: ResourceState,
}

impl StateTracker {
    pub fn new(initial: ResourceState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Queues a transition of `resource` to `new_state` unless it is already
    /// there. Returns whether a barrier was queued.
    pub fn transition_to<R: Clone>(
        &mut self,
        resource: &R,
        barriers: &mut BarrierList<R>,
        new_state: ResourceState,
    ) -> bool {
        if self.state.is_equivalent(new_state) {
            return false;
        }
        barriers.push(Barrier {
            resource: resource.clone(),
            kind: BarrierKind::Transition {
                before: self.state,
                after: new_state,
            },
        });
        self.state = new_state;
        true
    }

    pub fn uav_barrier<R: Clone>(&self, resource: &R, barriers: &mut BarrierList<R>) {
        debug_assert_eq!(self.state, ResourceState::UnorderedAccess);
        barriers.push(Barrier {
            resource: resource.clone(),
            kind: BarrierKind::Uav,
        });
    }

    /// Adopts a state reached outside this tracker, e.g. by an implicit
    /// decay after `ExecuteCommandLists`.
    pub fn assume(&mut self, state: ResourceState) {
        self.state = state;
    }
}

bitflags::bitflags! {
    /// Views a resource wrapper creates at construction.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Views: u8 {
        const CBV = 1 << 0;
        const SRV = 1 << 1;
        const UAV = 1 << 2;
        const RTV = 1 << 3;
        const DSV = 1 << 4;
    }
}

/// Where a buffer lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Default,
    Upload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: &'static str,
    pub size: u64,
    pub stride: u32,
    pub memory: MemoryKind,
    pub views: Views,
    pub initial_state: ResourceState,
}

impl BufferDesc {
    pub const CONSTANT_ALIGNMENT: u64 = 256;

    /// A CPU-writable constant buffer, padded to the CBV alignment.
    pub fn constants(name: &'static str, size: u64) -> Self {
        Self {
            name,
            size: align_up(size.max(1), Self::CONSTANT_ALIGNMENT),
            stride: 0,
            memory: MemoryKind::Upload,
            views: Views::CBV,
            initial_state: ResourceState::GenericRead,
        }
    }

    /// A structured buffer readable from shaders.
    pub fn structured(name: &'static str, count: u32, stride: u32) -> Self {
        Self {
            name,
            size: count as u64 * stride as u64,
            stride,
            memory: MemoryKind::Default,
            views: Views::SRV,
            initial_state: ResourceState::CopyDest,
        }
    }

    pub fn upload(name: &'static str, size: u64) -> Self {
        Self {
            name,
            size,
            stride: 0,
            memory: MemoryKind::Upload,
            views: Views::empty(),
            initial_state: ResourceState::GenericRead,
        }
    }

    pub fn element_count(&self) -> u32 {
        if self.stride == 0 { 0 } else { (self.size / self.stride as u64) as u32 }
    }
}

/// Texel formats the passes render into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rg16Float,
    R32Float,
    D32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D32Float)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    /// Greater than one for volume textures.
    pub depth: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub views: Views,
    pub initial_state: ResourceState,
}

impl TextureDesc {
    pub fn render_target(name: &'static str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            name,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            format,
            views: Views::RTV | Views::SRV,
            initial_state: ResourceState::PixelShaderResource,
        }
    }

    pub fn depth(name: &'static str, width: u32, height: u32) -> Self {
        Self {
            name,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            format: TextureFormat::D32Float,
            views: Views::DSV | Views::SRV,
            initial_state: ResourceState::DepthWrite,
        }
    }

    /// A cubic 3D texture written from compute.
    pub fn volume(name: &'static str, size: u32, mip_levels: u32, format: TextureFormat) -> Self {
        Self {
            name,
            width: size,
            height: size,
            depth: size,
            mip_levels,
            format,
            views: Views::SRV | Views::UAV,
            initial_state: ResourceState::UnorderedAccess,
        }
    }

    pub fn is_volume(&self) -> bool {
        self.depth > 1
    }
}

/// A resource whose memory can be mapped for CPU writes.
pub trait Mappable {
    fn map(&self) -> Result<*mut u8>;
    fn unmap(&self);
}

/// Maps on first use and unmaps on drop.
pub struct LazyMapping<M: Mappable> {
    resource: M,
    size: usize,
    ptr: Option<*mut u8>,
}

impl<M: Mappable> LazyMapping<M> {
    pub fn new(resource: M, size: usize) -> Self {
        Self { resource, size, ptr: None }
    }

    pub fn resource(&self) -> &M {
        &self.resource
    }

    pub fn is_mapped(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn map(&mut self) -> Result<*mut u8> {
        if let Some(ptr) = self.ptr {
            return Ok(ptr);
        }
        let ptr = self.resource.map()?;
        self.ptr = Some(ptr);
        Ok(ptr)
    }

    /// Copies `value` to the start of the mapped range.
    pub fn write<T: bytemuck::Pod>(&mut self, value: &T) -> Result<()> {
        self.write_bytes(0, bytemuck::bytes_of(value))
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.size {
            return Err(RenderError::Gpu {
                call: "write",
                message: format!(
                    "{} bytes at {offset} overrun a {} byte mapping",
                    bytes.len(),
                    self.size
                ),
            });
        }
        let ptr = self.map()?;
        // SAFETY: the mapping covers `size` bytes and the range was checked above.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len()) };
        Ok(())
    }
}

impl<M: Mappable> Drop for LazyMapping<M> {
    fn drop(&mut self) {
        if self.ptr.take().is_some() {
            self.resource.unmap();
        }
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn transition_to_current_state_is_elided() {
        let mut barriers = BarrierList::new();
        let mut tracker = StateTracker::new(ResourceState::RenderTarget);

        assert!(!tracker.transition_to(&"albedo", &mut barriers, ResourceState::RenderTarget));
        assert!(barriers.is_empty());

        assert!(tracker.transition_to(&"albedo", &mut barriers, ResourceState::PixelShaderResource));
        assert_eq!(
            barriers.as_slice(),
            &[Barrier {
                resource: "albedo",
                kind: BarrierKind::Transition {
                    before: ResourceState::RenderTarget,
                    after: ResourceState::PixelShaderResource,
                },
            }]
        );
        assert_eq!(tracker.state(), ResourceState::PixelShaderResource);
    }

    #[test]
    fn repeated_transitions_queue_one_barrier() {
        let mut barriers = BarrierList::new();
        let mut tracker = StateTracker::new(ResourceState::CopyDest);
        for _ in 0..5 {
            tracker.transition_to(&7u32, &mut barriers, ResourceState::AllShaderResource);
        }
        assert_eq!(barriers.len(), 1);
    }

    #[test]
    fn present_and_common_are_one_state() {
        let mut barriers = BarrierList::new();
        let mut tracker = StateTracker::new(ResourceState::Common);
        assert!(!tracker.transition_to(&0u8, &mut barriers, ResourceState::Present));
        assert!(barriers.is_empty());
    }

    #[test]
    fn flush_hands_over_every_barrier_once() {
        let mut barriers = BarrierList::new();
        let mut a = StateTracker::new(ResourceState::RenderTarget);
        let mut b = StateTracker::new(ResourceState::UnorderedAccess);
        a.transition_to(&1, &mut barriers, ResourceState::PixelShaderResource);
        b.uav_barrier(&2, &mut barriers);

        let seen = RefCell::new(Vec::new());
        let flushed = barriers
            .flush(|list| {
                seen.borrow_mut().extend(list.iter().map(|b| b.resource));
                Ok(())
            })
            .unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert!(barriers.is_empty());

        let called = Cell::new(false);
        barriers
            .flush(|_| {
                called.set(true);
                Ok(())
            })
            .unwrap();
        assert!(!called.get());
    }

    struct FakeUpload {
        memory: RefCell<Vec<u8>>,
        maps: Cell<u32>,
        unmaps: std::rc::Rc<Cell<u32>>,
    }

    impl Mappable for FakeUpload {
        fn map(&self) -> Result<*mut u8> {
            self.maps.set(self.maps.get() + 1);
            Ok(self.memory.borrow_mut().as_mut_ptr())
        }

        fn unmap(&self) {
            self.unmaps.set(self.unmaps.get() + 1);
        }
    }

    #[test]
    fn lazy_mapping_maps_once_and_unmaps_on_drop() {
        let unmaps = std::rc::Rc::new(Cell::new(0));
        let upload = FakeUpload {
            memory: RefCell::new(vec![0; 16]),
            maps: Cell::new(0),
            unmaps: unmaps.clone(),
        };
        let mut mapping = LazyMapping::new(upload, 16);
        assert!(!mapping.is_mapped());

        mapping.write(&[1.0f32, 2.0]).unwrap();
        mapping.write_bytes(8, &[9, 9]).unwrap();
        assert_eq!(mapping.resource().maps.get(), 1);
        assert_eq!(mapping.resource().memory.borrow()[8], 9);
        assert_eq!(&mapping.resource().memory.borrow()[..4], &1.0f32.to_ne_bytes());

        drop(mapping);
        assert_eq!(unmaps.get(), 1);
    }

    #[test]
    fn overrunning_write_is_rejected() {
        let upload = FakeUpload {
            memory: RefCell::new(vec![0; 8]),
            maps: Cell::new(0),
            unmaps: std::rc::Rc::new(Cell::new(0)),
        };
        let mut mapping = LazyMapping::new(upload, 8);
        assert!(mapping.write_bytes(6, &[1, 2, 3]).is_err());
        assert!(!mapping.is_mapped());
    }

    #[test]
    fn unmapped_resource_is_not_unmapped_on_drop() {
        let unmaps = std::rc::Rc::new(Cell::new(0));
        let upload = FakeUpload {
            memory: RefCell::new(vec![0; 4]),
            maps: Cell::new(0),
            unmaps: unmaps.clone(),
        };
        drop(LazyMapping::new(upload, 4));
        assert_eq!(unmaps.get(), 0);
    }

    #[test]
    fn constant_buffers_are_padded() {
        assert_eq!(BufferDesc::constants("frame", 200).size, 256);
        assert_eq!(BufferDesc::constants("model", 257).size, 512);
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(65, 64), 128);
    }
}
