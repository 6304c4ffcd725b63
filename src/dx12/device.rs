use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::core::Interface;

use super::heap::{Heaps, bind_frame_heaps, cpu, create_heaps};
use super::passes::PassContext;
use super::raytracing::raytracing_supported;
use super::sync::{D3dFence, D3dQueue};
use super::{GpuResultExt, record_barriers};
use crate::config::SandboxConfig;
use crate::descriptor::{DescriptorHandle, HeapKind};
use crate::error::{RenderError, Result};
use crate::frame::{FrameContext, FramePacer, SlotFences, Timeline, hand_off};
use crate::graph::QueueKind;
use crate::resource::{BarrierList, ResourceState, StateTracker};

/// Swap-chain storage format. Passes write linear color through an sRGB view.
pub const BACK_BUFFER_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;
pub const BACK_BUFFER_VIEW_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM_SRGB;

pub struct BackBuffer {
    resource: ID3D12Resource,
    tracker: StateTracker,
    rtv: DescriptorHandle,
}

impl BackBuffer {
    pub fn resource(&self) -> &ID3D12Resource {
        &self.resource
    }

    pub fn rtv(&self) -> DescriptorHandle {
        self.rtv
    }

    pub fn transition_to(&mut self, barriers: &mut BarrierList<ID3D12Resource>, state: ResourceState) -> bool {
        self.tracker.transition_to(&self.resource, barriers, state)
    }
}

/// Device, swap chain, both queues and the per-slot command allocators.
///
/// One direct list and one compute list are recorded per segment; after a
/// segment is submitted its list is reset against the same slot allocator,
/// so a frame can span several segments on each queue.
pub struct Graphics {
    device: ID3D12Device,
    dxr: Option<ID3D12Device5>,
    swap_chain: IDXGISwapChain4,
    direct: Timeline<D3dQueue>,
    compute: Timeline<D3dQueue>,
    pacer: FramePacer,
    compute_fences: SlotFences,
    direct_allocators: Vec<ID3D12CommandAllocator>,
    compute_allocators: Vec<ID3D12CommandAllocator>,
    upload_allocator: ID3D12CommandAllocator,
    direct_list: ID3D12GraphicsCommandList4,
    compute_list: ID3D12GraphicsCommandList4,
    back_buffers: Vec<BackBuffer>,
    pub(crate) heaps: Heaps,
    pub(crate) barriers: BarrierList<ID3D12Resource>,
    frame: FrameContext,
    active: QueueKind,
    compute_open: bool,
    compute_used: bool,
    /// Compute work submitted this frame that graphics has not waited on.
    compute_pending: bool,
    width: u32,
    height: u32,
    vsync: bool,
}

impl Graphics {
    pub fn new(hwnd: HWND, width: u32, height: u32, config: &SandboxConfig) -> Result<Self> {
        let slots = config.back_buffer_count as usize;
        unsafe {
            let factory: IDXGIFactory4 =
                CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)).context("CreateDXGIFactory2")?;
            let adapter = hardware_adapter(&factory)?;

            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device).context("D3D12CreateDevice")?;
            let device = super::created(device, "D3D12CreateDevice")?;

            let dxr = if raytracing_supported(&device) {
                device.cast::<ID3D12Device5>().ok()
            } else {
                log::warn!("device does not support DXR; ray-traced reflections are disabled");
                None
            };

            let direct_queue = D3dQueue::new(&device, D3D12_COMMAND_LIST_TYPE_DIRECT)?;
            let compute_queue = D3dQueue::new(&device, D3D12_COMMAND_LIST_TYPE_COMPUTE)?;

            let swap_chain: IDXGISwapChain1 = factory
                .CreateSwapChainForHwnd(
                    direct_queue.native(),
                    hwnd,
                    &DXGI_SWAP_CHAIN_DESC1 {
                        Width: width,
                        Height: height,
                        Format: BACK_BUFFER_FORMAT,
                        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                        BufferCount: config.back_buffer_count,
                        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                        ..Default::default()
                    },
                    None,
                    None,
                )
                .context("CreateSwapChainForHwnd")?;
            factory
                .MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER)
                .context("MakeWindowAssociation")?;
            let swap_chain: IDXGISwapChain4 = swap_chain.cast().context("cast")?;

            let mut heaps = create_heaps(&device, slots, &config.heaps)?;
            let rtvs = (0..slots)
                .map(|_| heaps.allocate(HeapKind::Rtv))
                .collect::<Result<Vec<_>>>()?;
            let back_buffers = create_back_buffers(&device, &swap_chain, &rtvs)?;

            let allocators = |kind| -> Result<Vec<ID3D12CommandAllocator>> {
                (0..slots)
                    .map(|_| device.CreateCommandAllocator(kind).context("CreateCommandAllocator"))
                    .collect()
            };
            let direct_allocators = allocators(D3D12_COMMAND_LIST_TYPE_DIRECT)?;
            let compute_allocators = allocators(D3D12_COMMAND_LIST_TYPE_COMPUTE)?;
            let upload_allocator: ID3D12CommandAllocator = device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                .context("CreateCommandAllocator")?;

            let direct_list: ID3D12GraphicsCommandList4 = device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &direct_allocators[0], None)
                .context("CreateCommandList")?;
            direct_list.Close().context("Close")?;
            let compute_list: ID3D12GraphicsCommandList4 = device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_COMPUTE, &compute_allocators[0], None)
                .context("CreateCommandList")?;
            compute_list.Close().context("Close")?;

            let direct = Timeline::new("graphics", direct_queue, D3dFence::new(&device)?);
            let compute = Timeline::new("compute", compute_queue, D3dFence::new(&device)?);

            let first = swap_chain.GetCurrentBackBufferIndex() as usize;
            log::info!(
                "device ready: {width}x{height}, {slots} back buffers, DXR {}",
                if dxr.is_some() { "available" } else { "unavailable" }
            );

            Ok(Self {
                device,
                dxr,
                swap_chain,
                direct,
                compute,
                pacer: FramePacer::new(slots, first),
                compute_fences: SlotFences::new(slots),
                direct_allocators,
                compute_allocators,
                upload_allocator,
                direct_list,
                compute_list,
                back_buffers,
                heaps,
                barriers: BarrierList::new(),
                frame: FrameContext::new(first, 0),
                active: QueueKind::Graphics,
                compute_open: false,
                compute_used: false,
                compute_pending: false,
                width,
                height,
                vsync: config.vsync,
            })
        }
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.device
    }

    pub fn dxr_device(&self) -> Option<&ID3D12Device5> {
        self.dxr.as_ref()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame(&self) -> FrameContext {
        self.frame
    }

    pub fn heaps(&self) -> &Heaps {
        &self.heaps
    }

    pub fn heaps_mut(&mut self) -> &mut Heaps {
        &mut self.heaps
    }

    /// The list of the queue currently recording.
    pub fn list(&self) -> &ID3D12GraphicsCommandList4 {
        match self.active {
            QueueKind::Graphics => &self.direct_list,
            QueueKind::Compute => &self.compute_list,
        }
    }

    pub fn active_queue(&self) -> QueueKind {
        self.active
    }

    pub fn back_buffer(&mut self) -> &mut BackBuffer {
        &mut self.back_buffers[self.frame.slot]
    }

    /// Borrows everything a pass records with, on the active list.
    pub fn pass_context(&mut self, frame_constants: u64) -> PassContext<'_> {
        let list = match self.active {
            QueueKind::Graphics => &self.direct_list,
            QueueKind::Compute => &self.compute_list,
        };
        PassContext {
            device: &self.device,
            list,
            heaps: &mut self.heaps,
            barriers: &mut self.barriers,
            back_buffer: &mut self.back_buffers[self.frame.slot],
            frame: self.frame,
            frame_constants,
            width: self.width,
            height: self.height,
        }
    }

    /// Waits for the slot's previous work on both queues, then opens the
    /// direct list and binds the slot's descriptor heaps.
    pub fn prepare(&mut self) -> Result<FrameContext> {
        let frame = self.pacer.prepare(&self.direct)?;
        self.compute_fences.wait(frame.slot, &self.compute)?;
        self.frame = frame;

        unsafe {
            self.direct_allocators[frame.slot].Reset().context("Reset")?;
            self.direct_list
                .Reset(&self.direct_allocators[frame.slot], None)
                .context("Reset")?;
        }
        self.heaps.begin_frame(frame)?;
        bind_frame_heaps(&self.direct_list, &self.heaps, frame)?;
        self.active = QueueKind::Graphics;
        self.compute_used = false;
        self.compute_pending = false;
        log::trace!("frame {} recording into slot {}", frame.number, frame.slot);
        Ok(frame)
    }

    pub fn flush_barriers(&mut self) -> Result<usize> {
        let list = match self.active {
            QueueKind::Graphics => &self.direct_list,
            QueueKind::Compute => &self.compute_list,
        };
        self.barriers.flush(|barriers| {
            record_barriers(list, barriers);
            Ok(())
        })
    }

    /// Executes the direct list recorded so far and reopens it.
    pub fn submit_graphics(&mut self) -> Result<()> {
        debug_assert_eq!(self.active, QueueKind::Graphics);
        self.flush_barriers()?;
        self.direct.queue().execute(&self.direct_list)?;
        unsafe {
            self.direct_list
                .Reset(&self.direct_allocators[self.frame.slot], None)
                .context("Reset")?;
        }
        bind_frame_heaps(&self.direct_list, &self.heaps, self.frame)
    }

    /// Opens the compute list for a compute segment.
    pub fn begin_compute(&mut self) -> Result<()> {
        let slot = self.frame.slot;
        unsafe {
            if !self.compute_used {
                self.compute_allocators[slot].Reset().context("Reset")?;
                self.compute_used = true;
            }
            self.compute_list
                .Reset(&self.compute_allocators[slot], None)
                .context("Reset")?;
        }
        bind_frame_heaps(&self.compute_list, &self.heaps, self.frame)?;
        self.compute_open = true;
        self.active = QueueKind::Compute;
        Ok(())
    }

    /// Executes the compute list and records its fence for the slot.
    pub fn submit_compute(&mut self) -> Result<()> {
        debug_assert!(self.compute_open);
        self.flush_barriers()?;
        self.compute.queue().execute(&self.compute_list)?;
        let value = self.compute.signal()?;
        self.compute_fences.record(self.frame.slot, value);
        self.compute_open = false;
        self.compute_pending = true;
        self.active = QueueKind::Graphics;
        Ok(())
    }

    /// Makes `consumer` wait on the GPU for everything submitted to the
    /// other queue so far.
    pub fn queue_wait(&mut self, consumer: QueueKind) -> Result<u64> {
        match consumer {
            QueueKind::Graphics => {
                self.compute_pending = false;
                hand_off(&mut self.compute, &self.direct)
            }
            QueueKind::Compute => hand_off(&mut self.direct, &self.compute),
        }
    }

    pub fn present(&mut self) -> Result<()> {
        let slot = self.frame.slot;
        self.back_buffers[slot].transition_to(&mut self.barriers, ResourceState::Present);
        self.flush_barriers()?;
        if self.compute_pending {
            // Nothing read the compute results, but the slot must not be
            // reused before they land.
            self.queue_wait(QueueKind::Graphics)?;
        }
        self.direct.queue().execute(&self.direct_list)?;

        let interval = if self.vsync { 1 } else { 0 };
        let presented = unsafe { self.swap_chain.Present(interval, DXGI_PRESENT(0)) };
        if presented == DXGI_ERROR_DEVICE_REMOVED || presented == DXGI_ERROR_DEVICE_RESET {
            let reason = match unsafe { self.device.GetDeviceRemovedReason() } {
                Err(e) => e.message().to_string(),
                Ok(()) => format!("{presented:?}"),
            };
            log::error!("device lost at present: {reason}");
            return Err(RenderError::DeviceLost { reason });
        }
        presented.ok().context("Present")?;

        let value = self.pacer.submit(&mut self.direct)?;
        log::trace!("frame {} submitted with fence {}", self.frame.number, value);
        let next = unsafe { self.swap_chain.GetCurrentBackBufferIndex() } as usize;
        self.pacer.move_to_next_frame(next);
        self.pacer.refresh(&self.direct);
        Ok(())
    }

    pub fn wait_for_graphics_to_finish(&mut self) -> Result<()> {
        self.pacer.wait_for_gpu(&mut self.direct)
    }

    pub fn wait_for_compute_to_finish(&mut self) -> Result<()> {
        self.compute.wait_idle().map(|_| ())
    }

    pub fn wait_for_gpu(&mut self) -> Result<()> {
        self.wait_for_compute_to_finish()?;
        self.wait_for_graphics_to_finish()
    }

    /// Records `record` on a one-off direct list, executes it and waits.
    /// Used for startup uploads and acceleration-structure builds.
    pub fn execute_immediately<R>(
        &mut self,
        record: impl FnOnce(&mut Self, &ID3D12GraphicsCommandList4) -> Result<R>,
    ) -> Result<R> {
        self.direct.wait_idle()?;
        let list: ID3D12GraphicsCommandList4 = unsafe {
            self.upload_allocator.Reset().context("Reset")?;
            self.device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &self.upload_allocator, None)
                .context("CreateCommandList")?
        };
        let result = record(self, &list)?;
        self.barriers.flush(|barriers| {
            record_barriers(&list, barriers);
            Ok(())
        })?;
        self.direct.queue().execute(&list)?;
        self.direct.wait_idle()?;
        Ok(result)
    }

    /// Recreates the back buffers at the new size. The caller recreates its
    /// own screen-sized targets afterwards.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        if width == 0 || height == 0 {
            log::warn!("ignoring resize to {width}x{height}");
            return Ok(false);
        }
        if (width, height) == (self.width, self.height) {
            return Ok(false);
        }

        self.wait_for_gpu()?;
        // ResizeBuffers needs every buffer reference released. The RTV slots
        // stay allocated and are rewritten for whichever buffers exist after.
        let rtvs: Vec<DescriptorHandle> = self.back_buffers.drain(..).map(|b| b.rtv).collect();

        let slots = self.pacer.slot_count();
        let resized = unsafe {
            self.swap_chain
                .ResizeBuffers(slots as u32, width, height, DXGI_FORMAT_UNKNOWN, DXGI_SWAP_CHAIN_FLAG(0))
                .context("ResizeBuffers")
        };
        self.back_buffers = create_back_buffers(&self.device, &self.swap_chain, &rtvs)?;
        resized?;
        self.width = width;
        self.height = height;

        let first = unsafe { self.swap_chain.GetCurrentBackBufferIndex() } as usize;
        self.pacer.restart(first);
        self.compute_fences.clear();
        log::info!("resized to {width}x{height}");
        Ok(true)
    }
}

impl Drop for Graphics {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_gpu() {
            log::error!("failed to drain the GPU on shutdown: {e}");
        }
    }
}

fn create_back_buffers(
    device: &ID3D12Device,
    swap_chain: &IDXGISwapChain4,
    rtvs: &[DescriptorHandle],
) -> Result<Vec<BackBuffer>> {
    rtvs.iter()
        .enumerate()
        .map(|(i, &rtv)| {
            let resource: ID3D12Resource = unsafe { swap_chain.GetBuffer(i as u32) }.context("GetBuffer")?;
            unsafe {
                device.CreateRenderTargetView(
                    &resource,
                    Some(&D3D12_RENDER_TARGET_VIEW_DESC {
                        Format: BACK_BUFFER_VIEW_FORMAT,
                        ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                        ..Default::default()
                    }),
                    cpu(rtv),
                );
            }
            Ok(BackBuffer {
                resource,
                tracker: StateTracker::new(ResourceState::Present),
                rtv,
            })
        })
        .collect()
}

/// The first hardware adapter that can create a D3D12 device.
fn hardware_adapter(factory: &IDXGIFactory4) -> Result<IDXGIAdapter1> {
    unsafe {
        for i in 0.. {
            let Ok(adapter) = factory.EnumAdapters1(i) else {
                break;
            };
            let desc = adapter.GetDesc1().context("GetDesc1")?;
            if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
                continue;
            }
            if D3D12CreateDevice(
                &adapter,
                D3D_FEATURE_LEVEL_11_0,
                std::ptr::null_mut::<Option<ID3D12Device>>(),
            )
            .is_ok()
            {
                let name = String::from_utf16_lossy(&desc.Description);
                log::info!("using adapter {}", name.trim_end_matches('\0'));
                return Ok(adapter);
            }
        }
    }
    Err(RenderError::Gpu {
        call: "EnumAdapters1",
        message: "no hardware adapter supports Direct3D 12".to_owned(),
    })
}
