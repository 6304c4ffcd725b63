use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::System::Threading::{CreateEventA, INFINITE, WaitForSingleObject};

use super::GpuResultExt;
use crate::error::{RenderError, Result};
use crate::frame::{CommandQueue, Fence};

/// An `ID3D12Fence` with the event used for CPU waits.
pub struct D3dFence {
    fence: ID3D12Fence,
    event: HANDLE,
}

impl D3dFence {
    pub fn new(device: &ID3D12Device) -> Result<Self> {
        unsafe {
            let fence: ID3D12Fence = device.CreateFence(0, D3D12_FENCE_FLAG_NONE).context("CreateFence")?;
            let event = CreateEventA(None, false, false, None).context("CreateEventA")?;
            Ok(Self { fence, event })
        }
    }

    pub fn native(&self) -> &ID3D12Fence {
        &self.fence
    }
}

impl Fence for D3dFence {
    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        unsafe {
            if self.fence.GetCompletedValue() < value {
                self.fence
                    .SetEventOnCompletion(value, self.event)
                    .context("SetEventOnCompletion")?;
                let status = WaitForSingleObject(self.event, INFINITE);
                if status != WAIT_OBJECT_0 {
                    return Err(RenderError::Gpu {
                        call: "WaitForSingleObject",
                        message: format!("fence value {value}: wait returned {:#x}", status.0),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for D3dFence {
    fn drop(&mut self) {
        if !self.event.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.event);
            }
        }
    }
}

/// A direct or compute command queue.
#[derive(Clone)]
pub struct D3dQueue {
    queue: ID3D12CommandQueue,
}

impl D3dQueue {
    pub fn new(device: &ID3D12Device, kind: D3D12_COMMAND_LIST_TYPE) -> Result<Self> {
        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: kind,
                ..Default::default()
            })
        }
        .context("CreateCommandQueue")?;
        Ok(Self { queue })
    }

    pub fn native(&self) -> &ID3D12CommandQueue {
        &self.queue
    }

    pub fn execute(&self, list: &ID3D12GraphicsCommandList4) -> Result<()> {
        unsafe {
            list.Close().context("Close")?;
            let lists = [Some(list.cast::<ID3D12CommandList>().context("cast")?)];
            self.queue.ExecuteCommandLists(&lists);
        }
        Ok(())
    }
}

impl CommandQueue for D3dQueue {
    type Fence = D3dFence;

    fn signal(&self, fence: &D3dFence, value: u64) -> Result<()> {
        unsafe { self.queue.Signal(&fence.fence, value) }.context("Signal")
    }

    fn wait(&self, fence: &D3dFence, value: u64) -> Result<()> {
        unsafe { self.queue.Wait(&fence.fence, value) }.context("Wait")
    }
}
