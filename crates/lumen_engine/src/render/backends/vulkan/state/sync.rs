//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for semaphores and fences. Objects whose destruction has to be
//! deferred past in-flight GPU work can give up ownership of the raw handle with
//! `into_raw` and have their teardown queued on the
//! [`FreeQueue`](crate::render::backends::vulkan::resources::free_queue::FreeQueue).

use ash::{vk, Device};
use std::mem::ManuallyDrop;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// GPU-GPU synchronization primitive with automatic resource management
///
/// Semaphores are signalled by one submission and waited on by another:
/// image acquisition signals and rendering waits, rendering signals and
/// presentation waits.
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device.create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Release ownership of the handle without destroying it
    pub fn into_raw(self) -> vk::Semaphore {
        let this = ManuallyDrop::new(self);
        this.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence, optionally already signalled
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device.create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, fence })
    }

    /// Wait for fence
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        wait_for_fences(&self.device, &[self.fence], timeout)
    }

    /// Reset fence
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device.reset_fences(&[self.fence])
                .map_err(VulkanError::Api)
        }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Release ownership of the handle without destroying it
    pub fn into_raw(self) -> vk::Fence {
        let this = ManuallyDrop::new(self);
        this.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Wait until every fence in `fences` is signalled
///
/// An expired timeout is reported as `VulkanError::Api(vk::Result::TIMEOUT)`.
pub fn wait_for_fences(device: &Device, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()> {
    if fences.is_empty() {
        return Ok(());
    }
    unsafe {
        device.wait_for_fences(fences, true, timeout)
            .map_err(VulkanError::Api)
    }
}
