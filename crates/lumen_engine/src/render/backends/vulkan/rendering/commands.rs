//! Command buffer management
//!
//! Command buffers carry their own in-flight fence and completion semaphore so
//! that a [`FrameGraph`](crate::render::backends::vulkan::state::frame_graph::FrameGraph)
//! can wire dependencies between them. Dropping a command buffer retires it:
//! the handle goes to the garbage collector and the sync objects to the free
//! queue, so nothing is destroyed while the GPU may still use it.

use ash::{vk, Device};
use std::sync::Arc;

use crate::render::backends::vulkan::resources::FrameResources;
use crate::render::backends::vulkan::state::sync::{wait_for_fences, Fence, Semaphore};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool whose buffers can be reset individually
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device.create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            command_pool,
        })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.device.allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

struct Owner {
    device: Device,
    resources: Arc<FrameResources>,
}

/// A primary command buffer with its own in-flight fence and completion semaphore
///
/// Must be dropped before the renderer whose pool it was allocated from.
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    fence: vk::Fence,
    finished: vk::Semaphore,
    owner: Option<Owner>,
}

impl CommandBuffer {
    /// Allocate a command buffer from `pool`
    ///
    /// The fence starts signalled so the first recording does not block.
    pub fn new(device: Device, pool: &CommandPool, resources: Arc<FrameResources>) -> VulkanResult<Self> {
        let fence = Fence::new(device.clone(), true)?;
        let finished = Semaphore::new(device.clone())?;
        let handle = pool
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InitializationFailed("No command buffer allocated".to_string()))?;

        Ok(Self {
            handle,
            fence: fence.into_raw(),
            finished: finished.into_raw(),
            owner: Some(Owner { device, resources }),
        })
    }

    /// Wrap raw handles without taking ownership of them
    #[cfg(test)]
    pub(crate) fn from_raw(handle: vk::CommandBuffer, fence: vk::Fence, finished: vk::Semaphore) -> Self {
        Self {
            handle,
            fence,
            finished,
            owner: None,
        }
    }

    /// Native command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Fence signalled when the last submission of this buffer completes
    pub fn in_flight_fence(&self) -> vk::Fence {
        self.fence
    }

    /// Semaphore signalled when the last submission of this buffer completes
    pub fn completion_semaphore(&self) -> vk::Semaphore {
        self.finished
    }

    /// Start recording, after waiting for the previous submission to finish
    pub fn record(&self) -> VulkanResult<CommandRecorder> {
        let owner = self.owner.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Command buffer has no owning device".to_string(),
        })?;
        wait_for_fences(&owner.device, &[self.fence], u64::MAX)?;

        let mut recorder = CommandRecorder::new(self.handle, owner.device.clone());
        recorder.begin()?;
        Ok(recorder)
    }

    /// Staging buffers and garbage of the renderer this buffer belongs to
    pub fn resources(&self) -> Option<&Arc<FrameResources>> {
        self.owner.as_ref().map(|owner| &owner.resources)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let Some(Owner { device, resources }) = self.owner.take() else {
            return;
        };

        resources.garbage.collect(self.handle);

        let (fence, finished) = (self.fence, self.finished);
        resources.free_queue.free(move || unsafe {
            device.destroy_fence(fence, None);
            device.destroy_semaphore(finished, None);
        });
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("fence", &self.fence)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// One command buffer per frame slot
#[derive(Debug)]
pub struct RenderCommandBuffer {
    frames: Vec<CommandBuffer>,
}

impl RenderCommandBuffer {
    /// Allocate `frames_in_flight` command buffers from `pool`
    pub fn new(
        device: &Device,
        pool: &CommandPool,
        resources: &Arc<FrameResources>,
        frames_in_flight: usize,
    ) -> VulkanResult<Self> {
        let frames = (0..frames_in_flight.max(1))
            .map(|_| CommandBuffer::new(device.clone(), pool, Arc::clone(resources)))
            .collect::<VulkanResult<Vec<_>>>()?;
        Ok(Self { frames })
    }

    /// Build from already constructed per-slot buffers
    #[cfg(test)]
    pub(crate) fn from_frames(frames: Vec<CommandBuffer>) -> Self {
        Self { frames }
    }

    /// The command buffer used in `slot`
    pub fn frame(&self, slot: usize) -> &CommandBuffer {
        &self.frames[slot % self.frames.len()]
    }

    /// Number of per-slot buffers
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false; at least one buffer is allocated
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Borrowed view over either kind of command buffer, resolved per frame slot
#[derive(Debug, Clone, Copy)]
pub enum CommandView<'a> {
    /// The same command buffer in every slot
    Single(&'a CommandBuffer),
    /// A different command buffer per slot
    PerFrame(&'a RenderCommandBuffer),
}

impl<'a> CommandView<'a> {
    /// The concrete command buffer used in `slot`
    pub fn resolve(&self, slot: usize) -> &'a CommandBuffer {
        match *self {
            Self::Single(command) => command,
            Self::PerFrame(commands) => commands.frame(slot),
        }
    }

    /// Native command buffer for `slot`
    pub fn command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.resolve(slot).handle()
    }

    /// Completion semaphore for `slot`
    pub fn completion_semaphore(&self, slot: usize) -> vk::Semaphore {
        self.resolve(slot).completion_semaphore()
    }

    /// In-flight fence for `slot`
    pub fn in_flight_fence(&self, slot: usize) -> vk::Fence {
        self.resolve(slot).in_flight_fence()
    }
}

impl<'a> From<&'a CommandBuffer> for CommandView<'a> {
    fn from(command: &'a CommandBuffer) -> Self {
        Self::Single(command)
    }
}

impl<'a> From<&'a RenderCommandBuffer> for CommandView<'a> {
    fn from(commands: &'a RenderCommandBuffer) -> Self {
        Self::PerFrame(commands)
    }
}

/// Records into a command buffer between `begin` and `end`
pub struct CommandRecorder {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
}

impl CommandRecorder {
    /// Create a new command recorder
    pub fn new(command_buffer: vk::CommandBuffer, device: Device) -> Self {
        Self {
            command_buffer,
            device,
            recording: false,
        }
    }

    /// Begin command recording
    pub fn begin(&mut self) -> VulkanResult<&mut Self> {
        if self.recording {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer already recording".to_string(),
            });
        }

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        self.recording = true;
        Ok(self)
    }

    /// Native handle of the buffer being recorded
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Record an image layout barrier
    pub fn image_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            );
        }
        Ok(())
    }

    /// Record a buffer to image copy
    pub fn copy_buffer_to_image(
        &mut self,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device.cmd_copy_buffer_to_image(self.command_buffer, buffer, image, layout, regions);
        }
        Ok(())
    }

    /// Record a scaled copy between image regions
    pub fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageBlit,
        filter: vk::Filter,
    ) -> VulkanResult<()> {
        self.ensure_recording()?;
        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                std::slice::from_ref(region),
                filter,
            );
        }
        Ok(())
    }

    /// End command recording
    pub fn end(mut self) -> VulkanResult<vk::CommandBuffer> {
        self.ensure_recording()?;

        unsafe {
            self.device.end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }

        self.recording = false;
        Ok(self.command_buffer)
    }

    fn ensure_recording(&self) -> VulkanResult<()> {
        if self.recording {
            Ok(())
        } else {
            Err(VulkanError::InvalidOperation {
                reason: "Command buffer not recording".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::vulkan::test_support::fake_command;

    #[test]
    fn test_single_view_resolves_same_buffer_for_every_slot() {
        let command = fake_command(1);
        let view = CommandView::from(&command);
        assert_eq!(view.command_buffer(0), view.command_buffer(2));
        assert_eq!(view.completion_semaphore(1), command.completion_semaphore());
    }

    #[test]
    fn test_per_frame_view_resolves_by_slot() {
        let commands = RenderCommandBuffer::from_frames(vec![fake_command(10), fake_command(20)]);
        let view = CommandView::from(&commands);
        assert_eq!(view.command_buffer(0), commands.frame(0).handle());
        assert_eq!(view.command_buffer(1), commands.frame(1).handle());
        assert_ne!(view.in_flight_fence(0), view.in_flight_fence(1));
        assert_eq!(view.command_buffer(2), view.command_buffer(0));
    }

    #[test]
    fn test_unowned_buffer_cannot_record() {
        let command = fake_command(3);
        assert!(matches!(command.record(), Err(VulkanError::InvalidOperation { .. })));
        assert!(command.resources().is_none());
    }
}
