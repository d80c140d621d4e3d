//! Per-window Vulkan renderer
//!
//! Drives the frame boundary. `begin_frame` waits for the slot's previous
//! submissions, reclaims everything retired in that slot and acquires the next
//! presentable image. `end_frame` bakes the frame graph into queue submissions,
//! and `present` hands the image back and advances to the next slot.

use ash::vk;
use std::sync::Arc;

use crate::core::config::RendererConfig;
use crate::render::backends::vulkan::rendering::commands::{CommandBuffer, CommandPool, RenderCommandBuffer};
use crate::render::backends::vulkan::resources::allocator::GpuAllocator;
use crate::render::backends::vulkan::resources::garbage::{DeviceDestroyer, GarbageEntry};
use crate::render::backends::vulkan::resources::image::{Image, ImageSpec, SamplerSpec};
use crate::render::backends::vulkan::resources::staging::StagingBuffer;
use crate::render::backends::vulkan::resources::FrameResources;
use crate::render::backends::vulkan::state::frame_graph::FrameGraph;
use crate::render::backends::vulkan::state::synchronizer::{BakedFrame, FenceWaiter, QueueSubmitter, Synchronizer};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Runtime parameters of a renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererSpecification {
    /// Framebuffer width
    pub width: u32,
    /// Framebuffer height
    pub height: u32,
    /// Whether presentation waits for vertical sync
    pub vsync: bool,
    /// Number of frame slots
    pub frames_in_flight: usize,
}

/// Swapchain side of the frame loop, implemented by the windowing layer
pub trait PresentTarget {
    /// Acquire the next presentable image, signalling `signal` once it is ready
    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: u64) -> VulkanResult<u32>;

    /// Present `image_index` after every semaphore in `wait` is signalled
    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> VulkanResult<()>;

    /// Rebuild the swapchain for a new framebuffer size or vsync mode
    fn recreate(&mut self, _width: u32, _height: u32, _vsync: bool) -> VulkanResult<()> {
        Ok(())
    }
}

/// Where the renderer is in the frame loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Between frames
    Idle,
    /// After `begin_frame`
    Recording,
    /// After `end_frame`
    Submitted,
}

/// Frame loop state machine and slot rotation
#[derive(Debug, Clone)]
pub struct FrameClock {
    state: FrameState,
    slot: usize,
    frames_in_flight: usize,
    frame_number: u64,
}

impl FrameClock {
    /// Start idle in slot 0
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            state: FrameState::Idle,
            slot: 0,
            frames_in_flight: frames_in_flight.max(1),
            frame_number: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Slot of the current or next frame
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of frames presented so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Enter recording, returning the slot of the new frame
    pub fn begin(&mut self) -> VulkanResult<usize> {
        self.transition(FrameState::Idle, FrameState::Recording, "begin_frame")?;
        Ok(self.slot)
    }

    /// Leave recording after the frame was submitted
    pub fn end(&mut self) -> VulkanResult<()> {
        self.transition(FrameState::Recording, FrameState::Submitted, "end_frame")
    }

    /// Finish the frame and move to the next slot
    pub fn present(&mut self) -> VulkanResult<()> {
        self.transition(FrameState::Submitted, FrameState::Idle, "present")?;
        self.slot = (self.slot + 1) % self.frames_in_flight;
        self.frame_number += 1;
        Ok(())
    }

    /// Abandon a frame that failed before submission
    pub fn cancel(&mut self) {
        if self.state == FrameState::Recording {
            self.state = FrameState::Idle;
        }
    }

    /// Fail unless the clock is in `expected`
    pub fn ensure(&self, expected: FrameState, operation: &str) -> VulkanResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VulkanError::InvalidOperation {
                reason: format!("{operation} called while frame is {:?}", self.state),
            })
        }
    }

    fn transition(&mut self, from: FrameState, to: FrameState, operation: &str) -> VulkanResult<()> {
        self.ensure(from, operation)?;
        self.state = to;
        Ok(())
    }
}

/// Frame-boundary protocol shared by every renderer
///
/// `begin_frame` waits on the slot's fences before anything retired in the
/// slot is reclaimed, and only then acquires the next image.
pub struct FrameLoop {
    synchronizer: Synchronizer,
    clock: FrameClock,
    fence_timeout: u64,
    acquired_image: Option<u32>,
    baked: Option<BakedFrame>,
}

impl FrameLoop {
    /// Start idle in slot 0
    pub fn new(synchronizer: Synchronizer, frames_in_flight: usize, fence_timeout: u64) -> Self {
        Self {
            synchronizer,
            clock: FrameClock::new(frames_in_flight),
            fence_timeout,
            acquired_image: None,
            baked: None,
        }
    }

    /// Frame state and slot rotation
    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    /// Fence and semaphore state
    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Image index acquired by the current frame
    pub fn acquired_image(&self) -> Option<u32> {
        self.acquired_image
    }

    /// Wait for the slot, reclaim its resources and acquire the next image
    ///
    /// On failure the frame is abandoned and the loop is idle again.
    pub fn begin_frame<W: FenceWaiter + ?Sized>(
        &mut self,
        resources: &FrameResources,
        waiter: &W,
        target: &mut dyn PresentTarget,
    ) -> VulkanResult<u32> {
        let slot = self.clock.begin()?;
        match self.prepare_frame(slot, resources, waiter, target) {
            Ok(image_index) => {
                log::trace!("Frame {} began in slot {} with image {}", self.clock.frame_number(), slot, image_index);
                self.acquired_image = Some(image_index);
                Ok(image_index)
            }
            Err(e) => {
                self.clock.cancel();
                Err(e)
            }
        }
    }

    fn prepare_frame<W: FenceWaiter + ?Sized>(
        &mut self,
        slot: usize,
        resources: &FrameResources,
        waiter: &W,
        target: &mut dyn PresentTarget,
    ) -> VulkanResult<u32> {
        self.synchronizer.wait_for_slot(slot, self.fence_timeout, waiter)?;
        resources.begin_slot(slot);
        self.synchronizer.set_current_slot(slot);
        target.acquire_next_image(self.synchronizer.image_available(slot), self.fence_timeout)
    }

    /// Submit the frame's work described by `graph`
    pub fn end_frame<S: QueueSubmitter + ?Sized>(&mut self, graph: &FrameGraph<'_>, submitter: &S) -> VulkanResult<()> {
        self.clock.ensure(FrameState::Recording, "end_frame")?;
        if graph.is_empty() {
            return Err(VulkanError::InvalidArgument {
                reason: "frame graph must contain at least one element".to_string(),
            });
        }

        let baked = self.synchronizer.bake_current_frame_graph(graph, true, submitter)?;
        log::trace!("Baked {} submission(s) for slot {}", baked.submissions.len(), self.clock.slot());
        self.baked = Some(baked);
        self.clock.end()
    }

    /// Present the acquired image and advance to the next slot
    pub fn present(&mut self, target: &mut dyn PresentTarget) -> VulkanResult<()> {
        self.clock.ensure(FrameState::Submitted, "present")?;
        let image_index = self.acquired_image.take().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "no image acquired for this frame".to_string(),
        })?;
        let wait: Vec<vk::Semaphore> = self.baked
            .take()
            .and_then(|frame| frame.present_wait)
            .into_iter()
            .collect();

        let result = target.present(image_index, &wait);
        self.clock.present()?;
        if let Err(e) = &result {
            log::warn!("Present of image {} failed: {}", image_index, e);
        }
        result
    }

    /// Bake `graph` for `slot` without waiting on an acquired image
    pub fn bake_frame_graph<S: QueueSubmitter + ?Sized>(
        &mut self,
        graph: &FrameGraph<'_>,
        slot: usize,
        submitter: &S,
    ) -> VulkanResult<BakedFrame> {
        self.synchronizer.bake_frame_graph(graph, slot, false, submitter)
    }

    /// Forget outstanding fences once the device is idle
    pub fn reset_after_idle(&mut self) {
        self.synchronizer.reset_after_idle();
    }
}

/// Vulkan renderer for one window
///
/// Command buffers created from a renderer must be dropped before it, since
/// they are freed into its command pool. Images and staging buffers keep the
/// context alive on their own.
pub struct Renderer {
    frame: FrameLoop,
    resources: Arc<FrameResources>,
    command_pool: CommandPool,
    context: Arc<VulkanContext>,
    spec: RendererSpecification,
}

impl Renderer {
    /// Create a renderer on `context`
    pub fn new(context: Arc<VulkanContext>, config: &RendererConfig) -> VulkanResult<Self> {
        config.validate().map_err(|e| VulkanError::InvalidArgument { reason: e.to_string() })?;
        let spec = config.specification();

        let device = context.raw_device();
        let command_pool = CommandPool::new(device.clone(), context.queue_family())?;

        let allocator: Arc<dyn GpuAllocator> = Arc::clone(&context) as Arc<dyn GpuAllocator>;
        let destroyer = Arc::new(DeviceDestroyer::new(
            device.clone(),
            command_pool.handle(),
            Arc::clone(&allocator),
        ));
        let resources = Arc::new(FrameResources::new(destroyer, allocator, spec.frames_in_flight));
        let synchronizer = Synchronizer::new(device, spec.frames_in_flight)?;

        log::info!(
            "Renderer created ({}x{}, vsync: {}, frames in flight: {})",
            spec.width, spec.height, spec.vsync, spec.frames_in_flight
        );

        Ok(Self {
            frame: FrameLoop::new(synchronizer, spec.frames_in_flight, config.fence_timeout()),
            resources,
            command_pool,
            context,
            spec,
        })
    }

    /// The shared Vulkan context
    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.context
    }

    /// Garbage collector, free queue and staging registry of this renderer
    pub fn resources(&self) -> &Arc<FrameResources> {
        &self.resources
    }

    /// Command pool all command buffers of this renderer come from
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Current runtime parameters
    pub fn specification(&self) -> &RendererSpecification {
        &self.spec
    }

    /// Slot of the current or next frame
    pub fn current_slot(&self) -> usize {
        self.frame.clock().slot()
    }

    /// Number of frames presented so far
    pub fn frame_number(&self) -> u64 {
        self.frame.clock().frame_number()
    }

    /// Where the renderer is in the frame loop
    pub fn frame_state(&self) -> FrameState {
        self.frame.clock().state()
    }

    /// Image index acquired by the current frame
    pub fn acquired_image(&self) -> Option<u32> {
        self.frame.acquired_image()
    }

    /// Allocate a command buffer used the same way in every slot
    pub fn create_command_buffer(&self) -> VulkanResult<CommandBuffer> {
        CommandBuffer::new(self.context.raw_device(), &self.command_pool, Arc::clone(&self.resources))
    }

    /// Allocate one command buffer per frame slot
    pub fn create_render_command_buffer(&self) -> VulkanResult<RenderCommandBuffer> {
        RenderCommandBuffer::new(
            &self.context.raw_device(),
            &self.command_pool,
            &self.resources,
            self.spec.frames_in_flight,
        )
    }

    /// Create a sampled image
    ///
    /// Mipmapped images need a format the device can blit with linear filtering.
    pub fn create_image(&self, spec: ImageSpec, sampler: SamplerSpec) -> VulkanResult<Image> {
        if spec.mip_levels > 1 && !self.context.supports_linear_blit(spec.format) {
            return Err(VulkanError::InvalidArgument {
                reason: format!("format {:?} does not support linear blits for mip generation", spec.format),
            });
        }
        Image::new(
            self.context.raw_device(),
            Arc::clone(&self.context) as Arc<dyn GpuAllocator>,
            Arc::clone(&self.resources),
            spec,
            sampler,
        )
    }

    /// Retire a handle until the current slot comes round again
    pub fn collect(&self, entry: impl Into<GarbageEntry>) {
        self.resources.garbage.collect(entry);
    }

    /// Defer a teardown action until the current slot comes round again
    pub fn free<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.resources.free_queue.free(action);
    }

    /// Reserve a staging buffer for the current slot
    pub fn staging_buffer(&self, size: vk::DeviceSize) -> VulkanResult<StagingBuffer> {
        self.resources.staging.get_buffer(size)
    }

    /// Start a frame and return the acquired image index
    pub fn begin_frame(&mut self, target: &mut dyn PresentTarget) -> VulkanResult<u32> {
        self.frame.begin_frame(&self.resources, self.context.as_ref(), target)
    }

    /// Submit the frame's work described by `graph`
    ///
    /// The first element waits on the acquired image unless another element
    /// does so explicitly; the last element's completion gates presentation.
    pub fn end_frame(&mut self, graph: &FrameGraph<'_>) -> VulkanResult<()> {
        self.frame.end_frame(graph, self.context.as_ref())
    }

    /// Present the acquired image and advance to the next slot
    ///
    /// The slot advances even when presentation reports an error, since the
    /// frame's work was already submitted.
    pub fn present(&mut self, target: &mut dyn PresentTarget) -> VulkanResult<()> {
        self.frame.present(target)
    }

    /// Bake a graph for `slot` outside the frame's image acquisition
    ///
    /// The last element still signals its completion semaphore; the caller has
    /// to consume the returned `present_wait` in a later submission.
    pub fn bake_frame_graph(&mut self, graph: &FrameGraph<'_>, slot: usize) -> VulkanResult<BakedFrame> {
        self.frame.bake_frame_graph(graph, slot, self.context.as_ref())
    }

    /// Bake a graph for the current slot outside the frame's image acquisition
    pub fn bake_current_frame_graph(&mut self, graph: &FrameGraph<'_>) -> VulkanResult<BakedFrame> {
        self.bake_frame_graph(graph, self.current_slot())
    }

    /// Apply a new framebuffer size and vsync mode
    ///
    /// Waits for the device, reclaims all retired resources and rebuilds the
    /// swapchain through `target`.
    pub fn recreate(&mut self, target: &mut dyn PresentTarget, width: u32, height: u32, vsync: bool) -> VulkanResult<()> {
        self.frame.clock().ensure(FrameState::Idle, "recreate")?;
        if width == 0 || height == 0 {
            return Err(VulkanError::InvalidArgument {
                reason: format!("framebuffer extent {width}x{height} must be non-zero"),
            });
        }

        self.context.wait_idle()?;
        self.frame.reset_after_idle();
        self.resources.release_all();

        target.recreate(width, height, vsync)?;
        self.spec.width = width;
        self.spec.height = height;
        self.spec.vsync = vsync;

        log::debug!("Renderer recreated ({}x{}, vsync: {})", width, height, vsync);
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for device idle during renderer teardown: {}", e);
        }
        self.frame.reset_after_idle();
        self.resources.release_all();
        log::debug!("Renderer destroyed after {} frame(s)", self.frame_number());
    }
}
