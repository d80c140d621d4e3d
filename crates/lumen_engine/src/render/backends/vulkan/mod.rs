//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering and state modules.

/// Vulkan initialization types (instance, device, context)
pub mod initialization;

/// Vulkan resource management (allocation, staging, deferred destruction, images)
pub mod resources;

/// Vulkan command pools, buffers and recording
pub mod rendering;

/// Vulkan synchronization and frame graphs
pub mod state;

/// Per-window renderer and its frame loop
pub mod renderer;

#[cfg(test)]
mod test_support;

// Re-export main renderer
pub use renderer::{FrameClock, FrameLoop, FrameState, PresentTarget, Renderer, RendererSpecification};

// Re-export core initialization types
pub use initialization::context::{PhysicalDeviceInfo, QueueSelection, VulkanContext, VulkanError, VulkanResult};

// Re-export resource types
pub use resources::allocator::{AllocationHandle, BufferDesc, GpuAllocator, ImageDesc, MemoryLocation, VmaAllocator};
pub use resources::free_queue::{FreeFn, FreeQueue};
pub use resources::garbage::{DeviceDestroyer, GarbageCollector, GarbageEntry, ImageGarbage, ResourceDestroyer};
pub use resources::image::{AddressMode, FilterMode, Image, ImageSpec, SamplerSpec};
pub use resources::staging::{StagingBuffer, StagingBufferRegistry};
pub use resources::FrameResources;

// Re-export rendering types
pub use rendering::commands::{CommandBuffer, CommandPool, CommandRecorder, CommandView, RenderCommandBuffer};

// Re-export state types
pub use state::frame_graph::{ExecutionPolicy, FrameGraph, GraphElement, Queue, Waitable};
pub use state::sync::{Fence, Semaphore};
pub use state::synchronizer::{BakedFrame, FenceWaiter, PlannedSubmission, QueueSubmitter, SemaphoreWait, SlotFences, Synchronizer};
