//! Vulkan resource management (allocation, staging, deferred destruction, images)

/// Device memory allocation seam and the VMA-backed implementation
pub mod allocator;

/// Typed deferred destruction of native handles
pub mod garbage;

/// Closure-based deferred teardown
pub mod free_queue;

/// Power-of-two pooled staging buffers
pub mod staging;

/// Sampled images uploaded through staging buffers
pub mod image;

use std::sync::Arc;

use allocator::GpuAllocator;
use free_queue::FreeQueue;
use garbage::{GarbageCollector, ResourceDestroyer};
use staging::StagingBufferRegistry;

/// Per-renderer registries whose contents are tied to frame slots
///
/// Shared through an `Arc` so worker threads can retire resources and request
/// staging buffers while the frame loop runs.
pub struct FrameResources {
    /// Deferred destruction of native handles
    pub garbage: GarbageCollector,
    /// Deferred teardown actions
    pub free_queue: FreeQueue,
    /// Upload staging buffers
    pub staging: StagingBufferRegistry,
    frames_in_flight: usize,
}

impl FrameResources {
    /// Create empty registries for `frames_in_flight` slots
    pub fn new(
        destroyer: Arc<dyn ResourceDestroyer>,
        allocator: Arc<dyn GpuAllocator>,
        frames_in_flight: usize,
    ) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            garbage: GarbageCollector::new(destroyer, frames_in_flight),
            free_queue: FreeQueue::new(frames_in_flight),
            staging: StagingBufferRegistry::new(allocator, frames_in_flight),
            frames_in_flight,
        }
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Reclaim everything retired in `slot` and make it the current slot
    ///
    /// Only valid after the fences submitted in `slot` have signalled.
    pub fn begin_slot(&self, slot: usize) {
        self.garbage.dispose(slot);
        self.free_queue.flush_slot(slot);
        self.staging.retire_used(slot);
    }

    /// Reclaim everything in every slot
    ///
    /// Only valid once the device is idle.
    pub fn release_all(&self) {
        self.garbage.dispose_all();
        self.free_queue.flush();
    }
}
