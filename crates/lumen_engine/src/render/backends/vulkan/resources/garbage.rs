//! Deferred destruction of GPU handles
//!
//! Handles that may still be referenced by in-flight GPU work are handed to the
//! [`GarbageCollector`] instead of being destroyed. Each frame slot keeps its own
//! pending set; the set is destroyed once the slot's fences have signalled.

use ash::{vk, Device};
use std::sync::{Arc, Mutex, PoisonError};

use super::allocator::{AllocationHandle, GpuAllocator};

/// Destroys native handles on behalf of the garbage collector
pub trait ResourceDestroyer: Send + Sync {
    /// Free command buffers in a single batched call
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Destroy an image and release its memory
    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle);
}

/// [`ResourceDestroyer`] backed by the logical device
pub struct DeviceDestroyer {
    device: Device,
    command_pool: vk::CommandPool,
    allocator: Arc<dyn GpuAllocator>,
}

impl DeviceDestroyer {
    /// Create a destroyer that frees command buffers back to `command_pool`
    pub fn new(device: Device, command_pool: vk::CommandPool, allocator: Arc<dyn GpuAllocator>) -> Self {
        Self {
            device,
            command_pool,
            allocator,
        }
    }
}

impl ResourceDestroyer for DeviceDestroyer {
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.device.free_command_buffers(self.command_pool, command_buffers);
        }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe {
            self.device.destroy_sampler(sampler, None);
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe {
            self.device.destroy_image_view(view, None);
        }
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle) {
        self.allocator.destroy_image(image, allocation);
    }
}

/// Handles retired together with an image
///
/// Any field may be null; null handles are skipped at disposal. An image without
/// an allocation (for example one owned by a swapchain) is never destroyed here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageGarbage {
    /// Image handle
    pub image: vk::Image,
    /// Memory backing the image
    pub allocation: Option<AllocationHandle>,
    /// View over the image
    pub view: vk::ImageView,
    /// Sampler used with the image
    pub sampler: vk::Sampler,
}

/// A retired resource awaiting destruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarbageEntry {
    /// Command buffer allocated from the renderer's pool
    CommandBuffer(vk::CommandBuffer),
    /// Image with its view and sampler
    Image(ImageGarbage),
}

impl From<vk::CommandBuffer> for GarbageEntry {
    fn from(command_buffer: vk::CommandBuffer) -> Self {
        Self::CommandBuffer(command_buffer)
    }
}

impl From<ImageGarbage> for GarbageEntry {
    fn from(image: ImageGarbage) -> Self {
        Self::Image(image)
    }
}

#[derive(Default)]
struct PendingSet {
    command_buffers: Vec<vk::CommandBuffer>,
    images: Vec<ImageGarbage>,
}

impl PendingSet {
    fn len(&self) -> usize {
        self.command_buffers.len() + self.images.len()
    }

    fn push(&mut self, entry: GarbageEntry) {
        match entry {
            GarbageEntry::CommandBuffer(command_buffer) => self.command_buffers.push(command_buffer),
            GarbageEntry::Image(image) => self.images.push(image),
        }
    }
}

struct CollectorState {
    current_slot: usize,
    slots: Vec<PendingSet>,
}

/// Thread-safe, slot-partitioned deferred destruction of GPU handles
pub struct GarbageCollector {
    destroyer: Arc<dyn ResourceDestroyer>,
    state: Mutex<CollectorState>,
}

impl GarbageCollector {
    /// Create a collector with one pending set per frame slot
    pub fn new(destroyer: Arc<dyn ResourceDestroyer>, frames_in_flight: usize) -> Self {
        Self {
            destroyer,
            state: Mutex::new(CollectorState {
                current_slot: 0,
                slots: (0..frames_in_flight.max(1)).map(|_| PendingSet::default()).collect(),
            }),
        }
    }

    /// Retire a resource into the current frame slot
    pub fn collect(&self, entry: impl Into<GarbageEntry>) {
        let entry = entry.into();
        let mut state = self.lock();
        let slot = state.current_slot;
        state.slots[slot].push(entry);
        log::trace!("Collected {:?} into slot {}", entry, slot);
    }

    /// Retire several resources into the current frame slot
    pub fn collect_all<I>(&self, entries: I)
    where
        I: IntoIterator,
        I::Item: Into<GarbageEntry>,
    {
        let mut state = self.lock();
        let slot = state.current_slot;
        for entry in entries {
            state.slots[slot].push(entry.into());
        }
    }

    /// Destroy everything retired into `slot` and make `slot` the current slot
    ///
    /// Must only be called after the fences of `slot` have signalled. Calling it
    /// again with nothing new collected destroys nothing.
    pub fn dispose(&self, slot: usize) {
        let mut state = self.lock();
        let slot = slot % state.slots.len();
        state.current_slot = slot;
        let pending = std::mem::take(&mut state.slots[slot]);
        drop(state);

        if pending.len() > 0 {
            log::debug!("Disposing {} retired resource(s) in slot {}", pending.len(), slot);
        }
        self.destroy(pending);
    }

    /// Destroy every pending resource in every slot
    ///
    /// Only valid once the device is idle.
    pub fn dispose_all(&self) {
        let mut state = self.lock();
        let pending: Vec<PendingSet> = state.slots.iter_mut().map(std::mem::take).collect();
        drop(state);

        for set in pending {
            self.destroy(set);
        }
    }

    /// Number of resources waiting for disposal across all slots
    pub fn pending_count(&self) -> usize {
        self.lock().slots.iter().map(PendingSet::len).sum()
    }

    fn destroy(&self, pending: PendingSet) {
        let command_buffers: Vec<vk::CommandBuffer> = pending.command_buffers
            .into_iter()
            .filter(|command_buffer| *command_buffer != vk::CommandBuffer::null())
            .collect();
        if !command_buffers.is_empty() {
            self.destroyer.free_command_buffers(&command_buffers);
        }

        for image in pending.images {
            if image.sampler != vk::Sampler::null() {
                self.destroyer.destroy_sampler(image.sampler);
            }
            if image.view != vk::ImageView::null() {
                self.destroyer.destroy_image_view(image.view);
            }
            if let Some(allocation) = image.allocation {
                if image.image != vk::Image::null() {
                    self.destroyer.destroy_image(image.image, allocation);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        let remaining = self.pending_count();
        if remaining > 0 {
            log::debug!("Garbage collector dropped with {} pending resource(s); disposing", remaining);
            self.dispose_all();
        }
    }
}
