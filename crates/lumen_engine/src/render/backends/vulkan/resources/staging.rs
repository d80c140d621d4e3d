//! Staging buffer registry
//!
//! Host-visible transfer buffers are pooled in power-of-two buckets, one pool
//! per frame slot. A buffer handed out in slot `s` stays reserved until
//! [`StagingBufferRegistry::retire_used`] is called for `s`, which the renderer
//! does once that slot's fences have signalled.

use ash::vk;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use super::allocator::{AllocationHandle, BufferDesc, GpuAllocator};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Number of capacity buckets; bucket `k` holds buffers of `2^k` bytes.
pub const BUCKET_COUNT: usize = 35;

/// Largest request the registry can satisfy
pub const MAX_STAGING_SIZE: vk::DeviceSize = 1 << (BUCKET_COUNT - 1);

/// Bucket index for a request of `size` bytes: the smallest `k` with `2^k >= size`.
///
/// Returns `None` for zero and for sizes above [`MAX_STAGING_SIZE`].
pub fn bucket_for_size(size: vk::DeviceSize) -> Option<usize> {
    if size == 0 || size > MAX_STAGING_SIZE {
        return None;
    }
    Some((u64::BITS - (size - 1).leading_zeros()) as usize)
}

/// Capacity in bytes of the buffers in bucket `bucket`
pub const fn bucket_capacity(bucket: usize) -> vk::DeviceSize {
    1 << bucket
}

/// A persistently mapped host-visible transfer buffer
///
/// This is a plain record; the registry owns the underlying resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingBuffer {
    buffer: vk::Buffer,
    allocation: AllocationHandle,
    mapped: NonNull<u8>,
    size: vk::DeviceSize,
}

// The mapping stays valid until the registry destroys the buffer, and every
// writer holds the buffer exclusively between `get_buffer` and `retire_used`.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    /// Native buffer handle, usable as a transfer source
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Capacity in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copy `data` to the start of the mapped memory
    pub fn write(&self, data: &[u8]) -> VulkanResult<()> {
        self.write_at(0, data)
    }

    /// Copy `data` into the mapped memory starting at `offset`
    pub fn write_at(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > self.size) {
            return Err(VulkanError::InvalidArgument {
                reason: format!(
                    "write of {} bytes at offset {} exceeds staging buffer of {} bytes",
                    data.len(), offset, self.size
                ),
            });
        }

        let offset = usize::try_from(offset).map_err(|_| VulkanError::InvalidArgument {
            reason: format!("offset {offset} is not addressable"),
        })?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mapped.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

struct SlotBuffers {
    free: Vec<VecDeque<StagingBuffer>>,
    in_use: Vec<StagingBuffer>,
}

impl SlotBuffers {
    fn new() -> Self {
        Self {
            free: (0..BUCKET_COUNT).map(|_| VecDeque::new()).collect(),
            in_use: Vec::new(),
        }
    }
}

struct RegistryState {
    current_slot: usize,
    slots: Vec<SlotBuffers>,
}

/// Per-slot pools of reusable staging buffers
pub struct StagingBufferRegistry {
    allocator: Arc<dyn GpuAllocator>,
    state: Mutex<RegistryState>,
}

impl StagingBufferRegistry {
    /// Create an empty registry with one pool per frame slot
    pub fn new(allocator: Arc<dyn GpuAllocator>, frames_in_flight: usize) -> Self {
        Self {
            allocator,
            state: Mutex::new(RegistryState {
                current_slot: 0,
                slots: (0..frames_in_flight.max(1)).map(|_| SlotBuffers::new()).collect(),
            }),
        }
    }

    /// Hand out a buffer of at least `size` bytes for the current frame slot
    ///
    /// The buffer is reserved until the slot is retired. Reuses a free buffer
    /// of the matching capacity when one exists, otherwise allocates one.
    pub fn get_buffer(&self, size: vk::DeviceSize) -> VulkanResult<StagingBuffer> {
        if size == 0 {
            return Err(VulkanError::InvalidArgument {
                reason: "staging buffer size must be non-zero".to_string(),
            });
        }
        let bucket = bucket_for_size(size).ok_or(VulkanError::OutOfMemory { requested: size })?;

        let mut state = self.lock();
        let slot = state.current_slot;
        let reused = state.slots[slot].free[bucket].pop_front();

        let buffer = match reused {
            Some(buffer) => buffer,
            None => self.create_buffer(bucket_capacity(bucket))?,
        };

        state.slots[slot].in_use.push(buffer);
        log::trace!(
            "Staging buffer {:?} ({} bytes) reserved for {} bytes in slot {}",
            buffer.buffer, buffer.size, size, slot
        );
        Ok(buffer)
    }

    /// Return every buffer reserved in `slot` to that slot's free pools and
    /// make `slot` the current slot
    ///
    /// Must only be called once the GPU has finished the work submitted in `slot`.
    pub fn retire_used(&self, slot: usize) {
        let mut state = self.lock();
        let slot = slot % state.slots.len();
        state.current_slot = slot;

        let slot_buffers = &mut state.slots[slot];
        let retired = std::mem::take(&mut slot_buffers.in_use);
        let count = retired.len();
        for buffer in retired {
            match bucket_for_size(buffer.size) {
                Some(bucket) => slot_buffers.free[bucket].push_back(buffer),
                None => log::error!("Staging buffer {:?} has unbucketable size {}", buffer.buffer, buffer.size),
            }
        }

        if count > 0 {
            log::trace!("Retired {} staging buffer(s) in slot {}", count, slot);
        }
    }

    /// Number of free buffers pooled for `slot`
    pub fn free_count(&self, slot: usize) -> usize {
        let state = self.lock();
        state.slots.get(slot).map_or(0, |s| s.free.iter().map(VecDeque::len).sum())
    }

    /// Number of buffers reserved in `slot`
    pub fn in_use_count(&self, slot: usize) -> usize {
        let state = self.lock();
        state.slots.get(slot).map_or(0, |s| s.in_use.len())
    }

    fn create_buffer(&self, capacity: vk::DeviceSize) -> VulkanResult<StagingBuffer> {
        let (buffer, allocation) = self.allocator.create_buffer(&BufferDesc::staging(capacity))?;
        let mapped = match self.allocator.map_memory(allocation) {
            Ok(mapped) => mapped,
            Err(e) => {
                self.allocator.destroy_buffer(buffer, allocation);
                return Err(e);
            }
        };

        log::debug!("Created staging buffer {:?} with capacity {} bytes", buffer, capacity);
        Ok(StagingBuffer {
            buffer,
            allocation,
            mapped,
            size: capacity,
        })
    }

    fn destroy_buffers(&self, buffers: impl IntoIterator<Item = StagingBuffer>) {
        for buffer in buffers {
            self.allocator.unmap_memory(buffer.allocation);
            self.allocator.destroy_buffer(buffer.buffer, buffer.allocation);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StagingBufferRegistry {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut self.lock().slots);
        let mut destroyed = 0;
        for slot in slots {
            let buffers: Vec<StagingBuffer> = slot.free
                .into_iter()
                .flatten()
                .chain(slot.in_use)
                .collect();
            destroyed += buffers.len();
            self.destroy_buffers(buffers);
        }
        log::debug!("Destroyed {} staging buffer(s)", destroyed);
    }
}
