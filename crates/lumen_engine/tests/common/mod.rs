//! Host-memory stand-ins for the device seams

#![allow(dead_code)]

use ash::vk::{self, Handle};
use lumen_engine::render::backends::vulkan::{
    AllocationHandle, BufferDesc, GpuAllocator, ImageDesc, ResourceDestroyer, VulkanError, VulkanResult,
};
use slotmap::SlotMap;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
struct HostState {
    next_raw: u64,
    memory: SlotMap<AllocationHandle, Box<[u8]>>,
    buffers_created: usize,
}

/// Allocator whose buffers live in host memory
#[derive(Default)]
pub struct HostAllocator {
    state: Mutex<HostState>,
}

impl HostAllocator {
    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buffers_created(&self) -> usize {
        self.lock().buffers_created
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().memory.len()
    }
}

impl GpuAllocator for HostAllocator {
    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<(vk::Buffer, AllocationHandle)> {
        let size = usize::try_from(desc.size).map_err(|_| VulkanError::OutOfMemory { requested: desc.size })?;
        let mut state = self.lock();
        state.next_raw += 1;
        state.buffers_created += 1;
        let raw = state.next_raw;
        let allocation = state.memory.insert(vec![0; size].into_boxed_slice());
        Ok((vk::Buffer::from_raw(raw), allocation))
    }

    fn destroy_buffer(&self, _buffer: vk::Buffer, allocation: AllocationHandle) {
        self.lock().memory.remove(allocation);
    }

    fn map_memory(&self, allocation: AllocationHandle) -> VulkanResult<NonNull<u8>> {
        let mut state = self.lock();
        let memory = state.memory.get_mut(allocation).ok_or(VulkanError::ResourceNotFound { id: 0 })?;
        Ok(NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling()))
    }

    fn unmap_memory(&self, _allocation: AllocationHandle) {}

    fn create_image(&self, _desc: &ImageDesc) -> VulkanResult<(vk::Image, AllocationHandle)> {
        let mut state = self.lock();
        state.next_raw += 1;
        let raw = state.next_raw;
        let allocation = state.memory.insert(Box::default());
        Ok((vk::Image::from_raw(raw), allocation))
    }

    fn destroy_image(&self, _image: vk::Image, allocation: AllocationHandle) {
        self.lock().memory.remove(allocation);
    }
}

/// Destroyer that remembers every raw handle it destroyed
#[derive(Default)]
pub struct CountingDestroyer {
    destroyed: Mutex<Vec<u64>>,
}

impl CountingDestroyer {
    pub fn destroyed(&self) -> Vec<u64> {
        self.destroyed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn destroyed_set(&self) -> HashSet<u64> {
        self.destroyed().into_iter().collect()
    }

    fn record(&self, raw: u64) {
        self.destroyed.lock().unwrap_or_else(PoisonError::into_inner).push(raw);
    }
}

impl ResourceDestroyer for CountingDestroyer {
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        for command_buffer in command_buffers {
            self.record(command_buffer.as_raw());
        }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.record(sampler.as_raw());
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.record(view.as_raw());
    }

    fn destroy_image(&self, image: vk::Image, _allocation: AllocationHandle) {
        self.record(image.as_raw());
    }
}
