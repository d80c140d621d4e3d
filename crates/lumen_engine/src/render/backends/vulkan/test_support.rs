//! Recording stand-ins for the device-facing seams

use ash::vk;
use slotmap::SlotMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::rendering::commands::CommandBuffer;
use super::resources::allocator::{AllocationHandle, BufferDesc, GpuAllocator, ImageDesc};
use super::resources::garbage::ResourceDestroyer;
use super::renderer::PresentTarget;
use super::state::synchronizer::{FenceWaiter, PlannedSubmission, QueueSubmitter};
use super::{VulkanError, VulkanResult};

pub fn fake_handle<T: vk::Handle>(raw: u64) -> T {
    T::from_raw(raw)
}

/// Command buffer with handle `id`, fence `id + 1000` and semaphore `id + 2000`
pub fn fake_command(id: u64) -> CommandBuffer {
    CommandBuffer::from_raw(fake_handle(id), fake_handle(id + 1_000), fake_handle(id + 2_000))
}

struct MockAllocation {
    memory: Box<[u8]>,
}

#[derive(Default)]
struct MockAllocatorState {
    next_handle: u64,
    allocations: SlotMap<AllocationHandle, MockAllocation>,
    created_buffers: usize,
    unmapped: usize,
    double_frees: usize,
}

/// Allocator backed by host memory
#[derive(Default)]
pub struct MockAllocator {
    state: Mutex<MockAllocatorState>,
}

impl MockAllocator {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockAllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn created_buffers(&self) -> usize {
        self.lock().created_buffers
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn unmapped(&self) -> usize {
        self.lock().unmapped
    }

    pub fn double_frees(&self) -> usize {
        self.lock().double_frees
    }

    fn allocate(&self, size: usize) -> (u64, AllocationHandle) {
        let mut state = self.lock();
        state.next_handle += 1;
        let raw = state.next_handle;
        let handle = state.allocations.insert(MockAllocation {
            memory: vec![0; size].into_boxed_slice(),
        });
        (raw, handle)
    }

    fn free(&self, allocation: AllocationHandle) {
        let mut state = self.lock();
        if state.allocations.remove(allocation).is_none() {
            state.double_frees += 1;
        }
    }
}

impl GpuAllocator for MockAllocator {
    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<(vk::Buffer, AllocationHandle)> {
        let size = usize::try_from(desc.size).unwrap_or(usize::MAX);
        let (raw, handle) = self.allocate(size);
        self.lock().created_buffers += 1;
        Ok((fake_handle(raw), handle))
    }

    fn destroy_buffer(&self, _buffer: vk::Buffer, allocation: AllocationHandle) {
        self.free(allocation);
    }

    fn map_memory(&self, allocation: AllocationHandle) -> VulkanResult<NonNull<u8>> {
        let mut state = self.lock();
        let entry = state.allocations.get_mut(allocation).ok_or(VulkanError::ResourceNotFound { id: 0 })?;
        Ok(NonNull::new(entry.memory.as_mut_ptr()).unwrap_or(NonNull::dangling()))
    }

    fn unmap_memory(&self, allocation: AllocationHandle) {
        let mut state = self.lock();
        if state.allocations.contains_key(allocation) {
            state.unmapped += 1;
        }
    }

    fn create_image(&self, _desc: &ImageDesc) -> VulkanResult<(vk::Image, AllocationHandle)> {
        let (raw, handle) = self.allocate(0);
        Ok((fake_handle(raw), handle))
    }

    fn destroy_image(&self, _image: vk::Image, allocation: AllocationHandle) {
        self.free(allocation);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyCall {
    CommandBuffers(Vec<vk::CommandBuffer>),
    Sampler(vk::Sampler),
    ImageView(vk::ImageView),
    Image(vk::Image),
}

/// Destroyer that records every call in order
#[derive(Default)]
pub struct MockDestroyer {
    calls: Mutex<Vec<DestroyCall>>,
}

impl MockDestroyer {
    pub fn calls(&self) -> Vec<DestroyCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, call: DestroyCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }
}

impl ResourceDestroyer for MockDestroyer {
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        self.record(DestroyCall::CommandBuffers(command_buffers.to_vec()));
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.record(DestroyCall::Sampler(sampler));
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.record(DestroyCall::ImageView(view));
    }

    fn destroy_image(&self, image: vk::Image, _allocation: AllocationHandle) {
        self.record(DestroyCall::Image(image));
    }
}

/// Submitter that records submissions instead of issuing them
#[derive(Default)]
pub struct MockSubmitter {
    submissions: Mutex<Vec<PlannedSubmission>>,
    fail_at: Option<usize>,
}

impl MockSubmitter {
    /// Accept `index` submissions, then report a lost device
    pub fn failing_at(index: usize) -> Self {
        Self {
            submissions: Mutex::default(),
            fail_at: Some(index),
        }
    }

    pub fn submissions(&self) -> Vec<PlannedSubmission> {
        self.submissions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl QueueSubmitter for MockSubmitter {
    fn submit(&self, submission: &PlannedSubmission) -> VulkanResult<()> {
        let mut submissions = self.submissions.lock().unwrap_or_else(PoisonError::into_inner);
        if self.fail_at == Some(submissions.len()) {
            return Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        }
        submissions.push(submission.clone());
        Ok(())
    }
}

/// Fence waiter that records every wait and can be told to time out
#[derive(Default)]
pub struct MockFenceWaiter {
    waits: Mutex<Vec<Vec<vk::Fence>>>,
    failing: AtomicBool,
}

impl MockFenceWaiter {
    pub fn waits(&self) -> Vec<Vec<vk::Fence>> {
        self.waits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl FenceWaiter for MockFenceWaiter {
    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> VulkanResult<()> {
        self.waits.lock().unwrap_or_else(PoisonError::into_inner).push(fences.to_vec());
        if self.failing.load(Ordering::SeqCst) {
            return Err(VulkanError::Api(vk::Result::TIMEOUT));
        }
        Ok(())
    }
}

/// Swapchain stand-in cycling through `image_count` images
#[derive(Debug, Default)]
pub struct MockPresentTarget {
    pub image_count: u32,
    pub next_image: u32,
    pub fail_acquire: bool,
    pub fail_present: bool,
    pub acquire_signals: Vec<vk::Semaphore>,
    pub presented: Vec<(u32, Vec<vk::Semaphore>)>,
}

impl MockPresentTarget {
    pub fn new(image_count: u32) -> Self {
        Self {
            image_count,
            ..Self::default()
        }
    }
}

impl PresentTarget for MockPresentTarget {
    fn acquire_next_image(&mut self, signal: vk::Semaphore, _timeout: u64) -> VulkanResult<u32> {
        if self.fail_acquire {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        self.acquire_signals.push(signal);
        let image = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count.max(1);
        Ok(image)
    }

    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> VulkanResult<()> {
        self.presented.push((image_index, wait.to_vec()));
        if self.fail_present {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        Ok(())
    }
}
