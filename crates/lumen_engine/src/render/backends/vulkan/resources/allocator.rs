//! Device memory allocation
//!
//! [`GpuAllocator`] is the seam between the resource registries and the memory
//! allocator. Allocations are referred to by [`AllocationHandle`] so that they
//! can be stored in plain records and moved between threads.

use ash::vk;
use slotmap::SlotMap;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};
use vk_mem::Alloc;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

slotmap::new_key_type! {
    /// Opaque reference to a device memory allocation
    pub struct AllocationHandle;
}

/// Where an allocation should live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local memory, not host visible
    GpuOnly,
    /// Host-visible memory the device reads from frequently
    CpuToGpu,
    /// Host-visible, host-coherent memory used as a transfer source
    CpuOnly,
}

/// Parameters for a buffer allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Buffer usage flags
    pub usage: vk::BufferUsageFlags,
    /// Memory placement
    pub location: MemoryLocation,
}

impl BufferDesc {
    /// Host-visible transfer source of `size` bytes
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuOnly,
        }
    }
}

/// Parameters for a 2D image allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Image dimensions
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
    /// Image usage flags
    pub usage: vk::ImageUsageFlags,
    /// Number of mip levels
    pub mip_levels: u32,
}

/// Allocator interface used by staging buffers, images and the garbage collector
pub trait GpuAllocator: Send + Sync {
    /// Create a buffer and bind memory to it
    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<(vk::Buffer, AllocationHandle)>;

    /// Destroy a buffer and release its memory
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle);

    /// Map a host-visible allocation
    fn map_memory(&self, allocation: AllocationHandle) -> VulkanResult<NonNull<u8>>;

    /// Unmap a previously mapped allocation
    fn unmap_memory(&self, allocation: AllocationHandle);

    /// Create an image and bind memory to it
    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<(vk::Image, AllocationHandle)>;

    /// Destroy an image and release its memory
    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle);
}

/// [`GpuAllocator`] backed by the Vulkan Memory Allocator
pub struct VmaAllocator {
    allocations: Mutex<SlotMap<AllocationHandle, vk_mem::Allocation>>,
    allocator: vk_mem::Allocator,
}

impl VmaAllocator {
    /// Create the allocator for a logical device
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> VulkanResult<Self> {
        let create_info = vk_mem::AllocatorCreateInfo::new(instance, device, physical_device);
        #[allow(unused_unsafe)]
        let allocator = unsafe { vk_mem::Allocator::new(create_info) }
            .map_err(VulkanError::Api)?;

        log::info!("VMA allocator created");

        Ok(Self {
            allocations: Mutex::new(SlotMap::with_key()),
            allocator,
        })
    }

    fn allocation_info(location: MemoryLocation) -> vk_mem::AllocationCreateInfo {
        match location {
            MemoryLocation::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryLocation::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
                ..Default::default()
            },
            MemoryLocation::CpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            },
        }
    }

    fn register(&self, allocation: vk_mem::Allocation) -> AllocationHandle {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(allocation)
    }

    fn release(&self, handle: AllocationHandle) -> Option<vk_mem::Allocation> {
        let removed = self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
        if removed.is_none() {
            log::error!("Attempted to release unknown allocation {:?}", handle);
        }
        removed
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl GpuAllocator for VmaAllocator {
    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<(vk::Buffer, AllocationHandle)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(&buffer_info, &Self::allocation_info(desc.location))
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        VulkanError::OutOfMemory { requested: desc.size }
                    }
                    other => VulkanError::Api(other),
                })?
        };

        log::trace!("Allocated buffer {:?} ({} bytes, {:?})", buffer, desc.size, desc.location);
        Ok((buffer, self.register(allocation)))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) {
        if let Some(mut allocation) = self.release(allocation) {
            unsafe {
                self.allocator.destroy_buffer(buffer, &mut allocation);
            }
        }
    }

    fn map_memory(&self, allocation: AllocationHandle) -> VulkanResult<NonNull<u8>> {
        let mut allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = allocations.get_mut(allocation).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("cannot map unknown allocation {allocation:?}"),
        })?;

        let mapped = unsafe {
            self.allocator.map_memory(entry).map_err(VulkanError::Api)?
        };

        NonNull::new(mapped).ok_or_else(|| VulkanError::InvalidOperation {
            reason: "allocation mapped to a null pointer".to_string(),
        })
    }

    fn unmap_memory(&self, allocation: AllocationHandle) {
        let mut allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        match allocations.get_mut(allocation) {
            Some(entry) => unsafe { self.allocator.unmap_memory(entry) },
            None => log::error!("Attempted to unmap unknown allocation {:?}", allocation),
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<(vk::Image, AllocationHandle)> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (image, allocation) = unsafe {
            self.allocator
                .create_image(&image_info, &Self::allocation_info(MemoryLocation::GpuOnly))
                .map_err(VulkanError::Api)?
        };

        log::trace!("Allocated image {:?} ({}x{})", image, desc.extent.width, desc.extent.height);
        Ok((image, self.register(allocation)))
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle) {
        if let Some(mut allocation) = self.release(allocation) {
            unsafe {
                self.allocator.destroy_image(image, &mut allocation);
            }
        }
    }
}

impl Drop for VmaAllocator {
    fn drop(&mut self) {
        let leaked = self.allocation_count();
        if leaked > 0 {
            log::warn!("VMA allocator destroyed with {} live allocation(s)", leaked);
        } else {
            log::info!("VMA allocator destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_desc() {
        let desc = BufferDesc::staging(256);
        assert_eq!(desc.size, 256);
        assert_eq!(desc.usage, vk::BufferUsageFlags::TRANSFER_SRC);
        assert_eq!(desc.location, MemoryLocation::CpuOnly);
    }

    #[test]
    fn test_host_visible_locations_require_host_visible_memory() {
        let info = VmaAllocator::allocation_info(MemoryLocation::CpuOnly);
        assert!(info.required_flags.contains(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        ));

        let info = VmaAllocator::allocation_info(MemoryLocation::GpuOnly);
        assert!(info.required_flags.is_empty());
    }

    #[test]
    fn test_vma_allocator_is_a_shared_gpu_allocator() {
        fn shared<T: GpuAllocator + Send + Sync + 'static>() {}
        shared::<VmaAllocator>();
    }
}
