//! Vulkan context management
//!
//! Owns the instance, the selected physical device, the logical device with its
//! queues, and the device memory allocator. Every queue comes from a single
//! family that supports both graphics and compute, so command buffers from one
//! pool can be submitted to any of them and resources need no ownership
//! transfers. The context is headless: surface and
//! swapchain handling live with the caller, who talks to the renderer through
//! [`PresentTarget`](crate::render::backends::vulkan::renderer::PresentTarget).

use ash::{Device, Entry, Instance};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::vk;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use thiserror::Error;

use crate::core::config::RendererConfig;
use crate::render::backends::vulkan::resources::allocator::{
    AllocationHandle, BufferDesc, GpuAllocator, ImageDesc, VmaAllocator,
};
use crate::render::backends::vulkan::state::synchronizer::FenceWaiter;
use crate::render::backends::vulkan::state::sync::wait_for_fences;
use crate::render::backends::vulkan::state::frame_graph::Queue;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u64,
    },

    /// An argument broke the contract of the called operation
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the rejected argument
        reason: String,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, optionally with validation layers
    pub fn new(app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid application name: {e}")))?;
        let engine_name_cstr = CString::new("Lumen")
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        #[allow(unused_mut)]
        let mut extensions: Vec<*const std::os::raw::c_char> = Vec::new();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let validation_layer = CStr::from_bytes_with_nul(b"VK_LAYER_KHRONOS_validation\0")
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let layer_names: Vec<*const std::os::raw::c_char> = if cfg!(debug_assertions) && enable_validation {
            vec![validation_layer.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe {
            entry.create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        log::debug!("Created Vulkan instance for '{}' (validation: {})", app_name, enable_validation);

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Available queue families
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Queue family every queue is created from
    pub queues: QueueSelection,
}

impl PhysicalDeviceInfo {
    /// Select the first device exposing a graphics queue, preferring discrete GPUs
    pub fn select_suitable_device(instance: &Instance) -> VulkanResult<Self> {
        let devices = unsafe {
            instance.enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut candidates: Vec<Self> = devices
            .into_iter()
            .filter_map(|device| Self::evaluate_device(instance, device))
            .collect();

        candidates.sort_by_key(|info| {
            info.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
        });

        let selected = candidates.into_iter().next().ok_or_else(|| {
            VulkanError::InitializationFailed("No suitable GPU found".to_string())
        })?;

        log::info!("Selected GPU: {}", unsafe {
            CStr::from_ptr(selected.properties.device_name.as_ptr()).to_string_lossy()
        });

        Ok(selected)
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> Option<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(device)
        };

        let queues = select_queue_family(&queue_families)?;

        Some(Self {
            device,
            properties,
            queue_families,
            queues,
        })
    }
}

/// Queue family and queue indices used by the logical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSelection {
    /// Family supporting graphics and compute
    pub family: u32,
    /// Index of the compute queue within the family, 0 when it shares the graphics queue
    pub compute_queue_index: u32,
}

impl QueueSelection {
    /// Number of queues to create in the family
    pub fn queue_count(&self) -> u32 {
        self.compute_queue_index + 1
    }
}

/// Pick the first family with both graphics and compute.
///
/// Dedicated compute families are skipped: command buffers are allocated from
/// one pool, and a pool's buffers may only be submitted to queues of its family.
/// A second queue of the same family is used for compute when there is one.
fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<QueueSelection> {
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    let (index, properties) = families
        .iter()
        .enumerate()
        .find(|(_, family)| family.queue_flags.contains(required) && family.queue_count > 0)?;

    Some(QueueSelection {
        family: u32::try_from(index).ok()?,
        compute_queue_index: u32::from(properties.queue_count > 1),
    })
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue, also used for presentation hand-off
    pub graphics_queue: vk::Queue,
    /// Compute operations queue, the graphics queue when the family has only one
    pub compute_queue: vk::Queue,
    /// Index of the queue family both queues belong to
    pub queue_family: u32,
}

impl LogicalDevice {
    /// Create a new logical device with its queues in the selected family
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> VulkanResult<Self> {
        let queues = physical_device_info.queues;
        let priorities = vec![1.0_f32; queues.queue_count() as usize];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queues.family)
            .queue_priorities(&priorities)
            .build()];

        let device_features = vk::PhysicalDeviceFeatures::builder().build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&device_features);

        let device = unsafe {
            instance.create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(queues.family, 0) };
        let compute_queue = unsafe { device.get_device_queue(queues.family, queues.compute_queue_index) };

        log::debug!(
            "Created logical device with {} queue(s) in family {}",
            queues.queue_count(), queues.family
        );

        Ok(Self {
            device,
            graphics_queue,
            compute_queue,
            queue_family: queues.family,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main Vulkan context that owns all core Vulkan resources
///
/// Fields drop in declaration order: the allocator goes before the device, and
/// the device before the instance. Resource registries reach the allocator
/// through an `Arc<VulkanContext>` used as their [`GpuAllocator`], so the
/// device outlives every allocation made from it.
pub struct VulkanContext {
    /// Device memory allocator
    allocator: VmaAllocator,
    /// Selected physical device information
    physical_device: PhysicalDeviceInfo,
    /// Logical device for operations
    device: LogicalDevice,
    /// Vulkan instance and debug utilities
    instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a headless Vulkan context from the renderer configuration
    pub fn new(config: &RendererConfig) -> VulkanResult<Self> {
        let enable_validation = config.enable_validation.unwrap_or(cfg!(debug_assertions));
        let instance = VulkanInstance::new(&config.application_name, enable_validation)?;

        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        let allocator = VmaAllocator::new(
            &instance.instance,
            &device.device,
            physical_device.device,
        )?;

        Ok(Self {
            allocator,
            physical_device,
            device,
            instance,
        })
    }

    /// Get a reference to the Vulkan entry
    pub fn entry(&self) -> &Entry {
        &self.instance.entry
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the physical device info
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Get the logical device
    pub fn device(&self) -> &LogicalDevice {
        &self.device
    }

    /// Get the raw Device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// The device memory allocator
    pub fn allocator(&self) -> &VmaAllocator {
        &self.allocator
    }

    /// Resolve a logical queue to its native queue
    ///
    /// Presentation is handed off on the graphics queue.
    pub fn queue(&self, queue: Queue) -> vk::Queue {
        match queue {
            Queue::Graphics | Queue::Present => self.device.graphics_queue,
            Queue::Compute => self.device.compute_queue,
        }
    }

    /// Queue family shared by every logical queue
    pub fn queue_family(&self) -> u32 {
        self.device.queue_family
    }

    /// Whether `format` supports linear filtering in blits from optimally tiled images
    pub fn supports_linear_blit(&self, format: vk::Format) -> bool {
        let properties = unsafe {
            self.instance.instance.get_physical_device_format_properties(self.physical_device.device, format)
        };
        properties.optimal_tiling_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.device.device.device_wait_idle().map_err(VulkanError::Api)
        }
    }
}

impl GpuAllocator for VulkanContext {
    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<(vk::Buffer, AllocationHandle)> {
        self.allocator.create_buffer(desc)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) {
        self.allocator.destroy_buffer(buffer, allocation);
    }

    fn map_memory(&self, allocation: AllocationHandle) -> VulkanResult<NonNull<u8>> {
        self.allocator.map_memory(allocation)
    }

    fn unmap_memory(&self, allocation: AllocationHandle) {
        self.allocator.unmap_memory(allocation);
    }

    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<(vk::Image, AllocationHandle)> {
        self.allocator.create_image(desc)
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle) {
        self.allocator.destroy_image(image, allocation);
    }
}

impl FenceWaiter for VulkanContext {
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VulkanResult<()> {
        wait_for_fences(&self.device.device, fences, timeout)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
        }
        log::debug!("Vulkan context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_dedicated_compute_family_is_not_used() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
        ];
        let selection = select_queue_family(&families).unwrap();
        assert_eq!(selection.family, 0);
        assert_eq!(selection.compute_queue_index, 0);
        assert_eq!(selection.queue_count(), 1);
    }

    #[test]
    fn test_second_queue_of_family_is_used_for_compute() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 16),
        ];
        assert_eq!(
            select_queue_family(&families),
            Some(QueueSelection { family: 1, compute_queue_index: 1 })
        );
    }

    #[test]
    fn test_graphics_without_compute_is_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(select_queue_family(&families).map(|s| s.family), Some(1));
    }

    #[test]
    fn test_no_graphics_family_is_unsuitable() {
        let families = [family(vk::QueueFlags::COMPUTE, 4)];
        assert_eq!(select_queue_family(&families), None);
    }

    #[test]
    fn test_error_messages() {
        let err = VulkanError::OutOfMemory { requested: 64 };
        assert_eq!(err.to_string(), "Out of memory: 64 bytes");

        let err = VulkanError::InvalidArgument { reason: "size must be non-zero".to_string() };
        assert!(err.to_string().contains("size must be non-zero"));
    }
}
