//! Sampled images
//!
//! An [`Image`] owns an image, its view and its sampler. Uploads go through the
//! staging buffer registry, and replaced or dropped handles are retired to the
//! garbage collector rather than destroyed on the spot. Images with more than
//! one mip level get their lower levels blitted from level 0 after each upload.

use ash::{vk, Device};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::allocator::{AllocationHandle, GpuAllocator, ImageDesc};
use super::garbage::ImageGarbage;
use super::FrameResources;
use crate::foundation::deferred::Deferred;
use crate::render::backends::vulkan::rendering::commands::CommandRecorder;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpec {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: vk::Format,
    /// Usage flags; transfer-dst is always added, transfer-src for mipmapped images
    pub usage: vk::ImageUsageFlags,
    /// Layout the image is left in after uploads
    pub layout: vk::ImageLayout,
    /// Number of mip levels, at least 1
    pub mip_levels: u32,
}

impl ImageSpec {
    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            mip_levels: 1,
        }
    }
}

/// Texture filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterMode {
    /// Nearest texel
    Nearest,
    /// Linear interpolation
    #[default]
    Linear,
}

impl From<FilterMode> for vk::Filter {
    fn from(mode: FilterMode) -> Self {
        match mode {
            FilterMode::Nearest => Self::NEAREST,
            FilterMode::Linear => Self::LINEAR,
        }
    }
}

/// Sampler addressing outside [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressMode {
    /// Tile the image
    #[default]
    Repeat,
    /// Tile with every other repetition mirrored
    MirroredRepeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

impl From<AddressMode> for vk::SamplerAddressMode {
    fn from(mode: AddressMode) -> Self {
        match mode {
            AddressMode::Repeat => Self::REPEAT,
            AddressMode::MirroredRepeat => Self::MIRRORED_REPEAT,
            AddressMode::ClampToEdge => Self::CLAMP_TO_EDGE,
        }
    }
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerSpec {
    /// Magnification filter
    pub mag_filter: FilterMode,
    /// Minification filter
    pub min_filter: FilterMode,
    /// Addressing on all axes
    pub address: AddressMode,
}

/// Stage and access masks for an image layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    /// Stages that must finish before the transition
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait for the transition
    pub dst_stage: vk::PipelineStageFlags,
    /// Writes made available by the transition
    pub src_access: vk::AccessFlags,
    /// Accesses made visible after the transition
    pub dst_access: vk::AccessFlags,
}

/// Synchronization scopes for moving an image from `old` to `new`
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> VulkanResult<LayoutTransition> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_stage, src_access) = match old {
        L::UNDEFINED => (S::TOP_OF_PIPE, A::empty()),
        L::TRANSFER_DST_OPTIMAL => (S::TRANSFER, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => (S::TRANSFER, A::TRANSFER_READ),
        L::SHADER_READ_ONLY_OPTIMAL => (S::FRAGMENT_SHADER, A::SHADER_READ),
        L::GENERAL => (S::COMPUTE_SHADER, A::SHADER_READ | A::SHADER_WRITE),
        L::COLOR_ATTACHMENT_OPTIMAL => (S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE),
        other => {
            return Err(VulkanError::InvalidOperation {
                reason: format!("unsupported source layout {other:?}"),
            })
        }
    };

    let (dst_stage, dst_access) = match new {
        L::TRANSFER_DST_OPTIMAL => (S::TRANSFER, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => (S::TRANSFER, A::TRANSFER_READ),
        L::SHADER_READ_ONLY_OPTIMAL => (S::FRAGMENT_SHADER, A::SHADER_READ),
        L::GENERAL => (S::COMPUTE_SHADER, A::SHADER_READ | A::SHADER_WRITE),
        L::COLOR_ATTACHMENT_OPTIMAL => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL if old == L::UNDEFINED => (
            S::EARLY_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        other => {
            return Err(VulkanError::InvalidOperation {
                reason: format!("unsupported transition {old:?} -> {other:?}"),
            })
        }
    };

    Ok(LayoutTransition {
        src_stage,
        dst_stage,
        src_access,
        dst_access,
    })
}

/// Aspect flags covering every plane of `format`
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel of the formats images can be uploaded in
pub fn texel_size(format: vk::Format) -> Option<vk::DeviceSize> {
    use vk::Format as F;

    let size = match format {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SRGB | F::S8_UINT => 1,
        F::R8G8_UNORM | F::R8G8_SNORM | F::R8G8_UINT | F::R8G8_SRGB | F::R16_UNORM | F::R16_UINT
        | F::R16_SFLOAT | F::D16_UNORM => 2,
        F::R8G8B8A8_UNORM | F::R8G8B8A8_SNORM | F::R8G8B8A8_UINT | F::R8G8B8A8_SRGB | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB | F::A2B10G10R10_UNORM_PACK32 | F::R16G16_SFLOAT | F::R32_UINT | F::R32_SFLOAT
        | F::D32_SFLOAT => 4,
        F::R16G16B16A16_UNORM | F::R16G16B16A16_SFLOAT | F::R32G32_SFLOAT | F::R32G32_UINT => 8,
        F::R32G32B32A32_SFLOAT | F::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// Size in bytes of a full level 0 upload
pub fn upload_size(spec: &ImageSpec) -> VulkanResult<vk::DeviceSize> {
    let texel = texel_size(spec.format).ok_or_else(|| VulkanError::InvalidArgument {
        reason: format!("uploads in format {:?} are not supported", spec.format),
    })?;
    Ok(vk::DeviceSize::from(spec.width) * vk::DeviceSize::from(spec.height) * texel)
}

/// The prefix of `data` that fills level 0, or an error when `data` is too short
pub fn upload_bytes<'d>(spec: &ImageSpec, data: &'d [u8]) -> VulkanResult<&'d [u8]> {
    let required = upload_size(spec)?;
    let available = data.len() as vk::DeviceSize;
    if available < required {
        return Err(VulkanError::InvalidArgument {
            reason: format!(
                "{}x{} {:?} image needs {} bytes, got {}",
                spec.width, spec.height, spec.format, required, available
            ),
        });
    }
    if available > required {
        log::warn!("Ignoring {} trailing byte(s) of image upload", available - required);
    }
    // required <= data.len(), so it fits in usize
    Ok(&data[..required as usize])
}

/// Length of the full mip chain for an image of `width` x `height`
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).max(1).leading_zeros()
}

/// Reject extents and mip counts an image cannot be created with
pub fn validate_spec(spec: &ImageSpec) -> VulkanResult<()> {
    if spec.width == 0 || spec.height == 0 {
        return Err(VulkanError::InvalidArgument {
            reason: format!("image extent {}x{} must be non-zero", spec.width, spec.height),
        });
    }
    let max_levels = max_mip_levels(spec.width, spec.height);
    if spec.mip_levels == 0 || spec.mip_levels > max_levels {
        return Err(VulkanError::InvalidArgument {
            reason: format!(
                "mip level count {} must be between 1 and {} for a {}x{} image",
                spec.mip_levels, max_levels, spec.width, spec.height
            ),
        });
    }
    if spec.mip_levels > 1 && aspect_mask(spec.format) != vk::ImageAspectFlags::COLOR {
        return Err(VulkanError::InvalidArgument {
            reason: format!("mip generation needs a color format, got {:?}", spec.format),
        });
    }
    Ok(())
}

/// Source and destination extents of each blit that fills levels `1..levels`
pub fn mip_chain(width: u32, height: u32, levels: u32) -> Vec<(vk::Extent2D, vk::Extent2D)> {
    let mut src = vk::Extent2D { width, height };
    (1..levels)
        .map(|_| {
            let dst = vk::Extent2D {
                width: (src.width / 2).max(1),
                height: (src.height / 2).max(1),
            };
            let blit = (src, dst);
            src = dst;
            blit
        })
        .collect()
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

#[derive(Debug, Clone, Copy)]
struct ImageHandles {
    image: vk::Image,
    allocation: AllocationHandle,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

impl From<ImageHandles> for ImageGarbage {
    fn from(handles: ImageHandles) -> Self {
        Self {
            image: handles.image,
            allocation: Some(handles.allocation),
            view: handles.view,
            sampler: handles.sampler,
        }
    }
}

/// A sampled 2D image with its view and sampler
///
/// `allocator` must be the allocator the renderer's garbage collector destroys
/// images with.
pub struct Image {
    device: Device,
    allocator: Arc<dyn GpuAllocator>,
    resources: Arc<FrameResources>,
    spec: ImageSpec,
    sampler_spec: SamplerSpec,
    handles: Deferred<ImageHandles>,
    layout: vk::ImageLayout,
}

impl Image {
    /// Create the image, its view and its sampler
    ///
    /// The contents are undefined until [`Self::set_data`] or
    /// [`Self::transition`] is recorded. With more than one mip level the
    /// format must support linear blits on the device.
    pub fn new(
        device: Device,
        allocator: Arc<dyn GpuAllocator>,
        resources: Arc<FrameResources>,
        spec: ImageSpec,
        sampler_spec: SamplerSpec,
    ) -> VulkanResult<Self> {
        validate_spec(&spec)?;
        let mut image = Self {
            device,
            allocator,
            resources,
            spec,
            sampler_spec,
            handles: Deferred::Uninitialized,
            layout: vk::ImageLayout::UNDEFINED,
        };
        let handles = image.create_handles()?;
        image.handles.construct(handles);
        Ok(image)
    }

    /// Creation parameters
    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    /// Width in texels
    pub fn width(&self) -> u32 {
        self.spec.width
    }

    /// Height in texels
    pub fn height(&self) -> u32 {
        self.spec.height
    }

    /// Layout recorded by the last transition
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Native image handle
    pub fn handle(&self) -> vk::Image {
        self.handles.get().map_or_else(vk::Image::null, |h| h.image)
    }

    /// Image view handle
    pub fn view(&self) -> vk::ImageView {
        self.handles.get().map_or_else(vk::ImageView::null, |h| h.view)
    }

    /// Sampler handle
    pub fn sampler(&self) -> vk::Sampler {
        self.handles.get().map_or_else(vk::Sampler::null, |h| h.sampler)
    }

    /// Record an upload of level 0 and leave the image in its target layout
    ///
    /// `data` must hold at least `width * height` texels; lower mip levels are
    /// regenerated from level 0. The staging buffer stays reserved until the
    /// current frame slot is retired.
    pub fn set_data(&mut self, recorder: &mut CommandRecorder, data: &[u8]) -> VulkanResult<()> {
        let image = self.live_handles()?.image;
        let data = upload_bytes(&self.spec, data)?;

        let staging = self.resources.staging.get_buffer(data.len() as vk::DeviceSize)?;
        staging.write(data)?;

        self.transition(recorder, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(self.level_layers(0))
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.spec.width,
                height: self.spec.height,
                depth: 1,
            })
            .build();

        recorder.copy_buffer_to_image(
            staging.handle(),
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&region),
        )?;

        if self.spec.mip_levels > 1 {
            self.generate_mips(recorder, image)
        } else {
            self.transition(recorder, self.spec.layout)
        }
    }

    /// Blit each level from the one above and move every level to the target layout
    ///
    /// Expects all levels in transfer-dst layout with level 0 filled.
    fn generate_mips(&mut self, recorder: &mut CommandRecorder, image: vk::Image) -> VulkanResult<()> {
        let target = self.spec.layout;
        let chain = mip_chain(self.spec.width, self.spec.height, self.spec.mip_levels);

        for (level, (src, dst)) in (1..).zip(chain) {
            let source = level - 1;
            self.level_barrier(recorder, image, source, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

            let blit = vk::ImageBlit {
                src_subresource: self.level_layers(source),
                src_offsets: [vk::Offset3D::default(), far_corner(src)],
                dst_subresource: self.level_layers(level),
                dst_offsets: [vk::Offset3D::default(), far_corner(dst)],
            };
            recorder.blit_image(
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &blit,
                vk::Filter::LINEAR,
            )?;

            self.level_barrier(recorder, image, source, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, target)?;
        }

        let last = self.spec.mip_levels - 1;
        self.level_barrier(recorder, image, last, vk::ImageLayout::TRANSFER_DST_OPTIMAL, target)?;
        self.layout = target;
        log::trace!("Generated {} mip level(s) for {:?}", last, image);
        Ok(())
    }

    fn level_barrier(
        &self,
        recorder: &mut CommandRecorder,
        image: vk::Image,
        level: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let scopes = layout_transition(old, new)?;
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                base_mip_level: level,
                level_count: 1,
                ..self.subresource_range()
            })
            .src_access_mask(scopes.src_access)
            .dst_access_mask(scopes.dst_access)
            .build();
        recorder.image_barrier(scopes.src_stage, scopes.dst_stage, &barrier)
    }

    /// Record a layout transition of every mip level
    pub fn transition(&mut self, recorder: &mut CommandRecorder, new_layout: vk::ImageLayout) -> VulkanResult<()> {
        if self.layout == new_layout {
            return Ok(());
        }
        let image = self.live_handles()?.image;
        let scopes = layout_transition(self.layout, new_layout)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(self.subresource_range())
            .src_access_mask(scopes.src_access)
            .dst_access_mask(scopes.dst_access)
            .build();

        recorder.image_barrier(scopes.src_stage, scopes.dst_stage, &barrier)?;
        self.layout = new_layout;
        Ok(())
    }

    /// Replace the image with one of a new size and record its transition to the target layout
    ///
    /// The old handles are retired to the garbage collector.
    ///
    /// The mip level count is kept and has to fit the new extent.
    pub fn resize(&mut self, recorder: &mut CommandRecorder, width: u32, height: u32) -> VulkanResult<()> {
        validate_spec(&ImageSpec { width, height, ..self.spec })?;

        self.retire();
        self.spec.width = width;
        self.spec.height = height;
        self.layout = vk::ImageLayout::UNDEFINED;

        let handles = self.create_handles()?;
        self.handles.construct(handles);
        log::debug!("Resized image to {}x{}", width, height);

        self.transition(recorder, self.spec.layout)
    }

    fn live_handles(&self) -> VulkanResult<ImageHandles> {
        self.handles.get().copied().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "image has no live handles".to_string(),
        })
    }

    fn level_layers(&self, level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: aspect_mask(self.spec.format),
            mip_level: level,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(self.spec.format),
            base_mip_level: 0,
            level_count: self.spec.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn create_handles(&self) -> VulkanResult<ImageHandles> {
        let mut usage = self.spec.usage | vk::ImageUsageFlags::TRANSFER_DST;
        if self.spec.mip_levels > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        let desc = ImageDesc {
            extent: self.spec.extent(),
            format: self.spec.format,
            usage,
            mip_levels: self.spec.mip_levels,
        };
        let (image, allocation) = self.allocator.create_image(&desc)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.spec.format)
            .subresource_range(self.subresource_range());

        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                self.allocator.destroy_image(image, allocation);
                return Err(VulkanError::Api(e));
            }
        };

        let address: vk::SamplerAddressMode = self.sampler_spec.address.into();
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(self.sampler_spec.mag_filter.into())
            .min_filter(self.sampler_spec.min_filter.into())
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(self.spec.mip_levels as f32)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        let sampler = match unsafe { self.device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { self.device.destroy_image_view(view, None) };
                self.allocator.destroy_image(image, allocation);
                return Err(VulkanError::Api(e));
            }
        };

        Ok(ImageHandles {
            image,
            allocation,
            view,
            sampler,
        })
    }

    fn retire(&mut self) {
        if let Some(handles) = self.handles.destroy() {
            self.resources.garbage.collect(ImageGarbage::from(handles));
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.retire();
    }
}
