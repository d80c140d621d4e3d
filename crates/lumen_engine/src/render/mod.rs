//! # Rendering System
//!
//! Vulkan rendering core: per-window renderers, the deferred reclamation of
//! GPU resources across frames in flight, and the registry that owns every
//! renderer of an application.
//!
//! ## Architecture
//!
//! - **Registry**: bounded table of live renderers addressed by id
//! - **Vulkan Backend**: context, renderer, command buffers, images and the
//!   frame-slot registries (garbage collector, free queue, staging buffers)

/// Bounded renderer table
pub mod registry;

/// Graphics backend implementations
pub mod backends;

pub use registry::{RendererId, RendererRegistry, MAX_RENDERERS};

// Re-export the Vulkan renderer as the default backend
pub use backends::vulkan::renderer::{FrameState, PresentTarget, Renderer, RendererSpecification};
