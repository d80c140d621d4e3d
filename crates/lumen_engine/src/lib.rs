//! # Lumen Engine
//!
//! Vulkan renderer core for real-time applications.
//!
//! ## Features
//!
//! - **Frame slots**: resources retired during a frame are reclaimed only
//!   once the GPU has finished every submission of that frame slot
//! - **Deferred destruction**: typed garbage collection of native handles plus
//!   a queue of arbitrary teardown actions
//! - **Staging uploads**: power-of-two pooled, persistently mapped staging
//!   buffers reused across frames
//! - **Frame graphs**: queue submissions with semaphore dependencies derived
//!   from a declarative description of the frame
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lumen_engine::prelude::*;
//! use std::sync::Arc;
//!
//! fn run(target: &mut dyn PresentTarget) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RendererConfig::new("Demo").with_frames_in_flight(2);
//!     lumen_engine::foundation::logging::init_with_filter(&config.log_filter);
//!
//!     let context = Arc::new(VulkanContext::new(&config)?);
//!     let mut renderer = Renderer::new(context, &config)?;
//!     let commands = renderer.create_render_command_buffer()?;
//!
//!     renderer.begin_frame(target)?;
//!     let recorder = commands.frame(renderer.current_slot()).record()?;
//!     recorder.end()?;
//!
//!     let graph = FrameGraph::new().then(GraphElement::new(&commands, Queue::Graphics));
//!     renderer.end_frame(&graph)?;
//!     renderer.present(target)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Core engine modules
pub mod core;

pub mod config;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        core::config::{Config, ConfigError, RendererConfig},
        foundation::deferred::Deferred,
        render::{
            backends::vulkan::{
                CommandBuffer, ExecutionPolicy, FrameGraph, FrameResources, GraphElement, Image, ImageSpec,
                Queue, RenderCommandBuffer, SamplerSpec, StagingBuffer, VulkanContext, VulkanError,
                VulkanResult, Waitable,
            },
            FrameState, PresentTarget, Renderer, RendererId, RendererRegistry,
        },
    };
}
