//! # Core Engine Module
//!
//! Shared configuration used by every renderer.

pub mod config;

// Re-export foundation modules for convenience
pub use crate::foundation;

// Re-export commonly used config types
pub use config::{Config, ConfigError, RendererConfig, MAX_FRAMES_IN_FLIGHT};
