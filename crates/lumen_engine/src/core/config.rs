//! # Renderer Configuration
//!
//! Serializable settings a renderer is created from. Files are loaded and
//! saved through the [`Config`] trait in TOML or RON.

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};
use crate::render::backends::vulkan::renderer::RendererSpecification;

/// Largest supported number of frames in flight
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// # Renderer Configuration
///
/// Application metadata, swapchain parameters and frame pacing for one
/// renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Number of frame slots whose work may be pending on the GPU
    pub frames_in_flight: usize,
    /// Initial framebuffer width
    pub width: u32,
    /// Initial framebuffer height
    pub height: u32,
    /// Whether presentation waits for vertical sync
    pub vsync: bool,
    /// Whether to enable Vulkan validation layers
    pub enable_validation: Option<bool>,
    /// Timeout for fence waits and image acquisition in nanoseconds, `None` waits forever
    pub fence_timeout_ns: Option<u64>,
    /// `env_logger` filter directives
    pub log_filter: String,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            frames_in_flight: 3,
            width: 1280,
            height: 720,
            vsync: true,
            enable_validation: None, // Auto-detect based on build type
            fence_timeout_ns: None,
            log_filter: "info".to_string(),
        }
    }

    /// Set the number of frames in flight
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the framebuffer extent
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the fence wait timeout
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = Some(timeout_ns);
        self
    }

    /// Fence timeout as passed to Vulkan
    pub fn fence_timeout(&self) -> u64 {
        self.fence_timeout_ns.unwrap_or(u64::MAX)
    }

    /// Set the log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("Frames in flight must be at least 1".to_string()));
        }

        if self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "Frames in flight must not exceed {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }

        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "Framebuffer extent {}x{} must be non-zero",
                self.width, self.height
            )));
        }

        Ok(())
    }

    /// Runtime parameters derived from this configuration
    pub fn specification(&self) -> RendererSpecification {
        RendererSpecification {
            width: self.width,
            height: self.height,
            vsync: self.vsync,
            frames_in_flight: self.frames_in_flight,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Lumen Application")
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.fence_timeout(), u64::MAX);
        assert_eq!(config.log_filter, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(RendererConfig::new("").validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(9).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(8).validate().is_ok());
        assert!(matches!(
            RendererConfig::default().with_extent(0, 600).validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_specification() {
        let spec = RendererConfig::default()
            .with_extent(800, 600)
            .with_vsync(false)
            .with_frames_in_flight(2)
            .specification();
        assert_eq!(spec.width, 800);
        assert_eq!(spec.height, 600);
        assert!(!spec.vsync);
        assert_eq!(spec.frames_in_flight, 2);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("renderer.toml");
        let config = RendererConfig::new("Demo")
            .with_frames_in_flight(2)
            .with_validation(true)
            .with_fence_timeout(1_000_000_000);

        config.save_to_file(&path).unwrap();
        let loaded = RendererConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.fence_timeout(), 1_000_000_000);
    }

    #[test]
    fn test_default_saves_as_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("default.toml");
        RendererConfig::default().save_to_file(&path).unwrap();
        assert_eq!(RendererConfig::load_from_file(&path).unwrap(), RendererConfig::default());
    }

    #[test]
    fn test_ron_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("renderer.ron");
        let config = RendererConfig::new("Demo").with_log_filter("lumen_engine=trace");

        config.save_to_file(&path).unwrap();
        assert_eq!(RendererConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "application_name = \"Partial\"\nvsync = false\n").unwrap();

        let loaded = RendererConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.application_name, "Partial");
        assert!(!loaded.vsync);
        assert_eq!(loaded.frames_in_flight, 3);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("renderer.json");
        assert!(matches!(
            RendererConfig::default().save_to_file(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
