//! Device configuration for application-specific settings
//!
//! Applications describe the swapchain and device they want with a
//! [`DeviceConfig`]; the manager validates it when constructed. The config is
//! serializable so it can be kept in a TOML or RON file next to the binary.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::types::{FeatureLevel, Format};
use crate::config::Config;

/// Largest supported back-buffer count
pub const MAX_BACK_BUFFER_COUNT: u32 = 3;

bitflags! {
    /// Optional device behaviors
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceOptions: u32 {
        /// Present with tearing when the display supports it
        const ALLOW_TEARING = 0x1;
        /// Switch to an HDR color space on HDR displays
        const ENABLE_HDR = 0x2;
        /// Depth is cleared to 0 and tested with GREATER
        const REVERSE_DEPTH = 0x4;
    }
}

/// Configuration for the swapchain manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Back buffer format
    pub back_buffer_format: Format,
    /// Depth buffer format, `Unknown` for none
    pub depth_buffer_format: Format,
    /// Number of back buffers / frames in flight
    pub back_buffer_count: u32,
    /// Lowest acceptable feature level
    pub min_feature_level: FeatureLevel,
    /// Present with tearing when supported
    pub allow_tearing: bool,
    /// Use HDR output when the display supports it
    pub enable_hdr: bool,
    /// Reverse-Z depth
    pub reverse_depth: bool,
    /// Whether to enable the API debug layer
    pub enable_debug_layer: Option<bool>,
    /// Initial index into the resolution preset table
    pub resolution_index: usize,
    /// Scene clear color [R, G, B, A]
    pub clear_color: [f32; 4],
    /// Color of the bars around a letterboxed scene
    pub letterbox_color: [f32; 4],
    /// Capacity of the shader-visible CBV/SRV/UAV heap
    pub descriptor_heap_capacity: u32,
}

impl DeviceConfig {
    /// Create a configuration with the given back buffer format and count
    pub fn new(back_buffer_format: Format, back_buffer_count: u32) -> Self {
        Self {
            back_buffer_format,
            back_buffer_count,
            ..Self::default()
        }
    }

    /// Set the depth buffer format
    pub fn with_depth_format(mut self, format: Format) -> Self {
        self.depth_buffer_format = format;
        self
    }

    /// Set the minimum feature level
    pub fn with_min_feature_level(mut self, level: FeatureLevel) -> Self {
        self.min_feature_level = level;
        self
    }

    /// Request tearing support
    pub fn with_tearing(mut self, enable: bool) -> Self {
        self.allow_tearing = enable;
        self
    }

    /// Request HDR output
    pub fn with_hdr(mut self, enable: bool) -> Self {
        self.enable_hdr = enable;
        self
    }

    /// Request reverse-Z depth
    pub fn with_reverse_depth(mut self, enable: bool) -> Self {
        self.reverse_depth = enable;
        self
    }

    /// Enable or disable the debug layer
    pub fn with_debug_layer(mut self, enable: bool) -> Self {
        self.enable_debug_layer = Some(enable);
        self
    }

    /// Set the initial resolution preset
    pub fn with_resolution_index(mut self, index: usize) -> Self {
        self.resolution_index = index;
        self
    }

    /// Set the descriptor heap capacity
    pub fn with_descriptor_heap_capacity(mut self, capacity: u32) -> Self {
        self.descriptor_heap_capacity = capacity.max(16);
        self
    }

    /// Requested options as flags
    pub fn options(&self) -> DeviceOptions {
        let mut options = DeviceOptions::empty();
        options.set(DeviceOptions::ALLOW_TEARING, self.allow_tearing);
        options.set(DeviceOptions::ENABLE_HDR, self.enable_hdr);
        options.set(DeviceOptions::REVERSE_DEPTH, self.reverse_depth);
        options
    }

    /// Debug layer setting, defaulting to debug builds
    pub fn debug_layer_enabled(&self) -> bool {
        self.enable_debug_layer.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            back_buffer_format: Format::Bgra8Unorm,
            depth_buffer_format: Format::D32Float,
            back_buffer_count: 2,
            min_feature_level: FeatureLevel::L11_0,
            allow_tearing: false,
            enable_hdr: false,
            reverse_depth: false,
            enable_debug_layer: None,
            resolution_index: 2,
            clear_color: [0.0, 0.2, 0.4, 1.0],
            letterbox_color: [0.0, 0.0, 0.0, 1.0],
            descriptor_heap_capacity: 1024,
        }
    }
}

impl Config for DeviceConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_flags() {
        let config = DeviceConfig::default().with_tearing(true).with_reverse_depth(true);
        assert_eq!(config.options(), DeviceOptions::ALLOW_TEARING | DeviceOptions::REVERSE_DEPTH);
        assert!(!config.options().contains(DeviceOptions::ENABLE_HDR));
    }

    /// Missing keys fall back to defaults so partial files stay valid
    #[test]
    fn test_partial_toml() {
        let config: DeviceConfig = toml::from_str("back_buffer_count = 3\nenable_hdr = true\n").unwrap();
        assert_eq!(config.back_buffer_count, 3);
        assert!(config.enable_hdr);
        assert_eq!(config.resolution_index, 2);
        assert_eq!(config.back_buffer_format, Format::Bgra8Unorm);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = DeviceConfig::new(Format::Rgb10A2Unorm, 3).with_hdr(true);
        let text = ron::ser::to_string(&config).unwrap();
        let back: DeviceConfig = ron::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
