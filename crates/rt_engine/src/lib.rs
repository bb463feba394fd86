//! # RT Engine
//!
//! GPU resource lifecycle and ray-tracing core.
//!
//! ## Features
//!
//! - **Swapchain management**: double or triple buffering, resize, tearing and HDR negotiation
//! - **Frame pacing**: fence-based CPU/GPU synchronization with per-frame command list recycling
//! - **Device-loss recovery**: observers are notified while every device object is rebuilt
//! - **Descriptor slots**: free-list slot allocator with multi-owner reference counts
//! - **Acceleration structures**: bottom-level builds, per-frame top-level builds and refits
//! - **Shader tables**: fixed-stride records with a typed writer
//!
//! Work reaches the GPU through the traits in [`render::api`]. The headless
//! backend runs everywhere and is what the tests use; the Vulkan backend is
//! behind the `vulkan` feature.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rt_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = HeadlessBackend::default();
//!     let surface = HeadlessSurface::new(Rect::new(0, 0, 1280, 720));
//!
//!     let mut manager = SwapchainManager::new(Box::new(backend), DeviceConfig::default())?;
//!     manager.set_window(Box::new(surface), 1280, 720);
//!     manager.create_device_resources()?;
//!     manager.create_window_size_dependent_resources()?;
//!
//!     for _ in 0..3 {
//!         manager.prepare(None)?;
//!         manager.execute_frame()?;
//!         manager.present()?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc
)]

pub mod config;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::config::{Config, ConfigError};
    pub use crate::render::api::{
        ColorSpace, CommandList, DeviceConfig, FeatureLevel, Format, GpuResource, GraphicsBackend, GraphicsDevice,
        GraphicsError, GraphicsResult, OutputSurface, Rect,
    };
    pub use crate::render::backends::headless::{HeadlessBackend, HeadlessConfig, HeadlessSurface};
    pub use crate::render::descriptors::{DescriptorHeapAllocator, SlotAllocator, SlotId};
    pub use crate::render::device::{DeviceNotify, DeviceState, Resolution, SwapchainManager};
    pub use crate::render::frame::{CommandPass, FramePacer};
    pub use crate::render::raytracing::{
        AccelerationStructureBuilder, BottomLevel, PerFrame, RayTracingPipelineBuilder, ShaderBindingLayout,
        ShaderTable, ShaderTableLayout, ShaderTableWriter, ShaderTableZone, TopLevel, TopLevelInstance,
    };
    pub use crate::render::resources::{ConstantBuffer, SceneConstants};
}
