//! Backend-facing API
//!
//! Traits every backend implements, the plain data types crossing that
//! boundary, the error type, and the device configuration.

pub mod backend;
pub mod device_config;
pub mod error;
pub mod types;

pub use backend::{
    CommandList, CommandQueue, DescriptorHeap, GpuFence, GpuResource, GraphicsBackend, GraphicsDevice,
    GraphicsInstance, OutputSurface, RayTracingPipeline, Swapchain,
};
pub use device_config::{DeviceConfig, DeviceOptions, MAX_BACK_BUFFER_COUNT};
pub use error::{GraphicsError, GraphicsResult};
pub use types::*;
