//! # Rendering core
//!
//! ```text
//! api           backend traits, descriptors, errors, DeviceConfig
//! descriptors   slot allocator + shader-visible heap
//! frame         per-frame command lists, fences, frame pacing
//! device        SwapchainManager, device-loss recovery, color space, resolution
//! raytracing    acceleration structures, pipeline builder, shader tables
//! resources     per-frame constant buffers
//! backends      headless (always) and vulkan (feature)
//! ```
//!
//! Everything runs on one render thread. The GPU is only observed through
//! fences: a frame's command lists and constants are rewritten only after
//! the fence value recorded for that frame has completed.

pub mod api;
pub mod descriptors;
pub mod device;
pub mod frame;
pub mod raytracing;
pub mod resources;

/// Graphics backend implementations
pub mod backends;

#[cfg(test)]
pub(crate) mod tests;
