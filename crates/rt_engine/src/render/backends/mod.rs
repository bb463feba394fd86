//! Backend implementations of [`crate::render::api`]
//!
//! `headless` is always built. `vulkan` needs the `vulkan` feature and a
//! driver with the KHR ray tracing extensions.

pub mod headless;

#[cfg(feature = "vulkan")]
pub mod vulkan;
