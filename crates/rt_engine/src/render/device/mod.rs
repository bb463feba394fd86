//! Device and swapchain ownership

pub mod color_space;
pub mod device_notify;
pub mod resolution;
pub mod swapchain_manager;

pub use color_space::{best_output, select_color_space};
pub use device_notify::{DeviceNotify, DeviceState};
pub use resolution::{
    post_view_and_scissor, Resolution, ResolutionSelector, DEFAULT_RESOLUTION_INDEX, RESOLUTION_OPTIONS,
};
pub use swapchain_manager::SwapchainManager;
