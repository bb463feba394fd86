//! Vulkan backend
//!
//! Implements the backend API on top of `ash` with the KHR acceleration
//! structure and ray tracing pipeline extensions. The mapping onto Vulkan:
//!
//! - fences are timeline semaphores, signalled through empty queue submits
//! - GPU virtual addresses are buffer device addresses; buffers flagged as
//!   acceleration structure storage report the address of the structure
//!   created over them, which is what instance records must reference
//! - a shader-visible descriptor heap is one bindless descriptor set whose
//!   arrays are indexed by slot; descriptor handles carry the slot in their
//!   low 32 bits and the heap id in the high 32 bits
//! - resource states translate into image layouts and access masks; an image
//!   leaves `UNDEFINED` on the first barrier that touches it
//! - root signature handles are raw `VkPipelineLayout` values, zero selecting
//!   the device's bindless layout
//!
//! Vulkan has no portable output enumeration, so the instance reports a
//! single SDR output spanning the virtual desktop.

mod acceleration;
mod command_list;
mod conv;
mod device;
mod instance;
mod pipeline;
mod queue;
mod resources;
mod swapchain;

use std::sync::Arc;

pub use command_list::VulkanCommandList;
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use pipeline::VulkanPipeline;
pub use queue::{VulkanFence, VulkanQueue};
pub use resources::{VulkanDescriptorHeap, VulkanResource};
pub use swapchain::VulkanSwapchain;

use crate::render::api::{GraphicsBackend, GraphicsError, GraphicsInstance, GraphicsResult};
use instance::InstanceShared;

/// Descriptors per array of the bindless set
pub const MAX_BINDLESS_DESCRIPTORS: u32 = 4096;

/// Application identity reported to the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulkanConfig {
    /// Application name
    pub application_name: String,
    /// Engine name
    pub engine_name: String,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self { application_name: "rt_engine application".to_string(), engine_name: "rt_engine".to_string() }
    }
}

/// Backend entry point for Vulkan
pub struct VulkanBackend {
    config: VulkanConfig,
}

impl VulkanBackend {
    /// Create a backend; the loader is opened per instance
    pub fn new(config: VulkanConfig) -> Self {
        Self { config }
    }
}

impl Default for VulkanBackend {
    fn default() -> Self {
        Self::new(VulkanConfig::default())
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn enable_debug_layer(&self) -> GraphicsResult<()> {
        if instance::validation_layer_available()? {
            Ok(())
        } else {
            Err(GraphicsError::Unsupported { feature: "VK_LAYER_KHRONOS_validation".to_string() })
        }
    }

    fn create_instance(&self, debug: bool) -> GraphicsResult<Box<dyn GraphicsInstance>> {
        let shared = InstanceShared::new(&self.config, debug)?;
        Ok(Box::new(VulkanInstance::new(Arc::new(shared))))
    }
}
