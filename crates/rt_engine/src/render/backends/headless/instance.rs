//! Adapter and output enumeration of the headless backend

use std::sync::Arc;

use crate::render::api::{
    AdapterInfo, CommandQueue, FeatureLevel, GpuPreference, GraphicsDevice, GraphicsError, GraphicsInstance,
    GraphicsResult, OutputDesc, OutputSurface, Swapchain, SwapchainDesc,
};

use super::device::HeadlessDevice;
use super::queue::HeadlessQueue;
use super::swapchain::HeadlessSwapchain;
use super::HeadlessControl;

/// Instance ("adapter factory") of the headless backend
pub struct HeadlessInstance {
    control: HeadlessControl,
    output_generation: u64,
    debug: bool,
}

impl HeadlessInstance {
    pub(crate) fn new(control: HeadlessControl, debug: bool) -> Self {
        let output_generation = control.output_generation();
        Self { control, output_generation, debug }
    }

    /// Whether debug reporting was requested
    pub fn debug(&self) -> bool {
        self.debug
    }
}

impl GraphicsInstance for HeadlessInstance {
    fn check_tearing_support(&self) -> GraphicsResult<bool> {
        Ok(self.control.config().tearing_supported)
    }

    fn enumerate_adapters(&self, preference: GpuPreference) -> GraphicsResult<Vec<AdapterInfo>> {
        let mut adapters = self.control.config().adapters;
        if preference == GpuPreference::HighPerformance {
            adapters.sort_by_key(|adapter| (adapter.is_software, std::cmp::Reverse(adapter.dedicated_video_memory)));
        }
        Ok(adapters)
    }

    fn create_device(&self, adapter: &AdapterInfo, minimum: FeatureLevel) -> GraphicsResult<Arc<dyn GraphicsDevice>> {
        let known = self.control.config().adapters.iter().any(|candidate| candidate == adapter);
        if !known {
            return Err(GraphicsError::Api {
                call: "create_device",
                code: format!("unknown adapter '{}'", adapter.name),
            });
        }
        if adapter.max_feature_level < minimum {
            return Err(GraphicsError::Unsupported {
                feature: format!("feature level {:?} on '{}'", minimum, adapter.name),
            });
        }
        Ok(Arc::new(HeadlessDevice::create(self.control.clone(), adapter.clone(), minimum)))
    }

    fn is_current(&self) -> bool {
        self.output_generation == self.control.output_generation()
    }

    fn enumerate_outputs(&self) -> GraphicsResult<Vec<OutputDesc>> {
        Ok(self.control.config().outputs)
    }

    fn create_swapchain(
        &self,
        device: &Arc<dyn GraphicsDevice>,
        queue: &dyn CommandQueue,
        surface: &dyn OutputSurface,
        desc: &SwapchainDesc,
    ) -> GraphicsResult<Box<dyn Swapchain>> {
        let device = device
            .as_any()
            .downcast_ref::<HeadlessDevice>()
            .ok_or_else(|| GraphicsError::invalid("device belongs to another backend"))?;
        let queue = queue
            .as_any()
            .downcast_ref::<HeadlessQueue>()
            .ok_or_else(|| GraphicsError::invalid("queue belongs to another backend"))?;
        device.shared().check_live()?;
        surface.window_bounds()?;

        let config = self.control.config();
        if desc.allow_tearing && !config.tearing_supported {
            return Err(GraphicsError::invalid("tearing swapchain requested without tearing support"));
        }
        Ok(Box::new(HeadlessSwapchain::new(
            Arc::clone(device.shared()),
            queue.sender(),
            *desc,
            config.supported_color_spaces,
        )?))
    }
}
