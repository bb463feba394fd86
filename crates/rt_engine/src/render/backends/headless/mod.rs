//! Deterministic in-process GPU
//!
//! The headless backend executes command lists on a dedicated worker thread
//! that stands in for the GPU queue. Fences, resource states, acceleration
//! structure builds and shader table contents are all tracked for real, so
//! the core's synchronization and layout rules can be exercised without a
//! graphics driver:
//!
//! - fences complete asynchronously, optionally after an artificial latency
//! - resetting a command list whose previous submission is still executing
//!   is rejected, as is submitting a list that is still recording
//! - barriers are checked against the tracked resource state
//! - acceleration structures are built from the bytes in device memory and
//!   can be queried with [`HeadlessDevice::trace_ray`]
//! - device removal can be injected through [`HeadlessControl`]
//!
//! Problems a real driver would only report through its debug layer are
//! collected in [`HeadlessStats::validation_errors`].

mod acceleration;
mod command_list;
mod device;
mod instance;
mod pipeline;
mod queue;
mod resources;
mod swapchain;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

pub use acceleration::{Ray, RayHit};
pub use command_list::HeadlessCommandList;
pub use device::HeadlessDevice;
pub use instance::HeadlessInstance;
pub use pipeline::HeadlessPipeline;
pub use queue::{HeadlessFence, HeadlessQueue};
pub use resources::{HeadlessDescriptorHeap, HeadlessResource, ViewRecord};
pub use swapchain::{HeadlessSurface, HeadlessSwapchain};

use crate::render::api::{
    AdapterInfo, ColorSpace, FeatureLevel, GraphicsBackend, GraphicsError, GraphicsInstance, GraphicsResult,
    OutputDesc, Rect, ShaderTableProperties,
};
use device::DeviceShared;

/// Simulated hardware and display configuration
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Adapters in driver enumeration order
    pub adapters: Vec<AdapterInfo>,
    /// Attached outputs in enumeration order
    pub outputs: Vec<OutputDesc>,
    /// Whether tearing (variable refresh) is supported
    pub tearing_supported: bool,
    /// Whether the debug layer can be enabled
    pub debug_layer_available: bool,
    /// Color spaces swapchains accept
    pub supported_color_spaces: Vec<ColorSpace>,
    /// Time the simulated GPU spends on every submitted batch
    pub gpu_latency: Duration,
    /// Shader identifier size and alignment rules
    pub shader_table_properties: ShaderTableProperties,
}

impl HeadlessConfig {
    /// Hardware adapter with the given feature level
    pub fn hardware_adapter(index: u32, name: &str, max_feature_level: FeatureLevel, memory: u64) -> AdapterInfo {
        AdapterInfo {
            index,
            name: name.to_string(),
            vendor_id: 0x1D0F,
            device_id: 0x1000 + index,
            dedicated_video_memory: memory,
            is_software: false,
            max_feature_level,
        }
    }

    /// Software rasterizer adapter
    pub fn software_adapter(index: u32) -> AdapterInfo {
        AdapterInfo {
            index,
            name: "Headless Software Rasterizer".to_string(),
            vendor_id: 0x1414,
            device_id: 0x008C,
            dedicated_video_memory: 0,
            is_software: true,
            max_feature_level: FeatureLevel::L12_1,
        }
    }

    /// Standard dynamic range output
    pub fn sdr_output(name: &str, desktop_coordinates: Rect) -> OutputDesc {
        OutputDesc { name: name.to_string(), desktop_coordinates, color_space: ColorSpace::SrgbG22P709 }
    }

    /// HDR10 output
    pub fn hdr_output(name: &str, desktop_coordinates: Rect) -> OutputDesc {
        OutputDesc { name: name.to_string(), desktop_coordinates, color_space: ColorSpace::Hdr10G2084P2020 }
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            adapters: vec![
                Self::hardware_adapter(0, "Headless GPU", FeatureLevel::L12_2, 8 << 30),
                Self::software_adapter(1),
            ],
            outputs: vec![Self::sdr_output("Display 1", Rect::new(0, 0, 1920, 1080))],
            tearing_supported: true,
            debug_layer_available: true,
            supported_color_spaces: vec![
                ColorSpace::SrgbG22P709,
                ColorSpace::Hdr10G2084P2020,
                ColorSpace::LinearG10P709,
            ],
            gpu_latency: Duration::ZERO,
            shader_table_properties: ShaderTableProperties::default(),
        }
    }
}

/// Present call as seen by the simulated display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRecord {
    /// Sync interval passed to present
    pub sync_interval: u32,
    /// Whether the allow-tearing flag was set
    pub allow_tearing: bool,
    /// Back buffer that was presented
    pub buffer_index: u32,
}

/// Counters and diagnostics collected by the simulated GPU
#[derive(Debug, Clone, Default)]
pub struct HeadlessStats {
    /// Instances created
    pub instances_created: u32,
    /// Devices created
    pub devices_created: u32,
    /// Swapchains created
    pub swapchains_created: u32,
    /// Successful swapchain resizes
    pub swapchain_resizes: u32,
    /// Frames presented
    pub presents: u64,
    /// Most recent present
    pub last_present: Option<PresentRecord>,
    /// Command lists executed by the worker
    pub executed_lists: u64,
    /// Ray dispatches executed
    pub dispatches: u64,
    /// Full acceleration structure builds executed
    pub acceleration_structure_builds: u64,
    /// Acceleration structure refits executed
    pub acceleration_structure_refits: u64,
    /// Color space most recently applied to a swapchain
    pub color_space: Option<ColorSpace>,
    /// Debug-layer style messages
    pub validation_errors: Vec<String>,
}

struct ControlState {
    config: Mutex<HeadlessConfig>,
    output_generation: AtomicU64,
    pending_removal: Mutex<Option<String>>,
    current_device: Mutex<Weak<DeviceShared>>,
    next_device_serial: AtomicU64,
    stats: Mutex<HeadlessStats>,
}

/// Shared handle used by tests to steer the simulated hardware
#[derive(Clone)]
pub struct HeadlessControl {
    inner: Arc<ControlState>,
}

impl HeadlessControl {
    fn new(config: HeadlessConfig) -> Self {
        Self {
            inner: Arc::new(ControlState {
                config: Mutex::new(config),
                output_generation: AtomicU64::new(0),
                pending_removal: Mutex::new(None),
                current_device: Mutex::new(Weak::new()),
                next_device_serial: AtomicU64::new(1),
                stats: Mutex::new(HeadlessStats::default()),
            }),
        }
    }

    /// Snapshot of the simulated configuration
    pub fn config(&self) -> HeadlessConfig {
        self.inner.config.lock().clone()
    }

    /// Make the next present or resize report the device as removed
    pub fn inject_device_removed(&self, reason: impl Into<String>) {
        *self.inner.pending_removal.lock() = Some(reason.into());
    }

    /// Remove the current device immediately
    pub fn remove_device_now(&self, reason: impl Into<String>) {
        if let Some(device) = self.inner.current_device.lock().upgrade() {
            device.mark_removed(reason.into());
        }
    }

    /// Replace the attached outputs; instances created earlier become stale
    pub fn set_outputs(&self, outputs: Vec<OutputDesc>) {
        self.inner.config.lock().outputs = outputs;
        self.inner.output_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Change tearing support for instances created from now on
    pub fn set_tearing_supported(&self, supported: bool) {
        self.inner.config.lock().tearing_supported = supported;
    }

    /// Change the simulated GPU latency for queues created from now on
    pub fn set_gpu_latency(&self, latency: Duration) {
        self.inner.config.lock().gpu_latency = latency;
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> HeadlessStats {
        self.inner.stats.lock().clone()
    }

    /// Validation messages collected so far
    pub fn validation_errors(&self) -> Vec<String> {
        self.inner.stats.lock().validation_errors.clone()
    }

    pub(crate) fn update_stats(&self, update: impl FnOnce(&mut HeadlessStats)) {
        update(&mut self.inner.stats.lock());
    }

    pub(crate) fn report_validation_error(&self, message: String) {
        log::error!("[headless] {}", message);
        self.inner.stats.lock().validation_errors.push(message);
    }

    pub(crate) fn output_generation(&self) -> u64 {
        self.inner.output_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn take_pending_removal(&self) -> Option<String> {
        self.inner.pending_removal.lock().take()
    }

    pub(crate) fn set_current_device(&self, device: &Arc<DeviceShared>) {
        *self.inner.current_device.lock() = Arc::downgrade(device);
    }

    pub(crate) fn next_device_serial(&self) -> u64 {
        self.inner.next_device_serial.fetch_add(1, Ordering::SeqCst)
    }
}

/// Backend entry point of the simulated GPU
#[derive(Clone)]
pub struct HeadlessBackend {
    control: HeadlessControl,
}

impl HeadlessBackend {
    /// Create a backend simulating `config`
    pub fn new(config: HeadlessConfig) -> Self {
        Self { control: HeadlessControl::new(config) }
    }

    /// Handle for fault injection and statistics
    pub fn control(&self) -> HeadlessControl {
        self.control.clone()
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn enable_debug_layer(&self) -> GraphicsResult<()> {
        if self.control.config().debug_layer_available {
            Ok(())
        } else {
            Err(GraphicsError::Unsupported { feature: "debug layer".to_string() })
        }
    }

    fn create_instance(&self, debug: bool) -> GraphicsResult<Box<dyn GraphicsInstance>> {
        self.control.update_stats(|stats| stats.instances_created += 1);
        Ok(Box::new(HeadlessInstance::new(self.control.clone(), debug)))
    }
}
