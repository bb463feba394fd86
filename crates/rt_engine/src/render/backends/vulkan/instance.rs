//! Vulkan instance: loader, debug messenger, adapter enumeration

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use ash::extensions::ext::{DebugUtils, MetalSurface};
use ash::extensions::khr::{
    AccelerationStructure, AndroidSurface, DeferredHostOperations, RayTracingPipeline, Surface, WaylandSurface,
    Win32Surface, XcbSurface, XlibSurface,
};
use ash::{vk, Entry, Instance};

use crate::render::api::{
    AdapterInfo, ColorSpace, CommandQueue, FeatureLevel, GpuPreference, GraphicsDevice, GraphicsError,
    GraphicsInstance, GraphicsResult, OutputDesc, OutputSurface, Rect, Swapchain, SwapchainDesc,
};

use super::conv::vk_error;
use super::device::{DeviceShared, VulkanDevice};
use super::swapchain::VulkanSwapchain;
use super::VulkanConfig;

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Extent reported for the single virtual output
const VIRTUAL_DESKTOP: Rect = Rect::new(-16384, -16384, 16384, 16384);

fn load_entry() -> GraphicsResult<Entry> {
    unsafe { Entry::load() }
        .map_err(|e| GraphicsError::Unsupported { feature: format!("Vulkan loader ({})", e) })
}

pub(crate) fn validation_layer_available() -> GraphicsResult<bool> {
    let entry = load_entry()?;
    let layers = entry.enumerate_instance_layer_properties().map_err(vk_error("vkEnumerateInstanceLayerProperties"))?;
    Ok(layers
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER))
}

/// Instance-level objects shared by devices and swapchains
pub(crate) struct InstanceShared {
    pub entry: Entry,
    pub instance: Instance,
    pub surface_loader: Surface,
    pub swapchain_colorspace: bool,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl InstanceShared {
    pub fn new(config: &VulkanConfig, debug: bool) -> GraphicsResult<Self> {
        let entry = load_entry()?;

        let app_name = CString::new(config.application_name.as_str()).unwrap_or_default();
        let engine_name = CString::new(config.engine_name.as_str()).unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(vk_error("vkEnumerateInstanceExtensionProperties"))?;
        let is_available = |name: &CStr| {
            available.iter().any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        // Every platform surface the loader offers; the window is only known at swapchain creation
        let mut wanted = vec![
            Surface::name(),
            XlibSurface::name(),
            XcbSurface::name(),
            WaylandSurface::name(),
            Win32Surface::name(),
            MetalSurface::name(),
            AndroidSurface::name(),
            vk::ExtSwapchainColorspaceFn::name(),
        ];
        if debug {
            wanted.push(DebugUtils::name());
        }
        let extensions: Vec<&CStr> = wanted.into_iter().filter(|name| is_available(*name)).collect();
        if !extensions.contains(&Surface::name()) {
            return Err(GraphicsError::Unsupported { feature: "VK_KHR_surface".to_string() });
        }
        let swapchain_colorspace = extensions.contains(&vk::ExtSwapchainColorspaceFn::name());
        let debug_utils_enabled = extensions.contains(&DebugUtils::name());
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|name| name.as_ptr()).collect();

        let layers: Vec<*const c_char> = if debug { vec![VALIDATION_LAYER.as_ptr()] } else { Vec::new() };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layers);
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.map_err(vk_error("vkCreateInstance"))?;

        let debug = if debug_utils_enabled {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    log::warn!("Debug messenger unavailable: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        log::debug!("Created Vulkan instance with {} extensions", extensions.len());
        Ok(Self { entry, instance, surface_loader, swapchain_colorspace, debug })
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn setup_debug_messenger(debug_utils: &DebugUtils) -> GraphicsResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(vk_error("vkCreateDebugUtilsMessengerEXT"))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Device extensions required for the ray tracing tier
pub(crate) fn ray_tracing_extensions() -> [&'static CStr; 3] {
    [AccelerationStructure::name(), RayTracingPipeline::name(), DeferredHostOperations::name()]
}

fn supports_extensions(instance: &Instance, device: vk::PhysicalDevice, required: &[&CStr]) -> bool {
    let Ok(available) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
        return false;
    };
    required.iter().all(|required| {
        available.iter().any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
    })
}

fn max_feature_level(instance: &Instance, device: vk::PhysicalDevice, api_version: u32) -> FeatureLevel {
    let minor = vk::api_version_minor(api_version);
    let major = vk::api_version_major(api_version);
    if major > 1 || minor >= 2 {
        if supports_extensions(instance, device, &ray_tracing_extensions()) {
            FeatureLevel::L12_2
        } else {
            FeatureLevel::L12_0
        }
    } else if minor == 1 {
        FeatureLevel::L11_1
    } else {
        FeatureLevel::L11_0
    }
}

const fn performance_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 4,
        _ => 3,
    }
}

/// Adapter factory over one `VkInstance`
pub struct VulkanInstance {
    shared: Arc<InstanceShared>,
}

impl VulkanInstance {
    pub(crate) fn new(shared: Arc<InstanceShared>) -> Self {
        Self { shared }
    }

    fn physical_devices(&self) -> GraphicsResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.shared.instance.enumerate_physical_devices() }.map_err(vk_error("vkEnumeratePhysicalDevices"))
    }
}

impl GraphicsInstance for VulkanInstance {
    /// Presentation mode is fixed per swapchain, so variable refresh is never negotiated
    fn check_tearing_support(&self) -> GraphicsResult<bool> {
        Ok(false)
    }

    fn enumerate_adapters(&self, preference: GpuPreference) -> GraphicsResult<Vec<AdapterInfo>> {
        let instance = &self.shared.instance;
        let mut adapters = Vec::new();
        for (index, device) in self.physical_devices()?.into_iter().enumerate() {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let memory = unsafe { instance.get_physical_device_memory_properties(device) };
            let dedicated_video_memory = memory.memory_heaps[..memory.memory_heap_count as usize]
                .iter()
                .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|heap| heap.size)
                .sum();
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy().into_owned();

            adapters.push((
                performance_rank(properties.device_type),
                AdapterInfo {
                    index: index as u32,
                    name,
                    vendor_id: properties.vendor_id,
                    device_id: properties.device_id,
                    dedicated_video_memory,
                    is_software: properties.device_type == vk::PhysicalDeviceType::CPU,
                    max_feature_level: max_feature_level(instance, device, properties.api_version),
                },
            ));
        }

        if preference == GpuPreference::HighPerformance {
            adapters.sort_by_key(|(rank, _)| *rank);
        }
        Ok(adapters.into_iter().map(|(_, adapter)| adapter).collect())
    }

    fn create_device(&self, adapter: &AdapterInfo, minimum: FeatureLevel) -> GraphicsResult<Arc<dyn GraphicsDevice>> {
        if adapter.max_feature_level < minimum {
            return Err(GraphicsError::Unsupported {
                feature: format!("{:?} on '{}' (max {:?})", minimum, adapter.name, adapter.max_feature_level),
            });
        }
        let physical_device = self
            .physical_devices()?
            .get(adapter.index as usize)
            .copied()
            .ok_or(GraphicsError::ResourceNotFound { id: u64::from(adapter.index) })?;

        let shared = DeviceShared::new(Arc::clone(&self.shared), physical_device, adapter.clone())?;
        Ok(Arc::new(VulkanDevice::new(Arc::new(shared))))
    }

    fn is_current(&self) -> bool {
        true
    }

    fn enumerate_outputs(&self) -> GraphicsResult<Vec<OutputDesc>> {
        Ok(vec![OutputDesc {
            name: "Virtual desktop".to_string(),
            desktop_coordinates: VIRTUAL_DESKTOP,
            color_space: ColorSpace::SrgbG22P709,
        }])
    }

    fn create_swapchain(
        &self,
        device: &Arc<dyn GraphicsDevice>,
        _queue: &dyn CommandQueue,
        surface: &dyn OutputSurface,
        desc: &SwapchainDesc,
    ) -> GraphicsResult<Box<dyn Swapchain>> {
        let device = device
            .as_any()
            .downcast_ref::<VulkanDevice>()
            .ok_or_else(|| GraphicsError::invalid("swapchain device belongs to another backend"))?;
        let (Some(display), Some(window)) = (surface.raw_display_handle(), surface.raw_window_handle()) else {
            return Err(GraphicsError::Unsupported { feature: "presenting without a native window".to_string() });
        };

        let surface = unsafe {
            ash_window::create_surface(&self.shared.entry, &self.shared.instance, display, window, None)
        }
        .map_err(vk_error("vkCreateSurfaceKHR"))?;
        Ok(Box::new(VulkanSwapchain::new(Arc::clone(device.shared()), surface, *desc)?))
    }
}
