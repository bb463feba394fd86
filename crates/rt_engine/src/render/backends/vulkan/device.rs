//! Logical device, memory allocation and the bindless descriptor layout

use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline, Swapchain as SwapchainLoader};
use ash::prelude::VkResult;
use ash::{vk, Device};
use parking_lot::{Mutex, MutexGuard};

use crate::render::api::{
    AccelerationStructureInputs, AdapterInfo, BufferDesc, CommandList, CommandQueue, DescriptorHeap,
    DescriptorHeapDesc, FeatureLevel, GpuFence, GpuResource, GpuVirtualAddress, GraphicsDevice, GraphicsError,
    GraphicsResult, PrebuildInfo, RayTracingPipeline as RayTracingPipelineApi, ShaderTableProperties, TextureDesc,
};
use crate::render::raytracing::pipeline::RayTracingPipelineDesc;

use super::acceleration::BuildGeometry;
use super::command_list::VulkanCommandList;
use super::conv::vk_error;
use super::instance::{ray_tracing_extensions, InstanceShared};
use super::pipeline::VulkanPipeline;
use super::queue::{VulkanFence, VulkanQueue};
use super::resources::{VulkanDescriptorHeap, VulkanResource};
use super::MAX_BINDLESS_DESCRIPTORS;

/// Binding numbers of the bindless set
pub(crate) mod binding {
    pub const STORAGE_IMAGE: u32 = 0;
    pub const UNIFORM_BUFFER: u32 = 1;
    pub const SAMPLED_IMAGE: u32 = 2;
    pub const STORAGE_BUFFER: u32 = 3;
    pub const ACCELERATION_STRUCTURE: u32 = 4;
}

/// Ray tracing extension loaders, present at the ray tracing tier
pub(crate) struct RayTracingLoaders {
    pub acceleration: AccelerationStructure,
    pub pipeline: RayTracingPipeline,
}

/// Device state shared with queues, lists and resources
pub(crate) struct DeviceShared {
    pub instance: Arc<InstanceShared>,
    pub physical_device: vk::PhysicalDevice,
    pub adapter: AdapterInfo,
    pub device: Device,
    pub swapchain_loader: SwapchainLoader,
    pub ray_tracing: Option<RayTracingLoaders>,
    pub queue_family: u32,
    pub shader_table_properties: ShaderTableProperties,
    pub bindless_layout: vk::DescriptorSetLayout,
    pub default_pipeline_layout: vk::PipelineLayout,
    queue: Mutex<vk::Queue>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    addresses: Mutex<BTreeMap<GpuVirtualAddress, (vk::Buffer, u64)>>,
    next_object_id: AtomicU64,
    removed: Mutex<Option<String>>,
}

impl DeviceShared {
    pub fn new(
        instance: Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        adapter: AdapterInfo,
    ) -> GraphicsResult<Self> {
        let raw = &instance.instance;
        let families = unsafe { raw.get_physical_device_queue_family_properties(physical_device) };
        let queue_family = families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .ok_or_else(|| GraphicsError::Unsupported { feature: "graphics and compute queue".to_string() })?
            as u32;

        let ray_tracing_enabled = adapter.max_feature_level >= FeatureLevel::L12_2;
        let mut extensions: Vec<*const c_char> = vec![SwapchainLoader::name().as_ptr()];
        if ray_tracing_enabled {
            extensions.extend(ray_tracing_extensions().iter().map(|name| name.as_ptr()));
        }

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true);
        let mut acceleration_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true)
            .descriptor_binding_acceleration_structure_update_after_bind(true);
        let mut pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut vulkan12);
        if ray_tracing_enabled {
            create_info = create_info.push_next(&mut acceleration_features).push_next(&mut pipeline_features);
        }

        let device =
            unsafe { raw.create_device(physical_device, &create_info, None) }.map_err(vk_error("vkCreateDevice"))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_loader = SwapchainLoader::new(raw, &device);
        let memory_properties = unsafe { raw.get_physical_device_memory_properties(physical_device) };

        let (ray_tracing, shader_table_properties) = if ray_tracing_enabled {
            let mut properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut properties);
            unsafe { raw.get_physical_device_properties2(physical_device, &mut properties2) };
            let shader_table_properties = ShaderTableProperties {
                identifier_size: properties.shader_group_handle_size,
                record_alignment: properties.shader_group_handle_alignment,
                table_alignment: properties.shader_group_base_alignment,
            };
            let loaders = RayTracingLoaders {
                acceleration: AccelerationStructure::new(raw, &device),
                pipeline: RayTracingPipeline::new(raw, &device),
            };
            (Some(loaders), shader_table_properties)
        } else {
            (None, ShaderTableProperties::default())
        };

        let bindless_layout = match create_bindless_layout(&device, ray_tracing_enabled) {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };
        let set_layouts = [bindless_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let default_pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe {
                    device.destroy_descriptor_set_layout(bindless_layout, None);
                    device.destroy_device(None);
                }
                return Err(vk_error("vkCreatePipelineLayout")(err));
            }
        };

        log::info!(
            "Created Vulkan device on '{}' (queue family {}, ray tracing {})",
            adapter.name,
            queue_family,
            if ray_tracing_enabled { "enabled" } else { "unavailable" }
        );
        Ok(Self {
            instance,
            physical_device,
            adapter,
            device,
            swapchain_loader,
            ray_tracing,
            queue_family,
            shader_table_properties,
            bindless_layout,
            default_pipeline_layout,
            queue: Mutex::new(queue),
            memory_properties,
            addresses: Mutex::new(BTreeMap::new()),
            next_object_id: AtomicU64::new(1),
            removed: Mutex::new(None),
        })
    }

    pub fn next_object_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Exclusive access to the queue; submits and presents go through here
    pub fn queue(&self) -> MutexGuard<'_, vk::Queue> {
        self.queue.lock()
    }

    pub fn ray_tracing(&self) -> GraphicsResult<&RayTracingLoaders> {
        self.ray_tracing
            .as_ref()
            .ok_or_else(|| GraphicsError::Unsupported { feature: "VK_KHR_ray_tracing_pipeline".to_string() })
    }

    /// Map a `VkResult`, remembering device loss
    pub fn check<T>(&self, call: &'static str, result: VkResult<T>) -> GraphicsResult<T> {
        result.map_err(|code| {
            if code == vk::Result::ERROR_DEVICE_LOST {
                self.removed.lock().get_or_insert_with(|| format!("{} returned VK_ERROR_DEVICE_LOST", call));
            }
            vk_error(call)(code)
        })
    }

    pub fn removed_reason(&self) -> Option<String> {
        self.removed.lock().clone()
    }

    fn find_memory_type(&self, type_filter: u32, candidates: &[vk::MemoryPropertyFlags]) -> GraphicsResult<u32> {
        let properties = &self.memory_properties;
        candidates
            .iter()
            .find_map(|wanted| {
                (0..properties.memory_type_count).find(|i| {
                    (type_filter & (1 << i)) != 0
                        && properties.memory_types[*i as usize].property_flags.contains(*wanted)
                })
            })
            .ok_or_else(|| GraphicsError::Unsupported { feature: format!("memory type with {:?}", candidates) })
    }

    /// Allocate memory for `requirements` from the first matching candidate type
    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        candidates: &[vk::MemoryPropertyFlags],
        device_address: bool,
    ) -> GraphicsResult<vk::DeviceMemory> {
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, candidates)?;
        let mut flags = vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if device_address {
            info = info.push_next(&mut flags);
        }
        unsafe { self.device.allocate_memory(&info, None) }.map_err(|code| match code {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GraphicsError::OutOfMemory { requested: requirements.size }
            }
            other => vk_error("vkAllocateMemory")(other),
        })
    }

    pub fn register_address(&self, address: GpuVirtualAddress, buffer: vk::Buffer, size: u64) {
        self.addresses.lock().insert(address, (buffer, size));
    }

    pub fn unregister_address(&self, address: GpuVirtualAddress) {
        self.addresses.lock().remove(&address);
    }

    /// Buffer and offset containing `address`
    pub fn resolve(&self, address: GpuVirtualAddress) -> Option<(vk::Buffer, u64)> {
        let addresses = self.addresses.lock();
        let (start, (buffer, size)) = addresses.range(..=address).next_back()?;
        (address < start + size).then_some((*buffer, address - start))
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_pipeline_layout(self.default_pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.bindless_layout, None);
            self.device.destroy_device(None);
        }
    }
}

fn create_bindless_layout(device: &Device, acceleration_structures: bool) -> GraphicsResult<vk::DescriptorSetLayout> {
    let mut types = vec![
        (binding::STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE),
        (binding::UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER),
        (binding::SAMPLED_IMAGE, vk::DescriptorType::SAMPLED_IMAGE),
        (binding::STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER),
    ];
    if acceleration_structures {
        types.push((binding::ACCELERATION_STRUCTURE, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
    }

    let bindings: Vec<vk::DescriptorSetLayoutBinding> = types
        .iter()
        .map(|(index, kind)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(*index)
                .descriptor_type(*kind)
                .descriptor_count(MAX_BINDLESS_DESCRIPTORS)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build()
        })
        .collect();
    let flags = vec![
        vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
        bindings.len()
    ];
    let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);
    let info = vk::DescriptorSetLayoutCreateInfo::builder()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&bindings)
        .push_next(&mut binding_flags);
    unsafe { device.create_descriptor_set_layout(&info, None) }.map_err(vk_error("vkCreateDescriptorSetLayout"))
}

/// Logical device of the Vulkan backend
pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
}

impl VulkanDevice {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Raw `ash` device, for callers creating their own pipeline layouts
    pub fn raw(&self) -> &Device {
        &self.shared.device
    }

    /// Layout of the bindless set every shader-visible heap allocates
    pub fn bindless_layout(&self) -> vk::DescriptorSetLayout {
        self.shared.bindless_layout
    }
}

impl GraphicsDevice for VulkanDevice {
    fn adapter(&self) -> &AdapterInfo {
        &self.shared.adapter
    }

    fn max_supported_feature_level(&self, candidates: &[FeatureLevel]) -> GraphicsResult<FeatureLevel> {
        candidates
            .iter()
            .copied()
            .filter(|level| *level <= self.shared.adapter.max_feature_level)
            .max()
            .ok_or_else(|| GraphicsError::Unsupported {
                feature: format!("any of the feature levels {:?}", candidates),
            })
    }

    fn create_command_queue(&self) -> GraphicsResult<Box<dyn CommandQueue>> {
        Ok(Box::new(VulkanQueue::new(Arc::clone(&self.shared))))
    }

    fn create_fence(&self, initial_value: u64) -> GraphicsResult<Box<dyn GpuFence>> {
        Ok(Box::new(VulkanFence::new(Arc::clone(&self.shared), initial_value)?))
    }

    fn create_command_list(&self, name: &str) -> GraphicsResult<Box<dyn CommandList>> {
        Ok(Box::new(VulkanCommandList::new(name, Arc::clone(&self.shared))?))
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GraphicsResult<Box<dyn DescriptorHeap>> {
        Ok(Box::new(VulkanDescriptorHeap::new(Arc::clone(&self.shared), *desc)?))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GraphicsResult<Arc<dyn GpuResource>> {
        Ok(Arc::new(VulkanResource::buffer(&self.shared, desc)?))
    }

    fn create_texture(&self, desc: &TextureDesc) -> GraphicsResult<Arc<dyn GpuResource>> {
        Ok(Arc::new(VulkanResource::texture(&self.shared, desc)?))
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> GraphicsResult<PrebuildInfo> {
        let loaders = self.shared.ray_tracing()?;
        let geometry = BuildGeometry::new(inputs);
        let sizes = unsafe {
            loaders.acceleration.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &geometry.info(inputs.flags()),
                &geometry.primitive_counts(),
            )
        };
        Ok(PrebuildInfo {
            result_data_max_size: sizes.acceleration_structure_size,
            scratch_data_size: sizes.build_scratch_size,
            update_scratch_data_size: sizes.update_scratch_size,
        })
    }

    fn shader_table_properties(&self) -> ShaderTableProperties {
        self.shared.shader_table_properties
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> GraphicsResult<Box<dyn RayTracingPipelineApi>> {
        Ok(Box::new(VulkanPipeline::new(Arc::clone(&self.shared), desc)?))
    }

    fn removed_reason(&self) -> Option<String> {
        self.shared.removed_reason()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
