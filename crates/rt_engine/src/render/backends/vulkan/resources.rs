//! Buffers, images and descriptor heaps of the Vulkan device

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::render::api::{
    BufferDesc, CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind, Format,
    GpuDescriptorHandle, GpuResource, GpuVirtualAddress, GraphicsError, GraphicsResult, HeapType,
    ResourceDimension, ResourceFlags, ResourceId, ResourceState, TextureDesc, ViewDesc,
};

use super::conv::{self, vk_error};
use super::device::{binding, DeviceShared};
use super::MAX_BINDLESS_DESCRIPTORS;

enum Storage {
    Buffer {
        buffer: vk::Buffer,
        size: u64,
        address: GpuVirtualAddress,
        mapped: *mut u8,
        acceleration_structure: vk::AccelerationStructureKHR,
    },
    Image {
        image: vk::Image,
        width: u32,
        height: u32,
        format: Format,
        owned: bool,
    },
}

/// Buffer or image of the Vulkan device
pub struct VulkanResource {
    id: ResourceId,
    name: String,
    device: Arc<DeviceShared>,
    heap: HeapType,
    flags: ResourceFlags,
    storage: Storage,
    memory: vk::DeviceMemory,
    layout_initialized: AtomicBool,
}

impl VulkanResource {
    fn empty(device: &Arc<DeviceShared>, name: &str, heap: HeapType, flags: ResourceFlags, storage: Storage) -> Self {
        Self {
            id: ResourceId(device.next_object_id()),
            name: name.to_string(),
            device: Arc::clone(device),
            heap,
            flags,
            storage,
            memory: vk::DeviceMemory::null(),
            layout_initialized: AtomicBool::new(false),
        }
    }

    pub(crate) fn buffer(device: &Arc<DeviceShared>, desc: &BufferDesc) -> GraphicsResult<Self> {
        if desc.size == 0 {
            return Err(GraphicsError::OutOfRange { reason: format!("buffer '{}' with zero size", desc.name) });
        }
        let is_acceleration_structure = desc.flags.contains(ResourceFlags::ACCELERATION_STRUCTURE);
        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        if device.ray_tracing.is_some() {
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
        }
        if is_acceleration_structure {
            device.ray_tracing()?;
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
        }

        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.device.create_buffer(&info, None) }.map_err(vk_error("vkCreateBuffer"))?;
        let mut resource = Self::empty(
            device,
            &desc.name,
            desc.heap,
            desc.flags,
            Storage::Buffer {
                buffer,
                size: desc.size,
                address: 0,
                mapped: std::ptr::null_mut(),
                acceleration_structure: vk::AccelerationStructureKHR::null(),
            },
        );

        let candidates: &[vk::MemoryPropertyFlags] = match desc.heap {
            HeapType::Default => &[vk::MemoryPropertyFlags::DEVICE_LOCAL],
            HeapType::Upload => &[vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT],
            HeapType::Readback => &[
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
        };
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        resource.memory = device.allocate(requirements, candidates, true)?;
        unsafe { device.device.bind_buffer_memory(buffer, resource.memory, 0) }
            .map_err(vk_error("vkBindBufferMemory"))?;

        let mapped = if desc.heap == HeapType::Default {
            std::ptr::null_mut()
        } else {
            unsafe { device.device.map_memory(resource.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
                .map_err(vk_error("vkMapMemory"))?
                .cast::<u8>()
        };
        let address = unsafe {
            device.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        };
        device.register_address(address, buffer, desc.size);
        if let Storage::Buffer { address: a, mapped: m, .. } = &mut resource.storage {
            *a = address;
            *m = mapped;
        }

        if is_acceleration_structure {
            let loaders = device.ray_tracing()?;
            let info = vk::AccelerationStructureCreateInfoKHR::builder()
                .buffer(buffer)
                .offset(0)
                .size(desc.size)
                .ty(vk::AccelerationStructureTypeKHR::GENERIC);
            let structure = unsafe { loaders.acceleration.create_acceleration_structure(&info, None) }
                .map_err(vk_error("vkCreateAccelerationStructureKHR"))?;
            if let Storage::Buffer { acceleration_structure, .. } = &mut resource.storage {
                *acceleration_structure = structure;
            }
        }
        log::trace!("Created buffer '{}' ({} bytes, {:?})", desc.name, desc.size, desc.heap);
        Ok(resource)
    }

    pub(crate) fn texture(device: &Arc<DeviceShared>, desc: &TextureDesc) -> GraphicsResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::OutOfRange {
                reason: format!("texture '{}' of size {}x{}", desc.name, desc.width, desc.height),
            });
        }
        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.format.is_depth() {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(conv::format(desc.format))
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.device.create_image(&info, None) }.map_err(vk_error("vkCreateImage"))?;
        let mut resource = Self::empty(
            device,
            &desc.name,
            HeapType::Default,
            desc.flags,
            Storage::Image { image, width: desc.width, height: desc.height, format: desc.format, owned: true },
        );

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        resource.memory = device.allocate(requirements, &[vk::MemoryPropertyFlags::DEVICE_LOCAL], false)?;
        unsafe { device.device.bind_image_memory(image, resource.memory, 0) }
            .map_err(vk_error("vkBindImageMemory"))?;
        log::trace!("Created texture '{}' ({}x{} {:?})", desc.name, desc.width, desc.height, desc.format);
        Ok(resource)
    }

    /// Wrap an image owned by a swapchain
    pub(crate) fn swapchain_image(
        device: &Arc<DeviceShared>,
        image: vk::Image,
        index: u32,
        width: u32,
        height: u32,
        format: Format,
    ) -> Self {
        Self::empty(
            device,
            &format!("Back buffer {}", index),
            HeapType::Default,
            ResourceFlags::ALLOW_RENDER_TARGET,
            Storage::Image { image, width, height, format, owned: false },
        )
    }

    /// Creation flags
    pub fn flags(&self) -> ResourceFlags {
        self.flags
    }

    /// Raw buffer handle
    pub fn raw_buffer(&self) -> Option<vk::Buffer> {
        match self.storage {
            Storage::Buffer { buffer, .. } => Some(buffer),
            Storage::Image { .. } => None,
        }
    }

    /// Raw image handle
    pub fn raw_image(&self) -> Option<vk::Image> {
        match self.storage {
            Storage::Image { image, .. } => Some(image),
            Storage::Buffer { .. } => None,
        }
    }

    /// Acceleration structure created over this buffer
    pub fn acceleration_structure(&self) -> Option<vk::AccelerationStructureKHR> {
        match self.storage {
            Storage::Buffer { acceleration_structure, .. }
                if acceleration_structure != vk::AccelerationStructureKHR::null() =>
            {
                Some(acceleration_structure)
            }
            _ => None,
        }
    }

    pub(crate) fn format(&self) -> Format {
        match self.storage {
            Storage::Image { format, .. } => format,
            Storage::Buffer { .. } => Format::Unknown,
        }
    }

    /// Layout the image is in before a command leaving `state`
    ///
    /// The first call per image reports `UNDEFINED`, since images are created
    /// without a layout.
    pub(crate) fn layout_before(&self, state: ResourceState) -> vk::ImageLayout {
        if self.layout_initialized.swap(true, Ordering::SeqCst) {
            conv::state_access(state).layout
        } else {
            vk::ImageLayout::UNDEFINED
        }
    }

    pub(crate) fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: conv::aspect(self.format()),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn create_view(&self, format: Format) -> GraphicsResult<vk::ImageView> {
        let image =
            self.raw_image().ok_or_else(|| GraphicsError::invalid(format!("'{}' is not a texture", self.name)))?;
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(conv::format(format))
            .subresource_range(self.subresource_range());
        unsafe { self.device.device.create_image_view(&info, None) }.map_err(vk_error("vkCreateImageView"))
    }
}

impl Drop for VulkanResource {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            match self.storage {
                Storage::Buffer { buffer, address, acceleration_structure, .. } => {
                    if acceleration_structure != vk::AccelerationStructureKHR::null() {
                        if let Some(loaders) = self.device.ray_tracing.as_ref() {
                            loaders.acceleration.destroy_acceleration_structure(acceleration_structure, None);
                        }
                    }
                    if address != 0 {
                        self.device.unregister_address(address);
                    }
                    device.destroy_buffer(buffer, None);
                }
                Storage::Image { image, owned, .. } => {
                    if owned {
                        device.destroy_image(image, None);
                    }
                }
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
    }
}

impl GpuResource for VulkanResource {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> ResourceDimension {
        match self.storage {
            Storage::Buffer { size, .. } => ResourceDimension::Buffer { size },
            Storage::Image { width, height, format, .. } => ResourceDimension::Texture2D { width, height, format },
        }
    }

    fn heap_type(&self) -> HeapType {
        self.heap
    }

    fn gpu_virtual_address(&self) -> GpuVirtualAddress {
        match self.storage {
            Storage::Buffer { acceleration_structure, address, .. } => {
                let has_structure = acceleration_structure != vk::AccelerationStructureKHR::null();
                match (has_structure, self.device.ray_tracing.as_ref()) {
                    (true, Some(loaders)) => unsafe {
                        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                            .acceleration_structure(acceleration_structure);
                        loaders.acceleration.get_acceleration_structure_device_address(&info)
                    },
                    _ => address,
                }
            }
            Storage::Image { .. } => 0,
        }
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let Storage::Buffer { size, mapped, .. } = self.storage else {
            return Err(GraphicsError::invalid(format!("write into texture '{}'", self.name)));
        };
        if mapped.is_null() {
            return Err(GraphicsError::invalid(format!("'{}' is not CPU visible", self.name)));
        }
        offset.checked_add(data.len() as u64).filter(|end| *end <= size).ok_or_else(|| GraphicsError::OutOfRange {
            reason: format!("write of {} bytes at {} into '{}' ({} bytes)", data.len(), offset, self.name, size),
        })?;
        // Mapped range covers the whole allocation and outlives this call
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len()) };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn vulkan_resource(resource: &dyn GpuResource) -> GraphicsResult<&VulkanResource> {
    resource
        .as_any()
        .downcast_ref::<VulkanResource>()
        .ok_or_else(|| GraphicsError::invalid(format!("'{}' belongs to another backend", resource.name())))
}

/// Descriptor heap of the Vulkan device
///
/// CBV/SRV/UAV heaps own one bindless descriptor set; render target and
/// depth stencil heaps only hold image views.
pub struct VulkanDescriptorHeap {
    device: Arc<DeviceShared>,
    desc: DescriptorHeapDesc,
    base: u64,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    views: Mutex<Vec<vk::ImageView>>,
}

impl VulkanDescriptorHeap {
    pub(crate) fn new(device: Arc<DeviceShared>, desc: DescriptorHeapDesc) -> GraphicsResult<Self> {
        if desc.capacity == 0 {
            return Err(GraphicsError::OutOfRange { reason: "descriptor heap with zero capacity".to_string() });
        }
        if desc.shader_visible && desc.kind != DescriptorHeapKind::CbvSrvUav {
            return Err(GraphicsError::invalid(format!("{:?} heaps cannot be shader visible", desc.kind)));
        }
        let base = device.next_object_id() << 32;
        let mut heap = Self {
            views: Mutex::new(vec![vk::ImageView::null(); desc.capacity as usize]),
            device,
            desc,
            base,
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
        };
        if desc.kind != DescriptorHeapKind::CbvSrvUav {
            return Ok(heap);
        }
        if desc.capacity > MAX_BINDLESS_DESCRIPTORS {
            return Err(GraphicsError::OutOfRange {
                reason: format!("{} descriptors exceed the bindless limit {}", desc.capacity, MAX_BINDLESS_DESCRIPTORS),
            });
        }

        let mut kinds = vec![
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_BUFFER,
        ];
        if heap.device.ray_tracing.is_some() {
            kinds.push(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        }
        let sizes: Vec<vk::DescriptorPoolSize> = kinds
            .into_iter()
            .map(|ty| vk::DescriptorPoolSize { ty, descriptor_count: MAX_BINDLESS_DESCRIPTORS })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&sizes);
        heap.pool = unsafe { heap.device.device.create_descriptor_pool(&pool_info, None) }
            .map_err(vk_error("vkCreateDescriptorPool"))?;

        let layouts = [heap.device.bindless_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder().descriptor_pool(heap.pool).set_layouts(&layouts);
        let sets = unsafe { heap.device.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(vk_error("vkAllocateDescriptorSets"))?;
        heap.set = sets.into_iter().next().ok_or_else(|| GraphicsError::invalid("no descriptor set allocated"))?;
        Ok(heap)
    }

    /// Bindless set, null for CPU-only heap kinds
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Image view written to `slot` of a render target or depth heap
    pub fn image_view(&self, slot: u32) -> Option<vk::ImageView> {
        self.views.lock().get(slot as usize).copied().filter(|view| *view != vk::ImageView::null())
    }

    fn store_view(&self, slot: u32, view: vk::ImageView) {
        let old = std::mem::replace(&mut self.views.lock()[slot as usize], view);
        if old != vk::ImageView::null() {
            unsafe { self.device.device.destroy_image_view(old, None) };
        }
    }

    fn write_image(
        &self,
        slot: u32,
        ty: vk::DescriptorType,
        binding: u32,
        layout: vk::ImageLayout,
        view: vk::ImageView,
    ) {
        let image_info =
            [vk::DescriptorImageInfo { sampler: vk::Sampler::null(), image_view: view, image_layout: layout }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(ty)
            .image_info(&image_info);
        unsafe { self.device.device.update_descriptor_sets(&[write.build()], &[]) };
    }

    fn write_buffer(
        &self,
        slot: u32,
        ty: vk::DescriptorType,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo { buffer, offset, range }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(ty)
            .buffer_info(&buffer_info);
        unsafe { self.device.device.update_descriptor_sets(&[write.build()], &[]) };
    }

    fn write_shader_view(&self, slot: u32, view: &ViewDesc<'_>) -> GraphicsResult<()> {
        match view {
            ViewDesc::ShaderResource(resource) | ViewDesc::UnorderedAccess(resource) => {
                let resource = vulkan_resource(*resource)?;
                let uav = matches!(view, ViewDesc::UnorderedAccess(_));
                if let Some(buffer) = resource.raw_buffer() {
                    self.write_buffer(
                        slot,
                        vk::DescriptorType::STORAGE_BUFFER,
                        binding::STORAGE_BUFFER,
                        buffer,
                        0,
                        vk::WHOLE_SIZE,
                    );
                    return Ok(());
                }
                let image_view = resource.create_view(resource.format())?;
                self.store_view(slot, image_view);
                if uav {
                    self.write_image(
                        slot,
                        vk::DescriptorType::STORAGE_IMAGE,
                        binding::STORAGE_IMAGE,
                        vk::ImageLayout::GENERAL,
                        image_view,
                    );
                } else {
                    self.write_image(
                        slot,
                        vk::DescriptorType::SAMPLED_IMAGE,
                        binding::SAMPLED_IMAGE,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        image_view,
                    );
                }
                Ok(())
            }
            ViewDesc::ConstantBuffer { address, size } => {
                let (buffer, offset) = self
                    .device
                    .resolve(*address)
                    .ok_or_else(|| GraphicsError::invalid(format!("no buffer at {:#x}", address)))?;
                self.write_buffer(
                    slot,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    binding::UNIFORM_BUFFER,
                    buffer,
                    offset,
                    u64::from(*size),
                );
                Ok(())
            }
            ViewDesc::AccelerationStructure(resource) => {
                let resource = vulkan_resource(*resource)?;
                let structure = resource.acceleration_structure().ok_or_else(|| {
                    GraphicsError::invalid(format!("'{}' holds no acceleration structure", resource.name))
                })?;
                let structures = [structure];
                let mut info =
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&structures);
                let mut write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(binding::ACCELERATION_STRUCTURE)
                    .dst_array_element(slot)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut info)
                    .build();
                write.descriptor_count = 1;
                unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
                Ok(())
            }
            ViewDesc::RenderTarget(_) | ViewDesc::DepthStencil(_) => {
                Err(GraphicsError::invalid("target views need a render target or depth stencil heap"))
            }
        }
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        unsafe {
            for view in self.views.get_mut().drain(..) {
                if view != vk::ImageView::null() {
                    self.device.device.destroy_image_view(view, None);
                }
            }
            if self.pool != vk::DescriptorPool::null() {
                self.device.device.destroy_descriptor_pool(self.pool, None);
            }
        }
    }
}

impl DescriptorHeap for VulkanDescriptorHeap {
    fn kind(&self) -> DescriptorHeapKind {
        self.desc.kind
    }

    fn capacity(&self) -> u32 {
        self.desc.capacity
    }

    fn descriptor_size(&self) -> u32 {
        1
    }

    fn cpu_start(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.base)
    }

    fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.desc.shader_visible.then_some(GpuDescriptorHandle(self.base))
    }

    fn write_view(&self, slot: u32, view: &ViewDesc<'_>) -> GraphicsResult<()> {
        if slot >= self.desc.capacity {
            return Err(GraphicsError::OutOfRange {
                reason: format!("slot {} of a {} descriptor heap", slot, self.desc.capacity),
            });
        }
        match (self.desc.kind, view) {
            (DescriptorHeapKind::RenderTarget, ViewDesc::RenderTarget(resource))
            | (DescriptorHeapKind::DepthStencil, ViewDesc::DepthStencil(resource)) => {
                let resource = vulkan_resource(*resource)?;
                let view = resource.create_view(resource.format())?;
                self.store_view(slot, view);
                Ok(())
            }
            (DescriptorHeapKind::CbvSrvUav, view) => self.write_shader_view(slot, view),
            (kind, _) => Err(GraphicsError::invalid(format!("view does not fit a {:?} heap", kind))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
