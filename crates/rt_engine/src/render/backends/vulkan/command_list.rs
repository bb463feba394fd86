//! Command buffer recording
//!
//! Each list owns a command pool with a single primary buffer. Recording
//! mistakes cannot be returned from the `cmd_*` calls, so they are collected
//! and reported by `close`, the same contract the headless device follows.

use std::any::Any;
use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::render::api::{
    BuildAccelerationStructureDesc, BuildFlags, CommandList, DescriptorHeap, DispatchRaysDesc, GpuResource,
    GraphicsError, GraphicsResult, PipelineHandle, PipelineKind, RayTracingPipeline, Rect, ResourceBarrier,
    ResourceDimension, ResourceId, ResourceState,
};

use super::acceleration::BuildGeometry;
use super::conv::{self, StateAccess};
use super::device::DeviceShared;
use super::pipeline::VulkanPipeline;
use super::resources::{vulkan_resource, VulkanDescriptorHeap, VulkanResource};

/// Command list of the Vulkan device
pub struct VulkanCommandList {
    name: String,
    device: Arc<DeviceShared>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    recording: bool,
    errors: Vec<String>,
    layout: vk::PipelineLayout,
    descriptor_set: vk::DescriptorSet,
    pipeline_bound: bool,
    uav_barriers: Vec<ResourceId>,
}

impl VulkanCommandList {
    pub(crate) fn new(name: &str, device: Arc<DeviceShared>) -> GraphicsResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(device.queue_family);
        let pool = device.check("vkCreateCommandPool", unsafe { device.device.create_command_pool(&pool_info, None) })?;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(err) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return device.check("vkAllocateCommandBuffers", Err(err));
            }
        };
        let layout = device.default_pipeline_layout;
        let mut list = Self {
            name: name.to_string(),
            device,
            pool,
            buffer,
            recording: false,
            errors: Vec::new(),
            layout,
            descriptor_set: vk::DescriptorSet::null(),
            pipeline_bound: false,
            uav_barriers: Vec::new(),
        };
        list.begin()?;
        log::trace!("Created command list '{}'", list.name);
        Ok(list)
    }

    /// Raw command buffer
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    fn begin(&mut self) -> GraphicsResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let result = unsafe { self.device.device.begin_command_buffer(self.buffer, &info) };
        self.device.check("vkBeginCommandBuffer", result)?;
        self.recording = true;
        self.errors.clear();
        self.layout = self.device.default_pipeline_layout;
        self.descriptor_set = vk::DescriptorSet::null();
        self.pipeline_bound = false;
        self.uav_barriers.clear();
        Ok(())
    }

    /// Command buffer to record into, or `None` after noting the misuse
    fn target(&mut self) -> Option<vk::CommandBuffer> {
        if self.recording {
            Some(self.buffer)
        } else {
            self.errors.push("command recorded on a closed list".to_string());
            None
        }
    }

    fn resource<'r>(&mut self, resource: &'r dyn GpuResource) -> Option<&'r VulkanResource> {
        match vulkan_resource(resource) {
            Ok(resource) => Some(resource),
            Err(err) => {
                self.errors.push(err.to_string());
                None
            }
        }
    }

    /// Drop stages and accesses of extensions the device runs without
    fn supported(&self, mut state: StateAccess) -> StateAccess {
        if self.device.ray_tracing.is_none() {
            state.stages &= !(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR);
            state.access &= !(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR);
            if state.stages.is_empty() {
                state.stages = vk::PipelineStageFlags::ALL_COMMANDS;
            }
        }
        state
    }

    fn bind_points(&self) -> Vec<vk::PipelineBindPoint> {
        let mut points = vec![vk::PipelineBindPoint::COMPUTE];
        if self.device.ray_tracing.is_some() {
            points.push(vk::PipelineBindPoint::RAY_TRACING_KHR);
        }
        points
    }

    fn bind_descriptor_set(&self, buffer: vk::CommandBuffer) {
        if self.descriptor_set == vk::DescriptorSet::null() {
            return;
        }
        for point in self.bind_points() {
            unsafe {
                self.device.device.cmd_bind_descriptor_sets(buffer, point, self.layout, 0, &[self.descriptor_set], &[])
            };
        }
    }

    /// Move an image between two layouts inside a transfer command
    fn image_transition(
        &self,
        buffer: vk::CommandBuffer,
        image: &VulkanResource,
        old_layout: vk::ImageLayout,
        from: StateAccess,
        to: StateAccess,
    ) {
        let Some(raw) = image.raw_image() else { return };
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(to.layout)
            .src_access_mask(from.access)
            .dst_access_mask(to.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(raw)
            .subresource_range(image.subresource_range());
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                buffer,
                from.stages,
                to.stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            )
        };
    }

    /// Bracket a transfer into a render target with layout changes
    fn with_target_in_transfer(
        &self,
        buffer: vk::CommandBuffer,
        target: &VulkanResource,
        transfer: impl FnOnce(&Self),
    ) {
        let render_target = self.supported(conv::state_access(ResourceState::RenderTarget));
        let copy_dest = conv::state_access(ResourceState::CopyDest);
        let old_layout = target.layout_before(ResourceState::RenderTarget);
        self.image_transition(buffer, target, old_layout, render_target, copy_dest);
        transfer(self);
        self.image_transition(buffer, target, copy_dest.layout, copy_dest, render_target);
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

impl CommandList for VulkanCommandList {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn reset(&mut self, initial_pipeline: Option<PipelineHandle>) -> GraphicsResult<()> {
        if self.recording {
            unsafe { self.device.device.end_command_buffer(self.buffer) }.ok();
        }
        let result = unsafe { self.device.device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) };
        self.device.check("vkResetCommandPool", result)?;
        self.begin()?;
        if let Some(pipeline) = initial_pipeline {
            let point = match pipeline.kind {
                PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
                PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
                PipelineKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
            };
            unsafe { self.device.device.cmd_bind_pipeline(self.buffer, point, vk::Pipeline::from_raw(pipeline.raw)) };
            self.pipeline_bound = pipeline.kind == PipelineKind::RayTracing;
        }
        Ok(())
    }

    fn close(&mut self) -> GraphicsResult<()> {
        if !self.recording {
            return Err(GraphicsError::invalid(format!("'{}' closed twice", self.name)));
        }
        self.recording = false;
        self.device.check("vkEndCommandBuffer", unsafe { self.device.device.end_command_buffer(self.buffer) })?;
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(GraphicsError::invalid(format!("'{}': {}", self.name, self.errors.join("; "))))
        }
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier<'_>]) {
        let Some(buffer) = self.target() else { return };
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        let mut memory = vk::MemoryBarrier::default();
        let mut images = Vec::new();
        let mut uav_ids = Vec::new();

        for barrier in barriers {
            match barrier {
                ResourceBarrier::Transition { resource, before, after } => {
                    let Some(resource) = self.resource(*resource) else { continue };
                    let from = self.supported(conv::state_access(*before));
                    let to = self.supported(conv::state_access(*after));
                    src_stages |= from.stages;
                    dst_stages |= to.stages;
                    match resource.raw_image() {
                        Some(image) => images.push(
                            vk::ImageMemoryBarrier::builder()
                                .old_layout(resource.layout_before(*before))
                                .new_layout(to.layout)
                                .src_access_mask(from.access)
                                .dst_access_mask(to.access)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(image)
                                .subresource_range(resource.subresource_range())
                                .build(),
                        ),
                        None => {
                            memory.src_access_mask |= from.access;
                            memory.dst_access_mask |= to.access;
                        }
                    }
                }
                ResourceBarrier::Uav { resource } => {
                    let uav = self.supported(conv::state_access(ResourceState::UnorderedAccess));
                    let structure = self.supported(conv::state_access(ResourceState::AccelerationStructure));
                    src_stages |= uav.stages | structure.stages;
                    dst_stages |= uav.stages | structure.stages;
                    memory.src_access_mask |= uav.access | structure.access;
                    memory.dst_access_mask |= uav.access | structure.access;
                    uav_ids.push(resource.id());
                }
            }
        }
        if src_stages.is_empty() {
            return;
        }
        let memory_barriers: &[vk::MemoryBarrier] =
            if memory.src_access_mask.is_empty() && memory.dst_access_mask.is_empty() {
                &[]
            } else {
                std::slice::from_ref(&memory)
            };
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                buffer,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                memory_barriers,
                &[],
                &images,
            )
        };
        self.uav_barriers = uav_ids;
    }

    fn set_descriptor_heap(&mut self, heap: &dyn DescriptorHeap) {
        let Some(buffer) = self.target() else { return };
        self.uav_barriers.clear();
        let Some(heap) = heap.as_any().downcast_ref::<VulkanDescriptorHeap>() else {
            self.errors.push("descriptor heap belongs to another backend".to_string());
            return;
        };
        if heap.gpu_start().is_none() || heap.descriptor_set() == vk::DescriptorSet::null() {
            self.errors.push(format!("bound {:?} heap is not shader visible", heap.kind()));
            return;
        }
        self.descriptor_set = heap.descriptor_set();
        self.bind_descriptor_set(buffer);
    }

    fn clear_render_target(&mut self, target: &dyn GpuResource, color: [f32; 4]) {
        let Some(buffer) = self.target() else { return };
        self.uav_barriers.clear();
        let Some(target) = self.resource(target) else { return };
        let Some(image) = target.raw_image() else {
            self.errors.push(format!("clear of buffer '{}'", target.name()));
            return;
        };
        let range = target.subresource_range();
        self.with_target_in_transfer(buffer, target, |list| unsafe {
            list.device.device.cmd_clear_color_image(
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                &[range],
            )
        });
    }

    fn copy_resource(&mut self, dst: &dyn GpuResource, src: &dyn GpuResource) {
        let Some(buffer) = self.target() else { return };
        self.uav_barriers.clear();
        if dst.dimension() != src.dimension() {
            self.errors.push(format!("copy between '{}' and '{}' of different shapes", dst.name(), src.name()));
            return;
        }
        let (Some(dst), Some(src)) = (self.resource(dst), self.resource(src)) else { return };
        match (dst.dimension(), dst.raw_buffer(), src.raw_buffer(), dst.raw_image(), src.raw_image()) {
            (ResourceDimension::Buffer { size }, Some(dst_buffer), Some(src_buffer), _, _) => unsafe {
                let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
                self.device.device.cmd_copy_buffer(buffer, src_buffer, dst_buffer, &[region]);
            },
            (ResourceDimension::Texture2D { width, height, .. }, _, _, Some(dst_image), Some(src_image)) => unsafe {
                let layers = vk::ImageSubresourceLayers {
                    aspect_mask: dst.subresource_range().aspect_mask,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let region = vk::ImageCopy::builder()
                    .src_subresource(layers)
                    .dst_subresource(layers)
                    .extent(vk::Extent3D { width, height, depth: 1 });
                self.device.device.cmd_copy_image(
                    buffer,
                    src_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region.build()],
                );
            },
            _ => self.errors.push(format!("copy between '{}' and '{}' of different kinds", dst.name(), src.name())),
        }
    }

    fn blit_scaled(&mut self, dst: &dyn GpuResource, dst_rect: Rect, src: &dyn GpuResource) {
        let Some(buffer) = self.target() else { return };
        self.uav_barriers.clear();
        let (Some(dst), Some(src)) = (self.resource(dst), self.resource(src)) else { return };
        let (
            ResourceDimension::Texture2D { width, height, .. },
            ResourceDimension::Texture2D { width: src_width, height: src_height, .. },
            Some(dst_image),
            Some(src_image),
        ) = (dst.dimension(), src.dimension(), dst.raw_image(), src.raw_image())
        else {
            self.errors.push(format!("blit between '{}' and '{}' needs two textures", src.name(), dst.name()));
            return;
        };
        let inside = dst_rect.left >= 0
            && dst_rect.top >= 0
            && dst_rect.right <= width as i32
            && dst_rect.bottom <= height as i32
            && dst_rect.width() > 0
            && dst_rect.height() > 0;
        if !inside {
            self.errors.push(format!("blit rectangle {:?} outside '{}' ({}x{})", dst_rect, dst.name(), width, height));
            return;
        }

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: src_width as i32, y: src_height as i32, z: 1 }],
            dst_subresource: layers,
            dst_offsets: [
                vk::Offset3D { x: dst_rect.left, y: dst_rect.top, z: 0 },
                vk::Offset3D { x: dst_rect.right, y: dst_rect.bottom, z: 1 },
            ],
        };
        self.with_target_in_transfer(buffer, dst, |list| unsafe {
            list.device.device.cmd_blit_image(
                buffer,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        });
    }

    fn build_acceleration_structure(&mut self, desc: &BuildAccelerationStructureDesc<'_>) {
        let Some(buffer) = self.target() else { return };
        let refit = desc.inputs.flags().contains(BuildFlags::PERFORM_UPDATE);
        if refit && !self.uav_barriers.contains(&desc.dest.id()) {
            self.errors.push(format!("refit of '{}' is not preceded by a UAV barrier on it", desc.dest.name()));
        }
        self.uav_barriers.clear();

        let device = Arc::clone(&self.device);
        let loaders = match device.ray_tracing() {
            Ok(loaders) => loaders,
            Err(err) => {
                self.errors.push(err.to_string());
                return;
            }
        };
        let Some(dest) = self.resource(desc.dest) else { return };
        let Some(dest_structure) = dest.acceleration_structure() else {
            self.errors.push(format!("'{}' is not acceleration structure storage", dest.name()));
            return;
        };
        let source_structure = match (refit, desc.source) {
            (false, _) => vk::AccelerationStructureKHR::null(),
            (true, None) => {
                self.errors.push(format!("refit of '{}' without a source structure", dest.name()));
                return;
            }
            (true, Some(source)) => {
                let Some(source) = self.resource(source) else { return };
                match source.acceleration_structure() {
                    Some(structure) => structure,
                    None => {
                        self.errors.push(format!("'{}' is not acceleration structure storage", source.name()));
                        return;
                    }
                }
            }
        };

        let geometry = BuildGeometry::new(desc.inputs);
        let mut info = geometry.info(desc.inputs.flags());
        info.dst_acceleration_structure = dest_structure;
        info.src_acceleration_structure = source_structure;
        info.scratch_data = vk::DeviceOrHostAddressKHR { device_address: desc.scratch.gpu_virtual_address() };
        unsafe { loaders.acceleration.cmd_build_acceleration_structures(buffer, &[info], &[geometry.ranges()]) };
    }

    fn set_ray_tracing_pipeline(&mut self, pipeline: &dyn RayTracingPipeline) {
        let Some(buffer) = self.target() else { return };
        self.uav_barriers.clear();
        let Some(pipeline) = pipeline.as_any().downcast_ref::<VulkanPipeline>() else {
            self.errors.push("ray tracing pipeline belongs to another backend".to_string());
            return;
        };
        unsafe {
            self.device.device.cmd_bind_pipeline(buffer, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.raw())
        };
        self.pipeline_bound = true;
        if pipeline.layout() != self.layout {
            self.layout = pipeline.layout();
            self.bind_descriptor_set(buffer);
        }
    }

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) {
        let Some(buffer) = self.target() else { return };
        self.uav_barriers.clear();
        if !self.pipeline_bound {
            self.errors.push("dispatch without a bound ray tracing pipeline".to_string());
            return;
        }
        let device = Arc::clone(&self.device);
        let loaders = match device.ray_tracing() {
            Ok(loaders) => loaders,
            Err(err) => {
                self.errors.push(err.to_string());
                return;
            }
        };
        let region = |start, size, stride| vk::StridedDeviceAddressRegionKHR { device_address: start, stride, size };
        let ray_generation = region(desc.ray_generation.start, desc.ray_generation.size, desc.ray_generation.size);
        let miss = region(desc.miss.start, desc.miss.size, desc.miss.stride);
        let hit_group = region(desc.hit_group.start, desc.hit_group.size, desc.hit_group.stride);
        let callable = region(desc.callable.start, desc.callable.size, desc.callable.stride);
        unsafe {
            loaders.pipeline.cmd_trace_rays(
                buffer,
                &ray_generation,
                &miss,
                &hit_group,
                &callable,
                desc.width,
                desc.height,
                desc.depth,
            )
        };
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
