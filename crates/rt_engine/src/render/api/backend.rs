//! Backend abstraction traits for the GPU core
//!
//! The core drives every GPU object through these traits. A backend provides
//! one implementation per object category and hands them out as boxed or
//! reference-counted trait objects; dropping the box (or the last `Arc`)
//! releases the underlying API object.
//!
//! Recording calls on [`CommandList`] do not return errors individually.
//! Problems found while recording are reported by [`CommandList::close`], the
//! same way explicit APIs surface invalid command list usage.

use std::any::Any;
use std::sync::Arc;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::error::GraphicsResult;
use super::types::{
    AccelerationStructureInputs, AdapterInfo, BuildAccelerationStructureDesc, BufferDesc, ColorSpace,
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapKind, DispatchRaysDesc, FeatureLevel, Format,
    GpuDescriptorHandle, GpuPreference, GpuVirtualAddress, HeapType, OutputDesc, PipelineHandle, PrebuildInfo,
    Rect, ResourceBarrier, ResourceDimension, ResourceId, ShaderIdentifier, ShaderTableProperties, SwapchainDesc,
    TextureDesc, ViewDesc,
};
use crate::render::raytracing::pipeline::RayTracingPipelineDesc;

/// Entry point of a backend: creates instances ("adapter factories")
///
/// The core keeps the backend for its whole lifetime and creates a fresh
/// instance on start-up, after device loss and whenever the cached output
/// information goes stale.
pub trait GraphicsBackend {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Enable the API debug layer; an error means it is unavailable
    fn enable_debug_layer(&self) -> GraphicsResult<()>;

    /// Create an instance, with debug reporting when `debug` is set
    fn create_instance(&self, debug: bool) -> GraphicsResult<Box<dyn GraphicsInstance>>;
}

/// Adapter enumeration, output enumeration and swapchain creation
pub trait GraphicsInstance {
    /// Whether the display stack supports tearing (variable refresh rate)
    fn check_tearing_support(&self) -> GraphicsResult<bool>;

    /// Enumerate adapters in the requested preference order
    fn enumerate_adapters(&self, preference: GpuPreference) -> GraphicsResult<Vec<AdapterInfo>>;

    /// Create a device on `adapter` at no less than `minimum` feature level
    fn create_device(&self, adapter: &AdapterInfo, minimum: FeatureLevel) -> GraphicsResult<Arc<dyn GraphicsDevice>>;

    /// False once adapter/output information cached by this instance is stale
    fn is_current(&self) -> bool;

    /// Outputs attached to all adapters, in enumeration order
    fn enumerate_outputs(&self) -> GraphicsResult<Vec<OutputDesc>>;

    /// Create a swapchain presenting to `surface` through `queue`
    fn create_swapchain(
        &self,
        device: &Arc<dyn GraphicsDevice>,
        queue: &dyn CommandQueue,
        surface: &dyn OutputSurface,
        desc: &SwapchainDesc,
    ) -> GraphicsResult<Box<dyn Swapchain>>;
}

/// Logical device: object factory for everything below the instance
pub trait GraphicsDevice {
    /// Adapter the device was created on
    fn adapter(&self) -> &AdapterInfo;

    /// Highest level in `candidates` the device supports
    fn max_supported_feature_level(&self, candidates: &[FeatureLevel]) -> GraphicsResult<FeatureLevel>;

    /// Create the direct command queue
    fn create_command_queue(&self) -> GraphicsResult<Box<dyn CommandQueue>>;

    /// Create a fence starting at `initial_value`
    fn create_fence(&self, initial_value: u64) -> GraphicsResult<Box<dyn GpuFence>>;

    /// Create a command list; it starts out recording
    fn create_command_list(&self, name: &str) -> GraphicsResult<Box<dyn CommandList>>;

    /// Create a descriptor heap
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GraphicsResult<Box<dyn DescriptorHeap>>;

    /// Create a committed buffer
    fn create_buffer(&self, desc: &BufferDesc) -> GraphicsResult<Arc<dyn GpuResource>>;

    /// Create a committed 2D texture
    fn create_texture(&self, desc: &TextureDesc) -> GraphicsResult<Arc<dyn GpuResource>>;

    /// Memory requirements of building `inputs`
    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> GraphicsResult<PrebuildInfo>;

    /// Shader identifier size and record alignment rules
    fn shader_table_properties(&self) -> ShaderTableProperties;

    /// Compile a validated ray tracing pipeline description
    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc) -> GraphicsResult<Box<dyn RayTracingPipeline>>;

    /// Removal reason once the device has been lost
    fn removed_reason(&self) -> Option<String>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// Queue executing command lists and fence signals in submission order
pub trait CommandQueue {
    /// Submit closed command lists; they execute in slice order
    fn execute_command_lists(&self, lists: &[&dyn CommandList]) -> GraphicsResult<()>;

    /// Enqueue a GPU-side signal of `fence` to `value`
    fn signal(&self, fence: &dyn GpuFence, value: u64) -> GraphicsResult<()>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// Monotonic GPU timeline
pub trait GpuFence {
    /// Highest value the GPU has signaled
    fn completed_value(&self) -> u64;

    /// Block the calling thread until the completed value reaches `value`
    fn wait_for_value(&self, value: u64) -> GraphicsResult<()>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// A committed buffer or texture
pub trait GpuResource {
    /// Unique id within the device
    fn id(&self) -> ResourceId;

    /// Debug name
    fn name(&self) -> &str;

    /// Buffer or texture shape
    fn dimension(&self) -> ResourceDimension;

    /// Heap the resource lives in
    fn heap_type(&self) -> HeapType;

    /// GPU virtual address (buffers only, zero for textures)
    fn gpu_virtual_address(&self) -> GpuVirtualAddress;

    /// Copy `data` into an upload-heap buffer at `offset`
    fn write_bytes(&self, offset: u64, data: &[u8]) -> GraphicsResult<()>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

impl dyn GpuResource + '_ {
    /// Size of a buffer in bytes, zero for textures
    pub fn buffer_size(&self) -> u64 {
        match self.dimension() {
            ResourceDimension::Buffer { size } => size,
            ResourceDimension::Texture2D { .. } => 0,
        }
    }
}

/// Descriptor heap
pub trait DescriptorHeap {
    /// Heap category
    fn kind(&self) -> DescriptorHeapKind;

    /// Number of descriptors
    fn capacity(&self) -> u32;

    /// Distance between consecutive descriptors
    fn descriptor_size(&self) -> u32;

    /// CPU handle of slot 0
    fn cpu_start(&self) -> CpuDescriptorHandle;

    /// GPU handle of slot 0 (shader-visible heaps only)
    fn gpu_start(&self) -> Option<GpuDescriptorHandle>;

    /// Write a view into `slot`
    fn write_view(&self, slot: u32, view: &ViewDesc<'_>) -> GraphicsResult<()>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// Recordable command list together with its allocator
pub trait CommandList {
    /// Debug name
    fn name(&self) -> &str;

    /// Whether the list is between `reset` and `close`
    fn is_recording(&self) -> bool;

    /// Reclaim the allocator and start recording
    fn reset(&mut self, initial_pipeline: Option<PipelineHandle>) -> GraphicsResult<()>;

    /// Finish recording; reports errors found while recording
    fn close(&mut self) -> GraphicsResult<()>;

    /// Record resource barriers
    fn resource_barrier(&mut self, barriers: &[ResourceBarrier<'_>]);

    /// Bind the shader-visible descriptor heap
    fn set_descriptor_heap(&mut self, heap: &dyn DescriptorHeap);

    /// Clear a render target texture
    fn clear_render_target(&mut self, target: &dyn GpuResource, color: [f32; 4]);

    /// Copy a whole resource
    fn copy_resource(&mut self, dst: &dyn GpuResource, src: &dyn GpuResource);

    /// Scale `src` into `dst_rect` of `dst` with linear filtering
    fn blit_scaled(&mut self, dst: &dyn GpuResource, dst_rect: Rect, src: &dyn GpuResource);

    /// Build or refit an acceleration structure
    fn build_acceleration_structure(&mut self, desc: &BuildAccelerationStructureDesc<'_>);

    /// Bind a ray tracing pipeline
    fn set_ray_tracing_pipeline(&mut self, pipeline: &dyn RayTracingPipeline);

    /// Launch rays
    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc);

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// Compiled ray tracing pipeline
pub trait RayTracingPipeline {
    /// Opaque handle of the pipeline
    fn handle(&self) -> PipelineHandle;

    /// Identifier of a shader export or hit group
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// Swapchain
pub trait Swapchain {
    /// Current creation parameters
    fn desc(&self) -> &SwapchainDesc;

    /// Resize all back buffers; every outstanding back-buffer reference must be dropped first
    fn resize_buffers(&mut self, buffer_count: u32, width: u32, height: u32, format: Format) -> GraphicsResult<()>;

    /// Queue the current back buffer for presentation
    fn present(&mut self, sync_interval: u32, allow_tearing: bool) -> GraphicsResult<()>;

    /// Index of the back buffer to render into next
    fn current_back_buffer_index(&self) -> u32;

    /// Back buffer `index`
    fn back_buffer(&self, index: u32) -> GraphicsResult<Arc<dyn GpuResource>>;

    /// Whether the swapchain can present in `color_space`
    fn check_color_space_support(&self, color_space: ColorSpace) -> GraphicsResult<bool>;

    /// Switch the presentation color space
    fn set_color_space(&mut self, color_space: ColorSpace) -> GraphicsResult<()>;

    /// Downcast support for backend internals
    fn as_any(&self) -> &dyn Any;
}

/// Window provided by the windowing layer
pub trait OutputSurface {
    /// Window rectangle in desktop coordinates
    fn window_bounds(&self) -> GraphicsResult<Rect>;

    /// Native window handle, when presenting to a real window
    fn raw_window_handle(&self) -> Option<RawWindowHandle> {
        None
    }

    /// Native display handle, when presenting to a real window
    fn raw_display_handle(&self) -> Option<RawDisplayHandle> {
        None
    }
}
