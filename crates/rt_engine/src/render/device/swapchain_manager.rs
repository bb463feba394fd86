//! Device, swapchain and per-frame resource management
//!
//! [`SwapchainManager`] owns every device-level object the renderer needs:
//! instance, device, direct queue, descriptor heaps, swapchain, back buffers,
//! depth buffer, the intermediate scene target and the frame pacer. It
//! recreates the window-size dependent subset on resize and everything on
//! device loss.
//!
//! Frame flow:
//!
//! ```text
//! begin_pass(Scene) / prepare()     record scene work
//! record_post_pass()                 scale the scene target onto the back buffer
//! execute_frame()                    submit [Scene, Post]
//! present()                          flip, pace, maybe refresh color space
//! ```

use std::sync::Arc;

use crate::render::api::{
    AdapterInfo, ColorSpace, CommandList, CommandQueue, CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc,
    DescriptorHeapKind, DeviceConfig, DeviceOptions, FeatureLevel, Format, GpuPreference, GpuResource,
    GraphicsBackend, GraphicsDevice, GraphicsError, GraphicsInstance, GraphicsResult, OutputSurface,
    PipelineHandle, Rect, ResourceBarrier, ResourceFlags, ResourceState, Swapchain, SwapchainDesc, TextureDesc,
    ViewDesc, Viewport, MAX_BACK_BUFFER_COUNT,
};
use crate::render::descriptors::{cpu_handle_at, DescriptorHeapAllocator, SlotAllocator, SlotId};
use crate::render::frame::{CommandPass, FramePacer, PassState};

use super::color_space::{best_output, select_color_space};
use super::device_notify::{DeviceNotify, DeviceState};
use super::resolution::{post_view_and_scissor, Resolution, ResolutionSelector, RESOLUTION_OPTIONS};

/// Objects that live exactly as long as one device
struct DeviceObjects {
    pacer: FramePacer,
    descriptors: DescriptorHeapAllocator,
    rtv_heap: Box<dyn DescriptorHeap>,
    dsv_heap: Option<Box<dyn DescriptorHeap>>,
    queue: Box<dyn CommandQueue>,
    feature_level: FeatureLevel,
    device: Arc<dyn GraphicsDevice>,
    instance: Box<dyn GraphicsInstance>,
}

/// Owner of the device, swapchain and frame resources
pub struct SwapchainManager {
    backend: Box<dyn GraphicsBackend>,
    config: DeviceConfig,
    options: DeviceOptions,
    slots: Arc<SlotAllocator>,
    debug_layer: bool,

    surface: Option<Box<dyn OutputSurface>>,
    output_width: u32,
    output_height: u32,

    objects: Option<DeviceObjects>,
    swapchain: Option<Box<dyn Swapchain>>,
    back_buffers: Vec<Arc<dyn GpuResource>>,
    depth_buffer: Option<Arc<dyn GpuResource>>,
    intermediate: Option<Arc<dyn GpuResource>>,
    intermediate_srv: Option<SlotId>,

    back_buffer_index: u32,
    back_buffer_state: ResourceState,
    recorded_passes: [bool; CommandPass::COUNT],
    color_space: ColorSpace,
    screen_viewport: Viewport,
    scissor_rect: Rect,
    resolution: ResolutionSelector,

    observers: Vec<Box<dyn DeviceNotify>>,
    state: DeviceState,
    device_generation: u64,
}

impl SwapchainManager {
    /// Create a manager with its own slot allocator
    pub fn new(backend: Box<dyn GraphicsBackend>, config: DeviceConfig) -> GraphicsResult<Self> {
        Self::with_slot_allocator(backend, config, Arc::new(SlotAllocator::new()))
    }

    /// Create a manager handing out descriptor slots from `slots`
    pub fn with_slot_allocator(
        backend: Box<dyn GraphicsBackend>,
        config: DeviceConfig,
        slots: Arc<SlotAllocator>,
    ) -> GraphicsResult<Self> {
        validate_config(&config)?;
        log::debug!(
            "Creating SwapchainManager on the {} backend ({} back buffers, {:?})",
            backend.name(),
            config.back_buffer_count,
            config.back_buffer_format
        );

        Ok(Self {
            backend,
            options: config.options(),
            resolution: ResolutionSelector::new(config.resolution_index),
            config,
            slots,
            debug_layer: false,
            surface: None,
            output_width: 1,
            output_height: 1,
            objects: None,
            swapchain: None,
            back_buffers: Vec::new(),
            depth_buffer: None,
            intermediate: None,
            intermediate_srv: None,
            back_buffer_index: 0,
            back_buffer_state: ResourceState::Present,
            recorded_passes: [false; CommandPass::COUNT],
            color_space: ColorSpace::SrgbG22P709,
            screen_viewport: Viewport::from_size(1, 1),
            scissor_rect: Rect::from_size(1, 1),
            observers: Vec::new(),
            state: DeviceState::Live,
            device_generation: 0,
        })
    }

    /// Bind the window to present into and its client size
    pub fn set_window(&mut self, surface: Box<dyn OutputSurface>, width: u32, height: u32) {
        self.surface = Some(surface);
        self.output_width = width.max(1);
        self.output_height = height.max(1);
    }

    /// Register an observer for device loss and restoration
    pub fn register_device_notify(&mut self, observer: Box<dyn DeviceNotify>) {
        self.observers.push(observer);
    }

    /// Create the device and every object that does not depend on the window size
    ///
    /// Does nothing when the device already exists.
    pub fn create_device_resources(&mut self) -> GraphicsResult<()> {
        if self.objects.is_some() {
            return Ok(());
        }

        self.debug_layer = self.config.debug_layer_enabled()
            && match self.backend.enable_debug_layer() {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("Debug layer unavailable, continuing without it: {}", err);
                    false
                }
            };

        let instance = self.backend.create_instance(self.debug_layer)?;

        if self.options.contains(DeviceOptions::ALLOW_TEARING) {
            match instance.check_tearing_support() {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("Variable refresh rate displays not supported");
                    self.options.remove(DeviceOptions::ALLOW_TEARING);
                }
                Err(err) => {
                    log::warn!("Tearing support query failed: {}", err);
                    self.options.remove(DeviceOptions::ALLOW_TEARING);
                }
            }
        }

        let device = select_adapter(instance.as_ref(), self.config.min_feature_level)?;
        let feature_level = device
            .max_supported_feature_level(&FeatureLevel::PROBE_ORDER)
            .unwrap_or_else(|err| {
                log::debug!("Feature level probe failed ({}), assuming {:?}", err, self.config.min_feature_level);
                self.config.min_feature_level
            });
        log::info!("Using adapter '{}' at feature level {:?}", device.adapter().name, feature_level);

        let queue = device.create_command_queue()?;

        let back_buffer_count = self.config.back_buffer_count;
        let rtv_heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: DescriptorHeapKind::RenderTarget,
            capacity: back_buffer_count + 1,
            shader_visible: false,
        })?;
        let dsv_heap = if self.config.depth_buffer_format == Format::Unknown {
            None
        } else {
            Some(device.create_descriptor_heap(&DescriptorHeapDesc {
                kind: DescriptorHeapKind::DepthStencil,
                capacity: 1,
                shader_visible: false,
            })?)
        };
        let descriptors =
            DescriptorHeapAllocator::new(
                device.as_ref(),
                self.config.descriptor_heap_capacity,
                Arc::clone(&self.slots),
            )?;

        let pacer = FramePacer::new(device.as_ref(), back_buffer_count, self.back_buffer_index)?;

        self.objects = Some(DeviceObjects {
            pacer,
            descriptors,
            rtv_heap,
            dsv_heap,
            queue,
            feature_level,
            device,
            instance,
        });
        self.state = DeviceState::Live;
        Ok(())
    }

    /// Create or resize the swapchain and everything sized after the window
    pub fn create_window_size_dependent_resources(&mut self) -> GraphicsResult<()> {
        if self.surface.is_none() {
            return Err(GraphicsError::NoOutputSurface);
        }
        if self.objects.is_none() {
            return Err(not_created());
        }

        // Nothing may still reference the buffers that are about to go away
        self.wait_for_gpu()?;
        self.back_buffers.clear();
        self.depth_buffer = None;
        self.intermediate = None;
        self.back_buffer_state = ResourceState::Present;
        if let Some(objects) = self.objects.as_mut() {
            objects.pacer.sync_all_frames();
        }

        let width = self.output_width;
        let height = self.output_height;
        let format = self.config.back_buffer_format.without_srgb();
        let buffer_count = self.config.back_buffer_count;

        if let Some(swapchain) = self.swapchain.as_mut() {
            if let Err(err) = swapchain.resize_buffers(buffer_count, width, height, format) {
                if err.is_device_lost() {
                    log::warn!("Device lost on resize: {}", err);
                    return self.handle_device_lost();
                }
                return Err(err);
            }
        } else {
            let (Some(objects), Some(surface)) = (self.objects.as_ref(), self.surface.as_deref()) else {
                return Err(not_created());
            };
            let desc = SwapchainDesc {
                width,
                height,
                format,
                buffer_count,
                allow_tearing: self.options.contains(DeviceOptions::ALLOW_TEARING),
            };
            let swapchain = objects.instance.create_swapchain(&objects.device, objects.queue.as_ref(), surface, &desc)?;
            self.swapchain = Some(swapchain);
        }

        self.update_color_space()?;
        self.acquire_back_buffers()?;
        self.create_depth_buffer()?;

        self.screen_viewport = Viewport::from_size(width, height);
        self.scissor_rect = Rect::from_size(width, height);

        self.create_scene_resolution_resources()
    }

    /// React to a new client size
    ///
    /// Returns `false` when there is no window or the size did not change.
    pub fn window_size_changed(&mut self, width: u32, height: u32) -> GraphicsResult<bool> {
        if self.surface.is_none() {
            return Ok(false);
        }

        let (width, height) = (width.max(1), height.max(1));
        if width == self.output_width && height == self.output_height {
            // The window may have moved to another output
            self.update_color_space()?;
            return Ok(false);
        }

        log::debug!("Window resized to {}x{}", width, height);
        self.output_width = width;
        self.output_height = height;
        self.create_window_size_dependent_resources()?;
        Ok(true)
    }

    /// Present the current back buffer and move to the next frame
    ///
    /// Device loss during present is recovered from here.
    pub fn present(&mut self) -> GraphicsResult<()> {
        let swapchain = self.swapchain.as_mut().ok_or_else(|| GraphicsError::invalid("present without a swapchain"))?;

        let result = if self.options.contains(DeviceOptions::ALLOW_TEARING) {
            swapchain.present(0, true)
        } else {
            swapchain.present(1, false)
        };
        if let Err(err) = result {
            if err.is_device_lost() {
                log::warn!("Device lost on present: {}", err);
                return self.handle_device_lost();
            }
            return Err(err);
        }

        let next = swapchain.current_back_buffer_index();
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        objects.pacer.move_to_next_frame(objects.queue.as_ref(), next)?;
        self.back_buffer_index = next;
        self.recorded_passes = [false; CommandPass::COUNT];

        if !objects.instance.is_current() {
            self.update_color_space()?;
        }
        Ok(())
    }

    /// Block until the GPU finished everything submitted so far
    pub fn wait_for_gpu(&mut self) -> GraphicsResult<()> {
        match self.objects.as_mut() {
            Some(objects) => objects.pacer.wait_for_gpu(objects.queue.as_ref()),
            None => Ok(()),
        }
    }

    /// Pick the presentation color space for the output the window is on
    pub fn update_color_space(&mut self) -> GraphicsResult<()> {
        let Some(objects) = self.objects.as_mut() else {
            return Ok(());
        };

        if !objects.instance.is_current() {
            log::debug!("Output information is stale, recreating the instance");
            objects.instance = self.backend.create_instance(self.debug_layer)?;
        }

        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(());
        };

        let outputs = objects.instance.enumerate_outputs()?;
        let window = match self.surface.as_deref() {
            Some(surface) => surface.window_bounds()?,
            None => Rect::default(),
        };
        let output = best_output(&outputs, &window);
        let color_space =
            select_color_space(
                self.options.contains(DeviceOptions::ENABLE_HDR),
                output,
                self.config.back_buffer_format,
            );

        self.color_space = color_space;
        if swapchain.check_color_space_support(color_space)? {
            swapchain.set_color_space(color_space)?;
            log::debug!("Presenting in {:?}", color_space);
        } else {
            log::debug!("Swapchain cannot present in {:?}", color_space);
        }
        Ok(())
    }

    /// Tear everything down and rebuild it on a fresh device
    pub fn handle_device_lost(&mut self) -> GraphicsResult<()> {
        let reason = self.objects.as_ref().and_then(|objects| objects.device.removed_reason());
        log::warn!("Device lost ({}), recreating device resources", reason.as_deref().unwrap_or("reset"));

        self.state = DeviceState::Lost;
        for observer in &mut self.observers {
            observer.on_device_lost();
        }

        self.release_device_objects();

        self.state = DeviceState::Recovering;
        self.create_device_resources()?;
        self.create_window_size_dependent_resources()?;

        self.device_generation += 1;
        self.state = DeviceState::Live;
        for observer in &mut self.observers {
            observer.on_device_restored();
        }
        log::info!("Device restored (generation {})", self.device_generation);
        Ok(())
    }

    /// Step to the next scene resolution, wrapping around
    pub fn increase_resolution_index(&mut self) -> GraphicsResult<Resolution> {
        let resolution = self.resolution.increase();
        self.reload_scene_resolution()?;
        Ok(resolution)
    }

    /// Step to the previous scene resolution, wrapping around
    pub fn decrease_resolution_index(&mut self) -> GraphicsResult<Resolution> {
        let resolution = self.resolution.decrease();
        self.reload_scene_resolution()?;
        Ok(resolution)
    }

    /// Reset `pass` of the current frame and start recording it
    pub fn begin_pass(
        &mut self,
        pass: CommandPass,
        initial_pipeline: Option<PipelineHandle>,
    ) -> GraphicsResult<&mut dyn CommandList> {
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        self.recorded_passes[pass.index()] = true;
        objects.pacer.current_frame_mut().reset_command_list(pass, initial_pipeline)
    }

    /// Bind the shader-visible CBV/SRV/UAV heap on `pass` of the current frame
    pub fn bind_descriptor_heap(&mut self, pass: CommandPass) -> GraphicsResult<()> {
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        let frame = objects.pacer.current_frame_mut();
        if frame.pass_state(pass) != PassState::Recording {
            return Err(GraphicsError::invalid(format!("{:?} pass is not recording", pass)));
        }
        frame.command_list_mut(pass).set_descriptor_heap(objects.descriptors.heap());
        Ok(())
    }

    /// Start the scene pass with the back buffer as render target
    pub fn prepare(&mut self, initial_pipeline: Option<PipelineHandle>) -> GraphicsResult<&mut dyn CommandList> {
        let back_buffer = self.current_back_buffer()?;
        let before = self.back_buffer_state;

        self.begin_pass(CommandPass::Scene, initial_pipeline)?;
        self.back_buffer_state = ResourceState::RenderTarget;

        let list = self.current_command_list(CommandPass::Scene)?;
        if before != ResourceState::RenderTarget {
            list.resource_barrier(&[ResourceBarrier::transition(
                back_buffer.as_ref(),
                before,
                ResourceState::RenderTarget,
            )]);
        }
        Ok(list)
    }

    /// Record the post pass: letterbox the scene target onto the back buffer
    pub fn record_post_pass(&mut self) -> GraphicsResult<()> {
        let back_buffer = self.current_back_buffer()?;
        let intermediate = self
            .intermediate
            .clone()
            .ok_or_else(|| GraphicsError::invalid("post pass without an intermediate render target"))?;
        let scissor = self.post_scissor();
        let letterbox_color = self.config.letterbox_color;
        let before = self.back_buffer_state;

        self.begin_pass(CommandPass::Post, None)?;
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        let frame = objects.pacer.current_frame_mut();
        let list = frame.command_list_mut(CommandPass::Post);

        list.set_descriptor_heap(objects.descriptors.heap());
        let mut barriers = vec![ResourceBarrier::transition(
            intermediate.as_ref(),
            ResourceState::RenderTarget,
            ResourceState::CopySource,
        )];
        if before != ResourceState::RenderTarget {
            barriers.push(ResourceBarrier::transition(back_buffer.as_ref(), before, ResourceState::RenderTarget));
        }
        list.resource_barrier(&barriers);

        list.clear_render_target(back_buffer.as_ref(), letterbox_color);
        list.blit_scaled(back_buffer.as_ref(), scissor, intermediate.as_ref());

        list.resource_barrier(&[
            ResourceBarrier::transition(back_buffer.as_ref(), ResourceState::RenderTarget, ResourceState::Present),
            ResourceBarrier::transition(intermediate.as_ref(), ResourceState::CopySource, ResourceState::RenderTarget),
        ]);
        frame.close(CommandPass::Post)?;

        self.back_buffer_state = ResourceState::Present;
        Ok(())
    }

    /// Close the passes recorded this frame and submit them in pass order
    ///
    /// A back buffer still bound as render target is returned to the present
    /// state at the end of the last pass that is still recording.
    pub fn execute_frame(&mut self) -> GraphicsResult<()> {
        let recorded = self.recorded_passes;
        let back_buffer = self.current_back_buffer()?;
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        let frame = objects.pacer.current_frame_mut();

        if self.back_buffer_state != ResourceState::Present {
            let open = CommandPass::ALL
                .iter()
                .rev()
                .copied()
                .find(|pass| recorded[pass.index()] && frame.pass_state(*pass) == PassState::Recording)
                .ok_or_else(|| {
                    GraphicsError::invalid("back buffer is still a render target and every pass is closed")
                })?;
            frame.command_list_mut(open).resource_barrier(&[ResourceBarrier::transition(
                back_buffer.as_ref(),
                self.back_buffer_state,
                ResourceState::Present,
            )]);
            self.back_buffer_state = ResourceState::Present;
        }

        for pass in CommandPass::ALL {
            if recorded[pass.index()] && frame.pass_state(pass) == PassState::Recording {
                frame.close(pass)?;
            }
        }

        let lists = frame
            .submission_batch()?
            .into_iter()
            .zip(CommandPass::ALL)
            .filter(|(_, pass)| recorded[pass.index()])
            .map(|(list, _)| list)
            .collect::<Vec<_>>();
        if !lists.is_empty() {
            objects.queue.execute_command_lists(&lists)?;
        }
        self.recorded_passes = [false; CommandPass::COUNT];
        Ok(())
    }

    /// Create a standalone command list, already recording
    pub fn create_command_list(&self, name: &str) -> GraphicsResult<Box<dyn CommandList>> {
        self.device()?.create_command_list(name)
    }

    /// Submit a standalone list and wait for the GPU to finish it
    pub fn execute_and_wait(&mut self, list: &dyn CommandList) -> GraphicsResult<()> {
        self.command_queue()?.execute_command_lists(&[list])?;
        self.wait_for_gpu()
    }

    /// The device
    pub fn device(&self) -> GraphicsResult<&Arc<dyn GraphicsDevice>> {
        self.objects.as_ref().map(|objects| &objects.device).ok_or_else(not_created)
    }

    /// The direct queue
    pub fn command_queue(&self) -> GraphicsResult<&dyn CommandQueue> {
        self.objects.as_ref().map(|objects| objects.queue.as_ref()).ok_or_else(not_created)
    }

    /// The shader-visible CBV/SRV/UAV heap
    pub fn descriptors(&self) -> GraphicsResult<&DescriptorHeapAllocator> {
        self.objects.as_ref().map(|objects| &objects.descriptors).ok_or_else(not_created)
    }

    /// Slot allocator shared by every consumer of the descriptor heap
    pub fn slot_allocator(&self) -> &Arc<SlotAllocator> {
        &self.slots
    }

    /// Frame contexts and fence
    pub fn frame_pacer(&self) -> GraphicsResult<&FramePacer> {
        self.objects.as_ref().map(|objects| &objects.pacer).ok_or_else(not_created)
    }

    /// Command list of `pass` in the current frame
    pub fn current_command_list(&mut self, pass: CommandPass) -> GraphicsResult<&mut dyn CommandList> {
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        Ok(objects.pacer.current_frame_mut().command_list_mut(pass))
    }

    /// The swapchain, once created
    pub fn swapchain(&self) -> Option<&dyn Swapchain> {
        self.swapchain.as_deref()
    }

    /// Index of the back buffer (and frame context) being recorded
    pub fn current_frame_index(&self) -> u32 {
        self.back_buffer_index
    }

    /// Number of back buffers and frames in flight
    pub fn back_buffer_count(&self) -> u32 {
        self.config.back_buffer_count
    }

    /// Back buffer being rendered to this frame
    pub fn current_back_buffer(&self) -> GraphicsResult<Arc<dyn GpuResource>> {
        self.back_buffers
            .get(self.back_buffer_index as usize)
            .cloned()
            .ok_or_else(|| GraphicsError::invalid("window size dependent resources have not been created"))
    }

    /// Render target view of the current back buffer
    pub fn render_target_view(&self) -> GraphicsResult<CpuDescriptorHandle> {
        self.rtv_at(self.back_buffer_index)
    }

    /// Heap holding the back buffer views followed by the intermediate target's view
    pub fn render_target_heap(&self) -> GraphicsResult<&dyn DescriptorHeap> {
        Ok(self.objects.as_ref().ok_or_else(not_created)?.rtv_heap.as_ref())
    }

    /// Back buffer `index`
    pub fn back_buffer(&self, index: u32) -> Option<&Arc<dyn GpuResource>> {
        self.back_buffers.get(index as usize)
    }

    /// Render target view of the intermediate scene target
    pub fn intermediate_render_target_view(&self) -> GraphicsResult<CpuDescriptorHandle> {
        self.rtv_at(self.config.back_buffer_count)
    }

    /// Depth stencil view, when a depth format is configured
    pub fn depth_stencil_view(&self) -> Option<CpuDescriptorHandle> {
        let heap = self.objects.as_ref()?.dsv_heap.as_ref()?;
        Some(heap.cpu_start())
    }

    /// Depth buffer, when a depth format is configured
    pub fn depth_buffer(&self) -> Option<&Arc<dyn GpuResource>> {
        self.depth_buffer.as_ref()
    }

    /// Scene render target at the current preset resolution
    pub fn intermediate_render_target(&self) -> Option<&Arc<dyn GpuResource>> {
        self.intermediate.as_ref()
    }

    /// Descriptor slot of the scene target's shader resource view
    pub fn intermediate_srv_slot(&self) -> Option<SlotId> {
        self.intermediate_srv
    }

    /// Viewport covering the whole output
    pub fn screen_viewport(&self) -> Viewport {
        self.screen_viewport
    }

    /// Scissor covering the whole output
    pub fn scissor_rect(&self) -> Rect {
        self.scissor_rect
    }

    /// Viewport of the scene pass (preset resolution)
    pub fn scene_viewport(&self) -> Viewport {
        let resolution = self.resolution.current();
        Viewport::from_size(resolution.width, resolution.height)
    }

    /// Scissor of the scene pass (preset resolution)
    pub fn scene_scissor(&self) -> Rect {
        let resolution = self.resolution.current();
        Rect::from_size(resolution.width, resolution.height)
    }

    /// Letterboxed viewport of the post pass
    pub fn post_viewport(&self) -> Viewport {
        post_view_and_scissor(self.resolution.current(), self.output_width, self.output_height).0
    }

    /// Letterboxed scissor of the post pass
    pub fn post_scissor(&self) -> Rect {
        post_view_and_scissor(self.resolution.current(), self.output_width, self.output_height).1
    }

    /// Current scene resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution.current()
    }

    /// Current index into the preset table
    pub fn resolution_index(&self) -> usize {
        self.resolution.index()
    }

    /// Client size of the window
    pub fn output_size(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    /// Color space selected by the last negotiation
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    /// Feature level of the current device
    pub fn feature_level(&self) -> Option<FeatureLevel> {
        self.objects.as_ref().map(|objects| objects.feature_level)
    }

    /// Adapter of the current device
    pub fn adapter(&self) -> Option<&AdapterInfo> {
        self.objects.as_ref().map(|objects| objects.device.adapter())
    }

    /// Effective options after capability probing
    pub fn options(&self) -> DeviceOptions {
        self.options
    }

    /// Requested configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Whether the debug layer is active
    pub fn debug_layer_enabled(&self) -> bool {
        self.debug_layer
    }

    /// Where the device is in its loss/recovery cycle
    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    /// Incremented on every device recovery
    ///
    /// Objects created on an older generation's device must be recreated.
    pub fn device_generation(&self) -> u64 {
        self.device_generation
    }

    fn rtv_at(&self, slot: u32) -> GraphicsResult<CpuDescriptorHandle> {
        let heap = &self.objects.as_ref().ok_or_else(not_created)?.rtv_heap;
        Ok(cpu_handle_at(heap.cpu_start(), slot, heap.descriptor_size()))
    }

    fn acquire_back_buffers(&mut self) -> GraphicsResult<()> {
        let objects = self.objects.as_mut().ok_or_else(not_created)?;
        let swapchain = self.swapchain.as_ref().ok_or_else(not_created)?;

        let count = swapchain.desc().buffer_count;
        let mut back_buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            let buffer = swapchain.back_buffer(index)?;
            objects.rtv_heap.write_view(index, &ViewDesc::RenderTarget(buffer.as_ref()))?;
            back_buffers.push(buffer);
        }

        self.back_buffers = back_buffers;
        self.back_buffer_index = swapchain.current_back_buffer_index();
        objects.pacer.set_current_index(self.back_buffer_index);
        log::debug!("Acquired {} back buffers, current index {}", count, self.back_buffer_index);
        Ok(())
    }

    fn create_depth_buffer(&mut self) -> GraphicsResult<()> {
        let format = self.config.depth_buffer_format;
        if format == Format::Unknown {
            return Ok(());
        }
        let objects = self.objects.as_ref().ok_or_else(not_created)?;

        let clear_depth = if self.options.contains(DeviceOptions::REVERSE_DEPTH) { 0.0 } else { 1.0 };
        let depth_buffer = objects.device.create_texture(&TextureDesc {
            name: "Depth stencil".to_string(),
            width: self.output_width,
            height: self.output_height,
            format,
            flags: ResourceFlags::ALLOW_DEPTH_STENCIL,
            initial_state: ResourceState::DepthWrite,
            clear_color: None,
            clear_depth: Some(clear_depth),
        })?;
        if let Some(dsv_heap) = objects.dsv_heap.as_ref() {
            dsv_heap.write_view(0, &ViewDesc::DepthStencil(depth_buffer.as_ref()))?;
        }
        self.depth_buffer = Some(depth_buffer);
        Ok(())
    }

    fn create_scene_resolution_resources(&mut self) -> GraphicsResult<()> {
        let objects = self.objects.as_ref().ok_or_else(not_created)?;
        let resolution = self.resolution.current();

        self.intermediate = None;
        let intermediate = objects.device.create_texture(&TextureDesc {
            name: "Intermediate render target".to_string(),
            width: resolution.width,
            height: resolution.height,
            format: self.config.back_buffer_format.without_srgb(),
            flags: ResourceFlags::ALLOW_RENDER_TARGET,
            initial_state: ResourceState::RenderTarget,
            clear_color: Some(self.config.clear_color),
            clear_depth: None,
        })?;
        objects
            .rtv_heap
            .write_view(self.config.back_buffer_count, &ViewDesc::RenderTarget(intermediate.as_ref()))?;

        // Reserved once; only the view is rewritten on later calls
        let slot = match self.intermediate_srv {
            Some(slot) => slot,
            None => {
                let slot = objects.descriptors.allocate()?;
                self.intermediate_srv = Some(slot);
                slot
            }
        };
        objects.descriptors.write_view(slot, &ViewDesc::ShaderResource(intermediate.as_ref()))?;

        log::info!(
            "Scene resolution {}x{} scaled to {}x{}",
            resolution.width,
            resolution.height,
            self.output_width,
            self.output_height
        );
        self.intermediate = Some(intermediate);
        Ok(())
    }

    fn reload_scene_resolution(&mut self) -> GraphicsResult<()> {
        if self.objects.is_none() || self.swapchain.is_none() {
            return Ok(());
        }
        self.wait_for_gpu()?;
        self.create_scene_resolution_resources()
    }

    fn release_device_objects(&mut self) {
        self.back_buffers.clear();
        self.depth_buffer = None;
        self.intermediate = None;
        self.swapchain = None;
        self.objects = None;
        self.back_buffer_state = ResourceState::Present;
        self.recorded_passes = [false; CommandPass::COUNT];
        log::debug!("Released device objects");
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        if let Err(err) = self.wait_for_gpu() {
            log::warn!("Failed to drain the GPU during shutdown: {}", err);
        }
        log::debug!("SwapchainManager dropped");
    }
}

fn not_created() -> GraphicsError {
    GraphicsError::invalid("device resources have not been created")
}

fn validate_config(config: &DeviceConfig) -> GraphicsResult<()> {
    if !(2..=MAX_BACK_BUFFER_COUNT).contains(&config.back_buffer_count) {
        return Err(GraphicsError::OutOfRange {
            reason: format!(
                "back buffer count {} outside 2..={}",
                config.back_buffer_count, MAX_BACK_BUFFER_COUNT
            ),
        });
    }
    if config.back_buffer_format == Format::Unknown || config.back_buffer_format.is_depth() {
        return Err(GraphicsError::OutOfRange {
            reason: format!("{:?} is not a back buffer format", config.back_buffer_format),
        });
    }
    if config.depth_buffer_format != Format::Unknown && !config.depth_buffer_format.is_depth() {
        return Err(GraphicsError::OutOfRange {
            reason: format!("{:?} is not a depth format", config.depth_buffer_format),
        });
    }
    if config.resolution_index >= RESOLUTION_OPTIONS.len() {
        return Err(GraphicsError::OutOfRange {
            reason: format!("resolution index {} of {}", config.resolution_index, RESOLUTION_OPTIONS.len()),
        });
    }
    if config.descriptor_heap_capacity == 0 {
        return Err(GraphicsError::OutOfRange { reason: "empty descriptor heap".to_string() });
    }
    Ok(())
}

/// First hardware adapter that can create a device at `minimum`
///
/// Debug builds fall back to a software adapter when no hardware one fits.
fn select_adapter(instance: &dyn GraphicsInstance, minimum: FeatureLevel) -> GraphicsResult<Arc<dyn GraphicsDevice>> {
    let adapters = instance.enumerate_adapters(GpuPreference::HighPerformance)?;

    for adapter in adapters.iter().filter(|adapter| !adapter.is_software) {
        match instance.create_device(adapter, minimum) {
            Ok(device) => {
                log::info!(
                    "Graphics adapter ({}): VID:{:04X}, PID:{:04X} - {}",
                    adapter.index,
                    adapter.vendor_id,
                    adapter.device_id,
                    adapter.name
                );
                return Ok(device);
            }
            Err(err) => log::debug!("Skipping adapter '{}': {}", adapter.name, err),
        }
    }

    if cfg!(debug_assertions) {
        if let Some(software) = adapters.iter().find(|adapter| adapter.is_software) {
            log::warn!("No hardware adapter supports {:?}, falling back to '{}'", minimum, software.name);
            return instance.create_device(software, minimum);
        }
    }

    Err(GraphicsError::NoAdapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessBackend, HeadlessConfig, HeadlessSurface};
    use crate::render::tests::{headless_manager, window_at};

    #[test]
    fn test_rejects_back_buffer_counts() {
        for count in [0, 1, MAX_BACK_BUFFER_COUNT + 1] {
            let config = DeviceConfig::new(Format::Bgra8Unorm, count);
            let result = SwapchainManager::new(Box::new(HeadlessBackend::default()), config);
            assert!(matches!(result, Err(GraphicsError::OutOfRange { .. })), "count {count} accepted");
        }
    }

    #[test]
    fn test_rejects_bad_formats() {
        let config = DeviceConfig::new(Format::D32Float, 2);
        assert!(SwapchainManager::new(Box::new(HeadlessBackend::default()), config).is_err());
        let config = DeviceConfig::default().with_depth_format(Format::Rgba8Unorm);
        assert!(SwapchainManager::new(Box::new(HeadlessBackend::default()), config).is_err());
    }

    #[test]
    fn test_window_resources_need_a_window() {
        let mut manager = SwapchainManager::new(Box::new(HeadlessBackend::default()), DeviceConfig::default()).unwrap();
        manager.create_device_resources().unwrap();
        assert!(matches!(manager.create_window_size_dependent_resources(), Err(GraphicsError::NoOutputSurface)));
        assert!(!manager.window_size_changed(800, 600).unwrap());
    }

    #[test]
    fn test_device_resources_are_idempotent() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let mut manager = SwapchainManager::new(Box::new(backend), DeviceConfig::default()).unwrap();
        manager.create_device_resources().unwrap();
        manager.create_device_resources().unwrap();
        assert_eq!(control.stats().devices_created, 1);
        assert_eq!(manager.feature_level(), Some(FeatureLevel::L12_2));
        assert_eq!(manager.adapter().unwrap().name, "Headless GPU");
    }

    /// Software adapters are skipped while a hardware adapter qualifies
    #[test]
    fn test_prefers_hardware_adapter() {
        let config = HeadlessConfig {
            adapters: vec![
                HeadlessConfig::software_adapter(0),
                HeadlessConfig::hardware_adapter(1, "Small GPU", FeatureLevel::L12_0, 2 << 30),
                HeadlessConfig::hardware_adapter(2, "Big GPU", FeatureLevel::L12_1, 16 << 30),
            ],
            ..HeadlessConfig::default()
        };
        let mut manager =
            SwapchainManager::new(Box::new(HeadlessBackend::new(config)), DeviceConfig::default()).unwrap();
        manager.create_device_resources().unwrap();
        assert_eq!(manager.adapter().unwrap().name, "Big GPU");
        assert_eq!(manager.feature_level(), Some(FeatureLevel::L12_1));
    }

    #[test]
    fn test_no_adapter_meets_minimum() {
        let config = HeadlessConfig {
            adapters: vec![HeadlessConfig::hardware_adapter(0, "Old GPU", FeatureLevel::L11_1, 1 << 30)],
            ..HeadlessConfig::default()
        };
        let device_config = DeviceConfig::default().with_min_feature_level(FeatureLevel::L12_0);
        let mut manager = SwapchainManager::new(Box::new(HeadlessBackend::new(config)), device_config).unwrap();
        assert!(matches!(manager.create_device_resources(), Err(GraphicsError::NoAdapter)));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_software_fallback_in_debug_builds() {
        let config = HeadlessConfig {
            adapters: vec![
                HeadlessConfig::hardware_adapter(0, "Old GPU", FeatureLevel::L11_0, 1 << 30),
                HeadlessConfig::software_adapter(1),
            ],
            ..HeadlessConfig::default()
        };
        let device_config = DeviceConfig::default().with_min_feature_level(FeatureLevel::L12_0);
        let mut manager = SwapchainManager::new(Box::new(HeadlessBackend::new(config)), device_config).unwrap();
        manager.create_device_resources().unwrap();
        assert!(manager.adapter().unwrap().is_software);
    }

    /// A missing debug layer or tearing support only degrades
    #[test]
    fn test_tolerated_capability_failures() {
        let config = HeadlessConfig {
            tearing_supported: false,
            debug_layer_available: false,
            ..HeadlessConfig::default()
        };
        let backend = HeadlessBackend::new(config);
        let control = backend.control();
        let device_config = DeviceConfig::default().with_tearing(true).with_debug_layer(true);
        let (mut manager, _surface) = headless_manager(backend, device_config, 1280, 720);

        assert!(!manager.options().contains(DeviceOptions::ALLOW_TEARING));
        assert!(!manager.debug_layer_enabled());
        assert!(!manager.swapchain().unwrap().desc().allow_tearing);

        manager.present().unwrap();
        let present = control.stats().last_present.unwrap();
        assert_eq!((present.sync_interval, present.allow_tearing), (1, false));
    }

    #[test]
    fn test_tearing_present() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default().with_tearing(true), 1280, 720);

        assert!(manager.swapchain().unwrap().desc().allow_tearing);
        manager.present().unwrap();
        let present = control.stats().last_present.unwrap();
        assert_eq!((present.sync_interval, present.allow_tearing), (0, true));
    }

    #[test]
    fn test_same_size_is_not_a_resize() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 1280, 720);

        assert!(!manager.window_size_changed(1280, 720).unwrap());
        assert_eq!(control.stats().swapchain_resizes, 0);
        assert!(manager.window_size_changed(1024, 768).unwrap());
        assert_eq!(control.stats().swapchain_resizes, 1);
        assert_eq!(manager.output_size(), (1024, 768));
    }

    /// HDR10 is chosen only on an HDR output with a 10-bit back buffer
    #[test]
    fn test_hdr_color_space() {
        let config = HeadlessConfig {
            outputs: vec![
                HeadlessConfig::sdr_output("SDR", Rect::new(0, 0, 1920, 1080)),
                HeadlessConfig::hdr_output("HDR", Rect::new(1920, 0, 3840, 2160)),
            ],
            ..HeadlessConfig::default()
        };
        let backend = HeadlessBackend::new(config);
        let control = backend.control();
        let device_config = DeviceConfig::new(Format::Rgb10A2Unorm, 2).with_hdr(true);
        let mut manager = SwapchainManager::new(Box::new(backend), device_config).unwrap();
        let surface = HeadlessSurface::new(window_at(2000, 100, 1280, 720));
        manager.set_window(Box::new(surface.clone()), 1280, 720);
        manager.create_device_resources().unwrap();
        manager.create_window_size_dependent_resources().unwrap();

        assert_eq!(manager.color_space(), ColorSpace::Hdr10G2084P2020);
        assert_eq!(control.stats().color_space, Some(ColorSpace::Hdr10G2084P2020));

        // Dragged back onto the SDR output
        surface.set_bounds(window_at(100, 100, 1280, 720));
        assert!(!manager.window_size_changed(1280, 720).unwrap());
        assert_eq!(manager.color_space(), ColorSpace::SrgbG22P709);
    }

    /// Hot-plugging a display makes the instance stale; present refreshes it
    #[test]
    fn test_stale_outputs_refresh_on_present() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) =
            headless_manager(backend, DeviceConfig::new(Format::Rgb10A2Unorm, 2).with_hdr(true), 1280, 720);
        assert_eq!(manager.color_space(), ColorSpace::SrgbG22P709);

        control.set_outputs(vec![HeadlessConfig::hdr_output("HDR", Rect::new(0, 0, 3840, 2160))]);
        let instances = control.stats().instances_created;
        manager.present().unwrap();
        assert_eq!(control.stats().instances_created, instances + 1);
        assert_eq!(manager.color_space(), ColorSpace::Hdr10G2084P2020);
    }

    #[test]
    fn test_depth_buffer_follows_window() {
        let (mut manager, _surface) =
            headless_manager(HeadlessBackend::default(), DeviceConfig::default().with_reverse_depth(true), 800, 600);
        let depth = manager.depth_buffer().unwrap();
        assert_eq!(
            depth.dimension(),
            crate::render::api::ResourceDimension::Texture2D { width: 800, height: 600, format: Format::D32Float }
        );
        assert!(manager.depth_stencil_view().is_some());

        manager.window_size_changed(640, 480).unwrap();
        assert_eq!(
            manager.depth_buffer().unwrap().dimension(),
            crate::render::api::ResourceDimension::Texture2D { width: 640, height: 480, format: Format::D32Float }
        );
    }

    /// The scene target's descriptor slot survives resolution changes
    #[test]
    fn test_intermediate_srv_slot_is_stable() {
        let (mut manager, _surface) = headless_manager(HeadlessBackend::default(), DeviceConfig::default(), 1280, 720);
        let slot = manager.intermediate_srv_slot().unwrap();
        let live = manager.slot_allocator().live_count();

        manager.increase_resolution_index().unwrap();
        manager.decrease_resolution_index().unwrap();
        assert_eq!(manager.intermediate_srv_slot(), Some(slot));
        assert_eq!(manager.slot_allocator().live_count(), live);
    }

    #[test]
    fn test_post_pass_frame_is_valid() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) = headless_manager(backend, DeviceConfig::new(Format::Bgra8Unorm, 3), 1920, 1080);
        manager.decrease_resolution_index().unwrap();

        for _ in 0..5 {
            manager.begin_pass(CommandPass::Scene, None).unwrap();
            manager.record_post_pass().unwrap();
            manager.execute_frame().unwrap();
            manager.present().unwrap();
        }
        manager.wait_for_gpu().unwrap();

        assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
        assert_eq!(control.stats().presents, 5);
        assert_eq!(control.stats().executed_lists, 10);
    }

    /// Rendering straight into the back buffer returns it to PRESENT on submit
    #[test]
    fn test_prepare_without_post_pass() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 640, 480);

        for _ in 0..3 {
            let back_buffer = manager.current_back_buffer().unwrap();
            let list = manager.prepare(None).unwrap();
            list.clear_render_target(back_buffer.as_ref(), [1.0, 0.0, 0.0, 1.0]);
            drop(back_buffer);
            manager.execute_frame().unwrap();
            manager.present().unwrap();
        }
        manager.wait_for_gpu().unwrap();
        assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
    }

    #[test]
    fn test_present_without_swapchain_fails() {
        let mut manager = SwapchainManager::new(Box::new(HeadlessBackend::default()), DeviceConfig::default()).unwrap();
        assert!(manager.present().is_err());
        assert!(manager.wait_for_gpu().is_ok());
    }
}
