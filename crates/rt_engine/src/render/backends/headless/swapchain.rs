//! Flip-model swapchain and window surface of the headless backend

use std::any::Any;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::render::api::{
    ColorSpace, Format, GpuResource, GraphicsError, GraphicsResult, OutputSurface, Rect, ResourceFlags,
    ResourceState, Swapchain, SwapchainDesc, TextureDesc,
};

use super::device::DeviceShared;
use super::queue::QueueItem;
use super::resources::HeadlessResource;
use super::PresentRecord;

const MAX_BUFFER_COUNT: u32 = 16;

/// Window stand-in whose bounds tests can move around
#[derive(Clone)]
pub struct HeadlessSurface {
    bounds: Arc<Mutex<Rect>>,
}

impl HeadlessSurface {
    /// Window covering `bounds` in desktop coordinates
    pub fn new(bounds: Rect) -> Self {
        Self { bounds: Arc::new(Mutex::new(bounds)) }
    }

    /// Move or resize the window
    pub fn set_bounds(&self, bounds: Rect) {
        *self.bounds.lock() = bounds;
    }
}

impl OutputSurface for HeadlessSurface {
    fn window_bounds(&self) -> GraphicsResult<Rect> {
        Ok(*self.bounds.lock())
    }
}

/// Swapchain of the headless backend
pub struct HeadlessSwapchain {
    desc: SwapchainDesc,
    device: Arc<DeviceShared>,
    sender: Sender<QueueItem>,
    back_buffers: Vec<Arc<HeadlessResource>>,
    current: u32,
    color_space: ColorSpace,
    supported_color_spaces: Vec<ColorSpace>,
}

impl HeadlessSwapchain {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        sender: Sender<QueueItem>,
        desc: SwapchainDesc,
        supported_color_spaces: Vec<ColorSpace>,
    ) -> GraphicsResult<Self> {
        validate(&desc)?;
        let back_buffers = create_back_buffers(&device, &desc)?;
        device.control.update_stats(|stats| stats.swapchains_created += 1);
        log::debug!(
            "Created headless swapchain {}x{} {:?} x{}",
            desc.width,
            desc.height,
            desc.format,
            desc.buffer_count
        );
        Ok(Self {
            desc,
            device,
            sender,
            back_buffers,
            current: 0,
            color_space: ColorSpace::SrgbG22P709,
            supported_color_spaces,
        })
    }

    /// Color space currently applied
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    fn check_device(&self) -> GraphicsResult<()> {
        if let Some(reason) = self.device.control.take_pending_removal() {
            self.device.mark_removed(reason);
        }
        self.device.check_live()
    }
}

fn validate(desc: &SwapchainDesc) -> GraphicsResult<()> {
    if !(2..=MAX_BUFFER_COUNT).contains(&desc.buffer_count) {
        return Err(GraphicsError::OutOfRange {
            reason: format!("flip-model swapchains need 2..={} buffers, got {}", MAX_BUFFER_COUNT, desc.buffer_count),
        });
    }
    if desc.width == 0 || desc.height == 0 {
        return Err(GraphicsError::OutOfRange { reason: format!("swapchain size {}x{}", desc.width, desc.height) });
    }
    match desc.format {
        Format::Bgra8Unorm | Format::Rgba8Unorm | Format::Rgb10A2Unorm | Format::Rgba16Float => Ok(()),
        other => Err(GraphicsError::Unsupported { feature: format!("swapchain format {:?}", other) }),
    }
}

fn create_back_buffers(device: &Arc<DeviceShared>, desc: &SwapchainDesc) -> GraphicsResult<Vec<Arc<HeadlessResource>>> {
    (0..desc.buffer_count)
        .map(|index| {
            let texture = device.new_texture(&TextureDesc {
                name: format!("Back buffer {}", index),
                width: desc.width,
                height: desc.height,
                format: desc.format,
                flags: ResourceFlags::ALLOW_RENDER_TARGET,
                initial_state: ResourceState::Present,
                clear_color: None,
                clear_depth: None,
            })?;
            Ok(Arc::new(texture))
        })
        .collect()
}

impl Swapchain for HeadlessSwapchain {
    fn desc(&self) -> &SwapchainDesc {
        &self.desc
    }

    fn resize_buffers(&mut self, buffer_count: u32, width: u32, height: u32, format: Format) -> GraphicsResult<()> {
        self.check_device()?;
        if let Some(index) = self.back_buffers.iter().position(|buffer| Arc::strong_count(buffer) > 1) {
            return Err(GraphicsError::invalid(format!(
                "back buffer {} is still referenced while resizing",
                index
            )));
        }

        let mut desc = self.desc;
        if buffer_count != 0 {
            desc.buffer_count = buffer_count;
        }
        if format != Format::Unknown {
            desc.format = format;
        }
        desc.width = width;
        desc.height = height;
        validate(&desc)?;

        self.back_buffers = create_back_buffers(&self.device, &desc)?;
        self.desc = desc;
        self.current = 0;
        self.device.control.update_stats(|stats| stats.swapchain_resizes += 1);
        log::debug!("Resized headless swapchain to {}x{}", width, height);
        Ok(())
    }

    fn present(&mut self, sync_interval: u32, allow_tearing: bool) -> GraphicsResult<()> {
        self.check_device()?;
        if allow_tearing && (!self.desc.allow_tearing || sync_interval != 0) {
            return Err(GraphicsError::invalid("tearing present needs a tearing swapchain and sync interval 0"));
        }

        let record = PresentRecord { sync_interval, allow_tearing, buffer_index: self.current };
        let back_buffer = Arc::downgrade(&self.back_buffers[self.current as usize].inner);
        self.sender
            .send(QueueItem::Present { back_buffer, record })
            .map_err(|_| GraphicsError::Api { call: "present", code: "queue worker stopped".to_string() })?;

        self.current = (self.current + 1) % self.desc.buffer_count;
        self.device.control.update_stats(|stats| {
            stats.presents += 1;
            stats.last_present = Some(record);
        });
        Ok(())
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.current
    }

    fn back_buffer(&self, index: u32) -> GraphicsResult<Arc<dyn GpuResource>> {
        self.back_buffers
            .get(index as usize)
            .map(|buffer| Arc::clone(buffer) as Arc<dyn GpuResource>)
            .ok_or_else(|| GraphicsError::OutOfRange {
                reason: format!("back buffer {} of {}", index, self.back_buffers.len()),
            })
    }

    fn check_color_space_support(&self, color_space: ColorSpace) -> GraphicsResult<bool> {
        let format_matches = match color_space {
            ColorSpace::SrgbG22P709 => true,
            ColorSpace::Hdr10G2084P2020 => self.desc.format == Format::Rgb10A2Unorm,
            ColorSpace::LinearG10P709 => self.desc.format == Format::Rgba16Float,
        };
        Ok(format_matches && self.supported_color_spaces.contains(&color_space))
    }

    fn set_color_space(&mut self, color_space: ColorSpace) -> GraphicsResult<()> {
        if !self.check_color_space_support(color_space)? {
            return Err(GraphicsError::Unsupported { feature: format!("color space {:?}", color_space) });
        }
        self.color_space = color_space;
        self.device.control.update_stats(|stats| stats.color_space = Some(color_space));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
