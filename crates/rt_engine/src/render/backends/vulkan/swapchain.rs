//! Window surface swapchain

use std::any::Any;
use std::sync::Arc;

use ash::vk;

use crate::render::api::{ColorSpace, Format, GpuResource, GraphicsError, GraphicsResult, Swapchain, SwapchainDesc};

use super::conv;
use super::device::DeviceShared;
use super::resources::VulkanResource;

const MAX_BUFFER_COUNT: u32 = 16;

/// Swapchain of the Vulkan backend
///
/// The next image is acquired right after each present with a fence, so the
/// current back buffer index is always known to the caller.
pub struct VulkanSwapchain {
    device: Arc<DeviceShared>,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    desc: SwapchainDesc,
    color_space: ColorSpace,
    back_buffers: Vec<Arc<VulkanResource>>,
    present_semaphores: Vec<vk::Semaphore>,
    acquire_fence: vk::Fence,
    current: u32,
}

impl VulkanSwapchain {
    /// Take ownership of `surface` and create the swapchain on it
    pub(crate) fn new(device: Arc<DeviceShared>, surface: vk::SurfaceKHR, desc: SwapchainDesc) -> GraphicsResult<Self> {
        let mut swapchain = Self {
            device,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            desc,
            color_space: ColorSpace::SrgbG22P709,
            back_buffers: Vec::new(),
            present_semaphores: Vec::new(),
            acquire_fence: vk::Fence::null(),
            current: 0,
        };
        let fence = unsafe { swapchain.device.device.create_fence(&vk::FenceCreateInfo::default(), None) };
        swapchain.acquire_fence = swapchain.device.check("vkCreateFence", fence)?;
        swapchain.recreate(desc, ColorSpace::SrgbG22P709)?;
        log::debug!(
            "Created Vulkan swapchain {}x{} {:?} x{}",
            desc.width,
            desc.height,
            desc.format,
            swapchain.back_buffers.len()
        );
        Ok(swapchain)
    }

    /// Color space currently applied
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    fn surface_formats(&self) -> GraphicsResult<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.device
                .instance
                .surface_loader
                .get_physical_device_surface_formats(self.device.physical_device, self.surface)
        };
        self.device.check("vkGetPhysicalDeviceSurfaceFormatsKHR", formats)
    }

    fn present_mode(&self, allow_tearing: bool) -> GraphicsResult<vk::PresentModeKHR> {
        let modes = unsafe {
            self.device
                .instance
                .surface_loader
                .get_physical_device_surface_present_modes(self.device.physical_device, self.surface)
        };
        let modes = self.device.check("vkGetPhysicalDeviceSurfacePresentModesKHR", modes)?;
        Ok(if allow_tearing && modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
            vk::PresentModeKHR::IMMEDIATE
        } else {
            vk::PresentModeKHR::FIFO
        })
    }

    fn ensure_unreferenced(&self, action: &str) -> GraphicsResult<()> {
        match self.back_buffers.iter().position(|buffer| Arc::strong_count(buffer) > 1) {
            Some(index) => {
                Err(GraphicsError::invalid(format!("back buffer {} is still referenced while {}", index, action)))
            }
            None => Ok(()),
        }
    }

    /// Replace the swapchain, its images and semaphores
    fn recreate(&mut self, desc: SwapchainDesc, color_space: ColorSpace) -> GraphicsResult<()> {
        validate(&desc)?;
        let device = Arc::clone(&self.device);
        let surface_loader = &device.instance.surface_loader;
        let physical = device.physical_device;

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(physical, device.queue_family, self.surface)
        };
        if !device.check("vkGetPhysicalDeviceSurfaceSupportKHR", supported)? {
            return Err(GraphicsError::Unsupported { feature: "presenting from the graphics queue".to_string() });
        }
        let capabilities = unsafe { surface_loader.get_physical_device_surface_capabilities(physical, self.surface) };
        let capabilities = device.check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", capabilities)?;

        let surface_format = vk::SurfaceFormatKHR {
            format: conv::format(desc.format),
            color_space: conv::color_space(color_space),
        };
        if !has_format(&self.surface_formats()?, surface_format) {
            return Err(GraphicsError::Unsupported {
                feature: format!("surface format {:?} in {:?}", desc.format, color_space),
            });
        }

        let mut image_count = desc.buffer_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }
        let extent = vk::Extent2D {
            width: desc.width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: desc.height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        };
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode(desc.allow_tearing)?)
            .clipped(true)
            .old_swapchain(self.swapchain);
        let created = unsafe { device.swapchain_loader.create_swapchain(&info, None) };
        let swapchain = device.check("vkCreateSwapchainKHR", created)?;

        self.release_images();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { device.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { device.swapchain_loader.get_swapchain_images(swapchain) };
        let images = device.check("vkGetSwapchainImagesKHR", images)?;
        self.back_buffers = images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                Arc::new(VulkanResource::swapchain_image(
                    &device,
                    *image,
                    index as u32,
                    extent.width,
                    extent.height,
                    desc.format,
                ))
            })
            .collect();
        for _ in &images {
            let semaphore = unsafe { device.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) };
            self.present_semaphores.push(device.check("vkCreateSemaphore", semaphore)?);
        }

        self.desc = SwapchainDesc {
            width: extent.width,
            height: extent.height,
            buffer_count: images.len() as u32,
            ..desc
        };
        self.color_space = color_space;
        self.current = 0;
        self.acquire()
    }

    fn release_images(&mut self) {
        self.back_buffers.clear();
        for semaphore in self.present_semaphores.drain(..) {
            unsafe { self.device.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn acquire(&mut self) -> GraphicsResult<()> {
        let device = &self.device;
        device.check("vkResetFences", unsafe { device.device.reset_fences(&[self.acquire_fence]) })?;
        let acquired = unsafe {
            device.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                vk::Semaphore::null(),
                self.acquire_fence,
            )
        };
        match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal for the surface");
                }
                let waited = unsafe { device.device.wait_for_fences(&[self.acquire_fence], true, u64::MAX) };
                device.check("vkWaitForFences", waited)?;
                self.current = index;
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain is out of date; waiting for a resize");
                Ok(())
            }
            Err(err) => device.check("vkAcquireNextImageKHR", Err(err)),
        }
    }
}

fn has_format(formats: &[vk::SurfaceFormatKHR], wanted: vk::SurfaceFormatKHR) -> bool {
    formats.iter().any(|format| format.format == wanted.format && format.color_space == wanted.color_space)
}

fn validate(desc: &SwapchainDesc) -> GraphicsResult<()> {
    if !(2..=MAX_BUFFER_COUNT).contains(&desc.buffer_count) {
        return Err(GraphicsError::OutOfRange {
            reason: format!("swapchains need 2..={} buffers, got {}", MAX_BUFFER_COUNT, desc.buffer_count),
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

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        self.release_images();
        unsafe {
            if self.acquire_fence != vk::Fence::null() {
                self.device.device.destroy_fence(self.acquire_fence, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.device.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.device.instance.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

impl Swapchain for VulkanSwapchain {
    fn desc(&self) -> &SwapchainDesc {
        &self.desc
    }

    fn resize_buffers(&mut self, buffer_count: u32, width: u32, height: u32, format: Format) -> GraphicsResult<()> {
        self.ensure_unreferenced("resizing")?;
        let mut desc = self.desc;
        if buffer_count != 0 {
            desc.buffer_count = buffer_count;
        }
        if format != Format::Unknown {
            desc.format = format;
        }
        desc.width = width;
        desc.height = height;
        self.recreate(desc, self.color_space)?;
        log::debug!("Resized Vulkan swapchain to {}x{}", self.desc.width, self.desc.height);
        Ok(())
    }

    fn present(&mut self, sync_interval: u32, allow_tearing: bool) -> GraphicsResult<()> {
        if allow_tearing && (!self.desc.allow_tearing || sync_interval != 0) {
            return Err(GraphicsError::invalid("tearing present needs a tearing swapchain and sync interval 0"));
        }
        let index = self.current;
        let semaphore = self
            .present_semaphores
            .get(index as usize)
            .copied()
            .ok_or_else(|| GraphicsError::invalid("present without an acquired back buffer"))?;

        let presented = {
            let queue = self.device.queue();
            let signal = [semaphore];
            let submit = vk::SubmitInfo::builder().signal_semaphores(&signal);
            let submitted = unsafe { self.device.device.queue_submit(*queue, &[submit.build()], vk::Fence::null()) };
            self.device.check("vkQueueSubmit", submitted)?;

            let swapchains = [self.swapchain];
            let indices = [index];
            let info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&signal)
                .swapchains(&swapchains)
                .image_indices(&indices);
            unsafe { self.device.swapchain_loader.queue_present(*queue, &info) }
        };
        match presented {
            Ok(_) => {}
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain went out of date during present");
                return Ok(());
            }
            Err(err) => return self.device.check("vkQueuePresentKHR", Err(err)),
        }
        self.acquire()
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
        if !format_matches || (color_space != ColorSpace::SrgbG22P709 && !self.device.instance.swapchain_colorspace) {
            return Ok(false);
        }
        let wanted = vk::SurfaceFormatKHR {
            format: conv::format(self.desc.format),
            color_space: conv::color_space(color_space),
        };
        Ok(has_format(&self.surface_formats()?, wanted))
    }

    fn set_color_space(&mut self, color_space: ColorSpace) -> GraphicsResult<()> {
        if !self.check_color_space_support(color_space)? {
            return Err(GraphicsError::Unsupported { feature: format!("color space {:?}", color_space) });
        }
        if color_space == self.color_space {
            return Ok(());
        }
        self.ensure_unreferenced("changing the color space")?;
        self.recreate(self.desc, color_space)?;
        log::info!("Swapchain color space set to {:?}", color_space);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(buffer_count: u32, format: Format) -> SwapchainDesc {
        SwapchainDesc { width: 640, height: 480, format, buffer_count, allow_tearing: false }
    }

    #[test]
    fn test_validate() {
        assert!(validate(&desc(2, Format::Bgra8Unorm)).is_ok());
        assert!(matches!(validate(&desc(1, Format::Bgra8Unorm)), Err(GraphicsError::OutOfRange { .. })));
        assert!(matches!(validate(&desc(3, Format::Bgra8UnormSrgb)), Err(GraphicsError::Unsupported { .. })));
    }

    #[test]
    fn test_surface_format_match() {
        let srgb =
            vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_UNORM, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR };
        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        };
        assert!(has_format(&[srgb], srgb));
        assert!(!has_format(&[srgb], hdr));
    }
}
