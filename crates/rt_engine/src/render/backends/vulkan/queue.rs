//! Queue submission and timeline fences

use std::any::Any;
use std::sync::Arc;

use ash::vk;

use crate::render::api::{CommandList, CommandQueue, GpuFence, GraphicsError, GraphicsResult};

use super::command_list::VulkanCommandList;
use super::device::DeviceShared;

/// Fence backed by a timeline semaphore
pub struct VulkanFence {
    device: Arc<DeviceShared>,
    semaphore: vk::Semaphore,
}

impl VulkanFence {
    pub(crate) fn new(device: Arc<DeviceShared>, initial_value: u64) -> GraphicsResult<Self> {
        let mut timeline = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline);
        let semaphore = device.check("vkCreateSemaphore", unsafe { device.device.create_semaphore(&info, None) })?;
        Ok(Self { device, semaphore })
    }

    /// Raw timeline semaphore
    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

impl GpuFence for VulkanFence {
    fn completed_value(&self) -> u64 {
        // A lost device never completes anything again; report everything done
        // so waiters fall through to the device loss check
        let result = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) };
        self.device.check("vkGetSemaphoreCounterValue", result).unwrap_or(u64::MAX)
    }

    fn wait_for_value(&self, value: u64) -> GraphicsResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);
        self.device.check("vkWaitSemaphores", unsafe { self.device.device.wait_semaphores(&info, u64::MAX) })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The device's queue
pub struct VulkanQueue {
    device: Arc<DeviceShared>,
}

impl VulkanQueue {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Self {
        Self { device }
    }
}

impl CommandQueue for VulkanQueue {
    fn execute_command_lists(&self, lists: &[&dyn CommandList]) -> GraphicsResult<()> {
        let buffers = lists
            .iter()
            .map(|list| {
                let vulkan = list
                    .as_any()
                    .downcast_ref::<VulkanCommandList>()
                    .ok_or_else(|| GraphicsError::invalid(format!("'{}' belongs to another backend", list.name())))?;
                if vulkan.is_recording() {
                    return Err(GraphicsError::invalid(format!("'{}' executed while recording", list.name())));
                }
                Ok(vulkan.raw())
            })
            .collect::<GraphicsResult<Vec<_>>>()?;

        let submit = vk::SubmitInfo::builder().command_buffers(&buffers);
        let queue = self.device.queue();
        let result = unsafe { self.device.device.queue_submit(*queue, &[submit.build()], vk::Fence::null()) };
        self.device.check("vkQueueSubmit", result)
    }

    fn signal(&self, fence: &dyn GpuFence, value: u64) -> GraphicsResult<()> {
        let fence = fence
            .as_any()
            .downcast_ref::<VulkanFence>()
            .ok_or_else(|| GraphicsError::invalid("fence belongs to another backend"))?;
        let semaphores = [fence.raw()];
        let values = [value];
        let mut timeline = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder().signal_semaphores(&semaphores).push_next(&mut timeline);
        let queue = self.device.queue();
        let result = unsafe { self.device.device.queue_submit(*queue, &[submit.build()], vk::Fence::null()) };
        self.device.check("vkQueueSubmit", result)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
