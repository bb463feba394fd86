//! Per-frame constant buffers
//!
//! One upload buffer holds a 256-byte aligned copy of the constants for each
//! in-flight frame, so the CPU can write frame K+1 while the GPU still reads
//! frame K. Each copy gets its own CBV in the shader-visible heap.

use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Point3, Vector4};

use crate::render::api::{BufferDesc, GpuResource, GpuVirtualAddress, GraphicsError, GraphicsResult, ViewDesc};
use crate::render::descriptors::{SlotAllocator, SlotId};
use crate::render::device::SwapchainManager;

/// Placement alignment of constant buffer views
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Constants read by the ray generation and hit shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneConstants {
    /// Inverse view-projection, column-major
    pub projection_to_world: [[f32; 4]; 4],
    /// Camera position (xyz, w = 1)
    pub camera_position: [f32; 4],
    /// Point light position (xyz, w = 1)
    pub light_position: [f32; 4],
    /// Ambient light color
    pub light_ambient: [f32; 4],
    /// Diffuse light color
    pub light_diffuse: [f32; 4],
}

impl SceneConstants {
    /// Constants for a camera at `eye` with the given inverse view-projection
    pub fn new(projection_to_world: &Matrix4<f32>, eye: &Point3<f32>, light: &Point3<f32>) -> Self {
        Self {
            projection_to_world: (*projection_to_world).into(),
            camera_position: Vector4::new(eye.x, eye.y, eye.z, 1.0).into(),
            light_position: Vector4::new(light.x, light.y, light.z, 1.0).into(),
            ..Self::default()
        }
    }
}

impl Default for SceneConstants {
    fn default() -> Self {
        Self {
            projection_to_world: Matrix4::<f32>::identity().into(),
            camera_position: [0.0, 1.5, -7.0, 1.0],
            light_position: [0.0, 1.8, -3.0, 0.0],
            light_ambient: [0.2, 0.2, 0.2, 1.0],
            light_diffuse: [0.5, 0.0, 0.0, 1.0],
        }
    }
}

/// `T` replicated once per in-flight frame in an upload buffer
pub struct ConstantBuffer<T: Pod> {
    name: String,
    buffer: Arc<dyn GpuResource>,
    slots: Vec<SlotId>,
    allocator: Arc<SlotAllocator>,
    _marker: PhantomData<T>,
}

impl<T: Pod> ConstantBuffer<T> {
    /// Bytes one frame's copy occupies
    pub const fn aligned_size() -> u64 {
        (std::mem::size_of::<T>() as u64 + CONSTANT_BUFFER_ALIGNMENT - 1) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
    }

    /// Allocate one copy and one CBV slot per back buffer
    pub fn new(manager: &SwapchainManager, name: &str) -> GraphicsResult<Self> {
        let descriptors = manager.descriptors()?;
        let frame_count = manager.back_buffer_count();

        let mut slots = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            match descriptors.allocate() {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    for slot in slots {
                        descriptors.free(slot);
                    }
                    return Err(err);
                }
            }
        }

        let buffer = match Self::create_buffer(manager, name, &slots) {
            Ok(buffer) => buffer,
            Err(err) => {
                for slot in slots {
                    descriptors.free(slot);
                }
                return Err(err);
            }
        };

        log::debug!(
            "Created constant buffer '{}': {} frames of {} bytes",
            name,
            frame_count,
            Self::aligned_size()
        );
        Ok(Self {
            name: name.to_string(),
            buffer,
            slots,
            allocator: Arc::clone(descriptors.slots()),
            _marker: PhantomData,
        })
    }

    fn create_buffer(manager: &SwapchainManager, name: &str, slots: &[SlotId]) -> GraphicsResult<Arc<dyn GpuResource>> {
        let size = Self::aligned_size() * slots.len() as u64;
        let buffer = manager.device()?.create_buffer(&BufferDesc::upload(name, size))?;

        let descriptors = manager.descriptors()?;
        for (frame, slot) in slots.iter().enumerate() {
            descriptors.write_view(
                *slot,
                &ViewDesc::ConstantBuffer {
                    address: buffer.gpu_virtual_address() + Self::aligned_size() * frame as u64,
                    size: Self::aligned_size() as u32,
                },
            )?;
        }
        Ok(buffer)
    }

    /// Recreate the buffer on the current device, keeping the slots
    ///
    /// Call after the manager recovered from device loss.
    pub fn recreate(&mut self, manager: &SwapchainManager) -> GraphicsResult<()> {
        if self.slots.is_empty() {
            return Err(GraphicsError::invalid(format!("constant buffer '{}' was released", self.name)));
        }
        self.buffer = Self::create_buffer(manager, &self.name, &self.slots)?;
        Ok(())
    }

    /// Write `value` into the copy read by `frame`
    ///
    /// The caller must only write the frame whose fence wait has completed.
    pub fn copy_to_gpu(&self, frame: u32, value: &T) -> GraphicsResult<()> {
        self.check_frame(frame)?;
        self.buffer.write_bytes(Self::aligned_size() * u64::from(frame), bytemuck::bytes_of(value))
    }

    /// GPU address of `frame`'s copy
    pub fn gpu_address(&self, frame: u32) -> GraphicsResult<GpuVirtualAddress> {
        self.check_frame(frame)?;
        Ok(self.buffer.gpu_virtual_address() + Self::aligned_size() * u64::from(frame))
    }

    /// Descriptor slot of `frame`'s view
    pub fn slot(&self, frame: u32) -> Option<SlotId> {
        self.slots.get(frame as usize).copied()
    }

    /// Number of frame copies
    pub fn frame_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Backing upload buffer
    pub fn buffer(&self) -> &Arc<dyn GpuResource> {
        &self.buffer
    }

    /// Return the descriptor slots; further writes fail
    pub fn release(&mut self) {
        for slot in self.slots.drain(..) {
            self.allocator.release(slot);
        }
    }

    fn check_frame(&self, frame: u32) -> GraphicsResult<()> {
        if frame as usize >= self.slots.len() {
            return Err(GraphicsError::OutOfRange {
                reason: format!("frame {} of constant buffer '{}' with {} frames", frame, self.name, self.slots.len()),
            });
        }
        Ok(())
    }
}

impl<T: Pod> Drop for ConstantBuffer<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{DeviceConfig, Format};
    use crate::render::backends::headless::{HeadlessBackend, HeadlessDescriptorHeap, HeadlessResource, ViewRecord};
    use crate::render::tests::headless_manager;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    struct Small {
        value: [f32; 3],
        frame: u32,
    }

    /// Just over one 256-byte block
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    struct Oversized {
        block: [u8; 256],
        tail: [u8; 4],
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(ConstantBuffer::<Small>::aligned_size(), 256);
        assert_eq!(ConstantBuffer::<[u8; 256]>::aligned_size(), 256);
        assert_eq!(ConstantBuffer::<Oversized>::aligned_size(), 512);
        assert_eq!(ConstantBuffer::<SceneConstants>::aligned_size(), 256);
    }

    #[test]
    fn test_scene_constants_layout() {
        assert_eq!(std::mem::size_of::<SceneConstants>(), 128);
    }

    /// Each frame writes its own 256-byte slice and owns its own view
    #[test]
    fn test_copy_to_gpu_per_frame() {
        let (manager, _surface) =
            headless_manager(HeadlessBackend::default(), DeviceConfig::new(Format::Bgra8Unorm, 3), 640, 480);
        let constants = ConstantBuffer::<Small>::new(&manager, "Frame constants").unwrap();
        assert_eq!(constants.frame_count(), 3);

        for frame in 0..3 {
            constants.copy_to_gpu(frame, &Small { value: [1.0, 2.0, 3.0], frame }).unwrap();
        }
        assert!(constants.copy_to_gpu(3, &Small { value: [0.0; 3], frame: 3 }).is_err());

        let bytes = constants.buffer().as_any().downcast_ref::<HeadlessResource>().unwrap().read_bytes();
        for frame in 0..3u32 {
            let start = 256 * frame as usize;
            let written: &Small = bytemuck::from_bytes(&bytes[start..start + std::mem::size_of::<Small>()]);
            assert_eq!(written.frame, frame);
        }

        let heap = manager.descriptors().unwrap().heap().as_any().downcast_ref::<HeadlessDescriptorHeap>().unwrap();
        for frame in 0..3 {
            let slot = constants.slot(frame).unwrap();
            assert_eq!(
                heap.view(slot.index()),
                Some(ViewRecord::ConstantBuffer { address: constants.gpu_address(frame).unwrap(), size: 256 })
            );
        }
    }

    #[test]
    fn test_release_returns_slots() {
        let (manager, _surface) =
            headless_manager(HeadlessBackend::default(), DeviceConfig::new(Format::Bgra8Unorm, 2), 640, 480);
        let before = manager.slot_allocator().live_count();

        let mut constants = ConstantBuffer::<SceneConstants>::new(&manager, "Scene constants").unwrap();
        assert_eq!(manager.slot_allocator().live_count(), before + 2);

        constants.release();
        assert_eq!(manager.slot_allocator().live_count(), before);
        assert!(constants.copy_to_gpu(0, &SceneConstants::default()).is_err());
        assert!(constants.recreate(&manager).is_err());

        let constants = ConstantBuffer::<SceneConstants>::new(&manager, "Scene constants").unwrap();
        drop(constants);
        assert_eq!(manager.slot_allocator().live_count(), before);
    }
}
