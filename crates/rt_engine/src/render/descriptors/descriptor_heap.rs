//! Shader-visible descriptor heap paired with the slot allocator

use std::sync::Arc;

use super::slot_allocator::{SlotAllocator, SlotId};
use crate::render::api::{
    CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind, GpuDescriptorHandle,
    GraphicsDevice, GraphicsError, GraphicsResult, ViewDesc,
};

/// CPU handle of `slot` in a heap starting at `start`
pub fn cpu_handle_at(start: CpuDescriptorHandle, slot: u32, descriptor_size: u32) -> CpuDescriptorHandle {
    CpuDescriptorHandle(start.0 + u64::from(slot) * u64::from(descriptor_size))
}

/// GPU handle of `slot` in a heap starting at `start`
pub fn gpu_handle_at(start: GpuDescriptorHandle, slot: u32, descriptor_size: u32) -> GpuDescriptorHandle {
    GpuDescriptorHandle(start.0 + u64::from(slot) * u64::from(descriptor_size))
}

/// The CBV/SRV/UAV heap and the allocator handing out its slots
///
/// The heap is a device object and is recreated after device loss; the
/// allocator outlives it so slot ids held by upper layers stay valid.
pub struct DescriptorHeapAllocator {
    heap: Box<dyn DescriptorHeap>,
    slots: Arc<SlotAllocator>,
}

impl DescriptorHeapAllocator {
    /// Create the shader-visible heap on `device`
    pub fn new(device: &dyn GraphicsDevice, capacity: u32, slots: Arc<SlotAllocator>) -> GraphicsResult<Self> {
        let heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: DescriptorHeapKind::CbvSrvUav,
            capacity,
            shader_visible: true,
        })?;
        log::debug!("Created CBV/SRV/UAV heap with {} descriptors", capacity);
        Ok(Self { heap, slots })
    }

    /// Allocator shared with every consumer of the heap
    pub fn slots(&self) -> &Arc<SlotAllocator> {
        &self.slots
    }

    /// The underlying heap, for binding
    pub fn heap(&self) -> &dyn DescriptorHeap {
        self.heap.as_ref()
    }

    /// Reserve a slot that fits in the heap
    pub fn allocate(&self) -> GraphicsResult<SlotId> {
        let capacity = self.heap.capacity();
        self.slots.acquire_below(capacity).map_err(|err| match err {
            GraphicsError::OutOfRange { .. } => GraphicsError::OutOfRange {
                reason: format!("descriptor heap capacity {} exhausted", capacity),
            },
            other => other,
        })
    }

    /// Return a slot to the allocator
    pub fn free(&self, slot: SlotId) -> bool {
        self.slots.release(slot)
    }

    /// CPU handle of `slot`
    pub fn cpu_handle(&self, slot: SlotId) -> CpuDescriptorHandle {
        cpu_handle_at(self.heap.cpu_start(), slot.index(), self.heap.descriptor_size())
    }

    /// GPU handle of `slot`
    pub fn gpu_handle(&self, slot: SlotId) -> GpuDescriptorHandle {
        // Shader-visible heaps always report a GPU start
        let start = self.heap.gpu_start().unwrap_or_default();
        gpu_handle_at(start, slot.index(), self.heap.descriptor_size())
    }

    /// Write a view into `slot`
    pub fn write_view(&self, slot: SlotId, view: &ViewDesc<'_>) -> GraphicsResult<()> {
        self.heap.write_view(slot.index(), view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessBackend;
    use crate::render::tests::headless_device;

    #[test]
    fn test_handle_arithmetic() {
        let cpu = cpu_handle_at(CpuDescriptorHandle(0x1000), 3, 32);
        assert_eq!(cpu, CpuDescriptorHandle(0x1000 + 96));
        let gpu = gpu_handle_at(GpuDescriptorHandle(0xF000_0000), 0, 32);
        assert_eq!(gpu, GpuDescriptorHandle(0xF000_0000));
    }

    /// A full heap keeps serving slots freed after a failed allocation
    #[test]
    fn test_full_heap_reuses_freed_slot() {
        let (_backend, device) = headless_device(HeadlessBackend::default());
        let heap = DescriptorHeapAllocator::new(device.as_ref(), 2, Arc::new(SlotAllocator::new())).unwrap();

        let first = heap.allocate().unwrap();
        let second = heap.allocate().unwrap();
        assert!(matches!(heap.allocate(), Err(GraphicsError::OutOfRange { .. })));
        assert_eq!(heap.slots().high_water(), 2);

        assert!(heap.free(first));
        assert_eq!(heap.allocate().unwrap(), first);
        assert!(heap.allocate().is_err());

        assert!(heap.free(second));
        assert!(heap.free(first));
        assert_eq!(heap.allocate().unwrap(), second);
        assert_eq!(heap.allocate().unwrap(), first);
    }
}
