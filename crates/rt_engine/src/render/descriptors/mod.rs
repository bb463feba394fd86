//! Descriptor slot allocation

pub mod descriptor_heap;
pub mod slot_allocator;

pub use descriptor_heap::{cpu_handle_at, gpu_handle_at, DescriptorHeapAllocator};
pub use slot_allocator::{SlotAllocator, SlotId};
