//! Buffers, textures and descriptor heaps of the simulated GPU

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::new_key_type;

use crate::render::api::{
    CpuDescriptorHandle, DescriptorHeap, DescriptorHeapDesc, DescriptorHeapKind, GpuDescriptorHandle, GpuResource,
    GpuVirtualAddress, GraphicsError, GraphicsResult, HeapType, ResourceDimension, ResourceFlags, ResourceId,
    ResourceState, ViewDesc,
};

use super::device::DeviceShared;

new_key_type! {
    /// Key of a buffer in the device memory map
    pub(crate) struct BufferKey;
}

/// State shared between a resource handle and GPU work referencing it
pub(crate) struct ResourceInner {
    pub id: ResourceId,
    pub name: String,
    pub dimension: ResourceDimension,
    pub heap: HeapType,
    pub flags: ResourceFlags,
    pub address: GpuVirtualAddress,
    pub bytes: Mutex<Vec<u8>>,
    pub state: Mutex<ResourceState>,
    pub clear_color: Mutex<Option<[f32; 4]>>,
}

/// Committed resource of the headless device
pub struct HeadlessResource {
    pub(crate) inner: Arc<ResourceInner>,
    key: Option<BufferKey>,
    device: Arc<DeviceShared>,
}

impl HeadlessResource {
    pub(crate) fn new(inner: Arc<ResourceInner>, key: Option<BufferKey>, device: Arc<DeviceShared>) -> Self {
        Self { inner, key, device }
    }

    /// Creation flags
    pub fn flags(&self) -> ResourceFlags {
        self.inner.flags
    }

    /// Usage state after all executed GPU work
    pub fn state(&self) -> ResourceState {
        *self.inner.state.lock()
    }

    /// Copy of the buffer contents
    pub fn read_bytes(&self) -> Vec<u8> {
        self.inner.bytes.lock().clone()
    }

    /// Color of the most recent clear or copy into this texture
    pub fn last_clear_color(&self) -> Option<[f32; 4]> {
        *self.inner.clear_color.lock()
    }
}

impl Drop for HeadlessResource {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.device.release_buffer(key, self.inner.address);
        }
    }
}

impl GpuResource for HeadlessResource {
    fn id(&self) -> ResourceId {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn dimension(&self) -> ResourceDimension {
        self.inner.dimension
    }

    fn heap_type(&self) -> HeapType {
        self.inner.heap
    }

    fn gpu_virtual_address(&self) -> GpuVirtualAddress {
        self.inner.address
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        if self.inner.heap != HeapType::Upload {
            return Err(GraphicsError::invalid(format!("'{}' is not CPU writable", self.inner.name)));
        }
        let mut bytes = self.inner.bytes.lock();
        let start = usize::try_from(offset).map_err(|_| out_of_bounds(&self.inner.name, offset, data.len()))?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| out_of_bounds(&self.inner.name, offset, data.len()))?;
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn out_of_bounds(name: &str, offset: u64, len: usize) -> GraphicsError {
    GraphicsError::OutOfRange { reason: format!("write of {} bytes at {} exceeds '{}'", len, offset, name) }
}

/// View recorded in a headless descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRecord {
    /// Render target view
    RenderTarget(ResourceId),
    /// Depth stencil view
    DepthStencil(ResourceId),
    /// Shader resource view
    ShaderResource(ResourceId),
    /// Unordered access view
    UnorderedAccess(ResourceId),
    /// Constant buffer view
    ConstantBuffer {
        /// Start address
        address: GpuVirtualAddress,
        /// Size in bytes
        size: u32,
    },
    /// Acceleration structure view
    AccelerationStructure(GpuVirtualAddress),
}

/// Descriptor heap of the headless device
pub struct HeadlessDescriptorHeap {
    desc: DescriptorHeapDesc,
    cpu_start: u64,
    gpu_start: Option<u64>,
    views: Mutex<Vec<Option<ViewRecord>>>,
}

impl HeadlessDescriptorHeap {
    /// Distance between descriptors of every heap kind
    pub const DESCRIPTOR_SIZE: u32 = 32;

    pub(crate) fn new(desc: DescriptorHeapDesc, cpu_start: u64, gpu_start: Option<u64>) -> Self {
        Self { desc, cpu_start, gpu_start, views: Mutex::new(vec![None; desc.capacity as usize]) }
    }

    /// View written into `slot`
    pub fn view(&self, slot: u32) -> Option<ViewRecord> {
        self.views.lock().get(slot as usize).copied().flatten()
    }

    /// Number of slots holding a view
    pub fn written_count(&self) -> usize {
        self.views.lock().iter().filter(|view| view.is_some()).count()
    }
}

impl DescriptorHeap for HeadlessDescriptorHeap {
    fn kind(&self) -> DescriptorHeapKind {
        self.desc.kind
    }

    fn capacity(&self) -> u32 {
        self.desc.capacity
    }

    fn descriptor_size(&self) -> u32 {
        Self::DESCRIPTOR_SIZE
    }

    fn cpu_start(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.cpu_start)
    }

    fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.gpu_start.map(GpuDescriptorHandle)
    }

    fn write_view(&self, slot: u32, view: &ViewDesc<'_>) -> GraphicsResult<()> {
        if slot >= self.desc.capacity {
            return Err(GraphicsError::OutOfRange {
                reason: format!("descriptor slot {} in a heap of {}", slot, self.desc.capacity),
            });
        }

        let record = match (self.desc.kind, view) {
            (DescriptorHeapKind::RenderTarget, ViewDesc::RenderTarget(resource)) => {
                require_flag(*resource, ResourceFlags::ALLOW_RENDER_TARGET)?;
                ViewRecord::RenderTarget(resource.id())
            }
            (DescriptorHeapKind::DepthStencil, ViewDesc::DepthStencil(resource)) => {
                require_flag(*resource, ResourceFlags::ALLOW_DEPTH_STENCIL)?;
                ViewRecord::DepthStencil(resource.id())
            }
            (DescriptorHeapKind::CbvSrvUav, ViewDesc::ShaderResource(resource)) => {
                ViewRecord::ShaderResource(resource.id())
            }
            (DescriptorHeapKind::CbvSrvUav, ViewDesc::UnorderedAccess(resource)) => {
                require_flag(*resource, ResourceFlags::ALLOW_UNORDERED_ACCESS)?;
                ViewRecord::UnorderedAccess(resource.id())
            }
            (DescriptorHeapKind::CbvSrvUav, ViewDesc::ConstantBuffer { address, size }) => {
                if size % 256 != 0 {
                    return Err(GraphicsError::invalid(format!(
                        "constant buffer view size {} is not 256-aligned",
                        size
                    )));
                }
                ViewRecord::ConstantBuffer { address: *address, size: *size }
            }
            (DescriptorHeapKind::CbvSrvUav, ViewDesc::AccelerationStructure(resource)) => {
                require_flag(*resource, ResourceFlags::ACCELERATION_STRUCTURE)?;
                ViewRecord::AccelerationStructure(resource.gpu_virtual_address())
            }
            (kind, _) => {
                return Err(GraphicsError::invalid(format!("view type not valid in a {:?} heap", kind)));
            }
        };

        self.views.lock()[slot as usize] = Some(record);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn require_flag(resource: &dyn GpuResource, flag: ResourceFlags) -> GraphicsResult<()> {
    let flags = resource
        .as_any()
        .downcast_ref::<HeadlessResource>()
        .map(HeadlessResource::flags)
        .ok_or_else(|| GraphicsError::invalid(format!("'{}' belongs to another backend", resource.name())))?;
    if flags.contains(flag) {
        Ok(())
    } else {
        Err(GraphicsError::invalid(format!("'{}' was not created with {:?}", resource.name(), flag)))
    }
}
