//! Logical device of the simulated GPU

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::render::api::{
    align_up, AccelerationStructureInputs, AdapterInfo, BufferDesc, CommandList, CommandQueue, DescriptorHeap,
    DescriptorHeapDesc, DescriptorHeapKind, FeatureLevel, GpuFence, GpuResource, GpuVirtualAddress,
    GraphicsDevice, GraphicsError, GraphicsResult, HeapType, PrebuildInfo, RayTracingPipeline, ResourceDimension,
    ResourceFlags, ResourceId, ResourceState, ShaderTableProperties, TextureDesc,
};
use crate::render::raytracing::pipeline::RayTracingPipelineDesc;

use super::acceleration::{self, BuiltStructure, Ray, RayHit};
use super::command_list::HeadlessCommandList;
use super::pipeline::HeadlessPipeline;
use super::queue::{FenceState, HeadlessFence, HeadlessQueue};
use super::resources::{BufferKey, HeadlessDescriptorHeap, HeadlessResource, ResourceInner};
use super::HeadlessControl;

/// Buffer placement granularity
const BUFFER_ALIGNMENT: u64 = 64 * 1024;

struct MemoryMap {
    buffers: SlotMap<BufferKey, Weak<ResourceInner>>,
    by_address: BTreeMap<GpuVirtualAddress, BufferKey>,
    next_address: GpuVirtualAddress,
}

/// Device state shared with queues, lists and resources
pub(crate) struct DeviceShared {
    pub serial: u64,
    pub control: HeadlessControl,
    pub adapter: AdapterInfo,
    pub feature_level: FeatureLevel,
    pub shader_table_properties: ShaderTableProperties,
    next_object_id: AtomicU64,
    memory: Mutex<MemoryMap>,
    structures: Mutex<HashMap<GpuVirtualAddress, Arc<BuiltStructure>>>,
    removed: Mutex<Option<String>>,
    fences: Mutex<Vec<Weak<FenceState>>>,
}

impl DeviceShared {
    fn new(serial: u64, control: HeadlessControl, adapter: AdapterInfo, feature_level: FeatureLevel) -> Self {
        let shader_table_properties = control.config().shader_table_properties;
        Self {
            serial,
            control,
            adapter,
            feature_level,
            shader_table_properties,
            next_object_id: AtomicU64::new(1),
            memory: Mutex::new(MemoryMap {
                buffers: SlotMap::with_key(),
                by_address: BTreeMap::new(),
                next_address: (serial << 40) | BUFFER_ALIGNMENT,
            }),
            structures: Mutex::new(HashMap::new()),
            removed: Mutex::new(None),
            fences: Mutex::new(Vec::new()),
        }
    }

    pub fn next_object_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.lock().is_some()
    }

    pub fn removed_reason(&self) -> Option<String> {
        self.removed.lock().clone()
    }

    pub fn check_live(&self) -> GraphicsResult<()> {
        match self.removed_reason() {
            Some(reason) => Err(GraphicsError::DeviceRemoved { reason }),
            None => Ok(()),
        }
    }

    /// Put the device into the removed state; every fence completes
    pub fn mark_removed(&self, reason: String) {
        {
            let mut removed = self.removed.lock();
            if removed.is_some() {
                return;
            }
            log::error!("Headless device {} removed: {}", self.serial, reason);
            *removed = Some(reason);
        }
        for fence in self.fences.lock().drain(..) {
            if let Some(fence) = fence.upgrade() {
                fence.complete(u64::MAX);
            }
        }
    }

    pub fn register_fence(&self, fence: &Arc<FenceState>) {
        let mut fences = self.fences.lock();
        fences.retain(|fence| fence.strong_count() > 0);
        fences.push(Arc::downgrade(fence));
    }

    pub fn new_buffer(self: &Arc<Self>, desc: &BufferDesc) -> GraphicsResult<HeadlessResource> {
        self.check_live()?;
        if desc.size == 0 {
            return Err(GraphicsError::OutOfRange { reason: format!("buffer '{}' has zero size", desc.name) });
        }
        if desc.flags.contains(ResourceFlags::ACCELERATION_STRUCTURE)
            && (desc.heap != HeapType::Default || desc.initial_state != ResourceState::AccelerationStructure)
        {
            return Err(GraphicsError::invalid(format!(
                "acceleration structure buffer '{}' must live in the default heap in the acceleration structure state",
                desc.name
            )));
        }
        if desc.heap == HeapType::Upload && desc.initial_state != ResourceState::GenericRead {
            return Err(GraphicsError::invalid(format!("upload buffer '{}' must start in GenericRead", desc.name)));
        }
        let size = usize::try_from(desc.size).map_err(|_| GraphicsError::OutOfMemory { requested: desc.size })?;

        let mut memory = self.memory.lock();
        let address = memory.next_address;
        memory.next_address = align_up(address + desc.size, BUFFER_ALIGNMENT);

        let inner = Arc::new(ResourceInner {
            id: ResourceId(self.next_object_id()),
            name: desc.name.clone(),
            dimension: ResourceDimension::Buffer { size: desc.size },
            heap: desc.heap,
            flags: desc.flags,
            address,
            bytes: Mutex::new(vec![0; size]),
            state: Mutex::new(desc.initial_state),
            clear_color: Mutex::new(None),
        });
        let key = memory.buffers.insert(Arc::downgrade(&inner));
        memory.by_address.insert(address, key);
        drop(memory);

        log::trace!("Created buffer '{}' ({} bytes) at {:#x}", desc.name, desc.size, address);
        Ok(HeadlessResource::new(inner, Some(key), Arc::clone(self)))
    }

    pub fn new_texture(self: &Arc<Self>, desc: &TextureDesc) -> GraphicsResult<HeadlessResource> {
        self.check_live()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::OutOfRange {
                reason: format!("texture '{}' is {}x{}", desc.name, desc.width, desc.height),
            });
        }
        if desc.format.is_depth() != desc.flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
            return Err(GraphicsError::invalid(format!(
                "texture '{}' format {:?} does not match its depth-stencil flag",
                desc.name, desc.format
            )));
        }

        let inner = Arc::new(ResourceInner {
            id: ResourceId(self.next_object_id()),
            name: desc.name.clone(),
            dimension: ResourceDimension::Texture2D { width: desc.width, height: desc.height, format: desc.format },
            heap: HeapType::Default,
            flags: desc.flags,
            address: 0,
            bytes: Mutex::new(Vec::new()),
            state: Mutex::new(desc.initial_state),
            clear_color: Mutex::new(None),
        });
        Ok(HeadlessResource::new(inner, None, Arc::clone(self)))
    }

    pub fn release_buffer(&self, key: BufferKey, address: GpuVirtualAddress) {
        let mut memory = self.memory.lock();
        memory.buffers.remove(key);
        memory.by_address.remove(&address);
        drop(memory);
        self.structures.lock().remove(&address);
    }

    /// Buffer containing `address` and the offset into it
    pub fn resolve(&self, address: GpuVirtualAddress) -> Option<(Arc<ResourceInner>, u64)> {
        let memory = self.memory.lock();
        let (&base, &key) = memory.by_address.range(..=address).next_back()?;
        let inner = memory.buffers.get(key)?.upgrade()?;
        let offset = address - base;
        match inner.dimension {
            ResourceDimension::Buffer { size } if offset < size => Some((inner, offset)),
            _ => None,
        }
    }

    /// Copy `len` bytes starting at `address`; `None` when the range is not inside one live buffer
    pub fn read_memory(&self, address: GpuVirtualAddress, len: u64) -> Option<Vec<u8>> {
        let (inner, offset) = self.resolve(address)?;
        let bytes = inner.bytes.lock();
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        bytes.get(start..end).map(<[u8]>::to_vec)
    }

    pub fn structure(&self, address: GpuVirtualAddress) -> Option<Arc<BuiltStructure>> {
        self.structures.lock().get(&address).cloned()
    }

    pub fn store_structure(&self, address: GpuVirtualAddress, structure: BuiltStructure) {
        self.structures.lock().insert(address, Arc::new(structure));
    }

    pub fn live_buffer_count(&self) -> usize {
        self.memory.lock().buffers.len()
    }
}

/// Device of the headless backend
pub struct HeadlessDevice {
    shared: Arc<DeviceShared>,
}

impl HeadlessDevice {
    pub(crate) fn create(control: HeadlessControl, adapter: AdapterInfo, feature_level: FeatureLevel) -> Self {
        let serial = control.next_device_serial();
        let shared = Arc::new(DeviceShared::new(serial, control.clone(), adapter, feature_level));
        control.set_current_device(&shared);
        control.update_stats(|stats| stats.devices_created += 1);
        log::debug!("Created headless device {} on '{}' at {:?}", serial, shared.adapter.name, feature_level);
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Creation serial, unique per backend
    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    /// Feature level the device was created at
    pub fn feature_level(&self) -> FeatureLevel {
        self.shared.feature_level
    }

    /// Buffers currently alive on this device
    pub fn live_buffer_count(&self) -> usize {
        self.shared.live_buffer_count()
    }

    /// Intersect `ray` with the top-level structure most recently built into `tlas`
    ///
    /// Reflects GPU work that has finished executing, so callers wait for
    /// the queue first.
    pub fn trace_ray(&self, tlas: &dyn GpuResource, ray: &Ray) -> GraphicsResult<Option<RayHit>> {
        let structure = self
            .shared
            .structure(tlas.gpu_virtual_address())
            .ok_or(GraphicsError::ResourceNotFound { id: tlas.id().0 })?;
        acceleration::trace(&structure, ray)
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn adapter(&self) -> &AdapterInfo {
        &self.shared.adapter
    }

    fn max_supported_feature_level(&self, candidates: &[FeatureLevel]) -> GraphicsResult<FeatureLevel> {
        candidates
            .iter()
            .copied()
            .filter(|level| *level <= self.shared.adapter.max_feature_level)
            .max()
            .ok_or_else(|| GraphicsError::Unsupported {
                feature: format!("any of the feature levels {:?}", candidates),
            })
    }

    fn create_command_queue(&self) -> GraphicsResult<Box<dyn CommandQueue>> {
        self.shared.check_live()?;
        let latency = self.shared.control.config().gpu_latency;
        Ok(Box::new(HeadlessQueue::new(Arc::clone(&self.shared), latency)?))
    }

    fn create_fence(&self, initial_value: u64) -> GraphicsResult<Box<dyn GpuFence>> {
        self.shared.check_live()?;
        Ok(Box::new(HeadlessFence::new(&self.shared, initial_value)))
    }

    fn create_command_list(&self, name: &str) -> GraphicsResult<Box<dyn CommandList>> {
        self.shared.check_live()?;
        Ok(Box::new(HeadlessCommandList::new(name, Arc::clone(&self.shared))))
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GraphicsResult<Box<dyn DescriptorHeap>> {
        self.shared.check_live()?;
        if desc.capacity == 0 {
            return Err(GraphicsError::OutOfRange { reason: "descriptor heap with zero capacity".to_string() });
        }
        if desc.shader_visible && desc.kind != DescriptorHeapKind::CbvSrvUav {
            return Err(GraphicsError::invalid(format!("{:?} heaps cannot be shader visible", desc.kind)));
        }
        let base = (self.shared.serial << 40) | (self.shared.next_object_id() << 20);
        let gpu_start = desc.shader_visible.then_some(base | (1 << 63));
        log::debug!("Created {:?} descriptor heap with {} slots", desc.kind, desc.capacity);
        Ok(Box::new(HeadlessDescriptorHeap::new(*desc, base, gpu_start)))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GraphicsResult<Arc<dyn GpuResource>> {
        Ok(Arc::new(self.shared.new_buffer(desc)?))
    }

    fn create_texture(&self, desc: &TextureDesc) -> GraphicsResult<Arc<dyn GpuResource>> {
        Ok(Arc::new(self.shared.new_texture(desc)?))
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> GraphicsResult<PrebuildInfo> {
        acceleration::prebuild_info(inputs)
    }

    fn shader_table_properties(&self) -> ShaderTableProperties {
        self.shared.shader_table_properties
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> GraphicsResult<Box<dyn RayTracingPipeline>> {
        self.shared.check_live()?;
        Ok(Box::new(HeadlessPipeline::new(&self.shared, desc)))
    }

    fn removed_reason(&self) -> Option<String> {
        self.shared.removed_reason()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
