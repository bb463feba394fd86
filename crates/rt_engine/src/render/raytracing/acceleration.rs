//! Bottom- and top-level acceleration structure builds
//!
//! Bottom-level structures are built once on a single-use command list and
//! drained before returning. Top-level structures exist once per in-flight
//! frame so a frame can refit its own copy while the GPU still traces
//! against the others.

use std::sync::Arc;

use nalgebra::Matrix4;

use crate::render::api::{
    AccelerationStructureInputs, BufferDesc, BuildAccelerationStructureDesc, BuildFlags, CommandList, GeometryDesc,
    GpuResource, GpuVirtualAddress, GraphicsDevice, GraphicsError, GraphicsResult, PrebuildInfo, ResourceBarrier,
    ResourceState,
};
use crate::render::device::SwapchainManager;

use super::binding_layout::ShaderBindingLayout;
use super::instance::{InstanceFlags, RaytracingInstanceDesc, INSTANCE_DESC_SIZE};

/// Buffers backing one acceleration structure
pub struct AccelerationStructureBuffers {
    /// Build scratch memory (UAV, default heap)
    pub scratch: Arc<dyn GpuResource>,
    /// The structure itself
    pub result: Arc<dyn GpuResource>,
    /// Upload-heap instance records (top level only)
    pub instance_desc: Option<Arc<dyn GpuResource>>,
}

impl AccelerationStructureBuffers {
    fn allocate(device: &dyn GraphicsDevice, label: &str, info: &PrebuildInfo) -> GraphicsResult<Self> {
        let scratch = device.create_buffer(&BufferDesc::unordered_access(
            format!("{} scratch", label),
            info.scratch_data_size,
            ResourceState::UnorderedAccess,
        ))?;
        let result = device.create_buffer(&BufferDesc::acceleration_structure(label, info.result_data_max_size))?;
        Ok(Self { scratch, result, instance_desc: None })
    }
}

/// Built bottom-level structure
pub struct BottomLevel {
    buffers: AccelerationStructureBuffers,
    geometries: Vec<GeometryDesc>,
    prebuild: PrebuildInfo,
}

impl BottomLevel {
    /// GPU address referenced by instance records
    pub fn address(&self) -> GpuVirtualAddress {
        self.buffers.result.gpu_virtual_address()
    }

    /// Result buffer
    pub fn result(&self) -> &Arc<dyn GpuResource> {
        &self.buffers.result
    }

    /// Geometries the structure was built from
    pub fn geometries(&self) -> &[GeometryDesc] {
        &self.geometries
    }

    /// Number of geometries, one hit group slot each
    pub fn geometry_count(&self) -> u32 {
        self.geometries.len() as u32
    }

    /// Sizes reported by the prebuild query
    pub fn prebuild_info(&self) -> PrebuildInfo {
        self.prebuild
    }
}

/// One instance of a bottom-level structure in a top-level build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopLevelInstance {
    /// Address of the bottom-level structure
    pub bottom_level: GpuVirtualAddress,
    /// Geometry count of the bottom-level structure
    pub geometry_count: u32,
    /// Object-to-world transform
    pub transform: Matrix4<f32>,
    /// Value of `InstanceID()` in shaders
    pub instance_id: u32,
    /// Traversal flags
    pub flags: InstanceFlags,
}

impl TopLevelInstance {
    /// Instance of `bottom_level` with no flags
    pub fn new(bottom_level: &BottomLevel, instance_id: u32, transform: Matrix4<f32>) -> Self {
        Self {
            bottom_level: bottom_level.address(),
            geometry_count: bottom_level.geometry_count(),
            transform,
            instance_id,
            flags: InstanceFlags::empty(),
        }
    }
}

/// Built top-level structure with its own instance buffer
pub struct TopLevel {
    buffers: AccelerationStructureBuffers,
    instance_count: u32,
    prebuild: PrebuildInfo,
    refits: u64,
}

impl TopLevel {
    /// GPU address bound for tracing
    pub fn address(&self) -> GpuVirtualAddress {
        self.buffers.result.gpu_virtual_address()
    }

    /// Result buffer
    pub fn result(&self) -> &Arc<dyn GpuResource> {
        &self.buffers.result
    }

    /// Backing buffers
    pub fn buffers(&self) -> &AccelerationStructureBuffers {
        &self.buffers
    }

    /// Instances in the structure
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Sizes reported by the prebuild query
    pub fn prebuild_info(&self) -> PrebuildInfo {
        self.prebuild
    }

    /// Refits recorded since the last full build
    pub fn refit_count(&self) -> u64 {
        self.refits
    }

    fn write_instances(&self, descs: &[RaytracingInstanceDesc]) -> GraphicsResult<()> {
        let buffer = self
            .buffers
            .instance_desc
            .as_ref()
            .ok_or_else(|| GraphicsError::invalid("top-level structure without an instance buffer"))?;
        buffer.write_bytes(0, bytemuck::cast_slice(descs))
    }

    fn inputs(&self, flags: BuildFlags) -> GraphicsResult<AccelerationStructureInputs> {
        let instance_descs = self
            .buffers
            .instance_desc
            .as_ref()
            .ok_or_else(|| GraphicsError::invalid("top-level structure without an instance buffer"))?
            .gpu_virtual_address();
        Ok(AccelerationStructureInputs::TopLevel { flags, instance_count: self.instance_count, instance_descs })
    }
}

/// One value per in-flight frame, indexed by frame slot
pub struct PerFrame<T> {
    items: Vec<T>,
}

impl<T> PerFrame<T> {
    /// Wrap one value per frame slot
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    /// Number of frame slots
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no frame slots
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Value of frame `frame_index`
    pub fn get(&self, frame_index: usize) -> GraphicsResult<&T> {
        let count = self.items.len();
        self.items.get(frame_index).ok_or_else(|| out_of_frames(frame_index, count))
    }

    /// Value of frame `frame_index`, mutably
    pub fn get_mut(&mut self, frame_index: usize) -> GraphicsResult<&mut T> {
        let count = self.items.len();
        self.items.get_mut(frame_index).ok_or_else(|| out_of_frames(frame_index, count))
    }

    /// Values in frame order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

fn out_of_frames(index: usize, count: usize) -> GraphicsError {
    GraphicsError::OutOfRange { reason: format!("frame slot {} of {}", index, count) }
}

/// Records acceleration structure builds
#[derive(Debug, Clone, Copy)]
pub struct AccelerationStructureBuilder {
    bottom_level_flags: BuildFlags,
    top_level_flags: BuildFlags,
}

impl Default for AccelerationStructureBuilder {
    fn default() -> Self {
        Self { bottom_level_flags: BuildFlags::PREFER_FAST_TRACE, top_level_flags: BuildFlags::ALLOW_UPDATE }
    }
}

impl AccelerationStructureBuilder {
    /// Builder with default flags
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the flags of bottom-level builds
    pub fn with_bottom_level_flags(mut self, flags: BuildFlags) -> Self {
        self.bottom_level_flags = flags - BuildFlags::PERFORM_UPDATE;
        self
    }

    /// Extra flags for top-level builds; `ALLOW_UPDATE` is always set
    pub fn with_top_level_flags(mut self, flags: BuildFlags) -> Self {
        self.top_level_flags = (flags | BuildFlags::ALLOW_UPDATE) - BuildFlags::PERFORM_UPDATE;
        self
    }

    /// Build a bottom-level structure and wait for it
    pub fn build_bottom_level(
        &self,
        manager: &mut SwapchainManager,
        geometries: Vec<GeometryDesc>,
    ) -> GraphicsResult<BottomLevel> {
        let device = Arc::clone(manager.device()?);
        let inputs =
            AccelerationStructureInputs::BottomLevel { flags: self.bottom_level_flags, geometries: geometries.clone() };
        let prebuild = device.acceleration_structure_prebuild_info(&inputs)?;
        let buffers = AccelerationStructureBuffers::allocate(device.as_ref(), "Bottom-level structure", &prebuild)?;

        let mut list = manager.create_command_list("Bottom-level build")?;
        list.build_acceleration_structure(&BuildAccelerationStructureDesc {
            inputs: &inputs,
            dest: buffers.result.as_ref(),
            source: None,
            scratch: buffers.scratch.as_ref(),
        });
        list.resource_barrier(&[ResourceBarrier::uav(buffers.result.as_ref())]);
        list.close()?;
        manager.execute_and_wait(list.as_ref())?;

        log::debug!(
            "Built bottom-level structure with {} geometries ({} bytes)",
            geometries.len(),
            prebuild.result_data_max_size
        );
        Ok(BottomLevel { buffers, geometries, prebuild })
    }

    /// Build one top-level structure per in-flight frame and wait for them
    pub fn build_top_level_set(
        &self,
        manager: &mut SwapchainManager,
        layout: &ShaderBindingLayout,
        instances: &[TopLevelInstance],
    ) -> GraphicsResult<PerFrame<TopLevel>> {
        let device = Arc::clone(manager.device()?);
        let mut list = manager.create_command_list("Top-level set build")?;

        let frame_count = manager.back_buffer_count() as usize;
        let mut set = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            set.push(self.build_top_level(device.as_ref(), list.as_mut(), layout, instances)?);
        }
        list.close()?;
        manager.execute_and_wait(list.as_ref())?;

        log::debug!("Built {} top-level structures of {} instances", set.len(), instances.len());
        Ok(PerFrame::new(set))
    }

    /// Record a full build into freshly allocated buffers
    pub fn build_top_level(
        &self,
        device: &dyn GraphicsDevice,
        list: &mut dyn CommandList,
        layout: &ShaderBindingLayout,
        instances: &[TopLevelInstance],
    ) -> GraphicsResult<TopLevel> {
        let descs = instance_descs(layout, instances)?;
        let instance_count = descs.len() as u32;

        let query = AccelerationStructureInputs::TopLevel {
            flags: self.top_level_flags,
            instance_count,
            instance_descs: 0,
        };
        let prebuild = device.acceleration_structure_prebuild_info(&query)?;
        let mut buffers = AccelerationStructureBuffers::allocate(device, "Top-level structure", &prebuild)?;
        buffers.instance_desc = Some(device.create_buffer(&BufferDesc::upload(
            "Top-level instances",
            u64::from(instance_count) * INSTANCE_DESC_SIZE,
        ))?);

        let tlas = TopLevel { buffers, instance_count, prebuild, refits: 0 };
        tlas.write_instances(&descs)?;

        let inputs = tlas.inputs(self.top_level_flags)?;
        list.build_acceleration_structure(&BuildAccelerationStructureDesc {
            inputs: &inputs,
            dest: tlas.buffers.result.as_ref(),
            source: None,
            scratch: tlas.buffers.scratch.as_ref(),
        });
        list.resource_barrier(&[ResourceBarrier::uav(tlas.buffers.result.as_ref())]);
        Ok(tlas)
    }

    /// Record a refit of `tlas` in place with new instance data
    ///
    /// The instance count must match the one `tlas` was built with.
    pub fn refit_top_level(
        &self,
        list: &mut dyn CommandList,
        tlas: &mut TopLevel,
        layout: &ShaderBindingLayout,
        instances: &[TopLevelInstance],
    ) -> GraphicsResult<()> {
        let descs = instance_descs(layout, instances)?;
        if descs.len() as u32 != tlas.instance_count {
            return Err(GraphicsError::invalid(format!(
                "refit with {} instances of a structure built with {}",
                descs.len(),
                tlas.instance_count
            )));
        }

        let result = Arc::clone(&tlas.buffers.result);
        // The previous build or refit must finish writing before it is read back
        list.resource_barrier(&[ResourceBarrier::uav(result.as_ref())]);
        tlas.write_instances(&descs)?;

        let inputs = tlas.inputs(self.top_level_flags | BuildFlags::PERFORM_UPDATE)?;
        list.build_acceleration_structure(&BuildAccelerationStructureDesc {
            inputs: &inputs,
            dest: result.as_ref(),
            source: Some(result.as_ref()),
            scratch: tlas.buffers.scratch.as_ref(),
        });
        list.resource_barrier(&[ResourceBarrier::uav(result.as_ref())]);
        tlas.refits += 1;
        Ok(())
    }

    /// Refit `tlas` when `update` is set, otherwise rebuild it from scratch
    pub fn build_or_refit_top_level(
        &self,
        device: &dyn GraphicsDevice,
        list: &mut dyn CommandList,
        tlas: &mut TopLevel,
        layout: &ShaderBindingLayout,
        instances: &[TopLevelInstance],
        update: bool,
    ) -> GraphicsResult<()> {
        if update {
            self.refit_top_level(list, tlas, layout, instances)
        } else {
            *tlas = self.build_top_level(device, list, layout, instances)?;
            Ok(())
        }
    }
}

/// Instance records with hit group contributions taken from `layout`
pub fn instance_descs(
    layout: &ShaderBindingLayout,
    instances: &[TopLevelInstance],
) -> GraphicsResult<Vec<RaytracingInstanceDesc>> {
    if instances.is_empty() {
        return Err(GraphicsError::OutOfRange { reason: "top-level structure without instances".to_string() });
    }
    if instances.len() as u32 != layout.instance_count() {
        return Err(GraphicsError::invalid(format!(
            "{} instances for a binding layout of {}",
            instances.len(),
            layout.instance_count()
        )));
    }

    instances
        .iter()
        .enumerate()
        .map(|(index, instance)| {
            let index = index as u32;
            if layout.geometry_count(index) != Some(instance.geometry_count) {
                return Err(GraphicsError::invalid(format!(
                    "instance {} has {} geometries but the binding layout expects {:?}",
                    index,
                    instance.geometry_count,
                    layout.geometry_count(index)
                )));
            }
            let contribution = layout.contribution(index).unwrap_or_default();
            RaytracingInstanceDesc::new(
                &instance.transform,
                instance.instance_id,
                contribution,
                instance.flags,
                instance.bottom_level,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{DeviceConfig, Format};
    use crate::render::backends::headless::{HeadlessBackend, HeadlessDevice, Ray};
    use crate::render::tests::{headless_manager, plane_geometry, triangle_geometry};
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};

    fn trace(manager: &SwapchainManager, tlas: &TopLevel, origin: Point3<f32>) -> Option<u32> {
        let device = manager.device().unwrap();
        let headless = device.as_any().downcast_ref::<HeadlessDevice>().unwrap();
        headless
            .trace_ray(tlas.result().as_ref(), &Ray::new(origin, Vector3::new(0.0, 0.0, 1.0)))
            .unwrap()
            .map(|hit| hit.instance_id)
    }

    #[test]
    fn test_bottom_level_build() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 640, 480);
        let (_vertices, geometry) = triangle_geometry(&manager);

        let blas = AccelerationStructureBuilder::new().build_bottom_level(&mut manager, vec![geometry]).unwrap();
        assert_eq!(blas.geometry_count(), 1);
        assert_eq!(blas.result().buffer_size(), blas.prebuild_info().result_data_max_size);
        assert_eq!(control.stats().acceleration_structure_builds, 1);
        assert!(control.validation_errors().is_empty());
    }

    /// One structure per frame, each traceable on its own
    #[test]
    fn test_top_level_set_per_frame() {
        let config = DeviceConfig::new(Format::Bgra8Unorm, 3);
        let (mut manager, _surface) = headless_manager(HeadlessBackend::default(), config, 640, 480);
        let (_vertices, geometry) = triangle_geometry(&manager);
        let builder = AccelerationStructureBuilder::new();
        let blas = builder.build_bottom_level(&mut manager, vec![geometry]).unwrap();

        let layout = ShaderBindingLayout::with_instances(1, &[1]).unwrap();
        let instances = [TopLevelInstance::new(&blas, 7, Matrix4::identity())];
        let set = builder.build_top_level_set(&mut manager, &layout, &instances).unwrap();

        assert_eq!(set.len(), 3);
        for tlas in set.iter() {
            assert_eq!(tlas.instance_count(), 1);
            assert_eq!(trace(&manager, tlas, Point3::new(0.0, 0.0, -1.0)), Some(7));
        }
        assert!(set.get(3).is_err());
    }

    #[test]
    fn test_refit_moves_instance() {
        let backend = HeadlessBackend::default();
        let control = backend.control();
        let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 640, 480);
        let (_vertices, geometry) = triangle_geometry(&manager);
        let builder = AccelerationStructureBuilder::new();
        let blas = builder.build_bottom_level(&mut manager, vec![geometry]).unwrap();

        let layout = ShaderBindingLayout::with_instances(1, &[1]).unwrap();
        let mut instances = [TopLevelInstance::new(&blas, 0, Matrix4::identity())];
        let mut set = builder.build_top_level_set(&mut manager, &layout, &instances).unwrap();

        instances[0].transform = Matrix4::new_translation(&Vector3::new(5.0, 0.0, 0.0));
        let mut list = manager.create_command_list("Refit").unwrap();
        builder.refit_top_level(list.as_mut(), set.get_mut(0).unwrap(), &layout, &instances).unwrap();
        list.close().unwrap();
        manager.execute_and_wait(list.as_ref()).unwrap();

        let tlas = set.get(0).unwrap();
        assert_eq!(tlas.refit_count(), 1);
        assert_eq!(trace(&manager, tlas, Point3::new(0.0, 0.0, -1.0)), None);
        assert_eq!(trace(&manager, tlas, Point3::new(5.0, 0.0, -1.0)), Some(0));
        assert_eq!(control.stats().acceleration_structure_refits, 1);
        assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
    }

    #[test]
    fn test_refit_rejects_instance_count_change() {
        let (mut manager, _surface) = headless_manager(HeadlessBackend::default(), DeviceConfig::default(), 640, 480);
        let (_triangle, triangle) = triangle_geometry(&manager);
        let builder = AccelerationStructureBuilder::new();
        let blas = builder.build_bottom_level(&mut manager, vec![triangle]).unwrap();

        let one = ShaderBindingLayout::with_instances(1, &[1]).unwrap();
        let two = ShaderBindingLayout::with_instances(1, &[1, 1]).unwrap();
        let mut set = builder
            .build_top_level_set(&mut manager, &one, &[TopLevelInstance::new(&blas, 0, Matrix4::identity())])
            .unwrap();

        let instances = [
            TopLevelInstance::new(&blas, 0, Matrix4::identity()),
            TopLevelInstance::new(&blas, 1, Matrix4::identity()),
        ];
        let mut list = manager.create_command_list("Refit").unwrap();
        let result = builder.refit_top_level(list.as_mut(), set.get_mut(0).unwrap(), &two, &instances);
        assert!(matches!(result, Err(GraphicsError::InvalidOperation { .. })));
    }

    /// Contributions come from the binding layout, not the instance order alone
    #[test]
    fn test_instance_descs_follow_layout() {
        let (mut manager, _surface) = headless_manager(HeadlessBackend::default(), DeviceConfig::default(), 640, 480);
        let (_plane, plane) = plane_geometry(&manager);
        let (_triangle, triangle) = triangle_geometry(&manager);
        let builder = AccelerationStructureBuilder::new();
        let plane_blas = builder.build_bottom_level(&mut manager, vec![plane]).unwrap();
        let triangle_blas = builder.build_bottom_level(&mut manager, vec![triangle, plane]).unwrap();

        let layout = ShaderBindingLayout::with_instances(2, &[1, 2, 2]).unwrap();
        let transform = Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0));
        let instances = [
            TopLevelInstance::new(&plane_blas, 0, Matrix4::identity()),
            TopLevelInstance::new(&triangle_blas, 1, transform),
            TopLevelInstance::new(&triangle_blas, 2, transform),
        ];
        let descs = instance_descs(&layout, &instances).unwrap();
        let contributions = descs.iter().map(RaytracingInstanceDesc::hit_group_contribution).collect::<Vec<_>>();
        assert_eq!(contributions, vec![0, 2, 6]);
        assert_eq!(descs[1].mask(), 0xFF);
        assert_relative_eq!(descs[1].transform[1][3], 2.0);

        let mismatched = [
            TopLevelInstance::new(&triangle_blas, 0, Matrix4::identity()),
            TopLevelInstance::new(&triangle_blas, 1, transform),
            TopLevelInstance::new(&triangle_blas, 2, transform),
        ];
        assert!(instance_descs(&layout, &mismatched).is_err());
        assert!(instance_descs(&layout, &[]).is_err());
    }
}
