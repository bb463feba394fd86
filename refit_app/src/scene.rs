//! Plane plus two spinning triangles, refit every frame

use std::sync::Arc;

use nalgebra::{Isometry3, Matrix4, Perspective3, Point3, Vector3};
use rt_engine::render::api::{
    BufferDesc, CommandList, GeometryDesc, GpuResource, GraphicsError, GraphicsResult, RayTracingPipeline,
    ResourceBarrier, ResourceFlags, ResourceState, RootSignatureHandle, TextureDesc, ViewDesc,
};
use rt_engine::render::descriptors::SlotId;
use rt_engine::render::device::{Resolution, SwapchainManager};
use rt_engine::render::frame::CommandPass;
use rt_engine::render::raytracing::{
    AccelerationStructureBuilder, BottomLevel, HitGroup, LibraryExport, PerFrame, RayTracingPipelineBuilder,
    RootArgument, ShaderBindingLayout, ShaderStage, ShaderTable, ShaderTableLayout, ShaderTableWriter,
    ShaderTableZone, TopLevel, TopLevelInstance,
};
use rt_engine::render::resources::{ConstantBuffer, SceneConstants};

const TRIANGLE: [[f32; 3]; 3] = [[0.0, 1.0, 0.0], [0.866, -0.5, 0.0], [-0.866, -0.5, 0.0]];

const PLANE: [[f32; 3]; 6] = [
    [-1.5, -0.8, 1.5],
    [-1.5, -0.8, -1.5],
    [1.5, -0.8, 1.5],
    [1.5, -0.8, 1.5],
    [-1.5, -0.8, -1.5],
    [1.5, -0.8, -1.5],
];

/// Primary and shadow rays
const RAY_TYPE_COUNT: u32 = 2;

/// Descriptor table, acceleration structure address, constants address
const MAX_ROOT_ARGUMENT_BYTES: u32 = 24;

/// Placeholder library; the headless device only inspects the exports
const SHADER_LIBRARY: &[u8] = b"refit_app raytracing library";

/// Everything the demo created on the current device
pub struct RefitScene {
    _vertex_buffers: Vec<Arc<dyn GpuResource>>,
    plane: BottomLevel,
    triangle: BottomLevel,
    layout: ShaderBindingLayout,
    builder: AccelerationStructureBuilder,
    top_levels: PerFrame<TopLevel>,
    pipeline: Box<dyn RayTracingPipeline>,
    shader_tables: PerFrame<ShaderTable>,
    constants: ConstantBuffer<SceneConstants>,
    output: Arc<dyn GpuResource>,
    output_uav: SlotId,
    resolution: Resolution,
}

impl RefitScene {
    /// Build geometry, acceleration structures, pipeline and shader tables on `manager`'s device
    pub fn new(manager: &mut SwapchainManager) -> GraphicsResult<Self> {
        let (triangle_vertices, triangle_geometry) = upload_vertices(manager, "Triangle vertices", &TRIANGLE)?;
        let (plane_vertices, plane_geometry) = upload_vertices(manager, "Plane vertices", &PLANE)?;

        let builder = AccelerationStructureBuilder::new();
        let plane = builder.build_bottom_level(manager, vec![plane_geometry])?;
        let triangle = builder.build_bottom_level(manager, vec![triangle_geometry])?;

        let layout = ShaderBindingLayout::with_instances(RAY_TYPE_COUNT, &[1, 1, 1])?;
        let instances = scene_instances(&plane, &triangle, 0.0);
        let top_levels = builder.build_top_level_set(manager, &layout, &instances)?;

        let pipeline = create_pipeline(manager)?;
        let constants = ConstantBuffer::new(manager, "Scene constants")?;

        let resolution = manager.resolution();
        let output_uav = manager.descriptors()?.allocate()?;
        let output = match create_output(manager, resolution, output_uav) {
            Ok(output) => output,
            Err(err) => {
                manager.descriptors()?.free(output_uav);
                return Err(err);
            }
        };

        let mut scene = Self {
            _vertex_buffers: vec![triangle_vertices, plane_vertices],
            plane,
            triangle,
            layout,
            builder,
            top_levels,
            pipeline,
            shader_tables: PerFrame::new(Vec::new()),
            constants,
            output,
            output_uav,
            resolution,
        };
        scene.shader_tables = scene.write_shader_tables(manager)?;

        log::info!(
            "Scene ready: {} instances, {} hit group records, {} frames",
            scene.layout.instance_count(),
            scene.layout.hit_record_count(),
            scene.top_levels.len()
        );
        Ok(scene)
    }

    fn write_shader_tables(&self, manager: &SwapchainManager) -> GraphicsResult<PerFrame<ShaderTable>> {
        let device = manager.device()?;
        let table_layout = ShaderTableLayout::for_binding_layout(
            device.shader_table_properties(),
            RAY_TYPE_COUNT,
            &self.layout,
            MAX_ROOT_ARGUMENT_BYTES,
        )?;
        let output_table = manager.descriptors()?.gpu_handle(self.output_uav);

        let mut tables = Vec::with_capacity(self.top_levels.len());
        for (frame, top_level) in self.top_levels.iter().enumerate() {
            let mut writer = ShaderTableWriter::new(table_layout)?;
            writer
                .record(ShaderTableZone::RayGeneration, 0)?
                .identifier(&self.identifier("rayGen")?)?
                .argument(RootArgument::DescriptorTable(output_table))?
                .argument(RootArgument::Address(top_level.address()))?
                .argument(RootArgument::Address(self.constants.gpu_address(frame as u32)?))?;
            writer.record(ShaderTableZone::Miss, 0)?.identifier(&self.identifier("miss")?)?;
            writer.record(ShaderTableZone::Miss, 1)?.identifier(&self.identifier("shadowMiss")?)?;

            for instance in 0..self.layout.instance_count() {
                let primary = if instance == 0 { "PlaneHitGroup" } else { "HitGroup" };
                let index = self.hit_record(instance, 0)?;
                let mut record = writer.record(ShaderTableZone::HitGroup, index)?;
                record.identifier(&self.identifier(primary)?)?;
                if instance > 0 {
                    record.argument(RootArgument::Constant(instance))?;
                }

                let index = self.hit_record(instance, 1)?;
                writer.record(ShaderTableZone::HitGroup, index)?.identifier(&self.identifier("ShadowHitGroup")?)?;
            }
            tables.push(ShaderTable::upload(manager, &writer)?);
        }
        Ok(PerFrame::new(tables))
    }

    fn identifier(&self, export: &str) -> GraphicsResult<rt_engine::render::api::ShaderIdentifier> {
        self.pipeline
            .shader_identifier(export)
            .ok_or_else(|| GraphicsError::invalid(format!("pipeline has no identifier for '{}'", export)))
    }

    fn hit_record(&self, instance: u32, ray_type: u32) -> GraphicsResult<u32> {
        self.layout.hit_record_index(instance, 0, ray_type).ok_or_else(|| GraphicsError::OutOfRange {
            reason: format!("hit record of instance {} ray type {}", instance, ray_type),
        })
    }

    /// Recreate the dispatch target after the scene resolution changed
    fn sync_resolution(&mut self, manager: &SwapchainManager) -> GraphicsResult<()> {
        let resolution = manager.resolution();
        if resolution == self.resolution {
            return Ok(());
        }
        self.output = create_output(manager, resolution, self.output_uav)?;
        self.resolution = resolution;
        Ok(())
    }

    /// Record and submit one frame: refit, dispatch, copy to the scene target, post pass
    pub fn render(&mut self, manager: &mut SwapchainManager, time: f32) -> GraphicsResult<()> {
        self.sync_resolution(manager)?;

        let frame = manager.current_frame_index();
        self.constants.copy_to_gpu(frame, &scene_constants(manager, time))?;

        let instances = scene_instances(&self.plane, &self.triangle, time);
        let intermediate = manager
            .intermediate_render_target()
            .cloned()
            .ok_or_else(|| GraphicsError::invalid("no intermediate render target"))?;
        let dispatch = self.shader_tables.get(frame as usize)?.dispatch_rays_desc(
            self.resolution.width,
            self.resolution.height,
        );

        manager.begin_pass(CommandPass::Scene, Some(self.pipeline.handle()))?;
        manager.bind_descriptor_heap(CommandPass::Scene)?;
        let list = manager.current_command_list(CommandPass::Scene)?;

        self.builder.refit_top_level(list, self.top_levels.get_mut(frame as usize)?, &self.layout, &instances)?;
        list.set_ray_tracing_pipeline(self.pipeline.as_ref());
        list.dispatch_rays(&dispatch);
        copy_to_scene_target(list, self.output.as_ref(), intermediate.as_ref());

        manager.record_post_pass()?;
        manager.execute_frame()
    }

    /// Return the descriptor slots this scene holds
    pub fn release(mut self, manager: &SwapchainManager) {
        self.constants.release();
        if let Ok(descriptors) = manager.descriptors() {
            descriptors.free(self.output_uav);
        } else {
            manager.slot_allocator().release(self.output_uav);
        }
    }
}

fn copy_to_scene_target(list: &mut dyn CommandList, output: &dyn GpuResource, target: &dyn GpuResource) {
    list.resource_barrier(&[
        ResourceBarrier::transition(output, ResourceState::UnorderedAccess, ResourceState::CopySource),
        ResourceBarrier::transition(target, ResourceState::RenderTarget, ResourceState::CopyDest),
    ]);
    list.copy_resource(target, output);
    list.resource_barrier(&[
        ResourceBarrier::transition(output, ResourceState::CopySource, ResourceState::UnorderedAccess),
        ResourceBarrier::transition(target, ResourceState::CopyDest, ResourceState::RenderTarget),
    ]);
}

fn scene_instances(plane: &BottomLevel, triangle: &BottomLevel, time: f32) -> [TopLevelInstance; 3] {
    let spin = Matrix4::from_axis_angle(&Vector3::y_axis(), time);
    [
        TopLevelInstance::new(plane, 0, Matrix4::identity()),
        TopLevelInstance::new(triangle, 1, Matrix4::new_translation(&Vector3::new(-0.9, 0.0, 0.0)) * spin),
        TopLevelInstance::new(triangle, 2, Matrix4::new_translation(&Vector3::new(0.9, 0.0, 0.5)) * spin.transpose()),
    ]
}

fn scene_constants(manager: &SwapchainManager, time: f32) -> SceneConstants {
    let resolution = manager.resolution();
    let aspect = resolution.width as f32 / resolution.height as f32;
    let eye = Point3::new(0.0, 1.5, -7.0);
    let view = Isometry3::look_at_rh(&eye, &Point3::origin(), &Vector3::y());
    let projection = Perspective3::new(aspect, 45f32.to_radians(), 0.1, 125.0);
    let view_projection = projection.to_homogeneous() * view.to_homogeneous();
    let projection_to_world = view_projection.try_inverse().unwrap_or_else(Matrix4::identity);

    let light = Point3::new(2.0 * time.cos(), 1.8, -3.0 + 2.0 * time.sin());
    SceneConstants::new(&projection_to_world, &eye, &light)
}

fn create_pipeline(manager: &SwapchainManager) -> GraphicsResult<Box<dyn RayTracingPipeline>> {
    let mut builder = RayTracingPipelineBuilder::new("Refit scene");
    builder.library(
        SHADER_LIBRARY,
        vec![
            LibraryExport::new("rayGen", ShaderStage::RayGeneration),
            LibraryExport::new("miss", ShaderStage::Miss),
            LibraryExport::new("shadowMiss", ShaderStage::Miss),
            LibraryExport::new("chs", ShaderStage::ClosestHit),
            LibraryExport::new("planeChs", ShaderStage::ClosestHit),
            LibraryExport::new("shadowChs", ShaderStage::ClosestHit),
        ],
    );
    builder.hit_group(HitGroup::triangles("HitGroup", "chs"));
    builder.hit_group(HitGroup::triangles("PlaneHitGroup", "planeChs"));
    builder.hit_group(HitGroup::triangles("ShadowHitGroup", "shadowChs"));

    let ray_gen_signature = builder.local_root_signature(RootSignatureHandle(1));
    builder.associate(ray_gen_signature, ["rayGen"]);
    let hit_signature = builder.local_root_signature(RootSignatureHandle(2));
    builder.associate(hit_signature, ["HitGroup"]);

    builder.shader_config(16, 8);
    builder.pipeline_config(2);
    builder.global_root_signature(RootSignatureHandle(0));

    let desc = builder.build()?;
    manager.device()?.create_ray_tracing_pipeline(&desc)
}

fn create_output(
    manager: &SwapchainManager,
    resolution: Resolution,
    slot: SlotId,
) -> GraphicsResult<Arc<dyn GpuResource>> {
    let output = manager.device()?.create_texture(&TextureDesc {
        name: "Ray tracing output".to_string(),
        width: resolution.width,
        height: resolution.height,
        format: manager.config().back_buffer_format.without_srgb(),
        flags: ResourceFlags::ALLOW_UNORDERED_ACCESS,
        initial_state: ResourceState::UnorderedAccess,
        clear_color: None,
        clear_depth: None,
    })?;
    manager.descriptors()?.write_view(slot, &ViewDesc::UnorderedAccess(output.as_ref()))?;
    Ok(output)
}

fn upload_vertices(
    manager: &SwapchainManager,
    name: &str,
    vertices: &[[f32; 3]],
) -> GraphicsResult<(Arc<dyn GpuResource>, GeometryDesc)> {
    let bytes: &[u8] = bytemuck::cast_slice(vertices);
    let buffer = manager.device()?.create_buffer(&BufferDesc::upload(name, bytes.len() as u64))?;
    buffer.write_bytes(0, bytes)?;
    let geometry = GeometryDesc::opaque_triangles(buffer.gpu_virtual_address(), vertices.len() as u32);
    Ok((buffer, geometry))
}
