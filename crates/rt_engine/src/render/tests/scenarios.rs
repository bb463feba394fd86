//! End-to-end scenarios across the swapchain manager, frame pacing and ray tracing

use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use nalgebra::{Matrix4, Point3, Vector3};
use parking_lot::Mutex;

use super::{headless_manager, plane_geometry, triangle_geometry};
use crate::render::api::{DeviceConfig, Format, Rect, ResourceDimension, RootSignatureHandle};
use crate::render::backends::headless::{
    HeadlessBackend, HeadlessConfig, HeadlessDescriptorHeap, HeadlessDevice, Ray, ViewRecord,
};
use crate::render::device::{DeviceNotify, DeviceState, Resolution, SwapchainManager};
use crate::render::frame::CommandPass;
use crate::render::raytracing::{
    AccelerationStructureBuilder, HitGroup, LibraryExport, RayTracingPipelineBuilder, RootArgument,
    ShaderBindingLayout, ShaderStage, ShaderTable, ShaderTableLayout, ShaderTableWriter, ShaderTableZone, TopLevel,
    TopLevelInstance,
};

struct RecordingObserver {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl DeviceNotify for RecordingObserver {
    fn on_device_lost(&mut self) {
        self.events.lock().push("lost");
    }

    fn on_device_restored(&mut self) {
        self.events.lock().push("restored");
    }
}

fn intermediate_size(manager: &SwapchainManager) -> (u32, u32) {
    match manager.intermediate_render_target().unwrap().dimension() {
        ResourceDimension::Texture2D { width, height, .. } => (width, height),
        ResourceDimension::Buffer { .. } => panic!("scene target is a buffer"),
    }
}

/// Resizing re-creates every back buffer view at the new size
#[test]
fn test_resize_recreates_back_buffer_views() {
    let backend = HeadlessBackend::default();
    let control = backend.control();
    let (mut manager, _surface) = headless_manager(backend, DeviceConfig::new(Format::Bgra8Unorm, 3), 1280, 720);
    let old_ids = (0..3).map(|index| manager.back_buffer(index).unwrap().id()).collect::<Vec<_>>();

    assert!(manager.window_size_changed(1920, 1080).unwrap());
    assert_eq!(control.stats().swapchain_resizes, 1);

    let heap = manager.render_target_heap().unwrap().as_any().downcast_ref::<HeadlessDescriptorHeap>().unwrap();
    for index in 0..3 {
        let back_buffer = manager.back_buffer(index).unwrap();
        assert_ne!(back_buffer.id(), old_ids[index as usize]);
        assert_eq!(
            back_buffer.dimension(),
            ResourceDimension::Texture2D { width: 1920, height: 1080, format: Format::Bgra8Unorm }
        );
        assert_eq!(heap.view(index), Some(ViewRecord::RenderTarget(back_buffer.id())));
    }

    let viewport = manager.screen_viewport();
    assert_relative_eq!(viewport.width, 1920.0);
    assert_relative_eq!(viewport.height, 1080.0);
    assert_eq!(manager.scissor_rect(), Rect::new(0, 0, 1920, 1080));

    manager.present().unwrap();
    assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
}

/// Device removal during present is recovered before present returns
#[test]
fn test_device_loss_during_present() {
    let backend = HeadlessBackend::default();
    let control = backend.control();
    let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 1280, 720);

    let events = Arc::new(Mutex::new(Vec::new()));
    manager.register_device_notify(Box::new(RecordingObserver { events: Arc::clone(&events) }));
    let slot = manager.intermediate_srv_slot();

    control.inject_device_removed("driver update");
    manager.present().unwrap();

    assert_eq!(*events.lock(), vec!["lost", "restored"]);
    assert_eq!(manager.device_state(), DeviceState::Live);
    assert_eq!(manager.device_generation(), 1);
    assert_eq!(control.stats().devices_created, 2);
    assert_eq!(manager.intermediate_srv_slot(), slot);

    manager.prepare(None).unwrap();
    manager.execute_frame().unwrap();
    manager.present().unwrap();
    manager.wait_for_gpu().unwrap();
    assert_eq!(events.lock().len(), 2);
}

/// Device removal discovered by a resize rebuilds the device at the new size
#[test]
fn test_device_loss_during_resize() {
    let backend = HeadlessBackend::default();
    let control = backend.control();
    let (mut manager, _surface) = headless_manager(backend, DeviceConfig::new(Format::Bgra8Unorm, 2), 1280, 720);

    let events = Arc::new(Mutex::new(Vec::new()));
    manager.register_device_notify(Box::new(RecordingObserver { events: Arc::clone(&events) }));

    control.inject_device_removed("TDR during resize");
    assert!(manager.window_size_changed(1920, 1080).unwrap());

    assert_eq!(*events.lock(), vec!["lost", "restored"]);
    assert_eq!(manager.device_state(), DeviceState::Live);
    assert_eq!(manager.device_generation(), 1);
    for index in 0..2 {
        assert_eq!(
            manager.back_buffer(index).unwrap().dimension(),
            ResourceDimension::Texture2D { width: 1920, height: 1080, format: Format::Bgra8Unorm }
        );
    }
    assert_eq!(manager.scissor_rect(), Rect::new(0, 0, 1920, 1080));

    manager.prepare(None).unwrap();
    manager.execute_frame().unwrap();
    manager.present().unwrap();
    manager.wait_for_gpu().unwrap();
    assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
}

/// Eight steps up return to the start; one step down from 0 wraps to 4K
#[test]
fn test_resolution_cycling() {
    let (mut manager, _surface) = headless_manager(HeadlessBackend::default(), DeviceConfig::default(), 1280, 720);
    assert_eq!(manager.resolution_index(), 2);

    for _ in 0..8 {
        let resolution = manager.increase_resolution_index().unwrap();
        assert_eq!(intermediate_size(&manager), (resolution.width, resolution.height));
    }
    assert_eq!(manager.resolution_index(), 2);
    assert_eq!(manager.resolution(), Resolution::new(1280, 720));

    manager.decrease_resolution_index().unwrap();
    manager.decrease_resolution_index().unwrap();
    assert_eq!(manager.resolution_index(), 0);
    let wrapped = manager.decrease_resolution_index().unwrap();
    assert_eq!(manager.resolution_index(), 7);
    assert_eq!(wrapped, Resolution::new(3840, 2160));
    assert_eq!(intermediate_size(&manager), (3840, 2160));

    // 3840x2160 letterboxed into a 16:9 window fills it
    assert_eq!(manager.post_scissor(), Rect::new(0, 0, 1280, 720));
}

/// The CPU never runs more than the back buffer count ahead of the GPU
#[test]
fn test_frame_pacing_bound() {
    let backend = HeadlessBackend::new(HeadlessConfig {
        gpu_latency: Duration::from_millis(3),
        ..HeadlessConfig::default()
    });
    let control = backend.control();
    let (mut manager, _surface) = headless_manager(backend, DeviceConfig::new(Format::Bgra8Unorm, 3), 640, 480);

    for _ in 0..12 {
        manager.begin_pass(CommandPass::Scene, None).unwrap();
        manager.record_post_pass().unwrap();
        manager.execute_frame().unwrap();
        manager.present().unwrap();

        let pacer = manager.frame_pacer().unwrap();
        assert!(pacer.frames_in_flight() <= u64::from(manager.back_buffer_count()));
    }
    manager.wait_for_gpu().unwrap();
    assert_eq!(manager.frame_pacer().unwrap().frames_in_flight(), 0);
    assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
}

fn scene_instances(
    plane: &crate::render::raytracing::BottomLevel,
    triangle: &crate::render::raytracing::BottomLevel,
    angle: f32,
) -> [TopLevelInstance; 3] {
    let spin = Matrix4::from_axis_angle(&Vector3::z_axis(), angle);
    [
        TopLevelInstance::new(plane, 0, Matrix4::identity()),
        TopLevelInstance::new(triangle, 1, Matrix4::new_translation(&Vector3::new(-0.6, 0.0, 0.0)) * spin),
        TopLevelInstance::new(triangle, 2, Matrix4::new_translation(&Vector3::new(0.6, 0.0, 0.5)) * spin),
    ]
}

fn hits(manager: &SwapchainManager, tlas: &TopLevel) -> Vec<Option<(u32, u32)>> {
    let device = manager.device().unwrap();
    let headless = device.as_any().downcast_ref::<HeadlessDevice>().unwrap();
    let mut hits = Vec::new();
    for y in -6..=6 {
        for x in -10..=10 {
            let origin = Point3::new(x as f32 * 0.15, y as f32 * 0.15, -2.0);
            let ray = Ray::new(origin, Vector3::new(0.0, -0.2, 1.0));
            let hit = headless.trace_ray(tlas.result().as_ref(), &ray).unwrap();
            hits.push(hit.map(|hit| (hit.instance_id, hit.primitive_index)));
        }
    }
    hits
}

/// Refitting twice lands on the same structure as building the final transforms
#[test]
fn test_refit_matches_rebuild() {
    let backend = HeadlessBackend::default();
    let control = backend.control();
    let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 640, 480);
    let (_plane_vertices, plane) = plane_geometry(&manager);
    let (_triangle_vertices, triangle) = triangle_geometry(&manager);

    let builder = AccelerationStructureBuilder::new();
    let plane_blas = builder.build_bottom_level(&mut manager, vec![plane]).unwrap();
    let triangle_blas = builder.build_bottom_level(&mut manager, vec![triangle]).unwrap();
    let layout = ShaderBindingLayout::with_instances(2, &[1, 1, 1]).unwrap();

    let mut refitted = builder
        .build_top_level_set(&mut manager, &layout, &scene_instances(&plane_blas, &triangle_blas, 0.0))
        .unwrap();
    for angle in [0.4, 1.1] {
        let mut list = manager.create_command_list("Refit").unwrap();
        let device = Arc::clone(manager.device().unwrap());
        builder
            .build_or_refit_top_level(
                device.as_ref(),
                list.as_mut(),
                refitted.get_mut(0).unwrap(),
                &layout,
                &scene_instances(&plane_blas, &triangle_blas, angle),
                true,
            )
            .unwrap();
        list.close().unwrap();
        manager.execute_and_wait(list.as_ref()).unwrap();
    }

    let rebuilt = builder
        .build_top_level_set(&mut manager, &layout, &scene_instances(&plane_blas, &triangle_blas, 1.1))
        .unwrap();

    let refitted = refitted.get(0).unwrap();
    assert_eq!(refitted.refit_count(), 2);
    let expected = hits(&manager, rebuilt.get(0).unwrap());
    assert!(expected.iter().any(Option::is_some));
    assert_eq!(hits(&manager, refitted), expected);
    assert_eq!(control.stats().acceleration_structure_refits, 2);
    assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
}

/// A table written from the binding layout passes dispatch validation
#[test]
fn test_shader_table_dispatch() {
    let backend = HeadlessBackend::default();
    let control = backend.control();
    let (mut manager, _surface) = headless_manager(backend, DeviceConfig::default(), 1280, 720);

    let mut pipeline_builder = RayTracingPipelineBuilder::new("Scene");
    pipeline_builder.library(
        vec![0u8; 64],
        vec![
            LibraryExport::new("rayGen", ShaderStage::RayGeneration),
            LibraryExport::new("miss", ShaderStage::Miss),
            LibraryExport::new("chs", ShaderStage::ClosestHit),
            LibraryExport::new("planeChs", ShaderStage::ClosestHit),
        ],
    );
    pipeline_builder.hit_group(HitGroup::triangles("HitGroup", "chs"));
    pipeline_builder.hit_group(HitGroup::triangles("PlaneHitGroup", "planeChs"));
    let local = pipeline_builder.local_root_signature(RootSignatureHandle(2));
    pipeline_builder.associate(local, ["rayGen", "HitGroup"]);
    pipeline_builder.shader_config(16, 8);
    pipeline_builder.pipeline_config(2);
    pipeline_builder.global_root_signature(RootSignatureHandle(1));
    let desc = pipeline_builder.build().unwrap();
    let pipeline = manager.device().unwrap().create_ray_tracing_pipeline(&desc).unwrap();

    let device = manager.device().unwrap();
    let binding = ShaderBindingLayout::with_instances(2, &[1, 1, 1]).unwrap();
    let layout = ShaderTableLayout::for_binding_layout(device.shader_table_properties(), 1, &binding, 8).unwrap();
    assert_eq!(layout.stride(), 64);

    let output = manager.intermediate_srv_slot().unwrap();
    let output_handle = manager.descriptors().unwrap().gpu_handle(output);
    let identifier = |name: &str| pipeline.shader_identifier(name).unwrap();

    let mut writer = ShaderTableWriter::new(layout).unwrap();
    writer
        .record(ShaderTableZone::RayGeneration, 0)
        .unwrap()
        .identifier(&identifier("rayGen"))
        .unwrap()
        .argument(RootArgument::DescriptorTable(output_handle))
        .unwrap();
    writer.record(ShaderTableZone::Miss, 0).unwrap().identifier(&identifier("miss")).unwrap();
    for instance in 0..binding.instance_count() {
        let hit_group = if instance == 0 { "PlaneHitGroup" } else { "HitGroup" };
        for ray_type in 0..binding.ray_type_count() {
            let index = binding.hit_record_index(instance, 0, ray_type).unwrap();
            let mut record = writer.record(ShaderTableZone::HitGroup, index).unwrap();
            record.identifier(&identifier(hit_group)).unwrap();
            if hit_group == "HitGroup" {
                record.argument(RootArgument::Constant(instance)).unwrap();
            }
        }
    }
    let table = ShaderTable::upload(&manager, &writer).unwrap();

    let dispatch = table.dispatch_rays_desc(1280, 720);
    assert_eq!(dispatch.hit_group.size, 6 * 64);
    assert_eq!(dispatch.hit_group.start - dispatch.ray_generation.start, 2 * 64);

    assert!(manager.bind_descriptor_heap(CommandPass::Scene).is_err());
    manager.begin_pass(CommandPass::Scene, Some(pipeline.handle())).unwrap();
    manager.bind_descriptor_heap(CommandPass::Scene).unwrap();
    let list = manager.current_command_list(CommandPass::Scene).unwrap();
    list.set_ray_tracing_pipeline(pipeline.as_ref());
    list.dispatch_rays(&dispatch);
    manager.execute_frame().unwrap();
    manager.present().unwrap();
    manager.wait_for_gpu().unwrap();

    assert_eq!(control.stats().dispatches, 1);
    assert!(control.validation_errors().is_empty(), "{:?}", control.validation_errors());
}
