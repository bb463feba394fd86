//! Shared fixtures and cross-module scenarios, all on the headless backend

mod scenarios;

use std::sync::Arc;

use crate::render::api::{
    BufferDesc, DeviceConfig, FeatureLevel, GeometryDesc, GpuPreference, GpuResource, GraphicsBackend,
    GraphicsDevice, Rect,
};
use crate::render::backends::headless::{HeadlessBackend, HeadlessSurface};
use crate::render::device::SwapchainManager;

/// Route `log` output through the test harness; repeated calls are no-ops
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Device on the backend's preferred adapter, without a swapchain manager
pub(crate) fn headless_device(backend: HeadlessBackend) -> (HeadlessBackend, Arc<dyn GraphicsDevice>) {
    init_logging();
    let instance = backend.create_instance(false).unwrap();
    let adapters = instance.enumerate_adapters(GpuPreference::HighPerformance).unwrap();
    let device = instance.create_device(&adapters[0], FeatureLevel::L11_0).unwrap();
    (backend, device)
}

/// Window rectangle in desktop coordinates
pub(crate) fn window_at(x: i32, y: i32, width: u32, height: u32) -> Rect {
    Rect::new(x, y, x + width as i32, y + height as i32)
}

/// Manager with device and window resources created for a `width` x `height` window at the origin
pub(crate) fn headless_manager(
    backend: HeadlessBackend,
    config: DeviceConfig,
    width: u32,
    height: u32,
) -> (SwapchainManager, HeadlessSurface) {
    init_logging();
    let surface = HeadlessSurface::new(window_at(0, 0, width, height));
    let mut manager = SwapchainManager::new(Box::new(backend), config).unwrap();
    manager.set_window(Box::new(surface.clone()), width, height);
    manager.create_device_resources().unwrap();
    manager.create_window_size_dependent_resources().unwrap();
    (manager, surface)
}

/// Upright triangle around the origin in the z = 0 plane
pub(crate) fn triangle_geometry(manager: &SwapchainManager) -> (Arc<dyn GpuResource>, GeometryDesc) {
    upload_vertices(manager, "Triangle vertices", &[[0.0, 1.0, 0.0], [0.866, -0.5, 0.0], [-0.866, -0.5, 0.0]])
}

/// Floor quad below the triangle
pub(crate) fn plane_geometry(manager: &SwapchainManager) -> (Arc<dyn GpuResource>, GeometryDesc) {
    upload_vertices(
        manager,
        "Plane vertices",
        &[
            [-1.5, -0.8, 1.5],
            [-1.5, -0.8, -1.5],
            [1.5, -0.8, 1.5],
            [1.5, -0.8, 1.5],
            [-1.5, -0.8, -1.5],
            [1.5, -0.8, -1.5],
        ],
    )
}

fn upload_vertices(
    manager: &SwapchainManager,
    name: &str,
    vertices: &[[f32; 3]],
) -> (Arc<dyn GpuResource>, GeometryDesc) {
    let bytes: &[u8] = bytemuck::cast_slice(vertices);
    let buffer = manager.device().unwrap().create_buffer(&BufferDesc::upload(name, bytes.len() as u64)).unwrap();
    buffer.write_bytes(0, bytes).unwrap();
    let geometry = GeometryDesc::opaque_triangles(buffer.gpu_virtual_address(), vertices.len() as u32);
    (buffer, geometry)
}
