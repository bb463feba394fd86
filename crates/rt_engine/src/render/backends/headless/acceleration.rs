//! Acceleration structure builds and CPU ray traversal
//!
//! Builds read vertex, index and instance data straight from device memory,
//! so the structure reflects exactly what the CPU wrote into its buffers by
//! the time the build executed. Invalid builds fault the device.

use std::sync::Arc;

use nalgebra::{Matrix4, Point3, Vector3};

use crate::render::api::{
    align_up, AccelerationStructureInputs, BuildFlags, Format, GeometryDesc, GraphicsError,
    GraphicsResult, IndexFormat, PrebuildInfo, ResourceDimension, ResourceFlags, ResourceState,
};
use crate::render::raytracing::instance::{RaytracingInstanceDesc, INSTANCE_DESC_SIZE};

use super::command_list::BuildCommand;
use super::device::DeviceShared;
use super::resources::ResourceInner;

const EPSILON: f32 = 1e-7;

type Triangle = [Point3<f32>; 3];

pub(crate) struct BuiltGeometry {
    triangles: Vec<Triangle>,
}

pub(crate) struct BuiltInstance {
    desc: RaytracingInstanceDesc,
    world_to_object: Option<Matrix4<f32>>,
    bottom: Arc<BuiltStructure>,
}

/// Structure contents as left by the last build into a buffer
pub(crate) enum BuiltStructure {
    Bottom { flags: BuildFlags, geometries: Vec<BuiltGeometry> },
    Top { flags: BuildFlags, instances: Vec<BuiltInstance> },
}

impl BuiltStructure {
    fn flags(&self) -> BuildFlags {
        match self {
            Self::Bottom { flags, .. } | Self::Top { flags, .. } => *flags,
        }
    }
}

/// Ray for [`super::HeadlessDevice::trace_ray`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// World space origin
    pub origin: Point3<f32>,
    /// World space direction (need not be normalized)
    pub direction: Vector3<f32>,
    /// Nearest accepted distance
    pub t_min: f32,
    /// Farthest accepted distance
    pub t_max: f32,
    /// ANDed with each instance mask
    pub mask: u8,
}

impl Ray {
    /// Unbounded ray visible to every instance
    pub fn new(origin: Point3<f32>, direction: Vector3<f32>) -> Self {
        Self { origin, direction, t_min: 0.0, t_max: f32::INFINITY, mask: 0xFF }
    }
}

/// Closest intersection found by a traversal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Distance along the ray in units of its direction
    pub t: f32,
    /// Index of the instance in the top-level structure
    pub instance_index: u32,
    /// User instance id
    pub instance_id: u32,
    /// Geometry index inside the bottom-level structure
    pub geometry_index: u32,
    /// Triangle index inside the geometry
    pub primitive_index: u32,
    /// Barycentrics of the second and third vertex
    pub barycentrics: [f32; 2],
    /// Hit group contribution of the instance
    pub hit_group_contribution: u32,
}

impl RayHit {
    /// Hit zone record a `TraceRay` with these parameters would invoke
    pub fn hit_group_record(&self, geometry_multiplier: u32, ray_type: u32) -> u32 {
        self.hit_group_contribution + self.geometry_index * geometry_multiplier + ray_type
    }
}

/// Memory requirements of a build
pub(crate) fn prebuild_info(inputs: &AccelerationStructureInputs) -> GraphicsResult<PrebuildInfo> {
    let primitives = match inputs {
        AccelerationStructureInputs::BottomLevel { geometries, .. } => {
            if geometries.is_empty() {
                return Err(GraphicsError::OutOfRange { reason: "bottom-level build without geometry".to_string() });
            }
            let mut triangles = 0u64;
            for geometry in geometries {
                if geometry.vertex_format != Format::Rgb32Float {
                    return Err(GraphicsError::Unsupported {
                        feature: format!("vertex format {:?}", geometry.vertex_format),
                    });
                }
                triangles += u64::from(geometry.triangle_count());
            }
            triangles
        }
        AccelerationStructureInputs::TopLevel { instance_count, .. } => u64::from(*instance_count),
    };

    Ok(PrebuildInfo {
        result_data_max_size: align_up(256 + 64 * primitives, 256),
        scratch_data_size: align_up(256 + 32 * primitives, 256),
        update_scratch_data_size: align_up(256 + 16 * primitives, 256),
    })
}

/// Execute a build; returns whether it was a refit
pub(crate) fn execute_build(device: &DeviceShared, build: &BuildCommand) -> Result<bool, String> {
    let dest = build.dest.upgrade().ok_or("destination buffer destroyed")?;
    let scratch = build.scratch.upgrade().ok_or("scratch buffer destroyed")?;
    let flags = build.inputs.flags();
    let refit = flags.contains(BuildFlags::PERFORM_UPDATE);
    let info = prebuild_info(&build.inputs).map_err(|e| e.to_string())?;

    if !dest.flags.contains(ResourceFlags::ACCELERATION_STRUCTURE) {
        return Err(format!("'{}' is not acceleration structure storage", dest.name));
    }
    require_state(&dest, ResourceState::AccelerationStructure)?;
    require_state(&scratch, ResourceState::UnorderedAccess)?;
    if buffer_size(&dest) < info.result_data_max_size {
        return Err(format!("'{}' is smaller than the {} byte result", dest.name, info.result_data_max_size));
    }
    let scratch_needed = if refit { info.update_scratch_data_size } else { info.scratch_data_size };
    if buffer_size(&scratch) < scratch_needed {
        return Err(format!("'{}' is smaller than the {} byte scratch", scratch.name, scratch_needed));
    }

    let previous = if refit {
        let source = build.source.as_ref().and_then(std::sync::Weak::upgrade).ok_or("refit source missing")?;
        let previous = device.structure(source.address).ok_or("refit source was never built")?;
        if !previous.flags().contains(BuildFlags::ALLOW_UPDATE) || !flags.contains(BuildFlags::ALLOW_UPDATE) {
            return Err("refit of a structure built without ALLOW_UPDATE".to_string());
        }
        Some(previous)
    } else {
        None
    };

    let structure = match &build.inputs {
        AccelerationStructureInputs::BottomLevel { geometries, .. } => {
            let geometries = geometries
                .iter()
                .map(|geometry| read_geometry(device, geometry))
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(BuiltStructure::Bottom { geometries: old, .. }) = previous.as_deref() {
                let same_shape = old.len() == geometries.len()
                    && old.iter().zip(&geometries).all(|(a, b)| a.triangles.len() == b.triangles.len());
                if !same_shape {
                    return Err("bottom-level refit changed the geometry layout".to_string());
                }
            }
            BuiltStructure::Bottom { flags, geometries }
        }
        AccelerationStructureInputs::TopLevel { instance_count, instance_descs, .. } => {
            let instances = read_instances(device, *instance_descs, *instance_count)?;
            match previous.as_deref() {
                Some(BuiltStructure::Top { instances: old, .. }) if old.len() != instances.len() => {
                    return Err(format!("refit changed the instance count from {} to {}", old.len(), instances.len()));
                }
                Some(BuiltStructure::Bottom { .. }) => {
                    return Err("top-level refit of a bottom-level source".to_string());
                }
                _ => {}
            }
            BuiltStructure::Top { flags, instances }
        }
    };

    device.store_structure(dest.address, structure);
    Ok(refit)
}

fn buffer_size(resource: &ResourceInner) -> u64 {
    match resource.dimension {
        ResourceDimension::Buffer { size } => size,
        ResourceDimension::Texture2D { .. } => 0,
    }
}

fn require_state(resource: &ResourceInner, expected: ResourceState) -> Result<(), String> {
    let state = *resource.state.lock();
    if state == expected {
        Ok(())
    } else {
        Err(format!("'{}' is in {:?} instead of {:?}", resource.name, state, expected))
    }
}

fn read_geometry(device: &DeviceShared, geometry: &GeometryDesc) -> Result<BuiltGeometry, String> {
    let vertex_count = u64::from(geometry.vertex_count);
    if vertex_count == 0 {
        return Ok(BuiltGeometry { triangles: Vec::new() });
    }
    let span = (vertex_count - 1) * geometry.vertex_stride + 12;
    let vertex_bytes = device
        .read_memory(geometry.vertex_buffer, span)
        .ok_or_else(|| {
            format!("vertex buffer at {:#x} does not hold {} vertices", geometry.vertex_buffer, vertex_count)
        })?;
    let vertex = |index: u64| -> Result<Point3<f32>, String> {
        if index >= vertex_count {
            return Err(format!("index {} out of {} vertices", index, vertex_count));
        }
        let start = usize::try_from(index * geometry.vertex_stride).map_err(|e| e.to_string())?;
        let position: [f32; 3] = bytemuck::pod_read_unaligned(&vertex_bytes[start..start + 12]);
        Ok(Point3::from(position))
    };

    let indices: Vec<u64> = match geometry.index_buffer {
        Some(index_buffer) => {
            let bytes = device
                .read_memory(index_buffer.address, u64::from(index_buffer.count) * index_buffer.format.size())
                .ok_or_else(|| format!("index buffer at {:#x} is too small", index_buffer.address))?;
            match index_buffer.format {
                IndexFormat::U16 => {
                    bytes.chunks_exact(2).map(|c| u64::from(u16::from_le_bytes([c[0], c[1]]))).collect()
                }
                IndexFormat::U32 => bytes
                    .chunks_exact(4)
                    .map(|c| u64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect(),
            }
        }
        None => (0..vertex_count).collect(),
    };

    let triangles = indices
        .chunks_exact(3)
        .map(|corners| -> Result<Triangle, String> {
            Ok([vertex(corners[0])?, vertex(corners[1])?, vertex(corners[2])?])
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(BuiltGeometry { triangles })
}

fn read_instances(device: &DeviceShared, address: u64, count: u32) -> Result<Vec<BuiltInstance>, String> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let bytes = device
        .read_memory(address, u64::from(count) * INSTANCE_DESC_SIZE)
        .ok_or_else(|| format!("instance buffer at {:#x} does not hold {} records", address, count))?;

    bytes
        .chunks_exact(INSTANCE_DESC_SIZE as usize)
        .map(|record| -> Result<BuiltInstance, String> {
            let desc: RaytracingInstanceDesc = bytemuck::pod_read_unaligned(record);
            let bottom = device
                .structure(desc.acceleration_structure)
                .filter(|structure| matches!(**structure, BuiltStructure::Bottom { .. }))
                .ok_or_else(|| {
                    format!(
                        "instance references {:#x}, not a built bottom-level structure",
                        desc.acceleration_structure
                    )
                })?;
            Ok(BuiltInstance { desc, world_to_object: desc.transform_matrix().try_inverse(), bottom })
        })
        .collect()
}

/// Closest hit of `ray` against a top-level structure
pub(crate) fn trace(structure: &BuiltStructure, ray: &Ray) -> GraphicsResult<Option<RayHit>> {
    let BuiltStructure::Top { instances, .. } = structure else {
        return Err(GraphicsError::invalid("rays are traced against top-level structures"));
    };

    let mut closest: Option<RayHit> = None;
    for (instance_index, instance) in instances.iter().enumerate() {
        if instance.desc.mask() & ray.mask == 0 {
            continue;
        }
        let Some(world_to_object) = instance.world_to_object else { continue };
        let BuiltStructure::Bottom { geometries, .. } = instance.bottom.as_ref() else { continue };

        let origin = world_to_object.transform_point(&ray.origin);
        let direction = world_to_object.transform_vector(&ray.direction);
        for (geometry_index, geometry) in geometries.iter().enumerate() {
            for (primitive_index, triangle) in geometry.triangles.iter().enumerate() {
                let Some((t, u, v)) = intersect(&origin, &direction, triangle) else { continue };
                let t_max = closest.map_or(ray.t_max, |hit| hit.t);
                if t < ray.t_min || t >= t_max {
                    continue;
                }
                closest = Some(RayHit {
                    t,
                    instance_index: instance_index as u32,
                    instance_id: instance.desc.instance_id(),
                    geometry_index: geometry_index as u32,
                    primitive_index: primitive_index as u32,
                    barycentrics: [u, v],
                    hit_group_contribution: instance.desc.hit_group_contribution(),
                });
            }
        }
    }
    Ok(closest)
}

/// Möller–Trumbore; returns (t, u, v) for hits in front of the origin
fn intersect(origin: &Point3<f32>, direction: &Vector3<f32>, triangle: &Triangle) -> Option<(f32, f32, f32)> {
    let edge1 = triangle[1] - triangle[0];
    let edge2 = triangle[2] - triangle[0];
    let p = direction.cross(&edge2);
    let det = edge1.dot(&p);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - triangle[0];
    let u = s.dot(&p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(&edge1);
    let v = direction.dot(&q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(&q) * inv_det;
    (t > EPSILON).then_some((t, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_intersect_front_and_behind() {
        let triangle = [Point3::new(-1.0, -1.0, 0.0), Point3::new(1.0, -1.0, 0.0), Point3::new(0.0, 1.0, 0.0)];
        let (t, _, _) = intersect(&Point3::new(0.0, 0.0, -2.0), &Vector3::z(), &triangle).unwrap();
        assert_relative_eq!(t, 2.0);
        assert!(intersect(&Point3::new(0.0, 0.0, 2.0), &Vector3::z(), &triangle).is_none());
        assert!(intersect(&Point3::new(5.0, 0.0, -2.0), &Vector3::z(), &triangle).is_none());
    }

    #[test]
    fn test_prebuild_sizes_grow_with_primitives() {
        let small = prebuild_info(&AccelerationStructureInputs::TopLevel {
            flags: BuildFlags::ALLOW_UPDATE,
            instance_count: 1,
            instance_descs: 0,
        })
        .unwrap();
        let large = prebuild_info(&AccelerationStructureInputs::TopLevel {
            flags: BuildFlags::ALLOW_UPDATE,
            instance_count: 100,
            instance_descs: 0,
        })
        .unwrap();
        assert!(large.result_data_max_size > small.result_data_max_size);
        assert!(small.update_scratch_data_size <= small.scratch_data_size);
        assert_eq!(small.result_data_max_size % 256, 0);
    }

    #[test]
    fn test_prebuild_rejects_empty_bottom_level() {
        let inputs = AccelerationStructureInputs::BottomLevel { flags: BuildFlags::empty(), geometries: Vec::new() };
        assert!(prebuild_info(&inputs).is_err());
    }
}
