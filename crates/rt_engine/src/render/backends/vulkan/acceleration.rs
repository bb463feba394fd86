//! Acceleration structure build inputs in Vulkan form

use ash::vk;

use crate::render::api::{AccelerationStructureInputs, BuildFlags, GpuVirtualAddress};

use super::conv;

/// Geometries and ranges of one build, kept together so pointers stay valid
pub(crate) struct BuildGeometry {
    kind: vk::AccelerationStructureTypeKHR,
    geometries: Vec<vk::AccelerationStructureGeometryKHR>,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl BuildGeometry {
    pub fn new(inputs: &AccelerationStructureInputs) -> Self {
        match inputs {
            AccelerationStructureInputs::BottomLevel { geometries, .. } => {
                let (geometries, ranges) = geometries
                    .iter()
                    .map(|geometry| {
                        let index = geometry.index_buffer;
                        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                            .vertex_format(conv::format(geometry.vertex_format))
                            .vertex_data(device_address(geometry.vertex_buffer))
                            .vertex_stride(geometry.vertex_stride)
                            .max_vertex(geometry.vertex_count.saturating_sub(1))
                            .index_type(conv::index_type(index.map(|index| index.format)))
                            .index_data(device_address(index.map_or(0, |index| index.address)))
                            .build();
                        let built = vk::AccelerationStructureGeometryKHR::builder()
                            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                            .flags(conv::geometry_flags(geometry.flags))
                            .build();
                        (built, range(geometry.triangle_count()))
                    })
                    .unzip();
                Self { kind: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, geometries, ranges }
            }
            AccelerationStructureInputs::TopLevel { instance_count, instance_descs, .. } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(device_address(*instance_descs))
                    .build();
                let geometry = vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                    .build();
                Self {
                    kind: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    geometries: vec![geometry],
                    ranges: vec![range(*instance_count)],
                }
            }
        }
    }

    /// Build info without destination, source or scratch
    pub fn info(&self, flags: BuildFlags) -> vk::AccelerationStructureBuildGeometryInfoKHR {
        vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(self.kind)
            .flags(conv::build_flags(flags))
            .mode(conv::build_mode(flags))
            .geometries(&self.geometries)
            .build()
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.ranges.iter().map(|range| range.primitive_count).collect()
    }

    pub fn ranges(&self) -> &[vk::AccelerationStructureBuildRangeInfoKHR] {
        &self.ranges
    }
}

fn device_address(address: GpuVirtualAddress) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR { device_address: address }
}

fn range(primitive_count: u32) -> vk::AccelerationStructureBuildRangeInfoKHR {
    vk::AccelerationStructureBuildRangeInfoKHR::builder().primitive_count(primitive_count).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::GeometryDesc;

    #[test]
    fn test_bottom_level_ranges() {
        let inputs = AccelerationStructureInputs::BottomLevel {
            flags: BuildFlags::PREFER_FAST_TRACE,
            geometries: vec![GeometryDesc::opaque_triangles(0x1000, 6), GeometryDesc::opaque_triangles(0x2000, 3)],
        };
        let geometry = BuildGeometry::new(&inputs);
        assert_eq!(geometry.primitive_counts(), vec![2, 1]);
        let info = geometry.info(inputs.flags());
        assert_eq!(info.ty, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(info.geometry_count, 2);
    }

    /// A refit request switches the build mode
    #[test]
    fn test_top_level_update_mode() {
        let inputs = AccelerationStructureInputs::TopLevel {
            flags: BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE,
            instance_count: 3,
            instance_descs: 0x4000,
        };
        let geometry = BuildGeometry::new(&inputs);
        assert_eq!(geometry.primitive_counts(), vec![3]);
        assert_eq!(geometry.info(inputs.flags()).mode, vk::BuildAccelerationStructureModeKHR::UPDATE);
    }
}
