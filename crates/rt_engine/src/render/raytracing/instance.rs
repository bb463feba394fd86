//! Top-level instance records
//!
//! The layout matches the 64-byte instance record consumed by acceleration
//! structure builds on both DXR and Vulkan:
//!
//! ```text
//! offset  0  f32 transform[3][4]   row-major 3x4 object-to-world
//! offset 48  u32 instance_id:24 | mask:8
//! offset 52  u32 hit_group_contribution:24 | flags:8
//! offset 56  u64 bottom-level structure address
//! ```

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use nalgebra::Matrix4;

use crate::render::api::{GpuVirtualAddress, GraphicsError, GraphicsResult};

/// Size of one instance record in bytes
pub const INSTANCE_DESC_SIZE: u64 = std::mem::size_of::<RaytracingInstanceDesc>() as u64;

const FIELD_24_MAX: u32 = (1 << 24) - 1;

bitflags! {
    /// Per-instance traversal flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        /// Disable back-face culling
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        /// Counter-clockwise triangles are front facing
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        /// Treat every geometry as opaque
        const FORCE_OPAQUE = 1 << 2;
        /// Treat every geometry as non-opaque
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

/// GPU instance record
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RaytracingInstanceDesc {
    /// Object-to-world transform, first three rows
    pub transform: [[f32; 4]; 3],
    instance_id_and_mask: u32,
    contribution_and_flags: u32,
    /// Address of the bottom-level structure
    pub acceleration_structure: GpuVirtualAddress,
}

impl RaytracingInstanceDesc {
    /// Record visible to every ray (mask 0xFF)
    ///
    /// `instance_id` and `hit_group_contribution` are 24-bit fields.
    pub fn new(
        transform: &Matrix4<f32>,
        instance_id: u32,
        hit_group_contribution: u32,
        flags: InstanceFlags,
        acceleration_structure: GpuVirtualAddress,
    ) -> GraphicsResult<Self> {
        if instance_id > FIELD_24_MAX || hit_group_contribution > FIELD_24_MAX {
            return Err(GraphicsError::OutOfRange {
                reason: format!(
                    "instance id {} / hit group contribution {} exceed 24 bits",
                    instance_id, hit_group_contribution
                ),
            });
        }
        Ok(Self {
            transform: Self::rows(transform),
            instance_id_and_mask: instance_id | (0xFF << 24),
            contribution_and_flags: hit_group_contribution | (u32::from(flags.bits()) << 24),
            acceleration_structure,
        })
    }

    fn rows(transform: &Matrix4<f32>) -> [[f32; 4]; 3] {
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = transform[(r, c)];
            }
        }
        rows
    }

    /// Replace the transform, keeping everything else
    pub fn set_transform(&mut self, transform: &Matrix4<f32>) {
        self.transform = Self::rows(transform);
    }

    /// Transform expanded back to a 4x4 matrix
    pub fn transform_matrix(&self) -> Matrix4<f32> {
        let t = &self.transform;
        Matrix4::new(
            t[0][0], t[0][1], t[0][2], t[0][3],
            t[1][0], t[1][1], t[1][2], t[1][3],
            t[2][0], t[2][1], t[2][2], t[2][3],
            0.0, 0.0, 0.0, 1.0,
        )
    }

    /// User instance id (`InstanceID()` in shaders)
    pub const fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & FIELD_24_MAX
    }

    /// Visibility mask ANDed with the ray mask
    pub const fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    /// Offset of this instance's first hit group record
    pub const fn hit_group_contribution(&self) -> u32 {
        self.contribution_and_flags & FIELD_24_MAX
    }

    /// Traversal flags
    pub const fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.contribution_and_flags >> 24) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_record_is_64_bytes() {
        assert_eq!(INSTANCE_DESC_SIZE, 64);
        assert_eq!(std::mem::align_of::<RaytracingInstanceDesc>(), 8);
    }

    /// The translation lands in the fourth column of each row
    #[test]
    fn test_transform_rows() {
        let transform = Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0));
        let desc = RaytracingInstanceDesc::new(&transform, 5, 4, InstanceFlags::empty(), 0x1000).unwrap();

        assert_relative_eq!(desc.transform[0][3], 1.0);
        assert_relative_eq!(desc.transform[1][3], 2.0);
        assert_relative_eq!(desc.transform[2][3], 3.0);
        assert_relative_eq!(desc.transform[0][0], 1.0);
        assert_relative_eq!(desc.transform_matrix(), transform);
    }

    #[test]
    fn test_bitfield_packing() {
        let desc = RaytracingInstanceDesc::new(
            &Matrix4::identity(),
            0x12_3456,
            6,
            InstanceFlags::TRIANGLE_CULL_DISABLE,
            0xDEAD_0000,
        )
        .unwrap();

        assert_eq!(desc.instance_id(), 0x12_3456);
        assert_eq!(desc.mask(), 0xFF);
        assert_eq!(desc.hit_group_contribution(), 6);
        assert_eq!(desc.flags(), InstanceFlags::TRIANGLE_CULL_DISABLE);

        let bytes = bytemuck::bytes_of(&desc);
        assert_eq!(&bytes[48..52], &0xFF12_3456u32.to_le_bytes());
        assert_eq!(&bytes[52..56], &0x0100_0006u32.to_le_bytes());
        assert_eq!(&bytes[56..64], &0xDEAD_0000u64.to_le_bytes());
    }

    #[test]
    fn test_field_overflow() {
        let result = RaytracingInstanceDesc::new(&Matrix4::identity(), 1 << 24, 0, InstanceFlags::empty(), 0);
        assert!(matches!(result, Err(GraphicsError::OutOfRange { .. })));
    }
}
