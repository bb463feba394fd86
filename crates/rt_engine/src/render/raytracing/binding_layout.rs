//! Hit group indexing shared by the acceleration structure and shader table
//!
//! The hit group record a ray invokes is
//!
//! ```text
//! contribution(instance) + geometry_index * ray_type_count + ray_type
//! ```
//!
//! where `contribution` is written into the instance record and the other
//! two terms come from `TraceRay`. Deriving both the instance records and the
//! hit zone of the shader table from one [`ShaderBindingLayout`] keeps them
//! consistent when instances or geometries are added.

use crate::render::api::{GraphicsError, GraphicsResult};

/// Ray types and per-instance geometry counts of a scene
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBindingLayout {
    ray_type_count: u32,
    geometry_counts: Vec<u32>,
    contributions: Vec<u32>,
    hit_record_count: u32,
}

impl ShaderBindingLayout {
    /// Empty layout tracing `ray_type_count` ray types (primary, shadow, ...)
    pub fn new(ray_type_count: u32) -> GraphicsResult<Self> {
        if ray_type_count == 0 {
            return Err(GraphicsError::OutOfRange { reason: "a layout needs at least one ray type".to_string() });
        }
        Ok(Self { ray_type_count, geometry_counts: Vec::new(), contributions: Vec::new(), hit_record_count: 0 })
    }

    /// Layout for instances with the given geometry counts
    pub fn with_instances(ray_type_count: u32, geometry_counts: &[u32]) -> GraphicsResult<Self> {
        let mut layout = Self::new(ray_type_count)?;
        for &count in geometry_counts {
            layout.add_instance(count)?;
        }
        Ok(layout)
    }

    /// Append an instance whose bottom-level structure has `geometry_count` geometries
    ///
    /// Returns the instance index.
    pub fn add_instance(&mut self, geometry_count: u32) -> GraphicsResult<u32> {
        if geometry_count == 0 {
            return Err(GraphicsError::OutOfRange { reason: "an instance needs at least one geometry".to_string() });
        }
        let records = geometry_count
            .checked_mul(self.ray_type_count)
            .and_then(|records| records.checked_add(self.hit_record_count))
            .ok_or_else(|| GraphicsError::OutOfRange { reason: "hit group record count overflows".to_string() })?;

        self.contributions.push(self.hit_record_count);
        self.geometry_counts.push(geometry_count);
        self.hit_record_count = records;
        Ok((self.geometry_counts.len() - 1) as u32)
    }

    /// Number of ray types
    pub fn ray_type_count(&self) -> u32 {
        self.ray_type_count
    }

    /// Number of instances
    pub fn instance_count(&self) -> u32 {
        self.geometry_counts.len() as u32
    }

    /// Geometries of `instance`
    pub fn geometry_count(&self, instance: u32) -> Option<u32> {
        self.geometry_counts.get(instance as usize).copied()
    }

    /// Value for the instance record's hit group contribution field
    pub fn contribution(&self, instance: u32) -> Option<u32> {
        self.contributions.get(instance as usize).copied()
    }

    /// Multiplier passed to `TraceRay` for the geometry index
    pub fn geometry_multiplier(&self) -> u32 {
        self.ray_type_count
    }

    /// Total hit group records the shader table must hold
    pub fn hit_record_count(&self) -> u32 {
        self.hit_record_count
    }

    /// Hit zone record invoked for a geometry of an instance and a ray type
    pub fn hit_record_index(&self, instance: u32, geometry: u32, ray_type: u32) -> Option<u32> {
        let geometries = self.geometry_count(instance)?;
        if geometry >= geometries || ray_type >= self.ray_type_count {
            return None;
        }
        Some(self.contributions[instance as usize] + geometry * self.ray_type_count + ray_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-geometry instance followed by two single-geometry instances, two ray types
    #[test]
    fn test_mixed_instances() {
        let layout = ShaderBindingLayout::with_instances(2, &[2, 1, 1]).unwrap();
        assert_eq!(layout.instance_count(), 3);
        assert_eq!(layout.contribution(0), Some(0));
        assert_eq!(layout.contribution(1), Some(4));
        assert_eq!(layout.contribution(2), Some(6));
        assert_eq!(layout.hit_record_count(), 8);

        assert_eq!(layout.hit_record_index(0, 1, 0), Some(2));
        assert_eq!(layout.hit_record_index(2, 0, 1), Some(7));
        assert_eq!(layout.hit_record_index(1, 1, 0), None);
        assert_eq!(layout.hit_record_index(1, 0, 2), None);
        assert_eq!(layout.contribution(3), None);
    }

    /// Every record index is reached by exactly one (instance, geometry, ray) triple
    #[test]
    fn test_record_indices_are_dense() {
        let layout = ShaderBindingLayout::with_instances(3, &[1, 4, 2, 1]).unwrap();
        let mut seen = vec![false; layout.hit_record_count() as usize];
        for instance in 0..layout.instance_count() {
            for geometry in 0..layout.geometry_count(instance).unwrap() {
                for ray in 0..layout.ray_type_count() {
                    let index = layout.hit_record_index(instance, geometry, ray).unwrap() as usize;
                    assert!(!seen[index]);
                    seen[index] = true;
                }
            }
        }
        assert!(seen.into_iter().all(|hit| hit));
    }

    #[test]
    fn test_invalid_counts() {
        assert!(ShaderBindingLayout::new(0).is_err());
        let mut layout = ShaderBindingLayout::new(1).unwrap();
        assert!(layout.add_instance(0).is_err());
        assert_eq!(layout.add_instance(3).unwrap(), 0);
        assert_eq!(layout.add_instance(1).unwrap(), 1);
        assert_eq!(layout.geometry_multiplier(), 1);
    }
}
