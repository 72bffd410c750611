//! Sparse level sets and their linearization

use std::collections::HashMap;

use nalgebra::Point3;

use crate::volume::encode_field;

/// Sparse signed distance field over integer voxel coordinates
///
/// Inactive voxels read as the background value.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseLevelSet {
    voxels: HashMap<[i32; 3], f32>,
    background: f32,
    voxel_size: f32,
}

impl SparseLevelSet {
    /// Create an empty level set
    pub fn new(voxel_size: f32, background: f32) -> Self {
        Self {
            voxels: HashMap::new(),
            background,
            voxel_size,
        }
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn background(&self) -> f32 {
        self.background
    }

    /// Number of active voxels
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Activate a voxel
    pub fn set(&mut self, coord: [i32; 3], value: f32) {
        self.voxels.insert(coord, value);
    }

    /// Value at a voxel, background when inactive
    pub fn get(&self, coord: [i32; 3]) -> f32 {
        self.voxels.get(&coord).copied().unwrap_or(self.background)
    }

    /// Inclusive index-space bounds of the active voxels
    pub fn bounding_box(&self) -> Option<([i32; 3], [i32; 3])> {
        let mut coords = self.voxels.keys();
        let first = *coords.next()?;
        let bounds = coords.fold((first, first), |(mut min, mut max), c| {
            for axis in 0..3 {
                min[axis] = min[axis].min(c[axis]);
                max[axis] = max[axis].max(c[axis]);
            }
            (min, max)
        });
        Some(bounds)
    }

    /// Densify over the bounding box into the linearized field format
    ///
    /// An empty level set linearizes to no bytes. Axes only one voxel thick
    /// are widened by a background voxel so the lattice spans at least one
    /// cube per axis.
    pub fn linearize(&self) -> Vec<u8> {
        let Some((min, mut max)) = self.bounding_box() else {
            return Vec::new();
        };
        for axis in 0..3 {
            if max[axis] == min[axis] {
                max[axis] += 1;
            }
        }

        let counts = [
            (max[0] - min[0] + 1) as u32,
            (max[1] - min[1] + 1) as u32,
            (max[2] - min[2] + 1) as u32,
        ];
        let mut samples = Vec::with_capacity(counts.iter().map(|&c| c as usize).product());
        for z in min[2]..=max[2] {
            for y in min[1]..=max[1] {
                for x in min[0]..=max[0] {
                    samples.push(self.get([x, y, z]));
                }
            }
        }

        encode_field(min, counts, self.voxel_size, self.background, &samples)
    }
}

/// Build a signed distance sphere
///
/// Values are clamped to `±half_width` voxels. Voxels outside the narrow band
/// stay inactive; the interior is filled so it never reads as background.
pub fn level_set_sphere(radius: f32, center: Point3<f32>, voxel_size: f32, half_width: f32) -> SparseLevelSet {
    let band = half_width * voxel_size;
    let mut level_set = SparseLevelSet::new(voxel_size, band);

    let reach = radius + band;
    let lo = |c: f32| ((c - reach) / voxel_size).floor() as i32;
    let hi = |c: f32| ((c + reach) / voxel_size).ceil() as i32;

    for z in lo(center.z)..=hi(center.z) {
        for y in lo(center.y)..=hi(center.y) {
            for x in lo(center.x)..=hi(center.x) {
                let p = Point3::new(x as f32, y as f32, z as f32) * voxel_size;
                let distance = (p - center).norm() - radius;
                if distance < band {
                    level_set.set([x, y, z], distance.max(-band));
                }
            }
        }
    }

    level_set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeGrid;

    #[test]
    fn test_empty_level_set_linearizes_to_nothing() {
        let level_set = SparseLevelSet::new(1.0, 3.0);
        assert!(level_set.bounding_box().is_none());
        assert!(level_set.linearize().is_empty());
    }

    #[test]
    fn test_bounding_box_and_background() {
        let mut level_set = SparseLevelSet::new(0.5, 2.0);
        level_set.set([1, -2, 0], -1.0);
        level_set.set([3, 4, 0], 0.5);
        assert_eq!(level_set.bounding_box(), Some(([1, -2, 0], [3, 4, 0])));

        let grid = VolumeGrid::from_bytes(level_set.linearize()).unwrap();
        assert_eq!(grid.header().point_counts, [3, 7, 2]);
        assert_eq!(grid.header().bbox_min, [1, -2, 0]);
        assert_eq!(grid.sample(0, 0, 0), -1.0);
        assert_eq!(grid.sample(2, 6, 0), 0.5);
        assert_eq!(grid.sample(1, 1, 1), 2.0);
    }

    #[test]
    fn test_sphere_signs() {
        let sphere = level_set_sphere(4.0, Point3::origin(), 1.0, 3.0);
        assert!(sphere.get([0, 0, 0]) < 0.0);
        assert!(sphere.get([4, 0, 0]).abs() < 1e-5);
        assert!(sphere.get([6, 0, 0]) > 0.0);
        assert_eq!(sphere.get([20, 0, 0]), sphere.background());

        let (min, max) = sphere.bounding_box().unwrap();
        assert_eq!(min, [-6, -6, -6]);
        assert_eq!(max, [6, 6, 6]);
    }
}
