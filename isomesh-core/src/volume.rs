//! Volume snapshots and the linearized field format
//!
//! A linearized field is a 48-byte [`FieldHeader`] followed by one little-endian
//! `f32` sample per lattice point, x fastest. The cube lattice always has one
//! fewer cell than points on each axis.

use std::io::{Read, Write};

use bytemuck::{Pod, Zeroable};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Magic bytes opening every linearized field
pub const FIELD_MAGIC: [u8; 4] = *b"ISOV";

/// Current linearized field version
pub const FIELD_VERSION: u32 = 1;

/// Size of the field header in bytes
pub const FIELD_HEADER_SIZE: usize = std::mem::size_of::<FieldHeader>();

/// Header of a linearized field
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct FieldHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub bbox_min: [i32; 3],
    pub point_counts: [u32; 3],
    pub voxel_size: f32,
    pub background: f32,
    pub reserved: [u32; 2],
}

/// Cube counts of the marching cubes lattice along each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatticeDimensions {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl LatticeDimensions {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Dimensions of the lattice spanned by `point_counts` samples
    pub fn from_point_counts(point_counts: [u32; 3]) -> Self {
        Self::new(
            point_counts[0].saturating_sub(1),
            point_counts[1].saturating_sub(1),
            point_counts[2].saturating_sub(1),
        )
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Number of lattice cubes
    pub fn total_cubes(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// Number of lattice points along each axis
    pub fn point_counts(&self) -> [u32; 3] {
        [self.x + 1, self.y + 1, self.z + 1]
    }

    /// Number of lattice points
    pub fn total_points(&self) -> usize {
        self.point_counts().iter().map(|&c| c as usize).product()
    }

    /// Linear cube id of cube `(x, y, z)`
    pub fn linear_index(&self, x: u32, y: u32, z: u32) -> u32 {
        x + self.x * (y + self.y * z)
    }

    /// Cube coordinate of a linear cube id
    pub fn coord_of(&self, linear: u32) -> [u32; 3] {
        let x = linear % self.x;
        let y = (linear / self.x) % self.y;
        let z = linear / (self.x * self.y);
        [x, y, z]
    }

    /// Sample index of lattice point `(x, y, z)`
    pub fn point_index(&self, x: u32, y: u32, z: u32) -> usize {
        let [px, py, _] = self.point_counts();
        x as usize + px as usize * (y as usize + py as usize * z as usize)
    }
}

/// Encode samples into the linearized field format
pub fn encode_field(
    bbox_min: [i32; 3],
    point_counts: [u32; 3],
    voxel_size: f32,
    background: f32,
    samples: &[f32],
) -> Vec<u8> {
    let header = FieldHeader {
        magic: FIELD_MAGIC,
        version: FIELD_VERSION,
        bbox_min,
        point_counts,
        voxel_size,
        background,
        reserved: [0; 2],
    };

    let mut bytes = Vec::with_capacity(FIELD_HEADER_SIZE + samples.len() * 4);
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Immutable snapshot of a linearized scalar field
///
/// Shared as `Arc<VolumeGrid>` between the chunk view and the mesh proxy built
/// from it. Replacing the volume creates a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGrid {
    header: FieldHeader,
    dimensions: LatticeDimensions,
    bytes: Vec<u8>,
}

impl VolumeGrid {
    /// Parse a linearized field, taking ownership of its bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < FIELD_HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "field is {} bytes, shorter than its {}-byte header",
                bytes.len(),
                FIELD_HEADER_SIZE
            )));
        }

        let header: FieldHeader = bytemuck::pod_read_unaligned(&bytes[..FIELD_HEADER_SIZE]);
        if header.magic != FIELD_MAGIC {
            return Err(Error::InvalidData("bad field magic".to_string()));
        }
        if header.version != FIELD_VERSION {
            return Err(Error::Unsupported(format!("field version {}", header.version)));
        }
        if header.point_counts.iter().any(|&c| c < 2) {
            return Err(Error::InvalidData(format!(
                "point counts {:?} span no cubes",
                header.point_counts
            )));
        }
        if !(header.voxel_size > 0.0) {
            return Err(Error::InvalidData(format!(
                "voxel size {} is not positive",
                header.voxel_size
            )));
        }

        let expected = header
            .point_counts
            .iter()
            .try_fold(4u64, |acc, &c| acc.checked_mul(c as u64))
            .ok_or_else(|| Error::InvalidData("point counts overflow".to_string()))?;
        let actual = (bytes.len() - FIELD_HEADER_SIZE) as u64;
        if expected != actual {
            return Err(Error::InvalidData(format!(
                "sample section is {} bytes, point counts {:?} need {}",
                actual, header.point_counts, expected
            )));
        }

        let dimensions = LatticeDimensions::from_point_counts(header.point_counts);
        dimensions
            .x
            .checked_mul(dimensions.y)
            .and_then(|xy| xy.checked_mul(dimensions.z))
            .ok_or_else(|| Error::InvalidData("lattice has more than u32::MAX cubes".to_string()))?;

        Ok(Self {
            header,
            dimensions,
            bytes,
        })
    }

    pub fn header(&self) -> &FieldHeader {
        &self.header
    }

    pub fn dimensions(&self) -> LatticeDimensions {
        self.dimensions
    }

    pub fn voxel_size(&self) -> f32 {
        self.header.voxel_size
    }

    pub fn background(&self) -> f32 {
        self.header.background
    }

    /// World position of lattice point `(0, 0, 0)`
    pub fn origin(&self) -> Point3<f32> {
        let [x, y, z] = self.header.bbox_min;
        Point3::new(x as f32, y as f32, z as f32) * self.header.voxel_size
    }

    /// World position of a lattice point
    pub fn point_position(&self, x: u32, y: u32, z: u32) -> Point3<f32> {
        self.origin() + Vector3::new(x as f32, y as f32, z as f32) * self.header.voxel_size
    }

    /// The complete linearized field
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The sample section uploaded to the GPU
    pub fn sample_bytes(&self) -> &[u8] {
        &self.bytes[FIELD_HEADER_SIZE..]
    }

    /// Field value at a lattice point
    pub fn sample(&self, x: u32, y: u32, z: u32) -> f32 {
        let offset = FIELD_HEADER_SIZE + self.dimensions.point_index(x, y, z) * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        f32::from_le_bytes(raw)
    }

    /// Samples at the eight corners of a cube in corner order
    pub fn cube_corners(&self, x: u32, y: u32, z: u32) -> [f32; 8] {
        let mut corners = [0.0; 8];
        for (value, offset) in corners.iter_mut().zip(crate::tables::CORNER_OFFSETS.iter()) {
            *value = self.sample(x + offset[0], y + offset[1], z + offset[2]);
        }
        corners
    }
}

/// Volume state as stored by the owning chunk view
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedVolume {
    pub bytes: Vec<u8>,
    pub iso_value: f32,
}

impl PersistedVolume {
    /// Write as `u64` LE length, field bytes, then the threshold as `f32` LE
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.bytes.len() as u64).to_le_bytes())?;
        writer.write_all(&self.bytes)?;
        writer.write_all(&self.iso_value.to_le_bytes())?;
        Ok(())
    }

    /// Read the layout produced by [`PersistedVolume::write_to`]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let len = u64::from_le_bytes(len);

        let mut bytes = Vec::new();
        reader.by_ref().take(len).read_to_end(&mut bytes)?;
        if bytes.len() as u64 != len {
            return Err(Error::InvalidData(format!(
                "persisted volume truncated: expected {} bytes, found {}",
                len,
                bytes.len()
            )));
        }

        let mut iso = [0u8; 4];
        reader.read_exact(&mut iso)?;

        Ok(Self {
            bytes,
            iso_value: f32::from_le_bytes(iso),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_field() -> Vec<u8> {
        let counts = [3u32, 2, 2];
        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        encode_field([-1, 0, 2], counts, 0.5, 3.0, &samples)
    }

    #[test]
    fn test_parse_field() {
        let grid = VolumeGrid::from_bytes(ramp_field()).unwrap();
        assert_eq!(grid.dimensions(), LatticeDimensions::new(2, 1, 1));
        assert_eq!(grid.dimensions().total_cubes(), 2);
        assert_eq!(grid.sample_bytes().len(), 12 * 4);
        assert_eq!(grid.sample(2, 0, 0), 2.0);
        assert_eq!(grid.sample(0, 1, 0), 3.0);
        assert_eq!(grid.sample(0, 0, 1), 6.0);
        assert_relative_eq!(grid.origin(), Point3::new(-0.5, 0.0, 1.0));
        assert_relative_eq!(grid.point_position(2, 1, 1), Point3::new(0.5, 0.5, 1.5));
    }

    #[test]
    fn test_parse_rejects_bad_fields() {
        let mut bad_magic = ramp_field();
        bad_magic[0] = b'X';
        assert!(matches!(VolumeGrid::from_bytes(bad_magic), Err(Error::InvalidData(_))));

        let mut truncated = ramp_field();
        truncated.pop();
        assert!(VolumeGrid::from_bytes(truncated).is_err());

        let flat = encode_field([0; 3], [4, 1, 4], 1.0, 1.0, &[0.0; 16]);
        assert!(VolumeGrid::from_bytes(flat).is_err());

        assert!(VolumeGrid::from_bytes(vec![0u8; 10]).is_err());

        let mut future_version = ramp_field();
        future_version[4] = 2;
        assert!(matches!(VolumeGrid::from_bytes(future_version), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_linear_index_round_trips_coordinates() {
        let dims = LatticeDimensions::new(5, 3, 4);
        for linear in 0..dims.total_cubes() {
            let [x, y, z] = dims.coord_of(linear);
            assert!(x < 5 && y < 3 && z < 4);
            assert_eq!(dims.linear_index(x, y, z), linear);
        }
    }

    #[test]
    fn test_persisted_volume_round_trip() {
        let stored = PersistedVolume {
            bytes: ramp_field(),
            iso_value: 0.25,
        };
        let mut blob = Vec::new();
        stored.write_to(&mut blob).unwrap();
        assert_eq!(blob.len(), 8 + stored.bytes.len() + 4);

        let loaded = PersistedVolume::read_from(&mut blob.as_slice()).unwrap();
        assert_eq!(loaded, stored);
    }

    #[test]
    fn test_persisted_empty_volume() {
        let stored = PersistedVolume {
            bytes: Vec::new(),
            iso_value: 0.0,
        };
        let mut blob = Vec::new();
        stored.write_to(&mut blob).unwrap();
        assert_eq!(&blob[..8], &[0u8; 8]);
        assert_eq!(PersistedVolume::read_from(&mut blob.as_slice()).unwrap(), stored);
    }

    #[test]
    fn test_persisted_truncated_blob() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&100u64.to_le_bytes());
        blob.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            PersistedVolume::read_from(&mut blob.as_slice()),
            Err(Error::InvalidData(_))
        ));
    }
}
