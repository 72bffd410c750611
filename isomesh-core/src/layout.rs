//! Memory layouts shared with the marching cubes kernels
//!
//! Every type here is `#[repr(C)]` and mirrors a WGSL struct field for field.
//! Size assertions in the tests guard the WGSL alignment rules.

use bytemuck::{Pod, Zeroable};
use nalgebra::Vector3;

use crate::tables::{CASE_INFO, TRIANGLE_TABLE};
use crate::volume::VolumeGrid;

/// Uniform parameters read by all three kernels
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MarchingCubesUniforms {
    pub dimensions: [u32; 3],
    pub total_cubes: u32,
    pub point_counts: [u32; 3],
    pub iso_value: f32,
    pub origin: [f32; 3],
    pub voxel_size: f32,
}

impl MarchingCubesUniforms {
    /// Build the kernel parameters for a volume snapshot
    pub fn from_grid(grid: &VolumeGrid, iso_value: f32) -> Self {
        let dims = grid.dimensions();
        let origin = grid.origin();
        Self {
            dimensions: dims.as_array(),
            total_cubes: dims.total_cubes(),
            point_counts: dims.point_counts(),
            iso_value,
            origin: [origin.x, origin.y, origin.z],
            voxel_size: grid.voxel_size(),
        }
    }
}

/// The four per-run atomic counters
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GenerationCounters {
    pub non_empty_cubes: u32,
    pub vertices: u32,
    pub indices: u32,
    pub reserved: u32,
}

impl GenerationCounters {
    /// Byte size of the counter buffer
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Decode counters from a readback
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE as usize)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Triangle count implied by the index total
    pub fn primitives(&self) -> u32 {
        self.indices / 3
    }
}

/// Exclusive prefix-sum offsets of one compacted cube
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexIndexOffset {
    pub vertex: u32,
    pub index: u32,
}

/// One output vertex: position plus a 4x8 snorm packed normal
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub packed_normal: u32,
}

impl MeshVertex {
    /// Vertex stride in bytes
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    /// Unpacked normal
    pub fn normal(&self) -> Vector3<f32> {
        unpack_normal(self.packed_normal)
    }
}

/// Index stride in bytes
pub const INDEX_STRIDE: u64 = std::mem::size_of::<u32>() as u64;

/// Pack a unit normal the way WGSL `pack4x8snorm` does (w = 0)
pub fn pack_normal(normal: &Vector3<f32>) -> u32 {
    let components = [normal.x, normal.y, normal.z, 0.0];
    components.iter().enumerate().fold(0u32, |packed, (i, &c)| {
        let quantized = (0.5 + 127.0 * c.clamp(-1.0, 1.0)).floor() as i8;
        packed | ((quantized as u8 as u32) << (8 * i))
    })
}

/// Inverse of [`pack_normal`], matching WGSL `unpack4x8snorm`
pub fn unpack_normal(packed: u32) -> Vector3<f32> {
    let component = |i: u32| {
        let byte = ((packed >> (8 * i)) & 0xff) as u8 as i8;
        (byte as f32 / 127.0).max(-1.0)
    };
    Vector3::new(component(0), component(1), component(2))
}

/// Triangulation table row as uploaded to the GPU
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct CaseEntry {
    pub edge_mask: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub _padding: u32,
    pub edges: [u32; 16],
}

/// All 256 table rows in upload order
pub fn case_entries() -> Vec<CaseEntry> {
    CASE_INFO
        .iter()
        .zip(TRIANGLE_TABLE.iter())
        .map(|(info, row)| {
            let mut edges = [u32::MAX; 16];
            for (slot, &edge) in edges.iter_mut().zip(row.iter()) {
                if edge >= 0 {
                    *slot = edge as u32;
                }
            }
            CaseEntry {
                edge_mask: info.edge_mask as u32,
                vertex_count: info.vertex_count,
                index_count: info.index_count,
                _padding: 0,
                edges,
            }
        })
        .collect()
}
