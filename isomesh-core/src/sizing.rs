//! Buffer sizing for compaction tables and mesh buffers

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::{GenerationCounters, MeshVertex, VertexIndexOffset, INDEX_STRIDE};
use crate::tables::{MAX_INDICES_PER_CUBE, MAX_VERTICES_PER_CUBE};

/// How data-dependent buffers are sized during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferSizingPolicy {
    /// Read the counters back between passes and size buffers exactly
    #[default]
    Measured,
    /// Size everything for the largest possible output, no intermediate readback
    WorstCase,
}

/// Number of compaction slots to allocate
///
/// With no non-empty cubes the full lattice is used so the generator still
/// binds a valid buffer.
pub fn compaction_capacity(non_empty_cubes: u32, total_cubes: u32) -> u32 {
    if non_empty_cubes == 0 {
        total_cubes.max(1)
    } else {
        non_empty_cubes
    }
}

/// Byte sizes of the three compaction tables for `capacity` slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSizes {
    pub capacity: u32,
    pub linear_ids: u64,
    pub cube_indices: u64,
    pub offsets: u64,
}

impl CompactionSizes {
    pub fn for_capacity(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            linear_ids: capacity as u64 * 4,
            cube_indices: capacity as u64 * 4,
            offsets: capacity as u64 * std::mem::size_of::<VertexIndexOffset>() as u64,
        }
    }
}

/// Byte sizes of the vertex and index buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBufferSizes {
    pub vertex_bytes: u64,
    pub index_bytes: u64,
}

impl MeshBufferSizes {
    /// Exact sizes for measured totals, never below one element
    pub fn for_counts(vertices: u32, indices: u32) -> Self {
        Self {
            vertex_bytes: vertices.max(1) as u64 * MeshVertex::STRIDE,
            index_bytes: indices.max(1) as u64 * INDEX_STRIDE,
        }
    }

    /// Sizes from a counter readback
    pub fn for_counters(counters: &GenerationCounters) -> Self {
        Self::for_counts(counters.vertices, counters.indices)
    }

    /// Upper bound for a lattice of `total_cubes` cubes
    pub fn worst_case(total_cubes: u32) -> Self {
        let cubes = total_cubes.max(1) as u64;
        Self {
            vertex_bytes: cubes * MAX_VERTICES_PER_CUBE as u64 * MeshVertex::STRIDE,
            index_bytes: cubes * MAX_INDICES_PER_CUBE as u64 * INDEX_STRIDE,
        }
    }

    /// Whether buffers sized `self` can hold `counters`
    pub fn holds(&self, counters: &GenerationCounters) -> bool {
        self.vertex_bytes >= counters.vertices as u64 * MeshVertex::STRIDE
            && self.index_bytes >= counters.indices as u64 * INDEX_STRIDE
    }
}

/// Reject an allocation the device cannot satisfy
pub fn ensure_within_limit(label: &str, size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(Error::resource(
            label,
            format!("{} bytes exceeds the device limit of {} bytes", size, limit),
        ));
    }
    Ok(())
}

/// A buffer is reallocated only when its required size changes
pub fn needs_resize(current: Option<u64>, required: u64) -> bool {
    current != Some(required)
}
