//! GPU buffers owned by a volume, a run, and a mesh

use std::sync::Arc;

use isomesh_core::{
    needs_resize, CompactionSizes, GenerationCounters, MeshBufferSizes, Result, VolumeGrid,
};

use crate::device::GpuContext;

/// Buffers tied to one volume snapshot, created on its first run
pub struct VolumeBuffers {
    pub field: Arc<wgpu::Buffer>,
    pub cube_indices: Arc<wgpu::Buffer>,
    pub counters: Arc<wgpu::Buffer>,
    pub total_cubes: u32,
}

impl VolumeBuffers {
    /// Upload the field samples and allocate the per-cube case table
    pub fn upload(gpu: &GpuContext, grid: &VolumeGrid) -> Result<Self> {
        let total_cubes = grid.dimensions().total_cubes();
        let field = gpu.try_create_storage_buffer_init("isomesh field", grid.sample_bytes(), wgpu::BufferUsages::empty())?;
        let cube_indices = gpu.try_create_storage_buffer(
            "cube index offsets",
            total_cubes.max(1) as u64 * 4,
            wgpu::BufferUsages::COPY_SRC,
        )?;
        let counters = gpu.create_buffer(
            "generation counters",
            GenerationCounters::SIZE,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );

        Ok(Self {
            field: Arc::new(field),
            cube_indices: Arc::new(cube_indices),
            counters: Arc::new(counters),
            total_cubes,
        })
    }
}

/// Compacted non-empty cube tables for one run
pub struct CompactionBuffers {
    pub linear_ids: Arc<wgpu::Buffer>,
    pub cube_indices: Arc<wgpu::Buffer>,
    pub offsets: Arc<wgpu::Buffer>,
    pub sizes: CompactionSizes,
}

impl CompactionBuffers {
    pub fn allocate(gpu: &GpuContext, capacity: u32) -> Result<Self> {
        let sizes = CompactionSizes::for_capacity(capacity);
        let usage = wgpu::BufferUsages::COPY_SRC;
        Ok(Self {
            linear_ids: Arc::new(gpu.try_create_storage_buffer("non-empty cube linear ids", sizes.linear_ids, usage)?),
            cube_indices: Arc::new(gpu.try_create_storage_buffer("non-empty cube indices", sizes.cube_indices, usage)?),
            offsets: Arc::new(gpu.try_create_storage_buffer("vertex index offsets", sizes.offsets, usage)?),
            sizes,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.sizes.capacity
    }
}

/// Vertex and index buffers of a generated mesh
#[derive(Clone)]
pub struct MeshBuffers {
    pub vertices: Arc<wgpu::Buffer>,
    pub indices: Arc<wgpu::Buffer>,
}

impl MeshBuffers {
    pub fn sizes(&self) -> MeshBufferSizes {
        MeshBufferSizes {
            vertex_bytes: self.vertices.size(),
            index_bytes: self.indices.size(),
        }
    }

    /// Keep each buffer whose size already matches, allocate the rest
    ///
    /// Returns the buffers and whether any allocation happened.
    pub fn reuse_or_allocate(gpu: &GpuContext, current: Option<&MeshBuffers>, sizes: MeshBufferSizes) -> Result<(Self, bool)> {
        let (vertices, vertices_resized) = match current {
            Some(mesh) if !needs_resize(Some(mesh.vertices.size()), sizes.vertex_bytes) => (mesh.vertices.clone(), false),
            _ => {
                let buffer = gpu.try_create_storage_buffer(
                    "mesh vertices",
                    sizes.vertex_bytes,
                    wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_SRC,
                )?;
                (Arc::new(buffer), true)
            }
        };
        let (indices, indices_resized) = match current {
            Some(mesh) if !needs_resize(Some(mesh.indices.size()), sizes.index_bytes) => (mesh.indices.clone(), false),
            _ => {
                let buffer = gpu.try_create_storage_buffer(
                    "mesh indices",
                    sizes.index_bytes,
                    wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_SRC,
                )?;
                (Arc::new(buffer), true)
            }
        };

        Ok((Self { vertices, indices }, vertices_resized || indices_resized))
    }
}
