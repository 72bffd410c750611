//! Marching cubes compute kernels and their binding contracts

use isomesh_core::{case_entries, dispatch_shape_with_limit, WORKGROUP_SIZE};

use crate::buffers::{CompactionBuffers, MeshBuffers, VolumeBuffers};
use crate::device::GpuContext;

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn buffer_entries<'a>(buffers: &[&'a wgpu::Buffer]) -> Vec<wgpu::BindGroupEntry<'a>> {
    buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect()
}

struct Kernel {
    label: &'static str,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl Kernel {
    fn new(gpu: &GpuContext, label: &'static str, source: &str, entries: &[wgpu::BindGroupLayoutEntry]) -> Self {
        let shader = gpu.create_shader_module(label, source);
        let layout = gpu.create_bind_group_layout(label, entries);
        let pipeline = gpu.create_compute_pipeline(label, &layout, &shader, "main");
        Self { label, layout, pipeline }
    }

    fn bind(&self, gpu: &GpuContext, buffers: &[&wgpu::Buffer]) -> wgpu::BindGroup {
        gpu.create_bind_group(self.label, &self.layout, &buffer_entries(buffers))
    }

    fn record(&self, gpu: &GpuContext, encoder: &mut wgpu::CommandEncoder, bind_group: &wgpu::BindGroup, work_items: u32) {
        let [x, y, z] = dispatch_shape_with_limit(work_items, WORKGROUP_SIZE, gpu.max_workgroups_per_dimension());

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(self.label),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(&self.pipeline);
        compute_pass.set_bind_group(0, bind_group, &[]);
        compute_pass.dispatch_workgroups(x, y, z);
    }
}

/// Classification inputs and outputs
pub struct ClassifyBindings<'a> {
    pub uniforms: &'a wgpu::Buffer,
    pub volume: &'a VolumeBuffers,
}

/// Compaction inputs and outputs
pub struct CompactBindings<'a> {
    pub uniforms: &'a wgpu::Buffer,
    pub volume: &'a VolumeBuffers,
    pub tables: &'a CompactionBuffers,
}

/// Generation inputs and outputs
pub struct GenerateBindings<'a> {
    pub uniforms: &'a wgpu::Buffer,
    pub volume: &'a VolumeBuffers,
    pub tables: &'a CompactionBuffers,
    pub mesh: &'a MeshBuffers,
}

/// The three pipelines plus the uploaded triangulation table
pub struct MarchingCubesKernels {
    classify: Kernel,
    compact: Kernel,
    generate: Kernel,
    case_table: wgpu::Buffer,
}

impl MarchingCubesKernels {
    pub fn new(gpu: &GpuContext) -> Self {
        let classify = Kernel::new(
            gpu,
            "classify cubes",
            include_str!("shaders/classify.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
            ],
        );

        let compact = Kernel::new(
            gpu,
            "compact cubes",
            include_str!("shaders/compact.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
                storage_entry(5, false),
                storage_entry(6, false),
            ],
        );

        let generate = Kernel::new(
            gpu,
            "generate mesh",
            include_str!("shaders/generate.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, true),
                storage_entry(5, true),
                storage_entry(6, true),
                storage_entry(7, false),
                storage_entry(8, false),
            ],
        );

        let case_table = gpu.create_buffer_init("marching cubes case table", &case_entries(), wgpu::BufferUsages::STORAGE);

        Self {
            classify,
            compact,
            generate,
            case_table,
        }
    }

    /// One thread per lattice cube
    pub fn record_classify(&self, gpu: &GpuContext, encoder: &mut wgpu::CommandEncoder, bindings: &ClassifyBindings<'_>) {
        let bind_group = self.classify.bind(
            gpu,
            &[
                bindings.uniforms,
                &bindings.volume.field,
                &bindings.volume.cube_indices,
                &bindings.volume.counters,
            ],
        );
        self.classify.record(gpu, encoder, &bind_group, bindings.volume.total_cubes);
    }

    /// One thread per lattice cube; expects the slot counter cleared
    pub fn record_compact(&self, gpu: &GpuContext, encoder: &mut wgpu::CommandEncoder, bindings: &CompactBindings<'_>) {
        let bind_group = self.compact.bind(
            gpu,
            &[
                bindings.uniforms,
                &self.case_table,
                &bindings.volume.cube_indices,
                &bindings.volume.counters,
                &bindings.tables.linear_ids,
                &bindings.tables.cube_indices,
                &bindings.tables.offsets,
            ],
        );
        self.compact.record(gpu, encoder, &bind_group, bindings.volume.total_cubes);
    }

    /// One thread per compaction slot
    pub fn record_generate(&self, gpu: &GpuContext, encoder: &mut wgpu::CommandEncoder, bindings: &GenerateBindings<'_>) {
        let bind_group = self.generate.bind(
            gpu,
            &[
                bindings.uniforms,
                &bindings.volume.field,
                &self.case_table,
                &bindings.volume.counters,
                &bindings.tables.linear_ids,
                &bindings.tables.cube_indices,
                &bindings.tables.offsets,
                &bindings.mesh.vertices,
                &bindings.mesh.indices,
            ],
        );
        self.generate.record(gpu, encoder, &bind_group, bindings.tables.capacity());
    }
}
