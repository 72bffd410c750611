//! One generation run: classify, compact and generate as a pass graph
//!
//! Under [`BufferSizingPolicy::Measured`] the counters are read back after
//! classification and after compaction, and the buffers the next pass needs
//! are created in those readback callbacks. Under
//! [`BufferSizingPolicy::WorstCase`] everything is allocated up front and the
//! three kernels are submitted together. Both end with a readback of the
//! final counters, whose callback completes the run.

use std::sync::Arc;

use isomesh_core::{
    compaction_capacity, validate_compaction, BufferSizingPolicy, CompactionSizes, CompactionTables, Error,
    GenerationCounters, MarchingCubesUniforms, MeshBufferSizes, Result, VertexIndexOffset,
};

use crate::buffers::{CompactionBuffers, MeshBuffers, VolumeBuffers};
use crate::device::GpuContext;
use crate::graph::{CompiledGraph, Deferred, PassContext, PassGraph, PassId, ReadbackSource};
use crate::kernels::{ClassifyBindings, CompactBindings, GenerateBindings};
use crate::proxy::{GenerationGuard, MeshProxy};
use crate::submission::RunState;

fn read_counters(bytes: &[u8]) -> Result<GenerationCounters> {
    GenerationCounters::from_bytes(bytes)
        .ok_or_else(|| Error::InvalidData(format!("counter readback is {} bytes", bytes.len())))
}

/// State of one generation run
pub(crate) struct MeshRun {
    proxy: Arc<MeshProxy>,
    guard: GenerationGuard,
    iso_value: f32,
    total_cubes: u32,
    uniforms: Deferred<Arc<wgpu::Buffer>>,
    volume: Deferred<Arc<VolumeBuffers>>,
    tables: Deferred<CompactionBuffers>,
    mesh: Deferred<(MeshBuffers, bool)>,
    counters: Deferred<GenerationCounters>,
}

impl MeshRun {
    /// Capture the proxy's current parameters and build the run's graph
    pub(crate) fn plan(proxy: Arc<MeshProxy>, guard: GenerationGuard) -> Result<(CompiledGraph<Self>, Self)> {
        let settings = &proxy.shared().settings;
        let mut graph = PassGraph::new();

        let generate = match settings.sizing_policy {
            BufferSizingPolicy::Measured => {
                let classify = add_classify(&mut graph, &[]);
                let counted = graph.add_readback(
                    "count non-empty cubes",
                    &[classify],
                    |run: &MeshRun| Ok(ReadbackSource::new().with(&run.volume.get()?.counters, GenerationCounters::SIZE)),
                    |run, gpu, bytes| {
                        let counters = read_counters(bytes)?;
                        let capacity = compaction_capacity(counters.non_empty_cubes, run.total_cubes);
                        log::debug!(
                            "{} of {} cubes non-empty, compaction capacity {}",
                            counters.non_empty_cubes,
                            run.total_cubes,
                            capacity
                        );
                        run.tables.resolve(CompactionBuffers::allocate(gpu, capacity)?)
                    },
                );
                let compact = add_compact(&mut graph, &[counted]);
                if settings.validate_compaction {
                    add_validation(&mut graph, compact);
                }
                let sized = graph.add_readback(
                    "count emissions",
                    &[compact],
                    |run: &MeshRun| Ok(ReadbackSource::new().with(&run.volume.get()?.counters, GenerationCounters::SIZE)),
                    |run, gpu, bytes| {
                        let counters = read_counters(bytes)?;
                        resolve_mesh_buffers(run, gpu, MeshBufferSizes::for_counters(&counters))
                    },
                );
                add_generate(&mut graph, &[sized])
            }
            BufferSizingPolicy::WorstCase => {
                let allocate = graph.add_compute("allocate worst case", &[], |run: &mut MeshRun, ctx| {
                    let capacity = run.total_cubes.max(1);
                    run.tables.resolve(CompactionBuffers::allocate(ctx.gpu, capacity)?)?;
                    resolve_mesh_buffers(run, ctx.gpu, MeshBufferSizes::worst_case(run.total_cubes))
                });
                let classify = add_classify(&mut graph, &[]);
                let compact = add_compact(&mut graph, &[classify, allocate]);
                if settings.validate_compaction {
                    add_validation(&mut graph, compact);
                }
                add_generate(&mut graph, &[compact])
            }
        };

        graph.add_readback(
            "read final counters",
            &[generate],
            |run: &MeshRun| Ok(ReadbackSource::new().with(&run.volume.get()?.counters, GenerationCounters::SIZE)),
            |run, _, bytes| run.counters.resolve(read_counters(bytes)?),
        );

        let compiled = graph.compile()?;
        let run = MeshRun {
            iso_value: proxy.iso_value(),
            total_cubes: proxy.grid().dimensions().total_cubes(),
            proxy,
            guard,
            uniforms: Deferred::new("marching cubes uniforms"),
            volume: Deferred::new("volume buffers"),
            tables: Deferred::new("compaction tables"),
            mesh: Deferred::new("mesh buffers"),
            counters: Deferred::new("final counters"),
        };
        Ok((compiled, run))
    }
}

/// Size the run's mesh buffers from the proxy's spare set
fn resolve_mesh_buffers(run: &mut MeshRun, gpu: &GpuContext, sizes: MeshBufferSizes) -> Result<()> {
    let spare = run.proxy.take_spare_buffers();
    match MeshBuffers::reuse_or_allocate(gpu, spare.as_ref(), sizes) {
        Ok(mesh) => run.mesh.resolve(mesh),
        Err(error) => {
            if let Some(spare) = spare {
                run.proxy.restore_spare_buffers(spare);
            }
            Err(error)
        }
    }
}

fn add_classify(graph: &mut PassGraph<MeshRun>, deps: &[PassId]) -> PassId {
    graph.add_compute("classify", deps, |run: &mut MeshRun, ctx: &mut PassContext<'_>| {
        let volume = run.proxy.volume_buffers()?;
        let params = MarchingCubesUniforms::from_grid(run.proxy.grid(), run.iso_value);
        let uniforms = Arc::new(ctx.gpu.create_buffer_init(
            "marching cubes uniforms",
            &[params],
            wgpu::BufferUsages::UNIFORM,
        ));

        ctx.encoder.clear_buffer(&volume.counters, 0, None);
        run.proxy.shared().kernels.record_classify(
            ctx.gpu,
            ctx.encoder,
            &ClassifyBindings {
                uniforms: &uniforms,
                volume: &volume,
            },
        );

        run.uniforms.resolve(uniforms)?;
        run.volume.resolve(volume)
    })
}

fn add_compact(graph: &mut PassGraph<MeshRun>, deps: &[PassId]) -> PassId {
    graph.add_compute("compact", deps, |run: &mut MeshRun, ctx: &mut PassContext<'_>| {
        let volume = run.volume.get()?;
        // Slots are re-derived by counting non-empty cubes a second time
        ctx.encoder.clear_buffer(&volume.counters, 0, Some(4));
        run.proxy.shared().kernels.record_compact(
            ctx.gpu,
            ctx.encoder,
            &CompactBindings {
                uniforms: run.uniforms.get()?,
                volume,
                tables: run.tables.get()?,
            },
        );
        Ok(())
    })
}

fn add_generate(graph: &mut PassGraph<MeshRun>, deps: &[PassId]) -> PassId {
    graph.add_compute("generate", deps, |run: &mut MeshRun, ctx: &mut PassContext<'_>| {
        let (mesh, _) = run.mesh.get()?;
        run.proxy.shared().kernels.record_generate(
            ctx.gpu,
            ctx.encoder,
            &GenerateBindings {
                uniforms: run.uniforms.get()?,
                volume: run.volume.get()?,
                tables: run.tables.get()?,
                mesh,
            },
        );
        Ok(())
    })
}

fn split_segment<'a>(rest: &mut &'a [u8], len: u64) -> &'a [u8] {
    let current: &'a [u8] = rest;
    let (head, tail) = current.split_at((len as usize).min(current.len()));
    *rest = tail;
    head
}

/// Debug readback of the compaction tables, checked on the host and logged
fn add_validation(graph: &mut PassGraph<MeshRun>, compact: PassId) -> PassId {
    graph.add_readback(
        "validate compaction",
        &[compact],
        |run: &MeshRun| {
            let volume = run.volume.get()?;
            let tables = run.tables.get()?;
            Ok(ReadbackSource::new()
                .with(&volume.counters, GenerationCounters::SIZE)
                .with(&volume.cube_indices, run.total_cubes.max(1) as u64 * 4)
                .with(&tables.linear_ids, tables.sizes.linear_ids)
                .with(&tables.cube_indices, tables.sizes.cube_indices)
                .with(&tables.offsets, tables.sizes.offsets))
        },
        |run, _, bytes| {
            let tables = run.tables.get()?;
            let (cube_cases, readback, counters) = decode_compaction_readback(bytes, run.total_cubes, &tables.sizes)?;

            match validate_compaction(&cube_cases, &readback, &counters) {
                Ok(()) => log::debug!("compaction tables valid for {} cubes", readback.linear_ids.len()),
                Err(error) => log::warn!("compaction tables failed validation: {}", error),
            }
            Ok(())
        },
    )
}

/// Split a validation readback into the case table, the compaction tables
/// truncated to the filled slots, and the counters
fn decode_compaction_readback(
    bytes: &[u8],
    total_cubes: u32,
    sizes: &CompactionSizes,
) -> Result<(Vec<u32>, CompactionTables, GenerationCounters)> {
    let cube_bytes = total_cubes.max(1) as u64 * 4;
    let expected = GenerationCounters::SIZE + cube_bytes + sizes.linear_ids + sizes.cube_indices + sizes.offsets;
    if (bytes.len() as u64) < expected {
        return Err(Error::InvalidData(format!(
            "validation readback is {} bytes, expected {}",
            bytes.len(),
            expected
        )));
    }

    let counters = read_counters(bytes)?;
    let mut rest = &bytes[GenerationCounters::SIZE as usize..];

    let mut cube_cases: Vec<u32> = bytemuck::pod_collect_to_vec(split_segment(&mut rest, cube_bytes));
    cube_cases.truncate(total_cubes as usize);

    let slots = counters.non_empty_cubes.min(sizes.capacity) as usize;
    let mut tables = CompactionTables {
        linear_ids: bytemuck::pod_collect_to_vec(split_segment(&mut rest, sizes.linear_ids)),
        cube_indices: bytemuck::pod_collect_to_vec(split_segment(&mut rest, sizes.cube_indices)),
        offsets: bytemuck::pod_collect_to_vec::<u8, VertexIndexOffset>(split_segment(&mut rest, sizes.offsets)),
    };
    tables.linear_ids.truncate(slots);
    tables.cube_indices.truncate(slots);
    tables.offsets.truncate(slots);

    Ok((cube_cases, tables, counters))
}

impl RunState for MeshRun {
    fn complete(self) {
        let MeshRun {
            proxy,
            guard,
            mesh,
            counters,
            ..
        } = self;

        let (buffers, resized) = match mesh.into_inner() {
            Ok(mesh) => mesh,
            Err(error) => {
                log::error!("mesh generation could not be committed: {}", error);
                return;
            }
        };

        let counters = match counters.into_inner() {
            Ok(counters) if buffers.sizes().holds(&counters) => counters,
            Ok(counters) => {
                log::error!(
                    "mesh generation could not be committed: buffers too small for {} vertices and {} indices",
                    counters.vertices,
                    counters.indices
                );
                proxy.restore_spare_buffers(buffers);
                return;
            }
            Err(error) => {
                log::error!("mesh generation could not be committed: {}", error);
                proxy.restore_spare_buffers(buffers);
                return;
            }
        };

        proxy.commit(buffers, &counters, resized);
        drop(guard);
        proxy.notify_finished();
    }

    fn abort(self, pass: &'static str, error: Error) {
        log::error!("mesh generation aborted in pass '{}': {}", pass, error);
        if let Ok((buffers, _)) = self.mesh.into_inner() {
            self.proxy.restore_spare_buffers(buffers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isomesh_core::{classify_cubes, compact_cubes, encode_field, VolumeGrid};

    fn readback_of(cases: &[u32], tables: &CompactionTables, counters: &GenerationCounters, capacity: u32) -> Vec<u8> {
        let padding = capacity as usize - tables.linear_ids.len();
        let mut bytes = bytemuck::bytes_of(counters).to_vec();
        bytes.extend_from_slice(bytemuck::cast_slice(cases));
        bytes.extend_from_slice(bytemuck::cast_slice(&tables.linear_ids));
        bytes.extend(std::iter::repeat(0xAB).take(padding * 4));
        bytes.extend_from_slice(bytemuck::cast_slice(&tables.cube_indices));
        bytes.extend(std::iter::repeat(0xAB).take(padding * 4));
        bytes.extend_from_slice(bytemuck::cast_slice(&tables.offsets));
        bytes.extend(std::iter::repeat(0xAB).take(padding * 8));
        bytes
    }

    #[test]
    fn test_decode_compaction_readback() {
        let samples: Vec<f32> = (0..27).map(|i| if i % 4 == 0 { -1.0 } else { 1.0 }).collect();
        let grid = VolumeGrid::from_bytes(encode_field([0; 3], [3, 3, 3], 1.0, 1.0, &samples)).unwrap();
        let cases = classify_cubes(&grid, 0.0);
        let (tables, counters) = compact_cubes(&cases);
        assert!(counters.non_empty_cubes > 0);

        // Worst-case capacity leaves unused slots after the filled ones
        let sizes = CompactionSizes::for_capacity(cases.len() as u32);
        let bytes = readback_of(&cases, &tables, &counters, sizes.capacity);

        let (decoded_cases, decoded_tables, decoded_counters) =
            decode_compaction_readback(&bytes, cases.len() as u32, &sizes).unwrap();
        assert_eq!(decoded_cases, cases);
        assert_eq!(decoded_tables, tables);
        assert_eq!(decoded_counters, counters);
        validate_compaction(&decoded_cases, &decoded_tables, &decoded_counters).unwrap();
    }

    #[test]
    fn test_decode_rejects_short_readback() {
        let sizes = CompactionSizes::for_capacity(4);
        let short = vec![0u8; GenerationCounters::SIZE as usize + 8];
        assert!(matches!(
            decode_compaction_readback(&short, 8, &sizes),
            Err(Error::InvalidData(_))
        ));
    }
}
