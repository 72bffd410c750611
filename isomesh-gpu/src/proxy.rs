//! Mesh proxy: generated buffers and the generation state machine

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use isomesh_core::{unpack_normal, GenerationCounters, MeshVertex, Point3, Result, Vector3, VolumeGrid};

use crate::buffers::{MeshBuffers, VolumeBuffers};
use crate::mesher::MesherShared;
use crate::pipeline::MeshRun;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Raised once per completed generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildFinished {
    /// Completed runs of the owning view, counting from 1
    pub generation: u64,
    pub vertex_count: u32,
    pub primitive_count: u32,
}

/// Build-finished fan-out shared by a view and its proxies
#[derive(Default)]
pub(crate) struct BuildEvents {
    subscribers: Mutex<Vec<Sender<BuildFinished>>>,
    completed: AtomicU64,
}

impl BuildEvents {
    pub(crate) fn subscribe(&self) -> Receiver<BuildFinished> {
        let (sender, receiver) = flume::unbounded();
        lock(&self.subscribers).push(sender);
        receiver
    }

    fn emit(&self, vertex_count: u32, primitive_count: u32) -> BuildFinished {
        let event = BuildFinished {
            generation: self.completed.fetch_add(1, Ordering::AcqRel) + 1,
            vertex_count,
            primitive_count,
        };
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event).is_ok());
        event
    }
}

/// Idle/generating flag acquired by compare-and-swap
#[derive(Debug)]
pub struct GenerationState {
    ready_for_regeneration: AtomicBool,
}

impl GenerationState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready_for_regeneration: AtomicBool::new(true),
        })
    }

    /// Move `Idle -> Generating`; `None` while a generation is in flight
    pub fn try_begin(self: &Arc<Self>) -> Option<GenerationGuard> {
        self.ready_for_regeneration
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GenerationGuard { state: self.clone() })
    }

    pub fn is_generating(&self) -> bool {
        !self.ready_for_regeneration.load(Ordering::Acquire)
    }
}

/// Returns the state to idle when dropped
#[derive(Debug)]
pub struct GenerationGuard {
    state: Arc<GenerationState>,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.state.ready_for_regeneration.store(true, Ordering::Release);
    }
}

struct CommittedMesh {
    buffers: MeshBuffers,
    vertex_count: u32,
    primitive_count: u32,
}

/// Mesh downloaded for inspection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<Point3<f32>>,
    pub normals: Vec<Vector3<f32>>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// GPU-side mesh of one volume snapshot
///
/// Buffers and counts always describe the most recent completed run. A run
/// in flight writes into a spare set of buffers, which is swapped with the
/// published set only when the run completes.
pub struct MeshProxy {
    shared: Arc<MesherShared>,
    grid: Arc<VolumeGrid>,
    iso_bits: AtomicU32,
    state: Arc<GenerationState>,
    volume_buffers: Mutex<Option<Arc<VolumeBuffers>>>,
    mesh: Mutex<Option<CommittedMesh>>,
    spare: Mutex<Option<MeshBuffers>>,
    resize_count: AtomicU32,
    events: Arc<BuildEvents>,
    detached: AtomicBool,
}

impl MeshProxy {
    pub(crate) fn new(shared: Arc<MesherShared>, grid: Arc<VolumeGrid>, iso_value: f32, events: Arc<BuildEvents>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            grid,
            iso_bits: AtomicU32::new(iso_value.to_bits()),
            state: GenerationState::new(),
            volume_buffers: Mutex::new(None),
            mesh: Mutex::new(None),
            spare: Mutex::new(None),
            resize_count: AtomicU32::new(0),
            events,
            detached: AtomicBool::new(false),
        })
    }

    pub fn grid(&self) -> &Arc<VolumeGrid> {
        &self.grid
    }

    pub fn iso_value(&self) -> f32 {
        f32::from_bits(self.iso_bits.load(Ordering::Acquire))
    }

    pub(crate) fn set_iso_value(&self, iso_value: f32) {
        self.iso_bits.store(iso_value.to_bits(), Ordering::Release);
    }

    pub(crate) fn shared(&self) -> &Arc<MesherShared> {
        &self.shared
    }

    /// Usable buffers exist, whether or not a new run is in flight
    pub fn is_ready(&self) -> bool {
        lock(&self.mesh).is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.state.is_generating()
    }

    pub fn vertex_buffer(&self) -> Option<Arc<wgpu::Buffer>> {
        lock(&self.mesh).as_ref().map(|mesh| mesh.buffers.vertices.clone())
    }

    pub fn index_buffer(&self) -> Option<Arc<wgpu::Buffer>> {
        lock(&self.mesh).as_ref().map(|mesh| mesh.buffers.indices.clone())
    }

    pub fn vertex_count(&self) -> u32 {
        lock(&self.mesh).as_ref().map_or(0, |mesh| mesh.vertex_count)
    }

    pub fn primitive_count(&self) -> u32 {
        lock(&self.mesh).as_ref().map_or(0, |mesh| mesh.primitive_count)
    }

    /// Number of runs that had to reallocate mesh buffers
    pub fn resize_count(&self) -> u32 {
        self.resize_count.load(Ordering::Acquire)
    }

    /// Start a generation unless one is in flight
    ///
    /// Returns `Ok(false)` when the request was dropped.
    pub fn rebuild(self: &Arc<Self>) -> Result<bool> {
        let Some(guard) = self.state.try_begin() else {
            log::debug!("generation already in flight, rebuild request dropped");
            return Ok(false);
        };

        let (graph, run) = MeshRun::plan(self.clone(), guard)?;
        self.shared.submit(Box::new(crate::submission::GraphRun::new(graph, run)))?;
        Ok(true)
    }

    /// Stop raising build events for this proxy
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn volume_buffers(&self) -> Result<Arc<VolumeBuffers>> {
        let mut cached = lock(&self.volume_buffers);
        if let Some(buffers) = cached.as_ref() {
            return Ok(buffers.clone());
        }
        let buffers = Arc::new(VolumeBuffers::upload(&self.shared.gpu, &self.grid)?);
        *cached = Some(buffers.clone());
        Ok(buffers)
    }

    /// Buffers a run may write into; never the published set
    pub(crate) fn take_spare_buffers(&self) -> Option<MeshBuffers> {
        lock(&self.spare).take()
    }

    /// Hand back buffers of a run that did not complete
    pub(crate) fn restore_spare_buffers(&self, buffers: MeshBuffers) {
        lock(&self.spare).get_or_insert(buffers);
    }

    /// Publish a completed run; the caller releases the guard afterwards
    ///
    /// The previously published buffers become the spare set.
    pub(crate) fn commit(&self, buffers: MeshBuffers, counters: &GenerationCounters, resized: bool) {
        if resized {
            self.resize_count.fetch_add(1, Ordering::AcqRel);
        }
        let previous = lock(&self.mesh).replace(CommittedMesh {
            buffers,
            vertex_count: counters.vertices,
            primitive_count: counters.primitives(),
        });
        if let Some(previous) = previous {
            *lock(&self.spare) = Some(previous.buffers);
        }
    }

    /// Raise the build-finished event for the committed mesh
    pub(crate) fn notify_finished(&self) {
        if self.detached.load(Ordering::Acquire) {
            log::debug!("proxy was replaced, build event suppressed");
            return;
        }
        let event = self.events.emit(self.vertex_count(), self.primitive_count());
        log::info!(
            "mesh generation {} finished: {} vertices, {} triangles",
            event.generation,
            event.vertex_count,
            event.primitive_count
        );
    }

    /// Download the committed mesh
    ///
    /// Blocks the calling thread on the device; meant for tests and tools.
    pub async fn read_mesh(&self) -> Result<Option<MeshData>> {
        let (buffers, vertex_count, primitive_count) = match lock(&self.mesh).as_ref() {
            Some(mesh) => (mesh.buffers.clone(), mesh.vertex_count, mesh.primitive_count),
            None => return Ok(None),
        };

        let vertex_bytes = vertex_count as u64 * MeshVertex::STRIDE;
        let index_bytes = primitive_count as u64 * 3 * isomesh_core::INDEX_STRIDE;
        let raw_vertices = self.download(&buffers.vertices, vertex_bytes).await?;
        let raw_indices = self.download(&buffers.indices, index_bytes).await?;

        let vertices: Vec<MeshVertex> = bytemuck::pod_collect_to_vec(&raw_vertices);
        Ok(Some(MeshData {
            positions: vertices.iter().map(|v| Point3::from(v.position)).collect(),
            normals: vertices.iter().map(|v| unpack_normal(v.packed_normal)).collect(),
            indices: bytemuck::pod_collect_to_vec(&raw_indices),
        }))
    }

    async fn download(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let gpu = &self.shared.gpu;
        let staging_buffer = gpu.create_buffer(
            "mesh download staging",
            size,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        );

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mesh download encoder"),
        });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = flume::unbounded();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        gpu.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv_async()
            .await
            .map_err(|_| isomesh_core::Error::Gpu("Failed to receive mapping result".into()))??;

        let data = buffer_slice.get_mapped_range().to_vec();
        staging_buffer.unmap();
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_generation_state_single_attempt() {
        let state = GenerationState::new();
        assert!(!state.is_generating());

        let guard = state.try_begin().expect("idle state should begin");
        assert!(state.is_generating());
        assert!(state.try_begin().is_none());

        drop(guard);
        assert!(!state.is_generating());
        assert!(state.try_begin().is_some());
    }

    #[test]
    fn test_generation_state_concurrent_requests() {
        let state = GenerationState::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    state.try_begin()
                })
            })
            .collect();

        let guards: Vec<_> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(guards.len(), 1);
        assert!(state.is_generating());
    }

    #[test]
    fn test_build_events_fan_out() {
        let events = BuildEvents::default();
        let first = events.subscribe();
        let second = events.subscribe();
        drop(second);

        let event = events.emit(12, 4);
        assert_eq!(event.generation, 1);
        assert_eq!(first.try_recv().unwrap(), event);
        assert_eq!(lock(&events.subscribers).len(), 1);

        assert_eq!(events.emit(0, 0).generation, 2);
    }
}
