//! GPU integration tests for the isomesh pipeline
//!
//! Every test skips when no adapter is available.

use std::sync::Arc;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use flume::Receiver;
use isomesh_core::{
    classify_cubes, compact_cubes, encode_field, level_set_sphere, BufferSizingPolicy, MeshBufferSizes,
    MeshVertex, PersistedVolume, Point3, SparseLevelSet, VolumeGrid, INDEX_STRIDE,
};
use isomesh_gpu::{
    BuildFinished, ChunkRegistry, GpuContext, IsoMesher, MeshProxy, MesherSettings,
    VolumeChunkView,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Try to create a mesher, return None if no GPU is available
fn try_create_mesher(settings: MesherSettings) -> Option<IsoMesher> {
    pollster::block_on(async {
        match IsoMesher::new(settings).await {
            Ok(mesher) => Some(mesher),
            Err(_) => {
                println!("⚠️  GPU not available, skipping GPU-dependent test");
                None
            }
        }
    })
}

fn sphere(radius: f32) -> SparseLevelSet {
    level_set_sphere(radius, Point3::origin(), 1.0, 3.0)
}

fn wait_for_build(events: &Receiver<BuildFinished>) -> BuildFinished {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("build finished event should arrive")
}

/// Vertex and index totals the host model predicts
fn host_totals(level_set: &SparseLevelSet, iso_value: f32) -> (u32, u32) {
    let grid = VolumeGrid::from_bytes(level_set.linearize()).unwrap();
    let (_, counters) = compact_cubes(&classify_cubes(&grid, iso_value));
    (counters.vertices, counters.indices)
}

fn meshed_view(mesher: &IsoMesher, level_set: &SparseLevelSet) -> (Arc<VolumeChunkView>, BuildFinished) {
    let view = mesher.create_view();
    view.set_level_set(level_set).unwrap();
    let events = view.subscribe_build_finished();
    assert!(view.rebuild_mesh().unwrap());
    let event = wait_for_build(&events);
    (view, event)
}

#[test]
fn test_uniform_field_yields_empty_mesh() {
    let Some(mesher) = try_create_mesher(MesherSettings::default()) else {
        return;
    };

    let outside = encode_field([0; 3], [8, 8, 8], 1.0, 1.0, &[1.0; 512]);
    let view = mesher.create_view();
    view.set_volume(outside).unwrap();
    let events = view.subscribe_build_finished();
    assert!(view.rebuild_mesh().unwrap());

    let event = wait_for_build(&events);
    assert_eq!(event.vertex_count, 0);
    assert_eq!(event.primitive_count, 0);

    let proxy = view.proxy().unwrap();
    assert!(proxy.is_ready());
    assert!(!proxy.is_generating());
    assert!(proxy.vertex_buffer().unwrap().size() >= MeshVertex::STRIDE);
    assert!(proxy.index_buffer().unwrap().size() >= INDEX_STRIDE);

    let mesh = pollster::block_on(proxy.read_mesh()).unwrap().unwrap();
    assert!(mesh.positions.is_empty());
    assert!(mesh.indices.is_empty());

    println!("✓ Uniform field produced an empty mesh");
}

#[test]
fn test_concurrent_rebuild_is_dropped() {
    let Some(mesher) = try_create_mesher(MesherSettings::default()) else {
        return;
    };

    let view = mesher.create_view();
    view.set_level_set(&sphere(6.0)).unwrap();
    let events = view.subscribe_build_finished();

    assert!(view.rebuild_mesh().unwrap());
    assert!(!view.rebuild_mesh().unwrap(), "second request should be dropped while generating");

    wait_for_build(&events);
    assert!(events.recv_timeout(Duration::from_millis(500)).is_err(), "only one event expected");

    let proxy = view.proxy().unwrap();
    assert_eq!(proxy.resize_count(), 1);
    assert!(!proxy.is_generating());

    println!("✓ Concurrent rebuild produced one event and one resize");
}

#[test]
fn test_sphere_mesh_matches_host_model() {
    let Some(mesher) = try_create_mesher(MesherSettings::default().with_validation(true)) else {
        return;
    };

    let radius = 8.0;
    let level_set = sphere(radius);
    let (view, event) = meshed_view(&mesher, &level_set);

    let (vertices, indices) = host_totals(&level_set, 0.0);
    assert_eq!(event.vertex_count, vertices);
    assert_eq!(event.primitive_count, indices / 3);
    assert!(event.primitive_count > 0);

    let proxy = view.proxy().unwrap();
    let mesh = pollster::block_on(proxy.read_mesh()).unwrap().unwrap();
    assert_eq!(mesh.positions.len(), vertices as usize);
    assert_eq!(mesh.triangle_count(), event.primitive_count as usize);
    assert!(mesh.indices.iter().all(|&i| i < vertices));

    for (position, normal) in mesh.positions.iter().zip(mesh.normals.iter()) {
        let distance = position.coords.norm();
        assert_relative_eq!(distance, radius, epsilon = 0.2);
        assert!(normal.dot(&position.coords.normalize()) > 0.7, "normal should point outward");
    }

    println!("✓ Sphere mesh: {} vertices, {} triangles", vertices, event.primitive_count);
}

#[test]
fn test_worst_case_policy_matches_measured() {
    let Some(measured) = try_create_mesher(MesherSettings::default()) else {
        return;
    };
    let Some(worst_case) =
        try_create_mesher(MesherSettings::default().with_sizing_policy(BufferSizingPolicy::WorstCase))
    else {
        return;
    };

    let level_set = sphere(5.0);
    let (_, measured_event) = meshed_view(&measured, &level_set);
    let (view, worst_event) = meshed_view(&worst_case, &level_set);

    assert_eq!(measured_event.vertex_count, worst_event.vertex_count);
    assert_eq!(measured_event.primitive_count, worst_event.primitive_count);

    let proxy = view.proxy().unwrap();
    let total_cubes = proxy.grid().dimensions().total_cubes();
    let worst = MeshBufferSizes::worst_case(total_cubes);
    assert_eq!(proxy.vertex_buffer().unwrap().size(), worst.vertex_bytes);
    assert_eq!(proxy.index_buffer().unwrap().size(), worst.index_bytes);
}

#[test]
fn test_smaller_second_run_fits_buffers() {
    let Some(mesher) = try_create_mesher(MesherSettings::default()) else {
        return;
    };

    let (view, first) = meshed_view(&mesher, &sphere(10.0));
    let events = view.subscribe_build_finished();

    // Raising the surface inward shrinks the sphere
    view.update_iso_value(-2.0).unwrap();
    let second = wait_for_build(&events);
    assert!(second.vertex_count < first.vertex_count);
    assert!(second.generation > first.generation);

    let proxy = view.proxy().unwrap();
    assert_eq!(proxy.vertex_count(), second.vertex_count);
    assert!(proxy.vertex_buffer().unwrap().size() >= second.vertex_count as u64 * MeshVertex::STRIDE);
    assert!(proxy.index_buffer().unwrap().size() >= second.primitive_count as u64 * 3 * INDEX_STRIDE);
    assert_eq!(proxy.resize_count(), 2);
    assert!(!view.is_dirty());
}

#[test]
fn test_dirty_and_empty_states() {
    let Some(mesher) = try_create_mesher(MesherSettings::default()) else {
        return;
    };

    let view = mesher.create_view();
    view.set_volume(Vec::new()).unwrap();
    assert!(view.is_empty());
    assert!(!view.is_dirty());
    assert!(view.proxy().is_none());
    assert!(!view.rebuild_mesh().unwrap());

    view.set_level_set(&sphere(4.0)).unwrap();
    assert!(!view.is_empty());
    assert!(view.is_dirty());
    let proxy = view.proxy().unwrap();
    assert!(!proxy.is_ready());

    let events = view.subscribe_build_finished();
    assert!(view.rebuild_mesh().unwrap());
    assert!(!view.is_dirty());
    wait_for_build(&events);

    assert!(!proxy.is_generating());
    assert!(proxy.is_ready());
}

#[test]
fn test_persisted_view_round_trip() {
    let Some(mesher) = try_create_mesher(MesherSettings::default().with_rebuild_on_change(false)) else {
        return;
    };

    let (saved, _) = meshed_view(&mesher, &sphere(6.0));
    saved.update_iso_value(0.5).unwrap();
    assert!(saved.is_dirty());

    let mut blob = Vec::new();
    saved.write_to(&mut blob).unwrap();

    let restored = mesher.create_view();
    restored.read_from(&mut blob.as_slice()).unwrap();
    assert!(restored.is_dirty());
    assert_eq!(restored.iso_value(), 0.5);
    assert_eq!(
        restored.proxy().unwrap().grid().as_bytes(),
        saved.proxy().unwrap().grid().as_bytes()
    );

    let events = restored.subscribe_build_finished();
    assert!(restored.rebuild_mesh().unwrap());
    let event = wait_for_build(&events);
    let (vertices, _) = host_totals(&sphere(6.0), 0.5);
    assert_eq!(event.vertex_count, vertices);
}

#[test]
fn test_registry_rebuilds_dirty_views() {
    let Some(mesher) = try_create_mesher(MesherSettings::default()) else {
        return;
    };

    let mut registry = ChunkRegistry::new();
    let first = mesher.create_view();
    let second = mesher.create_view();
    let empty = mesher.create_view();
    first.set_level_set(&sphere(4.0)).unwrap();
    second.set_level_set(&sphere(5.0)).unwrap();
    registry.register(&first);
    registry.register(&second);
    registry.register(&empty);

    let first_events = first.subscribe_build_finished();
    let second_events = second.subscribe_build_finished();
    assert_eq!(registry.tick(), 2);
    wait_for_build(&first_events);
    wait_for_build(&second_events);
    assert_eq!(registry.tick(), 0);

    drop(second);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_runs_alternate_between_two_buffer_sets() {
    let Some(mesher) =
        try_create_mesher(MesherSettings::default().with_sizing_policy(BufferSizingPolicy::WorstCase))
    else {
        return;
    };

    let (view, first) = meshed_view(&mesher, &sphere(6.0));
    let proxy = view.proxy().unwrap();
    let first_vertices = proxy.vertex_buffer().unwrap();
    let first_indices = proxy.index_buffer().unwrap();
    let events = view.subscribe_build_finished();

    view.update_iso_value(-1.0).unwrap();
    let second = wait_for_build(&events);
    assert_eq!(proxy.vertex_count(), second.vertex_count);
    assert_ne!(second.vertex_count, first.vertex_count);
    let second_vertices = proxy.vertex_buffer().unwrap();
    assert!(!Arc::ptr_eq(&second_vertices, &first_vertices), "second run must not write the published buffers");
    assert!(!Arc::ptr_eq(&proxy.index_buffer().unwrap(), &first_indices));

    // The first set became the spare and is reused
    view.update_iso_value(-2.0).unwrap();
    let third = wait_for_build(&events);
    assert_eq!(proxy.vertex_count(), third.vertex_count);
    assert_eq!(proxy.primitive_count(), third.primitive_count);
    assert!(Arc::ptr_eq(&proxy.vertex_buffer().unwrap(), &first_vertices));
    assert!(Arc::ptr_eq(&proxy.index_buffer().unwrap(), &first_indices));
    assert_eq!(proxy.resize_count(), 2);

    let (vertices, _) = host_totals(&sphere(6.0), -2.0);
    let mesh = pollster::block_on(proxy.read_mesh()).unwrap().unwrap();
    assert_eq!(mesh.positions.len(), vertices as usize);
}

/// 64^3 samples of a radius 5 sphere centred in the lattice
fn small_sphere_in_large_lattice() -> Vec<u8> {
    const POINTS: u32 = 64;
    let mut samples = Vec::with_capacity((POINTS * POINTS * POINTS) as usize);
    for z in 0..POINTS {
        for y in 0..POINTS {
            for x in 0..POINTS {
                let offset = [x as f32 - 32.0, y as f32 - 32.0, z as f32 - 32.0];
                let distance = offset.iter().map(|c| c * c).sum::<f32>().sqrt();
                samples.push((distance - 5.0).clamp(-3.0, 3.0));
            }
        }
    }
    encode_field([0; 3], [POINTS; 3], 1.0, 3.0, &samples)
}

#[test]
fn test_resource_failure_keeps_last_mesh() {
    // Room for the field and classification tables but not for a full-lattice compaction
    let gpu = match pollster::block_on(GpuContext::with_storage_buffer_limit(1_572_864)) {
        Ok(gpu) => gpu,
        Err(_) => {
            println!("⚠️  GPU not available, skipping GPU-dependent test");
            return;
        }
    };
    let mesher = IsoMesher::with_context(Arc::new(gpu), MesherSettings::default()).unwrap();

    let view = mesher.create_view();
    view.set_volume(small_sphere_in_large_lattice()).unwrap();
    let events = view.subscribe_build_finished();
    assert!(view.rebuild_mesh().unwrap());
    let committed = wait_for_build(&events);
    assert!(committed.primitive_count > 0);

    let proxy = view.proxy().unwrap();
    let vertices = proxy.vertex_buffer().unwrap();
    let indices = proxy.index_buffer().unwrap();

    // Every sample lies above the threshold, so compaction needs a slot per cube
    view.update_iso_value(-10.0).unwrap();

    let deadline = Instant::now() + EVENT_TIMEOUT;
    while proxy.is_generating() {
        assert!(Instant::now() < deadline, "generation flag should reset after the failed run");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(events.recv_timeout(Duration::from_secs(1)).is_err(), "a failed run raises no event");

    assert_eq!(proxy.vertex_count(), committed.vertex_count);
    assert_eq!(proxy.primitive_count(), committed.primitive_count);
    assert!(Arc::ptr_eq(&proxy.vertex_buffer().unwrap(), &vertices));
    assert!(Arc::ptr_eq(&proxy.index_buffer().unwrap(), &indices));
    assert!(proxy.is_ready());

    // The generation flag is free for the next request
    assert!(proxy.rebuild().unwrap());
    proxy_settles(&proxy);

    println!("✓ Failed run left the last mesh in place");
}

fn proxy_settles(proxy: &MeshProxy) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while proxy.is_generating() {
        assert!(Instant::now() < deadline, "generation should settle");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_read_from_rejects_corrupt_field_without_changes() {
    let Some(mesher) = try_create_mesher(MesherSettings::default().with_rebuild_on_change(false)) else {
        return;
    };

    let view = mesher.create_view();
    view.set_level_set(&sphere(4.0)).unwrap();
    view.update_iso_value(0.25).unwrap();
    let proxy = view.proxy().unwrap();

    let mut field = sphere(4.0).linearize();
    field[0] = b'X';
    let mut blob = Vec::new();
    PersistedVolume {
        bytes: field,
        iso_value: 0.75,
    }
    .write_to(&mut blob)
    .unwrap();

    assert!(view.read_from(&mut blob.as_slice()).is_err());
    assert_eq!(view.iso_value(), 0.25);
    assert!(Arc::ptr_eq(&view.proxy().unwrap(), &proxy));
    assert_eq!(proxy.iso_value(), 0.25);
}
