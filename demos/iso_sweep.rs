//! Sweep the iso value over a set of registered spheres
//!
//! Each tick of the registry rebuilds the views that went dirty.

use std::time::Duration;

use anyhow::Context;
use isomesh_core::{level_set_sphere, Point3};
use isomesh_gpu::{ChunkRegistry, IsoMesher, MesherSettings};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = MesherSettings::default().with_rebuild_on_change(false);
    let mesher = pollster::block_on(IsoMesher::new(settings))?;

    let mut registry = ChunkRegistry::new();
    let mut views = Vec::new();
    for radius in [6.0, 10.0, 14.0] {
        let view = mesher.create_view();
        view.set_level_set(&level_set_sphere(radius, Point3::origin(), 1.0, 3.0))?;
        registry.register(&view);
        let events = view.subscribe_build_finished();
        views.push((radius, view, events));
    }

    for iso_value in [0.0, -1.0, -2.0, 1.0] {
        for (_, view, _) in &views {
            view.update_iso_value(iso_value)?;
        }
        let started = registry.tick();
        log::info!("iso {:+.1}: started {} generations", iso_value, started);

        for (radius, _, events) in &views {
            let event = events
                .recv_timeout(Duration::from_secs(30))
                .with_context(|| format!("sphere of radius {} did not finish", radius))?;
            println!(
                "radius {:>4.1} iso {:+.1}: {:>6} vertices {:>6} triangles",
                radius, iso_value, event.vertex_count, event.primitive_count
            );
        }
    }

    Ok(())
}
