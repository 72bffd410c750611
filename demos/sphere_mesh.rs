//! Mesh the default signed distance sphere on the GPU
//!
//! Run with `RUST_LOG=debug` to see each pass of the generation.

use std::time::Instant;

use anyhow::Context;
use isomesh_gpu::{create_sphere_chunk_view, IsoMesher, MesherSettings};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("🚀 GPU Isosurface Extraction Example");
    println!("====================================");

    println!("\n📱 Initializing mesher...");
    let mesher = pollster::block_on(IsoMesher::new(MesherSettings::default().with_validation(true)))?;
    println!("✅ Mesher ready on {}", mesher.gpu().adapter.get_info().name);

    let view = create_sphere_chunk_view(&mesher)?;
    let proxy = view.proxy().context("sphere view has no proxy")?;
    println!("\n📊 Volume: {:?} cubes", proxy.grid().dimensions());

    let finished = view.subscribe_build_finished();
    let start = Instant::now();
    view.rebuild_mesh()?;
    let event = finished.recv().context("mesher stopped before the build finished")?;
    println!("✅ Generation {} finished in {:?}", event.generation, start.elapsed());
    println!("   - Vertices: {}", event.vertex_count);
    println!("   - Triangles: {}", event.primitive_count);

    let mesh = pollster::block_on(proxy.read_mesh())?.context("no committed mesh")?;
    let mean_radius = mesh.positions.iter().map(|p| p.coords.norm()).sum::<f32>() / mesh.positions.len().max(1) as f32;
    println!("\n📐 Mean vertex distance from centre: {:.3}", mean_radius);

    println!("\n🎉 Done");
    Ok(())
}
