//! # isomesh GPU
//!
//! GPU-resident marching cubes using WGPU.
//!
//! A [`IsoMesher`] owns the device, the three compute kernels and a
//! submission worker. Each [`VolumeChunkView`] holds one volume snapshot and
//! a [`MeshProxy`] whose vertex and index buffers stay on the GPU.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use isomesh_gpu::{create_sphere_chunk_view, IsoMesher, MesherSettings};
//!
//! async fn example() -> isomesh_core::Result<()> {
//!     let mesher = IsoMesher::new(MesherSettings::default()).await?;
//!     let view = create_sphere_chunk_view(&mesher)?;
//!
//!     let finished = view.subscribe_build_finished();
//!     view.rebuild_mesh()?;
//!     let event = finished.recv_async().await.expect("mesher stopped");
//!     println!("{} triangles", event.primitive_count);
//!     Ok(())
//! }
//! ```

pub mod buffers;
pub mod chunk_view;
pub mod device;
pub mod graph;
pub mod kernels;
pub mod mesher;
mod pipeline;
pub mod proxy;
pub mod registry;
mod submission;
pub mod utilities;

// Re-export commonly used items
pub use buffers::{CompactionBuffers, MeshBuffers, VolumeBuffers};
pub use chunk_view::VolumeChunkView;
pub use device::GpuContext;
pub use graph::{CompiledGraph, Deferred, PassContext, PassGraph, PassId, ReadbackSource};
pub use mesher::{IsoMesher, MesherSettings};
pub use proxy::{BuildFinished, GenerationGuard, GenerationState, MeshData, MeshProxy};
pub use registry::ChunkRegistry;
pub use submission::RunState;
pub use utilities::create_sphere_chunk_view;
