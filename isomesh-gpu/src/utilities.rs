//! Convenience constructors

use std::sync::Arc;

use isomesh_core::{level_set_sphere, Point3, Result};

use crate::chunk_view::VolumeChunkView;
use crate::mesher::IsoMesher;

/// Radius of the default sphere, in voxels
pub const DEFAULT_SPHERE_RADIUS: f32 = 32.0;

/// Narrow band half width of the default sphere, in voxels
pub const DEFAULT_HALF_WIDTH: f32 = 3.0;

/// A view preloaded with a signed distance sphere centred at the origin
pub fn create_sphere_chunk_view(mesher: &IsoMesher) -> Result<Arc<VolumeChunkView>> {
    let view = mesher.create_view();
    view.set_level_set(&level_set_sphere(
        DEFAULT_SPHERE_RADIUS,
        Point3::origin(),
        1.0,
        DEFAULT_HALF_WIDTH,
    ))?;
    Ok(view)
}
