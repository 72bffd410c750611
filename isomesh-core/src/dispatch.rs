//! Dispatch shape computation
//!
//! Platforms cap the number of workgroups per dimension (65535 on every
//! backend wgpu targets by default). Large lattices overflow a 1-D dispatch,
//! so work spills into Y and then Z. Kernels rebuild the linear thread id as
//! `gid.x + gid.y * (groups.x * size) + gid.z * (groups.x * size * groups.y)`.

/// Maximum workgroup count per dispatch dimension
pub const MAX_GROUPS_PER_DIMENSION: u32 = 65535;

/// Threads per workgroup used by every marching cubes kernel
pub const WORKGROUP_SIZE: u32 = 64;

/// Compute the workgroup grid covering `work_items` threads
///
/// Never returns a zero dimension, so an empty run still issues a valid
/// dispatch whose threads all exit early.
pub fn dispatch_shape(work_items: u32, threads_per_group: u32) -> [u32; 3] {
    dispatch_shape_with_limit(work_items, threads_per_group, MAX_GROUPS_PER_DIMENSION)
}

/// [`dispatch_shape`] with an explicit per-dimension cap
pub fn dispatch_shape_with_limit(work_items: u32, threads_per_group: u32, max_groups: u32) -> [u32; 3] {
    let threads_per_group = threads_per_group.max(1);
    let max_groups = max_groups.max(1);
    let groups = work_items.div_ceil(threads_per_group).max(1);

    let x = groups.min(max_groups);
    let rows = groups.div_ceil(x);
    let y = rows.min(max_groups);
    let z = rows.div_ceil(y);

    [x, y, z]
}

/// Number of threads a dispatch shape launches
pub fn covered_threads(shape: [u32; 3], threads_per_group: u32) -> u64 {
    shape.iter().map(|&d| d as u64).product::<u64>() * threads_per_group as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_dispatch_stays_one_dimensional() {
        assert_eq!(dispatch_shape(20000, 1), [20000, 1, 1]);
        assert_eq!(dispatch_shape(20000, WORKGROUP_SIZE), [313, 1, 1]);
    }

    #[test]
    fn test_large_dispatch_spills_into_y() {
        assert_eq!(dispatch_shape(200000, 1), [65535, 4, 1]);
    }

    #[test]
    fn test_empty_dispatch_is_never_zero() {
        assert_eq!(dispatch_shape(0, WORKGROUP_SIZE), [1, 1, 1]);
        assert_eq!(dispatch_shape(0, 0), [1, 1, 1]);
    }

    #[test]
    fn test_spill_into_z() {
        let shape = dispatch_shape_with_limit(1000, 1, 8);
        assert_eq!(shape, [8, 8, 16]);
        assert!(covered_threads(shape, 1) >= 1000);
    }

    #[test]
    fn test_shape_covers_work_and_respects_cap() {
        let sizes = [1u32, 63, 64, 65, 4095, 65535, 65536, 4_194_304, 16_777_216, u32::MAX / 2];
        for &items in &sizes {
            for &tpg in &[1u32, 32, 64, 256] {
                let shape = dispatch_shape(items, tpg);
                assert!(covered_threads(shape, tpg) >= items as u64, "items {} tpg {}", items, tpg);
                assert!(shape.iter().all(|&d| d >= 1 && d <= MAX_GROUPS_PER_DIMENSION));
            }
        }
    }
}
