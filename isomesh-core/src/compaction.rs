//! Host model of the classification and compaction contract
//!
//! Mirrors the classify and compaction kernels with rayon and atomics so the
//! offset invariants can be checked without a GPU, and validates compaction
//! tables read back from the device. Compacted order is whatever the atomics
//! produce; only disjointness and totals are guaranteed.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::layout::{GenerationCounters, VertexIndexOffset};
use crate::tables::{case_index, case_info, EMPTY_CASE};
use crate::volume::VolumeGrid;

/// Compacted non-empty cube list with exclusive emission offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionTables {
    pub linear_ids: Vec<u32>,
    pub cube_indices: Vec<u32>,
    pub offsets: Vec<VertexIndexOffset>,
}

/// Case index of every lattice cube
pub fn classify_cubes(grid: &VolumeGrid, iso_value: f32) -> Vec<u32> {
    let dims = grid.dimensions();
    (0..dims.total_cubes())
        .into_par_iter()
        .map(|linear| {
            let [x, y, z] = dims.coord_of(linear);
            case_index(&grid.cube_corners(x, y, z), iso_value)
        })
        .collect()
}

/// Compact non-empty cubes and assign offsets by atomic fetch-and-add
pub fn compact_cubes(cube_cases: &[u32]) -> (CompactionTables, GenerationCounters) {
    let slot_counter = AtomicU32::new(0);
    let vertex_counter = AtomicU32::new(0);
    let index_counter = AtomicU32::new(0);

    let entries: Vec<(u32, u32, u32, VertexIndexOffset)> = cube_cases
        .par_iter()
        .enumerate()
        .filter(|(_, &case)| case != EMPTY_CASE)
        .map(|(linear, &case)| {
            let info = case_info(case);
            let slot = slot_counter.fetch_add(1, Ordering::Relaxed);
            let offset = VertexIndexOffset {
                vertex: vertex_counter.fetch_add(info.vertex_count, Ordering::Relaxed),
                index: index_counter.fetch_add(info.index_count, Ordering::Relaxed),
            };
            (slot, linear as u32, case, offset)
        })
        .collect();

    let count = entries.len();
    let mut tables = CompactionTables {
        linear_ids: vec![0; count],
        cube_indices: vec![EMPTY_CASE; count],
        offsets: vec![VertexIndexOffset::default(); count],
    };
    for (slot, linear, case, offset) in entries {
        let slot = slot as usize;
        tables.linear_ids[slot] = linear;
        tables.cube_indices[slot] = case;
        tables.offsets[slot] = offset;
    }

    let counters = GenerationCounters {
        non_empty_cubes: slot_counter.into_inner(),
        vertices: vertex_counter.into_inner(),
        indices: index_counter.into_inner(),
        reserved: 0,
    };

    (tables, counters)
}

/// Check compaction tables against the classification they were built from
///
/// Every non-empty cube must appear exactly once with its own case, and the
/// vertex and index ranges must tile `[0, total)` without overlap.
pub fn validate_compaction(
    cube_cases: &[u32],
    tables: &CompactionTables,
    counters: &GenerationCounters,
) -> Result<()> {
    let expected = cube_cases.iter().filter(|&&c| c != EMPTY_CASE).count();
    let count = counters.non_empty_cubes as usize;
    if count != expected {
        return Err(Error::InvalidData(format!(
            "counter reports {} non-empty cubes, classification has {}",
            count, expected
        )));
    }
    if tables.linear_ids.len() < count
        || tables.cube_indices.len() < count
        || tables.offsets.len() < count
    {
        return Err(Error::InvalidData(format!(
            "compaction tables hold fewer than {} slots",
            count
        )));
    }

    let mut seen = vec![false; cube_cases.len()];
    let mut vertex_ranges = Vec::with_capacity(count);
    let mut index_ranges = Vec::with_capacity(count);

    for slot in 0..count {
        let linear = tables.linear_ids[slot] as usize;
        let case = tables.cube_indices[slot];
        match cube_cases.get(linear) {
            Some(&classified) if classified == case && case != EMPTY_CASE => {}
            _ => {
                return Err(Error::InvalidData(format!(
                    "slot {} holds cube {} with case {} that disagrees with classification",
                    slot, linear, case
                )))
            }
        }
        if std::mem::replace(&mut seen[linear], true) {
            return Err(Error::InvalidData(format!("cube {} compacted twice", linear)));
        }

        let info = case_info(case);
        let offset = tables.offsets[slot];
        vertex_ranges.push((offset.vertex, info.vertex_count));
        index_ranges.push((offset.index, info.index_count));
    }

    check_tiling("vertex", vertex_ranges, counters.vertices)?;
    check_tiling("index", index_ranges, counters.indices)
}

fn check_tiling(kind: &str, mut ranges: Vec<(u32, u32)>, total: u32) -> Result<()> {
    ranges.sort_unstable();
    let mut end = 0u32;
    for (start, len) in ranges {
        if start != end {
            return Err(Error::InvalidData(format!(
                "{} range at {} does not follow the previous range ending at {}",
                kind, start, end
            )));
        }
        end = start + len;
    }
    if end != total {
        return Err(Error::InvalidData(format!(
            "{} ranges cover {} entries, counter reports {}",
            kind, end, total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::CASE_INFO;
    use crate::volume::encode_field;
    use rand::{Rng, SeedableRng};

    fn random_grid(seed: u64, counts: [u32; 3]) -> VolumeGrid {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let n = counts.iter().product::<u32>() as usize;
        let samples: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        VolumeGrid::from_bytes(encode_field([0; 3], counts, 1.0, 1.0, &samples)).unwrap()
    }

    #[test]
    fn test_random_lattices_tile_offsets() {
        for seed in 0..8 {
            let grid = random_grid(seed, [9, 7, 6]);
            let cases = classify_cubes(&grid, 0.0);
            assert_eq!(cases.len(), grid.dimensions().total_cubes() as usize);

            let (tables, counters) = compact_cubes(&cases);
            validate_compaction(&cases, &tables, &counters).unwrap();

            let expected_vertices: u32 = cases.iter().map(|&c| CASE_INFO[c as usize].vertex_count).sum();
            let expected_indices: u32 = cases.iter().map(|&c| CASE_INFO[c as usize].index_count).sum();
            assert_eq!(counters.vertices, expected_vertices);
            assert_eq!(counters.indices, expected_indices);
            assert_eq!(counters.indices % 3, 0);
        }
    }

    #[test]
    fn test_two_cube_lattice_offsets() {
        // 3x2x2 points: point (0,0,0) is corner 0 of cube 0, point (2,1,1) is corner 6 of cube 1
        let mut samples = [1.0f32; 12];
        samples[0] = -1.0;
        samples[11] = -1.0;
        let grid = VolumeGrid::from_bytes(encode_field([0; 3], [3, 2, 2], 1.0, 1.0, &samples)).unwrap();

        let cases = classify_cubes(&grid, 0.0);
        assert_eq!(cases, vec![1, 64]);

        let (tables, counters) = compact_cubes(&cases);
        assert_eq!(
            counters,
            GenerationCounters {
                non_empty_cubes: 2,
                vertices: 6,
                indices: 6,
                reserved: 0,
            }
        );

        // Slot order is up to the atomics; each cube keeps its own case
        let mut by_cube: Vec<(u32, u32)> = tables.linear_ids.iter().copied().zip(tables.cube_indices.iter().copied()).collect();
        by_cube.sort_unstable();
        assert_eq!(by_cube, vec![(0, 1), (1, 64)]);

        let mut offsets = tables.offsets.clone();
        offsets.sort_by_key(|offset| offset.vertex);
        assert_eq!(
            offsets,
            vec![
                VertexIndexOffset { vertex: 0, index: 0 },
                VertexIndexOffset { vertex: 3, index: 3 },
            ]
        );
        validate_compaction(&cases, &tables, &counters).unwrap();
    }

    #[test]
    fn test_uniform_field_is_empty() {
        let counts = [4u32, 4, 4];
        let inside = encode_field([0; 3], counts, 1.0, 1.0, &[-1.0; 64]);
        let grid = VolumeGrid::from_bytes(inside).unwrap();
        let cases = classify_cubes(&grid, 0.0);
        assert!(cases.iter().all(|&c| c == EMPTY_CASE));

        let (tables, counters) = compact_cubes(&cases);
        assert_eq!(counters, GenerationCounters::default());
        assert!(tables.linear_ids.is_empty());
        validate_compaction(&cases, &tables, &counters).unwrap();
    }

    #[test]
    fn test_validation_rejects_overlap() {
        let grid = random_grid(42, [6, 6, 6]);
        let cases = classify_cubes(&grid, 0.0);
        let (mut tables, counters) = compact_cubes(&cases);
        assert!(counters.non_empty_cubes >= 2);

        tables.offsets[1] = tables.offsets[0];
        assert!(validate_compaction(&cases, &tables, &counters).is_err());
    }

    #[test]
    fn test_validation_rejects_wrong_count() {
        let grid = random_grid(7, [5, 5, 5]);
        let cases = classify_cubes(&grid, 0.0);
        let (tables, mut counters) = compact_cubes(&cases);
        counters.non_empty_cubes -= 1;
        assert!(validate_compaction(&cases, &tables, &counters).is_err());
    }
}
