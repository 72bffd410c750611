//! Core data structures for isomesh
//!
//! This crate holds everything about GPU isosurface extraction that does not
//! need a device: volume snapshots and sparse level sets, the marching cubes
//! tables, the memory layouts shared with the kernels, dispatch and buffer
//! sizing, and a host model of the compaction contract.

pub mod compaction;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod level_set;
pub mod sizing;
pub mod tables;
pub mod volume;

pub use compaction::*;
pub use dispatch::*;
pub use error::*;
pub use layout::*;
pub use level_set::*;
pub use sizing::*;
pub use tables::{case_index, case_info, local_vertex_slot, CaseInfo, EMPTY_CASE, MAX_INDICES_PER_CUBE, MAX_VERTICES_PER_CUBE};
pub use volume::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Point3, Vector3};
