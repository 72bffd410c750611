//! Chunk view: the volume instance that owns a snapshot and its mesh proxy

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::Receiver;
use isomesh_core::{PersistedVolume, Result, SparseLevelSet, VolumeGrid};

use crate::mesher::MesherShared;
use crate::proxy::{BuildEvents, BuildFinished, MeshProxy};

struct ChunkState {
    grid: Option<Arc<VolumeGrid>>,
    iso_value: f32,
    proxy: Option<Arc<MeshProxy>>,
    dirty: bool,
}

/// A volume snapshot and the proxy meshing it
///
/// Replacing the volume discards the previous proxy; a run still in flight
/// on it completes but raises no build event.
pub struct VolumeChunkView {
    shared: Arc<MesherShared>,
    events: Arc<BuildEvents>,
    state: Mutex<ChunkState>,
}

impl VolumeChunkView {
    pub(crate) fn new(shared: Arc<MesherShared>) -> Self {
        Self {
            shared,
            events: Arc::new(BuildEvents::default()),
            state: Mutex::new(ChunkState {
                grid: None,
                iso_value: 0.0,
                proxy: None,
                dirty: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChunkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the volume with a linearized field; empty bytes mean no mesh
    pub fn set_volume(&self, bytes: Vec<u8>) -> Result<()> {
        let grid = parse_volume(bytes)?;
        let mut state = self.lock();
        self.install(&mut state, grid);
        Ok(())
    }

    /// Swap in a parsed snapshot and a fresh proxy for it
    fn install(&self, state: &mut ChunkState, grid: Option<Arc<VolumeGrid>>) {
        if let Some(previous) = state.proxy.take() {
            previous.detach();
        }
        let iso_value = state.iso_value;
        state.proxy = grid
            .as_ref()
            .map(|grid| MeshProxy::new(self.shared.clone(), grid.clone(), iso_value, self.events.clone()));
        state.dirty = grid.is_some();
        if let Some(grid) = &grid {
            log::debug!("volume set: {:?} cubes", grid.dimensions());
        }
        state.grid = grid;
    }

    /// Replace the volume with a densified sparse level set
    pub fn set_level_set(&self, level_set: &SparseLevelSet) -> Result<()> {
        self.set_volume(level_set.linearize())
    }

    /// No volume is set
    pub fn is_empty(&self) -> bool {
        self.lock().grid.is_none()
    }

    /// The mesh does not reflect the current volume and iso value
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn mark_dirty(&self) {
        let mut state = self.lock();
        state.dirty = state.grid.is_some();
    }

    pub fn iso_value(&self) -> f32 {
        self.lock().iso_value
    }

    pub fn proxy(&self) -> Option<Arc<MeshProxy>> {
        self.lock().proxy.clone()
    }

    /// Start a generation on the current proxy
    ///
    /// Returns `Ok(false)` without a volume or while a generation is in flight.
    pub fn rebuild_mesh(&self) -> Result<bool> {
        let mut state = self.lock();
        let Some(proxy) = state.proxy.clone() else {
            return Ok(false);
        };
        let started = proxy.rebuild()?;
        if started {
            state.dirty = false;
        }
        Ok(started)
    }

    /// Change the isosurface threshold
    ///
    /// Rebuilds right away when `rebuild_on_change` is set, otherwise leaves
    /// the view dirty.
    pub fn update_iso_value(&self, iso_value: f32) -> Result<()> {
        let mut state = self.lock();
        if state.iso_value == iso_value {
            return Ok(());
        }
        state.iso_value = iso_value;

        let Some(proxy) = state.proxy.clone() else {
            return Ok(());
        };
        proxy.set_iso_value(iso_value);
        state.dirty = true;

        if self.shared.settings.rebuild_on_change && proxy.rebuild()? {
            state.dirty = false;
        }
        Ok(())
    }

    /// One receiver per subscriber; every completed run is sent to all of them
    pub fn subscribe_build_finished(&self) -> Receiver<BuildFinished> {
        self.events.subscribe()
    }

    /// Persist the field bytes and iso value
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let persisted = {
            let state = self.lock();
            PersistedVolume {
                bytes: state.grid.as_ref().map(|grid| grid.as_bytes().to_vec()).unwrap_or_default(),
                iso_value: state.iso_value,
            }
        };
        persisted.write_to(writer)
    }

    /// Restore state written by [`VolumeChunkView::write_to`]
    ///
    /// Leaves the view untouched when the stored field does not parse.
    pub fn read_from<R: Read>(&self, reader: &mut R) -> Result<()> {
        let persisted = PersistedVolume::read_from(reader)?;
        let grid = parse_volume(persisted.bytes)?;

        let mut state = self.lock();
        state.iso_value = persisted.iso_value;
        self.install(&mut state, grid);
        Ok(())
    }
}

fn parse_volume(bytes: Vec<u8>) -> Result<Option<Arc<VolumeGrid>>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(VolumeGrid::from_bytes(bytes)?)))
}
