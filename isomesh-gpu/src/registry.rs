//! Registry that rebuilds dirty chunk views once per tick

use std::sync::{Arc, Weak};

use crate::chunk_view::VolumeChunkView;

/// Weakly held chunk views
#[derive(Default)]
pub struct ChunkRegistry {
    views: Vec<Weak<VolumeChunkView>>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a view until it is dropped elsewhere
    pub fn register(&mut self, view: &Arc<VolumeChunkView>) {
        self.views.push(Arc::downgrade(view));
    }

    /// Number of registered views still alive
    pub fn len(&self) -> usize {
        self.views.iter().filter(|view| view.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild every dirty, non-empty view and prune dropped ones
    ///
    /// Returns the number of generations started. Views whose previous run
    /// is still in flight stay dirty and are retried next tick.
    pub fn tick(&mut self) -> usize {
        self.views.retain(|view| view.strong_count() > 0);

        let mut started = 0;
        for view in self.views.iter().filter_map(Weak::upgrade) {
            if !view.is_dirty() || view.is_empty() {
                continue;
            }
            match view.rebuild_mesh() {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(error) => log::error!("failed to start mesh rebuild: {}", error),
            }
        }
        started
    }
}
