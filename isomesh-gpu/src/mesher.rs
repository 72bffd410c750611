//! Mesher: device, kernels and the submission worker shared by all chunk views

use std::sync::Arc;
use std::thread::JoinHandle;

use flume::Sender;
use isomesh_core::{BufferSizingPolicy, Error, Result};
use serde::{Deserialize, Serialize};

use crate::chunk_view::VolumeChunkView;
use crate::device::GpuContext;
use crate::kernels::MarchingCubesKernels;
use crate::submission::{spawn_worker, GraphTask, WorkerMessage};

/// Mesher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MesherSettings {
    /// How compaction tables and mesh buffers are sized
    pub sizing_policy: BufferSizingPolicy,
    /// Read compaction tables back and check them on the host (debug only)
    pub validate_compaction: bool,
    /// Rebuild as soon as the iso value changes instead of waiting for a tick
    pub rebuild_on_change: bool,
}

impl Default for MesherSettings {
    fn default() -> Self {
        Self {
            sizing_policy: BufferSizingPolicy::Measured,
            validate_compaction: false,
            rebuild_on_change: true,
        }
    }
}

impl MesherSettings {
    pub fn with_sizing_policy(mut self, policy: BufferSizingPolicy) -> Self {
        self.sizing_policy = policy;
        self
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_compaction = validate;
        self
    }

    pub fn with_rebuild_on_change(mut self, rebuild: bool) -> Self {
        self.rebuild_on_change = rebuild;
        self
    }
}

pub(crate) struct MesherShared {
    pub(crate) gpu: Arc<GpuContext>,
    pub(crate) kernels: MarchingCubesKernels,
    pub(crate) settings: MesherSettings,
    sender: Sender<WorkerMessage>,
}

impl MesherShared {
    pub(crate) fn submit(&self, task: Box<dyn GraphTask>) -> Result<()> {
        self.sender
            .send(WorkerMessage::Start(task))
            .map_err(|_| Error::Gpu("submission worker has stopped".to_string()))
    }
}

/// Owns the submission worker; dropping it drains in-flight runs and joins
pub struct IsoMesher {
    shared: Arc<MesherShared>,
    worker: Option<JoinHandle<()>>,
}

impl IsoMesher {
    /// Create a mesher on a new device
    pub async fn new(settings: MesherSettings) -> Result<Self> {
        let gpu = GpuContext::new().await?;
        Self::with_context(Arc::new(gpu), settings)
    }

    /// Create a mesher on an existing device
    pub fn with_context(gpu: Arc<GpuContext>, settings: MesherSettings) -> Result<Self> {
        let kernels = MarchingCubesKernels::new(&gpu);
        let (sender, worker) = spawn_worker(gpu.clone())?;
        log::debug!("mesher ready with {:?}", settings);

        Ok(Self {
            shared: Arc::new(MesherShared {
                gpu,
                kernels,
                settings,
                sender,
            }),
            worker: Some(worker),
        })
    }

    pub fn settings(&self) -> &MesherSettings {
        &self.shared.settings
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.shared.gpu
    }

    /// Create an empty chunk view meshed by this mesher
    pub fn create_view(&self) -> Arc<VolumeChunkView> {
        Arc::new(VolumeChunkView::new(self.shared.clone()))
    }
}

impl Drop for IsoMesher {
    fn drop(&mut self) {
        let _ = self.shared.sender.send(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("submission worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = MesherSettings::default();
        assert_eq!(settings.sizing_policy, BufferSizingPolicy::Measured);
        assert!(!settings.validate_compaction);
        assert!(settings.rebuild_on_change);
    }

    #[test]
    fn test_settings_builders() {
        let settings = MesherSettings::default()
            .with_sizing_policy(BufferSizingPolicy::WorstCase)
            .with_validation(true)
            .with_rebuild_on_change(false);
        assert_eq!(settings.sizing_policy, BufferSizingPolicy::WorstCase);
        assert!(settings.validate_compaction);
        assert!(!settings.rebuild_on_change);
    }
}
