//! Submission worker
//!
//! One thread owns command encoding, submission and mapping callbacks. A run
//! advances pass by pass until it reaches a readback, then parks inside the
//! `map_async` callback. While any run is parked the worker polls the device
//! without blocking, and the callback sends the run back to be resumed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use isomesh_core::{Error, Result};

use crate::device::GpuContext;
use crate::graph::{CompiledGraph, PassBody, PassContext, ResolveFn};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Per-run state threaded through a pass graph
pub trait RunState: Send + 'static {
    /// Every pass ran
    fn complete(self);

    /// A pass failed; later passes never run
    fn abort(self, pass: &'static str, error: Error);
}

pub(crate) enum WorkerMessage {
    Start(Box<dyn GraphTask>),
    Resume {
        task: Box<dyn GraphTask>,
        mapped: Result<()>,
    },
    Shutdown,
}

pub(crate) enum Step {
    Parked,
    Finished,
}

pub(crate) trait GraphTask: Send {
    fn advance(self: Box<Self>, gpu: &GpuContext, sender: &Sender<WorkerMessage>) -> Step;

    fn resume(self: Box<Self>, mapped: Result<()>, gpu: &GpuContext, sender: &Sender<WorkerMessage>) -> Step;

    fn cancel(self: Box<Self>, error: Error);
}

struct PendingReadback<S> {
    name: &'static str,
    staging: Arc<wgpu::Buffer>,
    resolve: ResolveFn<S>,
}

/// A compiled graph executing against its run state
pub(crate) struct GraphRun<S> {
    state: S,
    passes: CompiledGraph<S>,
    encoder: Option<wgpu::CommandEncoder>,
    pending: Option<PendingReadback<S>>,
}

impl<S: RunState> GraphRun<S> {
    pub(crate) fn new(passes: CompiledGraph<S>, state: S) -> Self {
        Self {
            state,
            passes,
            encoder: None,
            pending: None,
        }
    }

    fn fail(self: Box<Self>, pass: &'static str, error: Error) -> Step {
        let run = *self;
        run.state.abort(pass, error);
        Step::Finished
    }
}

fn create_encoder(gpu: &GpuContext) -> wgpu::CommandEncoder {
    gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("isomesh run encoder"),
    })
}

impl<S: RunState> GraphTask for GraphRun<S> {
    fn advance(mut self: Box<Self>, gpu: &GpuContext, sender: &Sender<WorkerMessage>) -> Step {
        while let Some(pass) = self.passes.next_pass() {
            log::debug!("running pass '{}'", pass.name);
            match pass.body {
                PassBody::Compute(run) => {
                    let this = &mut *self;
                    let encoder = this.encoder.get_or_insert_with(|| create_encoder(gpu));
                    let mut context = PassContext { gpu, encoder };
                    if let Err(error) = run(&mut this.state, &mut context) {
                        return self.fail(pass.name, error);
                    }
                }
                PassBody::Readback { source, resolve } => {
                    let source = match source(&self.state) {
                        Ok(source) => source,
                        Err(error) => return self.fail(pass.name, error),
                    };
                    if source.size() == 0 {
                        return self.fail(pass.name, Error::InvalidGraph("empty readback".to_string()));
                    }

                    let staging = Arc::new(gpu.create_buffer(
                        pass.name,
                        source.size(),
                        wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                    ));

                    let mut encoder = self.encoder.take().unwrap_or_else(|| create_encoder(gpu));
                    let mut offset = 0;
                    for (buffer, size) in source.segments() {
                        encoder.copy_buffer_to_buffer(buffer, 0, &staging, offset, *size);
                        offset += size;
                    }
                    gpu.queue.submit(std::iter::once(encoder.finish()));

                    self.pending = Some(PendingReadback {
                        name: pass.name,
                        staging: staging.clone(),
                        resolve,
                    });

                    let sender = sender.clone();
                    staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                        let mapped = result.map_err(Error::from);
                        // Send fails only after the worker exits
                        let _ = sender.send(WorkerMessage::Resume { task: self, mapped });
                    });
                    return Step::Parked;
                }
            }
        }

        if let Some(encoder) = self.encoder.take() {
            gpu.queue.submit(std::iter::once(encoder.finish()));
        }
        let run = *self;
        run.state.complete();
        Step::Finished
    }

    fn resume(mut self: Box<Self>, mapped: Result<()>, gpu: &GpuContext, sender: &Sender<WorkerMessage>) -> Step {
        let Some(pending) = self.pending.take() else {
            return self.fail("resume", Error::Gpu("no readback was pending".to_string()));
        };
        if let Err(error) = mapped {
            return self.fail(pending.name, error);
        }

        let resolved = {
            let data = pending.staging.slice(..).get_mapped_range();
            (pending.resolve)(&mut self.state, gpu, &data[..])
        };
        pending.staging.unmap();

        match resolved {
            Ok(()) => self.advance(gpu, sender),
            Err(error) => self.fail(pending.name, error),
        }
    }

    fn cancel(self: Box<Self>, error: Error) {
        let run = *self;
        run.state.abort("start", error);
    }
}

/// Start the submission worker thread
pub(crate) fn spawn_worker(gpu: Arc<GpuContext>) -> Result<(Sender<WorkerMessage>, JoinHandle<()>)> {
    let (sender, receiver) = flume::unbounded();
    let callback_sender = sender.clone();
    let handle = std::thread::Builder::new()
        .name("isomesh-submit".to_string())
        .spawn(move || run_worker(&gpu, &callback_sender, &receiver))?;
    Ok((sender, handle))
}

fn run_worker(gpu: &GpuContext, sender: &Sender<WorkerMessage>, receiver: &Receiver<WorkerMessage>) {
    let mut parked = 0usize;
    let mut shutting_down = false;

    loop {
        if shutting_down && parked == 0 {
            break;
        }

        let message = if parked > 0 {
            // Outstanding mappings are waited on during shutdown
            let maintain = if shutting_down {
                wgpu::Maintain::Wait
            } else {
                wgpu::Maintain::Poll
            };
            gpu.device.poll(maintain);
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            }
        };

        match message {
            WorkerMessage::Start(task) if shutting_down => {
                task.cancel(Error::Gpu("mesher is shutting down".to_string()));
            }
            WorkerMessage::Start(task) => {
                if let Step::Parked = task.advance(gpu, sender) {
                    parked += 1;
                }
            }
            WorkerMessage::Resume { task, mapped } => {
                parked = parked.saturating_sub(1);
                if let Step::Parked = task.resume(mapped, gpu, sender) {
                    parked += 1;
                }
            }
            WorkerMessage::Shutdown => {
                log::debug!("submission worker shutting down with {} parked runs", parked);
                shutting_down = true;
            }
        }
    }

    log::debug!("submission worker stopped");
}
