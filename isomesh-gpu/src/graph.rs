//! Pass graph with deferred resources
//!
//! A run is described as compute passes and readback passes joined by
//! explicit dependencies. Readback passes copy buffers into a staging buffer
//! and hand the mapped bytes to a resolve callback, which typically creates
//! the buffers the next pass consumes and stores them in a [`Deferred`] slot
//! of the run state.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use isomesh_core::{Error, Result};

use crate::device::GpuContext;

/// Index of a pass within its graph
pub type PassId = usize;

/// Encoder access for compute passes
pub struct PassContext<'a> {
    pub gpu: &'a GpuContext,
    pub encoder: &'a mut wgpu::CommandEncoder,
}

pub type ComputeFn<S> = Box<dyn FnOnce(&mut S, &mut PassContext<'_>) -> Result<()> + Send>;
pub type SourceFn<S> = Box<dyn FnOnce(&S) -> Result<ReadbackSource> + Send>;
pub type ResolveFn<S> = Box<dyn FnOnce(&mut S, &GpuContext, &[u8]) -> Result<()> + Send>;

/// Buffers copied, back to back, into one staging buffer
#[derive(Default)]
pub struct ReadbackSource {
    segments: Vec<(Arc<wgpu::Buffer>, u64)>,
}

impl ReadbackSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the first `size` bytes of `buffer`
    pub fn with(mut self, buffer: &Arc<wgpu::Buffer>, size: u64) -> Self {
        self.segments.push((buffer.clone(), size));
        self
    }

    /// Total staging size in bytes
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|(_, size)| size).sum()
    }

    pub(crate) fn segments(&self) -> &[(Arc<wgpu::Buffer>, u64)] {
        &self.segments
    }
}

pub(crate) enum PassBody<S> {
    Compute(ComputeFn<S>),
    Readback { source: SourceFn<S>, resolve: ResolveFn<S> },
}

pub(crate) struct Pass<S> {
    pub(crate) name: &'static str,
    deps: Vec<PassId>,
    pub(crate) body: PassBody<S>,
}

/// Passes and their dependencies for one run
pub struct PassGraph<S> {
    passes: Vec<Pass<S>>,
}

impl<S> Default for PassGraph<S> {
    fn default() -> Self {
        Self { passes: Vec::new() }
    }
}

impl<S> PassGraph<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Add a pass that records commands into the shared encoder
    pub fn add_compute<F>(&mut self, name: &'static str, deps: &[PassId], run: F) -> PassId
    where
        F: FnOnce(&mut S, &mut PassContext<'_>) -> Result<()> + Send + 'static,
    {
        self.push(name, deps, PassBody::Compute(Box::new(run)))
    }

    /// Add a pass that submits pending work and maps buffers back
    ///
    /// `source` picks the buffers once the pass is reached; `resolve` runs on
    /// the submission worker after the mapping completes.
    pub fn add_readback<F, G>(&mut self, name: &'static str, deps: &[PassId], source: F, resolve: G) -> PassId
    where
        F: FnOnce(&S) -> Result<ReadbackSource> + Send + 'static,
        G: FnOnce(&mut S, &GpuContext, &[u8]) -> Result<()> + Send + 'static,
    {
        self.push(
            name,
            deps,
            PassBody::Readback {
                source: Box::new(source),
                resolve: Box::new(resolve),
            },
        )
    }

    fn push(&mut self, name: &'static str, deps: &[PassId], body: PassBody<S>) -> PassId {
        let id = self.passes.len();
        self.passes.push(Pass {
            name,
            deps: deps.to_vec(),
            body,
        });
        id
    }

    /// Order passes so every pass follows its dependencies
    ///
    /// Ties are broken by insertion order.
    pub fn compile(self) -> Result<CompiledGraph<S>> {
        let count = self.passes.len();
        let mut indegree = vec![0usize; count];
        let mut dependents = vec![Vec::new(); count];

        for (id, pass) in self.passes.iter().enumerate() {
            for &dep in &pass.deps {
                if dep >= count {
                    return Err(Error::InvalidGraph(format!(
                        "pass '{}' depends on unknown pass {}",
                        pass.name, dep
                    )));
                }
                indegree[id] += 1;
                dependents[dep].push(id);
            }
        }

        let mut ready: BTreeSet<PassId> = (0..count).filter(|&id| indegree[id] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &next in &dependents[id] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != count {
            let stuck: Vec<&str> = (0..count)
                .filter(|&id| indegree[id] > 0)
                .map(|id| self.passes[id].name)
                .collect();
            return Err(Error::InvalidGraph(format!("dependency cycle through {:?}", stuck)));
        }

        let mut slots: Vec<Option<Pass<S>>> = self.passes.into_iter().map(Some).collect();
        let passes = order.into_iter().filter_map(|id| slots[id].take()).collect();
        Ok(CompiledGraph { passes })
    }
}

/// Passes in execution order
pub struct CompiledGraph<S> {
    passes: VecDeque<Pass<S>>,
}

impl<S> CompiledGraph<S> {
    /// Pass names in execution order
    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub(crate) fn next_pass(&mut self) -> Option<Pass<S>> {
        self.passes.pop_front()
    }
}

/// A resource produced by one pass and consumed by a later one
#[derive(Debug)]
pub struct Deferred<T> {
    name: &'static str,
    value: Option<T>,
}

impl<T> Deferred<T> {
    pub fn new(name: &'static str) -> Self {
        Self { name, value: None }
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    /// Fulfil the slot; a slot resolves exactly once
    pub fn resolve(&mut self, value: T) -> Result<()> {
        if self.value.is_some() {
            return Err(Error::InvalidGraph(format!("'{}' resolved twice", self.name)));
        }
        self.value = Some(value);
        Ok(())
    }

    pub fn get(&self) -> Result<&T> {
        self.value.as_ref().ok_or(Error::UnresolvedResource(self.name))
    }

    pub fn into_inner(self) -> Result<T> {
        self.value.ok_or(Error::UnresolvedResource(self.name))
    }
}
