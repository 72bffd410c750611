//! GPU device management

use isomesh_core::{ensure_within_limit, Error, Result};
use wgpu::util::DeviceExt;

/// GPU context for the marching cubes kernels
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Create a new GPU context
    pub async fn new() -> Result<Self> {
        Self::create(None).await
    }

    /// Create a GPU context whose storage buffers are capped at `max_bytes`
    pub async fn with_storage_buffer_limit(max_bytes: u32) -> Result<Self> {
        Self::create(Some(max_bytes)).await
    }

    async fn create(storage_buffer_limit: Option<u32>) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::Gpu("Failed to find suitable adapter".to_string()))?;

        // Large lattices need the adapter's full buffer limits
        let supported = adapter.limits();
        let max_storage_buffer_binding_size = storage_buffer_limit
            .map_or(supported.max_storage_buffer_binding_size, |limit| {
                limit.min(supported.max_storage_buffer_binding_size)
            });
        let required_limits = wgpu::Limits {
            max_buffer_size: supported.max_buffer_size,
            max_storage_buffer_binding_size,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("isomesh device"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                },
                None,
            )
            .await
            .map_err(|e| Error::Gpu(format!("Failed to create device: {}", e)))?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("uncaptured GPU error: {}", error);
        }));

        Ok(Self {
            device,
            queue,
            adapter,
        })
    }

    /// Largest storage buffer this device can allocate and bind whole
    pub fn max_storage_buffer_size(&self) -> u64 {
        let limits = self.device.limits();
        limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64)
    }

    /// Per-dimension workgroup cap for compute dispatches
    pub fn max_workgroups_per_dimension(&self) -> u32 {
        self.device.limits().max_compute_workgroups_per_dimension
    }

    /// Create a buffer from data
    pub fn create_buffer_init<T: bytemuck::Pod>(&self, label: &str, data: &[T], usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage,
        })
    }

    /// Create an empty buffer
    pub fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Create a storage buffer, failing instead of raising a device error
    ///
    /// The size is checked against the device limits first, then the
    /// allocation runs inside an out-of-memory error scope.
    pub fn try_create_storage_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> Result<wgpu::Buffer> {
        ensure_within_limit(label, size, self.max_storage_buffer_size())?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.create_buffer(label, size, usage | wgpu::BufferUsages::STORAGE);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(Error::resource(label, error.to_string())),
            None => Ok(buffer),
        }
    }

    /// [`GpuContext::try_create_storage_buffer`] with initial contents
    pub fn try_create_storage_buffer_init(&self, label: &str, contents: &[u8], usage: wgpu::BufferUsages) -> Result<wgpu::Buffer> {
        ensure_within_limit(label, contents.len() as u64, self.max_storage_buffer_size())?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage: usage | wgpu::BufferUsages::STORAGE,
        });
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(Error::resource(label, error.to_string())),
            None => Ok(buffer),
        }
    }

    /// Create a compute pipeline with an explicit layout
    pub fn create_compute_pipeline(
        &self,
        label: &str,
        layout: &wgpu::BindGroupLayout,
        shader: &wgpu::ShaderModule,
        entry_point: &str,
    ) -> wgpu::ComputePipeline {
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });

        self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: shader,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        })
    }

    /// Create a shader module from WGSL source
    pub fn create_shader_module(&self, label: &str, source: &str) -> wgpu::ShaderModule {
        self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        })
    }

    /// Create a bind group layout
    pub fn create_bind_group_layout(&self, label: &str, entries: &[wgpu::BindGroupLayoutEntry]) -> wgpu::BindGroupLayout {
        self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries,
        })
    }

    /// Create a bind group
    pub fn create_bind_group(&self, label: &str, layout: &wgpu::BindGroupLayout, entries: &[wgpu::BindGroupEntry]) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries,
        })
    }
}
