//! GPU-accelerated gradient kernels using WGPU.
//!
//! The backward pass of the composite field spends its elementwise time in
//! two places: accumulating the two position-encoding gradient contributions
//! and rescaling the uv band of the packed color-input gradient. Both run here
//! as WGSL compute shaders when the `wgpu` feature is enabled and the operand
//! is a dense region of memory.
//!
//! - `add_gradient` computes `dst += scale * src`
//! - `scale_gradient` computes `dst *= scale`
//!
//! Shaders are validated with `briny` and compiled once, lazily, the first
//! time a kernel is dispatched. If no adapter is available the kernels report
//! failure and [`dispatch`](super::dispatch) falls back to the CPU.

use briny::prelude::*;
use thiserror::Error;
use wgpu::util::DeviceExt;

const ADD_GRADIENT: &str = include_str!("shaders/add_gradient.wgsl");
const SCALE_GRADIENT: &str = include_str!("shaders/scale_gradient.wgsl");

const WORKGROUP_SIZE: u32 = 256;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Basic wrapper for common GPU errors.
#[derive(Debug, Error)]
pub enum GpuError {
    /// An error in requesting the adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// An error in requesting the device.
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// A failure while preparing or running a GPU kernel.
#[derive(Debug, Error)]
pub enum GpuFailure {
    /// Device acquisition failed.
    #[error("GPU failure: {0}")]
    Gpu(#[from] GpuError),
    /// A shader was rejected before compilation.
    #[error("GPU failure: shader validation: {0:?}")]
    Validation(ValidationError),
    /// Waiting on the device failed.
    #[error("GPU failure: poll: {0}")]
    Poll(#[from] wgpu::PollError),
    /// Reading back a result buffer failed.
    #[error("GPU failure: readback: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    /// Anything else.
    #[error("GPU failure: {0}")]
    Message(String),
}

impl From<ValidationError> for GpuFailure {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// The device's submission queue.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// # Errors
    /// Returns [`GpuError`] if adapter or device acquisition fails.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_field"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;
        Ok(Self { device, queue })
    }
}

/// Secure wrapper for WGSL source code.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }
        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Validates WGSL source and compiles it on `device`.
///
/// # Errors
/// Returns [`GpuFailure::Validation`] if the source is rejected.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

struct Kernel {
    label: &'static str,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl Kernel {
    /// Binding 0 is always the uniform block; `storage` lists the read-only
    /// flag of each following storage binding.
    fn new(
        ctx: &GpuContext,
        label: &'static str,
        source: &str,
        storage: &[bool],
    ) -> Result<Self, GpuFailure> {
        let module = load_shader(&ctx.device, label, source)?;
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for (binding, &read_only) in (1u32..).zip(storage) {
            entries.push(storage_entry(binding, read_only));
        }
        let bind_group_layout =
            ctx.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(label),
                    entries: &entries,
                });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        Ok(Self {
            label,
            bind_group_layout,
            pipeline,
        })
    }

    /// Runs the kernel over `dst` (bound last) with optional read-only `src`
    /// and copies the result back into `dst`.
    fn run(
        &self,
        ctx: &GpuContext,
        scale: f32,
        src: Option<&[f32]>,
        dst: &mut [f32],
    ) -> Result<(), GpuFailure> {
        let n = u32::try_from(dst.len())
            .map_err(|_| GpuFailure::Message(format!("{}: buffer too large", self.label)))?;
        let groups = n.div_ceil(WORKGROUP_SIZE);
        let groups_x = groups.clamp(1, MAX_GROUPS_PER_DIM);
        let groups_y = groups.div_ceil(groups_x);
        let uniform = [scale.to_bits(), n, groups_x * WORKGROUP_SIZE, 0];

        let device = &ctx.device;
        let uniform_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::cast_slice(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let src_buf = src.map(|src| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("src"),
                contents: bytemuck::cast_slice(src),
                usage: wgpu::BufferUsages::STORAGE,
            })
        });
        let dst_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dst"),
            contents: bytemuck::cast_slice(dst),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform_buf.as_entire_binding(),
        }];
        if let Some(buf) = &src_buf {
            entries.push(wgpu::BindGroupEntry {
                binding: 1,
                resource: buf.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: u32::from(src_buf.is_some()) + 1,
            resource: dst_buf.as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        let size = std::mem::size_of_val(dst) as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&dst_buf, 0, &staging, 0, size);
        ctx.queue.submit(Some(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |res| {
                let _ = tx.send(res);
            });
        device.poll(wgpu::PollType::Wait)?;
        rx.recv()
            .map_err(|_| GpuFailure::Message(format!("{}: readback dropped", self.label)))??;

        {
            let mapped = staging.slice(..).get_mapped_range();
            let values: &[f32] = bytemuck::try_cast_slice(&mapped)
                .map_err(|e| GpuFailure::Message(format!("{}: {e}", self.label)))?;
            dst.copy_from_slice(values);
        }
        staging.unmap();
        Ok(())
    }
}

fn build(label: &'static str, source: &str, storage: &[bool]) -> Option<Kernel> {
    let ctx = GPU_CONTEXT.as_ref()?;
    match Kernel::new(ctx, label, source, storage) {
        Ok(kernel) => Some(kernel),
        Err(err) => {
            log::error!("{label}: {err}");
            None
        }
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            log::warn!("wgpu backend unavailable, kernels run on the cpu: {err}");
            None
        }
    };
    static ref ADD_GRADIENT_KERNEL: Option<Kernel> = build("add_gradient", ADD_GRADIENT, &[true, false]);
    static ref SCALE_GRADIENT_KERNEL: Option<Kernel> = build("scale_gradient", SCALE_GRADIENT, &[false]);
}

fn fits(ctx: &GpuContext, len: usize) -> bool {
    let bytes = (len * std::mem::size_of::<f32>()) as u64;
    bytes <= u64::from(ctx.device.limits().max_storage_buffer_binding_size)
}

fn launch(kernel: &Option<Kernel>, scale: f32, src: Option<&[f32]>, dst: &mut [f32]) -> bool {
    if dst.is_empty() {
        return true;
    }
    let (Some(ctx), Some(kernel)) = (GPU_CONTEXT.as_ref(), kernel.as_ref()) else {
        return false;
    };
    if !fits(ctx, dst.len()) {
        return false;
    }
    match kernel.run(ctx, scale, src, dst) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("{}: {err}; retrying on the cpu", kernel.label);
            false
        }
    }
}

/// `dst += scale * src` on the GPU. Returns `false` if the caller must fall back.
pub fn wgpu_add_gradient(dst: &mut [f32], src: &[f32], scale: f32) -> bool {
    if dst.len() != src.len() {
        return false;
    }
    launch(&ADD_GRADIENT_KERNEL, scale, Some(src), dst)
}

/// `dst *= scale` on the GPU. Returns `false` if the caller must fall back.
pub fn wgpu_scale_gradient(dst: &mut [f32], scale: f32) -> bool {
    launch(&SCALE_GRADIENT_KERNEL, scale, None, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_shaders_pass_validation() {
        assert!(WgslSource(ADD_GRADIENT).validate().is_ok());
        assert!(WgslSource(SCALE_GRADIENT).validate().is_ok());
    }

    #[test]
    fn rejects_includes() {
        assert!(WgslSource("#include <x>\nfn main() {}").validate().is_err());
        assert!(WgslSource("fn helper() {}").validate().is_err());
    }
}
