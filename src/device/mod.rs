//! Backend-agnostic view of the device the particle system runs on.
//!
//! Work is recorded into a [`CommandList`] and submitted to one of two
//! independently scheduled execution contexts (graphics or compute). Handles
//! are opaque ids that only mean something to the backend that issued them.

pub mod host;
pub mod wgpu_device;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub use host::{HostDevice, HostDeviceOptions};
pub use wgpu_device::WgpuDevice;

// Storage and uniform bindings per descriptor set.
pub const MAX_BINDINGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Graphics,
    Compute,
}

impl ContextKind {
    pub fn other(self) -> Self {
        match self {
            ContextKind::Graphics => ContextKind::Compute,
            ContextKind::Compute => ContextKind::Graphics,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ContextKind::Graphics => 0,
            ContextKind::Compute => 1,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKind::Graphics => write!(f, "graphics"),
            ContextKind::Compute => write!(f, "compute"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineHandle(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryPoolHandle(pub(crate) u32);

/// Monotonic id of a submitted command list, shared by both contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionIndex(pub(crate) u64);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const STORAGE = 1 << 0;
        const UNIFORM = 1 << 1;
        const VERTEX = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Memory access kinds on either side of a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const TRANSFER_WRITE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    VertexInput,
    ComputeShader,
}

/// One half of a queue ownership transfer. The release is recorded on
/// `src_context`, the matching acquire on `dst_context`, both carrying the
/// same barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_context: ContextKind,
    pub dst_context: ContextKind,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub src_stage: PipelineStage,
    pub dst_stage: PipelineStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    Storage,
    Uniform,
}

pub type DescriptorBindings = [Option<BufferHandle>; MAX_BINDINGS];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindPipeline(PipelineHandle),
    BindDescriptorSet(DescriptorBindings),
    PushConstants { offset: u32, data: Vec<u8> },
    WriteBuffer { buffer: BufferHandle, offset: u64, data: Vec<u8> },
    Dispatch { groups: [u32; 3] },
    WriteTimestamp { pool: QueryPoolHandle, query: u32 },
    ResolveTimestamps { pool: QueryPoolHandle, queries: Range<u32> },
    Release(BufferBarrier),
    Acquire(BufferBarrier),
}

/// Recorded work for one submission. Resetting keeps the allocation so a
/// frame slot can reuse its storage every frame.
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    label: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        CommandList {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_descriptor_set(&mut self, bindings: DescriptorBindings) {
        self.push(Command::BindDescriptorSet(bindings));
    }

    pub fn push_constants<T: bytemuck::Pod>(&mut self, offset: u32, value: &T) {
        self.push(Command::PushConstants {
            offset,
            data: bytemuck::bytes_of(value).to_vec(),
        });
    }

    pub fn write_buffer<T: bytemuck::Pod>(&mut self, buffer: BufferHandle, offset: u64, data: &[T]) {
        self.push(Command::WriteBuffer {
            buffer,
            offset,
            data: bytemuck::cast_slice(data).to_vec(),
        });
    }

    pub fn dispatch(&mut self, groups_x: u32) {
        self.push(Command::Dispatch {
            groups: [groups_x, 1, 1],
        });
    }

    pub fn write_timestamp(&mut self, pool: QueryPoolHandle, query: u32) {
        self.push(Command::WriteTimestamp { pool, query });
    }

    pub fn resolve_timestamps(&mut self, pool: QueryPoolHandle, queries: Range<u32>) {
        self.push(Command::ResolveTimestamps { pool, queries });
    }

    pub fn release(&mut self, barrier: BufferBarrier) {
        self.push(Command::Release(barrier));
    }

    pub fn acquire(&mut self, barrier: BufferBarrier) {
        self.push(Command::Acquire(barrier));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Everything a host emulated dispatch gets to see. `bindings` is indexed by
/// binding slot and holds the buffer contents as 32-bit words.
pub struct HostDispatch<'a> {
    pub invocations: u32,
    pub push_constants: &'a [u8],
    pub bindings: &'a mut [Vec<u32>],
}

pub type HostKernel = fn(HostDispatch<'_>) -> Result<(), DeviceError>;

/// A compute program in both of its forms: WGSL for real devices and a
/// host function with the same semantics for the software device.
#[derive(Clone)]
pub struct ComputeProgram {
    pub label: &'static str,
    pub wgsl: String,
    pub entry_point: &'static str,
    pub host: HostKernel,
}

impl fmt::Debug for ComputeProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeProgram")
            .field("label", &self.label)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDescriptor<'a> {
    pub label: &'a str,
    pub program: &'a ComputeProgram,
    pub workgroup_size: u32,
    pub bindings: &'a [BindingType],
    pub push_constant_size: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory allocating {0}")]
    OutOfMemory(String),
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),
    #[error("unsupported by this device: {0}")]
    Unsupported(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("access out of bounds: {0}")]
    OutOfBounds(String),
    #[error("bad binding: {0}")]
    Binding(String),
    #[error("ownership violation: {0}")]
    OwnershipViolation(String),
    #[error("timestamps unavailable: {0}")]
    TimestampsUnavailable(String),
    #[error("device lost: {0}")]
    Lost(String),
}

pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Queue family backing an execution context. Equal families mean the
    /// contexts share coherency and need no ownership transfers.
    fn queue_family(&self, context: ContextKind) -> u32;

    fn max_compute_workgroup_size(&self) -> u32;

    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<BufferHandle, DeviceError>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Blocking readback of a whole buffer.
    fn read_buffer(&self, buffer: BufferHandle) -> Result<Vec<u8>, DeviceError>;

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor<'_>,
    ) -> Result<PipelineHandle, DeviceError>;

    fn create_timestamp_pool(&self, count: u32) -> Result<QueryPoolHandle, DeviceError>;

    fn read_timestamps(
        &self,
        pool: QueryPoolHandle,
        queries: Range<u32>,
    ) -> Result<Vec<u64>, DeviceError>;

    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    fn submit(
        &self,
        context: ContextKind,
        commands: &CommandList,
    ) -> Result<SubmissionIndex, DeviceError>;

    fn wait(&self, context: ContextKind, submission: SubmissionIndex) -> Result<(), DeviceError>;
}

/// The device as handed to subsystems that need it. Constructed once by the
/// application and passed explicitly.
#[derive(Clone)]
pub struct GraphicsContext {
    device: Arc<dyn Device>,
}

impl GraphicsContext {
    pub fn new(device: Arc<dyn Device>) -> Self {
        GraphicsContext { device }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("device", &self.device.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Host,
    Wgpu,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceParams {
    pub backend: Backend,
    #[serde(default)]
    pub host: HostDeviceOptions,
}

impl Default for DeviceParams {
    fn default() -> Self {
        DeviceParams {
            backend: Backend::Host,
            host: HostDeviceOptions::default(),
        }
    }
}

impl DeviceParams {
    pub fn open(&self) -> Result<Arc<dyn Device>, DeviceError> {
        let device: Arc<dyn Device> = match self.backend {
            Backend::Host => Arc::new(HostDevice::new(self.host)),
            Backend::Wgpu => Arc::new(WgpuDevice::new()?),
        };
        log::info!("Opened device: {}", device.name());
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_list_reuses_storage() {
        let mut list = CommandList::new("frame 0");
        list.dispatch(4);
        list.write_buffer(BufferHandle(1), 0, &[1.0f32, 2.0]);
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.commands()[1],
            Command::WriteBuffer {
                buffer: BufferHandle(1),
                offset: 0,
                data: bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec(),
            }
        );
        list.reset();
        assert!(list.is_empty());
        assert_eq!(list.label(), "frame 0");
    }

    #[test]
    fn flags_compose() {
        let usage = BufferUsage::STORAGE | BufferUsage::VERTEX;
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::UNIFORM));
        let access = AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE;
        assert!(access.contains(AccessFlags::SHADER_WRITE));
        assert!(!access.contains(AccessFlags::VERTEX_ATTRIBUTE_READ));
        assert_eq!(BufferUsage::from_bits(1 << 3), None);
        assert!(BufferUsage::empty().is_empty());
    }

    #[test]
    fn contexts_swap() {
        assert_eq!(ContextKind::Graphics.other(), ContextKind::Compute);
        assert_eq!(ContextKind::Compute.other(), ContextKind::Graphics);
        assert_eq!(ContextKind::Compute.to_string(), "compute");
    }

    #[test]
    fn device_params_from_toml() {
        let params: DeviceParams = toml::from_str(
            r#"
            backend = "host"
            [host]
            max_workgroup_size = 64
            "#,
        )
        .unwrap();
        assert_eq!(params.backend, Backend::Host);
        assert_eq!(params.host.max_workgroup_size, 64);
        assert!(params.host.timestamps);
    }
}
