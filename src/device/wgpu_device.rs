//! Device backed by a real GPU through wgpu.
//!
//! wgpu exposes a single queue and tracks buffer hazards itself, so both
//! contexts map onto that queue and report the same family. Ownership
//! barriers reduce to no-ops.

use super::{
    BindingType, BufferDescriptor, BufferHandle, BufferUsage, Command, CommandList, ComputePipelineDescriptor,
    ContextKind, DescriptorBindings, Device, DeviceError, PipelineHandle, QueryPoolHandle, SubmissionIndex,
};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;

const TIMESTAMP_SIZE: u64 = std::mem::size_of::<u64>() as u64;

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct WgpuPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    bindings: Vec<BindingType>,
}

struct WgpuQueryPool {
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    count: u32,
}

#[derive(Default)]
struct WgpuState {
    buffers: Vec<Option<WgpuBuffer>>,
    pipelines: Vec<WgpuPipeline>,
    query_pools: Vec<WgpuQueryPool>,
    bind_groups: HashMap<(PipelineHandle, DescriptorBindings), wgpu::BindGroup>,
    submissions: u64,
}

impl WgpuState {
    fn buffer(&self, handle: BufferHandle) -> Result<&WgpuBuffer, DeviceError> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&WgpuPipeline, DeviceError> {
        self.pipelines
            .get(handle.0 as usize)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }

    fn query_pool(&self, handle: QueryPoolHandle) -> Result<&WgpuQueryPool, DeviceError> {
        self.query_pools
            .get(handle.0 as usize)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }

    fn bind_group(
        &mut self,
        device: &wgpu::Device,
        pipeline: PipelineHandle,
        bindings: DescriptorBindings,
    ) -> Result<(), DeviceError> {
        if self.bind_groups.contains_key(&(pipeline, bindings)) {
            return Ok(());
        }
        let layout = self.pipeline(pipeline)?;
        let mut entries = Vec::with_capacity(layout.bindings.len());
        for (slot, binding) in bindings.iter().take(layout.bindings.len()).enumerate() {
            let handle = binding.ok_or_else(|| DeviceError::Binding(format!("binding {} is empty", slot)))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32,
                resource: self.buffer(handle)?.buffer.as_entire_binding(),
            });
        }
        let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Particle bind group"),
            layout: &layout.layout,
            entries: &entries,
        });
        self.bind_groups.insert((pipeline, bindings), group);
        Ok(())
    }
}

pub struct WgpuDevice {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    timestamp_period: f32,
    state: Mutex<WgpuState>,
}

fn map_read(device: &wgpu::Device, slice: wgpu::BufferSlice<'_>) -> Result<Vec<u8>, DeviceError> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    match rx.recv() {
        Ok(Ok(())) => Ok(slice.get_mapped_range().to_vec()),
        Ok(Err(e)) => Err(DeviceError::Lost(format!("buffer map failed: {}", e))),
        Err(e) => Err(DeviceError::Lost(format!("map callback dropped: {}", e))),
    }
}

impl WgpuDevice {
    pub fn new() -> Result<Self, DeviceError> {
        futures::executor::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| DeviceError::Unsupported("no compatible adapter".to_string()))?;
        let adapter_info = adapter.get_info();
        info!("Adapter: {} ({:?})", adapter_info.name, adapter_info.backend);

        // Both are optional here, the handler refuses GPU mode without them.
        let wanted = wgpu::Features::PUSH_CONSTANTS | wgpu::Features::TIMESTAMP_QUERY;
        let required_features = adapter.features() & wanted;
        if required_features != wanted {
            warn!("Adapter lacks {:?}", wanted - required_features);
        }
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Particle device"),
                    required_features,
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::Unsupported(format!("request_device: {}", e)))?;
        let timestamp_period = queue.get_timestamp_period();
        Ok(WgpuDevice {
            name: format!("wgpu: {}", adapter_info.name),
            device,
            queue,
            timestamp_period,
            state: Mutex::new(WgpuState::default()),
        })
    }

    fn has_feature(&self, feature: wgpu::Features) -> bool {
        self.device.features().contains(feature)
    }
}

impl Device for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_family(&self, _context: ContextKind) -> u32 {
        0
    }

    fn max_compute_workgroup_size(&self) -> u32 {
        let limits = self.device.limits();
        limits
            .max_compute_workgroup_size_x
            .min(limits.max_compute_invocations_per_workgroup)
    }

    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<BufferHandle, DeviceError> {
        let mut usage = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        if desc.usage.contains(BufferUsage::STORAGE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        if desc.usage.contains(BufferUsage::UNIFORM) {
            usage |= wgpu::BufferUsages::UNIFORM;
        }
        if desc.usage.contains(BufferUsage::VERTEX) {
            usage |= wgpu::BufferUsages::VERTEX;
        }
        let size = desc.size.max(16).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(e) = futures::executor::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::OutOfMemory(format!("'{}': {}", desc.label, e)));
        }
        let mut state = self.state.lock();
        let slot = Some(WgpuBuffer { buffer, size });
        let handle = match state.buffers.iter().position(Option::is_none) {
            Some(free) => {
                state.buffers[free] = slot;
                BufferHandle(free as u32)
            }
            None => {
                state.buffers.push(slot);
                BufferHandle(state.buffers.len() as u32 - 1)
            }
        };
        debug!("Created buffer '{}' ({} bytes) as {:?}", desc.label, size, handle);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(slot) = state.buffers.get_mut(buffer.0 as usize) {
            if let Some(old) = slot.take() {
                old.buffer.destroy();
            }
        }
        state
            .bind_groups
            .retain(|(_, bindings), _| !bindings.contains(&Some(buffer)));
    }

    fn read_buffer(&self, buffer: BufferHandle) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock();
        let source = state.buffer(buffer)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback staging"),
            size: source.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback") });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, source.size);
        self.queue.submit(Some(encoder.finish()));
        let data = map_read(&self.device, staging.slice(..))?;
        staging.unmap();
        Ok(data)
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor<'_>,
    ) -> Result<PipelineHandle, DeviceError> {
        if desc.workgroup_size == 0 || desc.workgroup_size > self.max_compute_workgroup_size() {
            return Err(DeviceError::PipelineCreation(format!(
                "workgroup size {} outside 1..={}",
                desc.workgroup_size,
                self.max_compute_workgroup_size()
            )));
        }
        if desc.push_constant_size > 0 && !self.has_feature(wgpu::Features::PUSH_CONSTANTS) {
            return Err(DeviceError::Unsupported("push constants".to_string()));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.program.label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(desc.program.wgsl.as_str())),
        });
        if let Some(e) = futures::executor::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::ShaderCompilation(e.to_string()));
        }

        let entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .bindings
            .iter()
            .enumerate()
            .map(|(slot, binding)| wgpu::BindGroupLayoutEntry {
                binding: slot as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match binding {
                        BindingType::Storage => wgpu::BufferBindingType::Storage { read_only: false },
                        BindingType::Uniform => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(desc.label),
            entries: &entries,
        });
        let push_constant_ranges = [wgpu::PushConstantRange {
            stages: wgpu::ShaderStages::COMPUTE,
            range: 0..desc.push_constant_size,
        }];
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(desc.label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: if desc.push_constant_size > 0 {
                &push_constant_ranges
            } else {
                &[]
            },
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(desc.label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: desc.program.entry_point,
        });
        if let Some(e) = futures::executor::block_on(self.device.pop_error_scope()) {
            return Err(DeviceError::PipelineCreation(e.to_string()));
        }

        let mut state = self.state.lock();
        let handle = PipelineHandle(state.pipelines.len() as u32);
        state.pipelines.push(WgpuPipeline {
            pipeline,
            layout,
            bindings: desc.bindings.to_vec(),
        });
        info!(
            "Built compute pipeline '{}' with workgroup size {}",
            desc.label, desc.workgroup_size
        );
        Ok(handle)
    }

    fn create_timestamp_pool(&self, count: u32) -> Result<QueryPoolHandle, DeviceError> {
        if !self.has_feature(wgpu::Features::TIMESTAMP_QUERY) {
            return Err(DeviceError::Unsupported("timestamp queries".to_string()));
        }
        let size = count as u64 * TIMESTAMP_SIZE;
        let set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Particle timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Timestamp resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Timestamp readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut state = self.state.lock();
        let handle = QueryPoolHandle(state.query_pools.len() as u32);
        state.query_pools.push(WgpuQueryPool {
            set,
            resolve,
            readback,
            count,
        });
        Ok(handle)
    }

    fn read_timestamps(
        &self,
        pool: QueryPoolHandle,
        queries: Range<u32>,
    ) -> Result<Vec<u64>, DeviceError> {
        let state = self.state.lock();
        let pool = state.query_pool(pool)?;
        if queries.end > pool.count || queries.is_empty() {
            return Err(DeviceError::OutOfBounds(format!(
                "queries {:?} of {}",
                queries, pool.count
            )));
        }
        let start = queries.start as u64 * TIMESTAMP_SIZE;
        let end = queries.end as u64 * TIMESTAMP_SIZE;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Timestamp copy") });
        encoder.copy_buffer_to_buffer(&pool.resolve, start, &pool.readback, start, end - start);
        self.queue.submit(Some(encoder.finish()));
        let data = map_read(&self.device, pool.readback.slice(start..end))
            .map_err(|e| DeviceError::TimestampsUnavailable(e.to_string()))?;
        pool.readback.unmap();
        Ok(bytemuck::pod_collect_to_vec(&data))
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    fn submit(
        &self,
        context: ContextKind,
        commands: &CommandList,
    ) -> Result<SubmissionIndex, DeviceError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(commands.label()),
        });
        let mut pipeline: Option<PipelineHandle> = None;
        let mut bindings: DescriptorBindings = Default::default();
        let mut push_constants: Vec<u8> = Vec::new();

        let list = commands.commands();
        for (i, command) in list.iter().enumerate() {
            match command {
                Command::BindPipeline(handle) => {
                    state.pipeline(*handle)?;
                    pipeline = Some(*handle);
                }
                Command::BindDescriptorSet(set) => bindings = *set,
                Command::PushConstants { offset, data } => {
                    let end = *offset as usize + data.len();
                    if push_constants.len() < end {
                        push_constants.resize(end, 0);
                    }
                    push_constants[*offset as usize..end].copy_from_slice(data);
                }
                Command::WriteBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    // Staged on the queue, lands before this submission executes.
                    let target = state.buffer(*buffer)?;
                    if *offset + data.len() as u64 > target.size {
                        return Err(DeviceError::OutOfBounds(format!(
                            "write of {} bytes at {} into {:?}",
                            data.len(),
                            offset,
                            buffer
                        )));
                    }
                    if !data.is_empty() {
                        self.queue.write_buffer(&target.buffer, *offset, data);
                    }
                }
                Command::Dispatch { groups } => {
                    let handle = pipeline
                        .ok_or_else(|| DeviceError::Binding("dispatch without a bound pipeline".to_string()))?;
                    state.bind_group(&self.device, handle, bindings)?;
                    let before = match i.checked_sub(1).and_then(|j| list.get(j)) {
                        Some(Command::WriteTimestamp { pool, query }) => Some((*pool, *query)),
                        _ => None,
                    };
                    let after = match list.get(i + 1) {
                        Some(Command::WriteTimestamp { pool, query }) => Some((*pool, *query)),
                        _ => None,
                    };
                    let timestamp_pool = match before.or(after) {
                        Some((pool, _)) => Some(state.query_pool(pool)?),
                        None => None,
                    };
                    let compute = state.pipeline(handle)?;
                    let group = &state.bind_groups[&(handle, bindings)];
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(commands.label()),
                        timestamp_writes: timestamp_pool.map(|pool| wgpu::ComputePassTimestampWrites {
                            query_set: &pool.set,
                            beginning_of_pass_write_index: before.map(|(_, query)| query),
                            end_of_pass_write_index: after.map(|(_, query)| query),
                        }),
                    });
                    pass.set_pipeline(&compute.pipeline);
                    pass.set_bind_group(0, group, &[]);
                    if !push_constants.is_empty() {
                        pass.set_push_constants(0, &push_constants);
                    }
                    pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
                }
                // Recorded as part of the adjacent compute pass.
                Command::WriteTimestamp { .. } => {}
                Command::ResolveTimestamps { pool, queries } => {
                    let pool = state.query_pool(*pool)?;
                    encoder.resolve_query_set(
                        &pool.set,
                        queries.clone(),
                        &pool.resolve,
                        queries.start as u64 * TIMESTAMP_SIZE,
                    );
                }
                Command::Release(barrier) | Command::Acquire(barrier) => {
                    trace!("{:?} on {} handled by wgpu", barrier.buffer, context);
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        state.submissions += 1;
        Ok(SubmissionIndex(state.submissions))
    }

    fn wait(&self, _context: ContextKind, _submission: SubmissionIndex) -> Result<(), DeviceError> {
        // One queue, so waiting for everything covers the submission.
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
