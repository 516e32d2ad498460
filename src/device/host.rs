//! Software device: runs compute programs on the calling thread and checks
//! cross-context buffer ownership at submission time.

use super::{
    BindingType, BufferDescriptor, BufferHandle, BufferUsage, Command, CommandList, ComputePipelineDescriptor,
    ContextKind, DescriptorBindings, Device, DeviceError, HostDispatch, HostKernel, PipelineHandle,
    QueryPoolHandle, SubmissionIndex, MAX_BINDINGS,
};
use crate::ownership::{LedgerCheckpoint, TransferEvent, TransferLedger};
use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDeviceOptions {
    pub max_workgroup_size: u32,
    pub graphics_queue_family: u32,
    pub compute_queue_family: u32,
    pub timestamps: bool,
    pub push_constants: bool,
    pub max_buffer_size: u64,
}

impl Default for HostDeviceOptions {
    fn default() -> Self {
        HostDeviceOptions {
            max_workgroup_size: 256,
            graphics_queue_family: 0,
            compute_queue_family: 1,
            timestamps: true,
            push_constants: true,
            max_buffer_size: 1 << 28,
        }
    }
}

struct HostBuffer {
    label: String,
    size: u64,
    words: Vec<u32>,
}

struct HostPipeline {
    label: String,
    kernel: HostKernel,
    workgroup_size: u32,
    bindings: Vec<BindingType>,
    push_constant_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub pipeline: PipelineHandle,
    pub groups: [u32; 3],
    pub invocations: u32,
}

#[derive(Default)]
struct HostState {
    buffers: Vec<Option<HostBuffer>>,
    pipelines: Vec<HostPipeline>,
    query_pools: Vec<Vec<Option<u64>>>,
    ledger: TransferLedger,
    submissions: u64,
    dispatches: Vec<DispatchRecord>,
    fail_timestamp_reads: bool,
}

impl HostState {
    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer, DeviceError> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut HostBuffer, DeviceError> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&HostPipeline, DeviceError> {
        self.pipelines
            .get(handle.0 as usize)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }

    fn query_pool_mut(&mut self, handle: QueryPoolHandle) -> Result<&mut Vec<Option<u64>>, DeviceError> {
        self.query_pools
            .get_mut(handle.0 as usize)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("{:?}", handle)))
    }
}

// Contents overwritten by the submission in flight, restored if a later
// command fails.
struct Journal {
    buffers: Vec<(BufferHandle, Vec<u32>)>,
    timestamps: Vec<(QueryPoolHandle, u32, Option<u64>)>,
    ledger: LedgerCheckpoint,
    dispatches: usize,
}

impl Journal {
    fn open(state: &HostState) -> Self {
        Journal {
            buffers: Vec::new(),
            timestamps: Vec::new(),
            ledger: state.ledger.checkpoint(),
            dispatches: state.dispatches.len(),
        }
    }

    fn save_buffer(&mut self, state: &HostState, handle: BufferHandle) -> Result<(), DeviceError> {
        if !self.buffers.iter().any(|(saved, _)| *saved == handle) {
            self.buffers.push((handle, state.buffer(handle)?.words.clone()));
        }
        Ok(())
    }

    fn roll_back(self, state: &mut HostState) {
        for (handle, words) in self.buffers {
            if let Ok(buffer) = state.buffer_mut(handle) {
                buffer.words = words;
            }
        }
        for (pool, query, value) in self.timestamps.into_iter().rev() {
            if let Some(slot) = state
                .query_pools
                .get_mut(pool.0 as usize)
                .and_then(|values| values.get_mut(query as usize))
            {
                *slot = value;
            }
        }
        state.ledger.roll_back(self.ledger);
        state.dispatches.truncate(self.dispatches);
    }
}

// State carried between commands of one submission.
#[derive(Default)]
struct Recording {
    pipeline: Option<PipelineHandle>,
    bindings: DescriptorBindings,
    push_constants: Vec<u8>,
}

pub struct HostDevice {
    options: HostDeviceOptions,
    epoch: Instant,
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new(options: HostDeviceOptions) -> Self {
        HostDevice {
            options,
            epoch: Instant::now(),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Makes every following timestamp read fail, like a device that lost its
    /// query results.
    pub fn set_timestamp_reads_failing(&self, failing: bool) {
        self.state.lock().fail_timestamp_reads = failing;
    }

    pub fn transfer_events(&self) -> Vec<TransferEvent> {
        self.state.lock().ledger.events().to_vec()
    }

    pub fn unmatched_releases(&self) -> Vec<BufferHandle> {
        self.state.lock().ledger.unmatched()
    }

    pub fn owner(&self, buffer: BufferHandle) -> Option<ContextKind> {
        self.state.lock().ledger.owner(buffer)
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.lock().dispatches.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.iter().flatten().count()
    }

    fn exclusive_ownership(&self) -> bool {
        self.options.graphics_queue_family != self.options.compute_queue_family
    }

    fn execute(
        &self,
        state: &mut HostState,
        context: ContextKind,
        recording: &mut Recording,
        journal: &mut Journal,
        command: &Command,
    ) -> Result<(), DeviceError> {
        match command {
            Command::BindPipeline(pipeline) => {
                state.pipeline(*pipeline)?;
                recording.pipeline = Some(*pipeline);
            }
            Command::BindDescriptorSet(bindings) => recording.bindings = *bindings,
            Command::PushConstants { offset, data } => {
                let end = *offset as usize + data.len();
                if recording.push_constants.len() < end {
                    recording.push_constants.resize(end, 0);
                }
                recording.push_constants[*offset as usize..end].copy_from_slice(data);
            }
            Command::WriteBuffer {
                buffer,
                offset,
                data,
            } => {
                if self.exclusive_ownership() {
                    state.ledger.claim(*buffer, context)?;
                }
                journal.save_buffer(state, *buffer)?;
                let target = state.buffer_mut(*buffer)?;
                let end = *offset + data.len() as u64;
                if offset % 4 != 0 || end > target.size {
                    return Err(DeviceError::OutOfBounds(format!(
                        "write of {} bytes at {} into '{}' ({} bytes)",
                        data.len(),
                        offset,
                        target.label,
                        target.size
                    )));
                }
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(target.words.as_mut_slice());
                bytes[*offset as usize..end as usize].copy_from_slice(data);
            }
            Command::Dispatch { groups } => self.dispatch(state, context, recording, journal, *groups)?,
            Command::WriteTimestamp { pool, query } => {
                let now = self.epoch.elapsed().as_nanos() as u64;
                let slot = state
                    .query_pool_mut(*pool)?
                    .get_mut(*query as usize)
                    .ok_or_else(|| DeviceError::OutOfBounds(format!("query {} of {:?}", query, pool)))?;
                journal.timestamps.push((*pool, *query, *slot));
                *slot = Some(now);
            }
            Command::ResolveTimestamps { pool, queries } => {
                let len = state.query_pool_mut(*pool)?.len();
                if queries.end as usize > len {
                    return Err(DeviceError::OutOfBounds(format!(
                        "resolve of {:?} in {:?} with {} queries",
                        queries, pool, len
                    )));
                }
            }
            Command::Release(barrier) => {
                if self.exclusive_ownership() {
                    state.ledger.release(barrier, context)?;
                }
            }
            Command::Acquire(barrier) => {
                if self.exclusive_ownership() {
                    state.ledger.acquire(barrier, context)?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        state: &mut HostState,
        context: ContextKind,
        recording: &Recording,
        journal: &mut Journal,
        groups: [u32; 3],
    ) -> Result<(), DeviceError> {
        let handle = recording
            .pipeline
            .ok_or_else(|| DeviceError::Binding("dispatch without a bound pipeline".to_string()))?;
        let (kernel, workgroup_size, binding_count, push_constant_size) = {
            let pipeline = state.pipeline(handle)?;
            (
                pipeline.kernel,
                pipeline.workgroup_size,
                pipeline.bindings.len(),
                pipeline.push_constant_size,
            )
        };
        if (recording.push_constants.len() as u32) < push_constant_size {
            return Err(DeviceError::Binding(format!(
                "pipeline {:?} expects {} bytes of push constants, got {}",
                handle,
                push_constant_size,
                recording.push_constants.len()
            )));
        }

        let mut bound: Vec<BufferHandle> = Vec::with_capacity(binding_count);
        for (slot, binding) in recording.bindings.iter().take(binding_count).enumerate() {
            let buffer = binding.ok_or_else(|| DeviceError::Binding(format!("binding {} is empty", slot)))?;
            if bound.contains(&buffer) {
                return Err(DeviceError::Binding(format!("{:?} bound twice", buffer)));
            }
            state.buffer(buffer)?;
            if self.exclusive_ownership() {
                state.ledger.claim(buffer, context)?;
            }
            bound.push(buffer);
        }
        for buffer in &bound {
            journal.save_buffer(state, *buffer)?;
        }

        let mut contents: Vec<Vec<u32>> = Vec::with_capacity(bound.len());
        for buffer in &bound {
            contents.push(std::mem::take(&mut state.buffer_mut(*buffer)?.words));
        }
        let invocations = groups[0] * groups[1] * groups[2] * workgroup_size;
        let result = kernel(HostDispatch {
            invocations,
            push_constants: &recording.push_constants,
            bindings: &mut contents,
        });
        for (buffer, words) in bound.iter().zip(contents) {
            state.buffer_mut(*buffer)?.words = words;
        }
        result?;

        trace!("Host dispatch {:?}: {:?} groups", handle, groups);
        state.dispatches.push(DispatchRecord {
            pipeline: handle,
            groups,
            invocations,
        });
        Ok(())
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn queue_family(&self, context: ContextKind) -> u32 {
        match context {
            ContextKind::Graphics => self.options.graphics_queue_family,
            ContextKind::Compute => self.options.compute_queue_family,
        }
    }

    fn max_compute_workgroup_size(&self) -> u32 {
        self.options.max_workgroup_size
    }

    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<BufferHandle, DeviceError> {
        if desc.size > self.options.max_buffer_size {
            return Err(DeviceError::OutOfMemory(format!(
                "'{}' ({} bytes)",
                desc.label, desc.size
            )));
        }
        if desc.usage.contains(BufferUsage::UNIFORM) && desc.size == 0 {
            return Err(DeviceError::Binding(format!("uniform '{}' is empty", desc.label)));
        }
        let size = (desc.size + 3) & !3;
        let buffer = HostBuffer {
            label: desc.label.to_string(),
            size,
            words: vec![0; (size / 4) as usize],
        };
        let mut state = self.state.lock();
        let handle = match state.buffers.iter().position(Option::is_none) {
            Some(free) => {
                state.buffers[free] = Some(buffer);
                BufferHandle(free as u32)
            }
            None => {
                state.buffers.push(Some(buffer));
                BufferHandle(state.buffers.len() as u32 - 1)
            }
        };
        debug!("Created buffer '{}' ({} bytes) as {:?}", desc.label, size, handle);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(slot) = state.buffers.get_mut(buffer.0 as usize) {
            *slot = None;
        }
        state.ledger.forget(buffer);
    }

    fn read_buffer(&self, buffer: BufferHandle) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock();
        let source = state.buffer(buffer)?;
        Ok(bytemuck::cast_slice(&source.words).to_vec())
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor<'_>,
    ) -> Result<PipelineHandle, DeviceError> {
        if desc.workgroup_size == 0 || desc.workgroup_size > self.options.max_workgroup_size {
            return Err(DeviceError::PipelineCreation(format!(
                "workgroup size {} outside 1..={}",
                desc.workgroup_size, self.options.max_workgroup_size
            )));
        }
        if desc.push_constant_size > 0 && !self.options.push_constants {
            return Err(DeviceError::Unsupported("push constants".to_string()));
        }
        if desc.bindings.len() > MAX_BINDINGS {
            return Err(DeviceError::PipelineCreation(format!(
                "{} bindings, at most {} supported",
                desc.bindings.len(),
                MAX_BINDINGS
            )));
        }
        let entry = format!("fn {}", desc.program.entry_point);
        if !desc.program.wgsl.contains(&entry) {
            return Err(DeviceError::ShaderCompilation(format!(
                "'{}' has no entry point {}",
                desc.program.label, desc.program.entry_point
            )));
        }
        let mut state = self.state.lock();
        let handle = PipelineHandle(state.pipelines.len() as u32);
        state.pipelines.push(HostPipeline {
            label: desc.label.to_string(),
            kernel: desc.program.host,
            workgroup_size: desc.workgroup_size,
            bindings: desc.bindings.to_vec(),
            push_constant_size: desc.push_constant_size,
        });
        debug!(
            "Created pipeline '{}' as {:?}",
            state.pipelines[handle.0 as usize].label, handle
        );
        Ok(handle)
    }

    fn create_timestamp_pool(&self, count: u32) -> Result<QueryPoolHandle, DeviceError> {
        if !self.options.timestamps {
            return Err(DeviceError::Unsupported("timestamp queries".to_string()));
        }
        let mut state = self.state.lock();
        let handle = QueryPoolHandle(state.query_pools.len() as u32);
        state.query_pools.push(vec![None; count as usize]);
        Ok(handle)
    }

    fn read_timestamps(
        &self,
        pool: QueryPoolHandle,
        queries: Range<u32>,
    ) -> Result<Vec<u64>, DeviceError> {
        let mut state = self.state.lock();
        if state.fail_timestamp_reads {
            return Err(DeviceError::TimestampsUnavailable(format!(
                "{:?} {:?}",
                pool, queries
            )));
        }
        let values = state.query_pool_mut(pool)?;
        let written = values
            .get(queries.start as usize..queries.end as usize)
            .ok_or_else(|| DeviceError::OutOfBounds(format!("{:?} of {:?}", queries, pool)))?;
        written
            .iter()
            .zip(queries.clone())
            .map(|(value, query)| {
                value.ok_or_else(|| {
                    DeviceError::TimestampsUnavailable(format!("query {} never written", query))
                })
            })
            .collect()
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }

    fn submit(
        &self,
        context: ContextKind,
        commands: &CommandList,
    ) -> Result<SubmissionIndex, DeviceError> {
        let mut state = self.state.lock();
        let mut recording = Recording::default();
        let mut journal = Journal::open(&state);
        for command in commands.commands() {
            if let Err(e) = self.execute(&mut state, context, &mut recording, &mut journal, command) {
                debug!("Rolling back '{}' on {}: {}", commands.label(), context, e);
                journal.roll_back(&mut state);
                return Err(e);
            }
        }
        state.submissions += 1;
        trace!(
            "Executed '{}' on {} ({} commands)",
            commands.label(),
            context,
            commands.len()
        );
        Ok(SubmissionIndex(state.submissions))
    }

    fn wait(&self, _context: ContextKind, submission: SubmissionIndex) -> Result<(), DeviceError> {
        // Submissions execute eagerly, anything issued is already complete.
        if submission.0 > self.state.lock().submissions {
            return Err(DeviceError::InvalidHandle(format!("{:?}", submission)));
        }
        Ok(())
    }
}
