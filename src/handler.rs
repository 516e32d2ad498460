//! Owns every emitter and drives them either on the host or through compute
//! dispatches, switching between the two at runtime.

use crate::device::{
    BufferHandle, ComputePipelineDescriptor, ContextKind, Device, DeviceError, GraphicsContext, PipelineHandle,
};
use crate::emitter::{EmitterBuffers, EmitterError, EmitterInfo, ParticleEmitter};
use crate::frame::FrameRing;
use crate::kernel::{self, FrameConstants};
use crate::ownership::{BufferOwnership, OwnershipTransfer, QueueFamilies, SyncBatch};
use crate::profiler::{Profiler, TimestampProfiler};
use crate::rendering::{DrawBatch, RenderingContext};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::fmt;
use std::sync::Arc;

slotmap::new_key_type! {
    pub struct EmitterHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputationMode {
    Cpu,
    Gpu,
}

impl fmt::Display for ComputationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputationMode::Cpu => write!(f, "CPU"),
            ComputationMode::Gpu => write!(f, "GPU"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    pub frame_slots: usize,
    pub workgroup_size: u32,
    pub gravity: f32,
    // Whether the renderer draws from the compute written position buffer in
    // GPU mode. Without it positions never leave the compute context.
    pub share_positions_with_graphics: bool,
    pub queries_per_frame: u32,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        HandlerSettings {
            frame_slots: 3,
            workgroup_size: 256,
            gravity: 9.81,
            share_positions_with_graphics: true,
            queries_per_frame: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no graphics context, call initialize first")]
    NotInitialized,
    #[error("GPU compute is not available")]
    GpuUnavailable,
    #[error("unknown emitter {0:?}")]
    UnknownEmitter(EmitterHandle),
    #[error(transparent)]
    Emitter(#[from] EmitterError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

struct GpuCompute {
    pipeline: PipelineHandle,
    workgroup_size: u32,
    families: QueueFamilies,
    frames: FrameRing,
    profiler: Box<dyn Profiler>,
}

pub struct ParticleEmitterHandler {
    settings: HandlerSettings,
    emitters: SlotMap<EmitterHandle, ParticleEmitter>,
    mode: ComputationMode,
    context: Option<GraphicsContext>,
    gpu: Option<GpuCompute>,
}

// Allocates the device mirror of `emitter` and gives its position buffer to
// whichever context simulates it in `mode`.
fn init_emitter_resources(
    device: &Arc<dyn Device>,
    emitter: &mut ParticleEmitter,
    mode: ComputationMode,
) -> Result<(), DeviceError> {
    let mut buffers = EmitterBuffers::create(device, emitter.max_particles())?;
    let families = QueueFamilies::query(device.as_ref());
    let mut batch = SyncBatch::new(families, ContextKind::Compute);
    match mode {
        ComputationMode::Cpu => {
            buffers.positions_ownership = BufferOwnership::Owned(ContextKind::Compute)
                .move_to(buffers.positions.buffer, ContextKind::Graphics, &mut batch)?;
            emitter.mark_positions_dirty();
        }
        ComputationMode::Gpu => upload_host_state(emitter, &buffers, &mut batch),
    }
    batch.submit_and_wait(device.as_ref())?;
    emitter.attach_buffers(buffers);
    Ok(())
}

// Records the host copy of every particle buffer and a settled uniform on the
// compute side of `batch`.
fn upload_host_state(emitter: &mut ParticleEmitter, buffers: &EmitterBuffers, batch: &mut SyncBatch) {
    let uniform = emitter.sync_uniform_to_host();
    let commands = batch.commands(ContextKind::Compute);
    if !emitter.is_empty() {
        commands.write_buffer(buffers.positions.buffer, 0, &emitter.gpu_positions());
        commands.write_buffer(buffers.velocities.buffer, 0, &emitter.gpu_velocities());
        commands.write_buffer(buffers.ages.buffer, 0, emitter.ages());
    }
    commands.write_buffer(buffers.uniform.buffer, 0, &[uniform]);
}

fn read_back<T: bytemuck::Pod>(device: &dyn Device, buffer: BufferHandle) -> Result<Vec<T>, DeviceError> {
    let bytes = device.read_buffer(buffer)?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

impl ParticleEmitterHandler {
    pub fn new(settings: HandlerSettings) -> Self {
        ParticleEmitterHandler {
            settings,
            emitters: SlotMap::with_key(),
            mode: ComputationMode::Cpu,
            context: None,
            gpu: None,
        }
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    pub fn mode(&self) -> ComputationMode {
        self.mode
    }

    pub fn is_gpu_compute_available(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn frame_index(&self) -> usize {
        self.gpu.as_ref().map_or(0, |gpu| gpu.frames.current_index())
    }

    pub fn frame_slots(&self) -> usize {
        self.gpu.as_ref().map_or(self.settings.frame_slots, |gpu| gpu.frames.len())
    }

    pub fn workgroup_size(&self) -> Option<u32> {
        self.gpu.as_ref().map(|gpu| gpu.workgroup_size)
    }

    pub fn emitter(&self, handle: EmitterHandle) -> Option<&ParticleEmitter> {
        self.emitters.get(handle)
    }

    pub fn emitters(&self) -> impl Iterator<Item = (EmitterHandle, &ParticleEmitter)> {
        self.emitters.iter()
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }

    pub fn total_particles(&self) -> u64 {
        self.emitters
            .values()
            .map(|emitter| emitter.particle_count() as u64)
            .sum()
    }

    /// Hooks up the device and allocates resources for emitters created so far.
    pub fn initialize(&mut self, context: GraphicsContext) -> Result<(), HandlerError> {
        info!("Initializing particle emitters on {}", context.device().name());
        let device = context.device().clone();
        self.context = Some(context);
        for (handle, emitter) in self.emitters.iter_mut() {
            if emitter.buffers().is_some() {
                continue;
            }
            if let Err(e) = init_emitter_resources(&device, emitter, self.mode) {
                error!("Failed to initialize emitter {:?}: {}", handle, e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn create_emitter(&mut self, info: EmitterInfo) -> Result<EmitterHandle, HandlerError> {
        let mut emitter = ParticleEmitter::new(info, self.settings.gravity)?;
        if let Some(context) = &self.context {
            init_emitter_resources(context.device(), &mut emitter, self.mode)?;
        }
        let handle = self.emitters.insert(emitter);
        debug!("Created emitter {:?}", handle);
        Ok(handle)
    }

    /// Frees the emitter and its device buffers once the device is done with them.
    pub fn remove_emitter(&mut self, handle: EmitterHandle) -> Result<(), HandlerError> {
        if !self.emitters.contains_key(handle) {
            return Err(HandlerError::UnknownEmitter(handle));
        }
        self.drain()?;
        self.emitters.remove(handle);
        debug!("Removed emitter {:?}", handle);
        Ok(())
    }

    /// Builds the compute pipeline, frame slots and profiler. Any failure leaves
    /// the handler on the CPU.
    pub fn initialize_gpu_compute(&mut self) -> Result<(), HandlerError> {
        let device = match &self.context {
            Some(context) => context.device().clone(),
            None => return Err(HandlerError::NotInitialized),
        };
        match self.build_gpu_compute(device.as_ref()) {
            Ok(gpu) => {
                info!(
                    "GPU compute ready: workgroup size {}, {} frame slots",
                    gpu.workgroup_size,
                    gpu.frames.len()
                );
                self.gpu = Some(gpu);
                Ok(())
            }
            Err(e) => {
                error!("GPU compute unavailable, staying on the CPU: {}", e);
                Err(e.into())
            }
        }
    }

    fn build_gpu_compute(&self, device: &dyn Device) -> Result<GpuCompute, DeviceError> {
        let workgroup_size = self
            .settings
            .workgroup_size
            .min(device.max_compute_workgroup_size())
            .max(1);
        if workgroup_size < self.settings.workgroup_size {
            info!(
                "Workgroup size {} capped to device limit {}",
                self.settings.workgroup_size, workgroup_size
            );
        }
        let program = kernel::program(workgroup_size)?;
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: "Particle update",
            program: &program,
            workgroup_size,
            bindings: &kernel::BINDINGS,
            push_constant_size: std::mem::size_of::<FrameConstants>() as u32,
        })?;
        let frames = FrameRing::new(self.settings.frame_slots);
        let profiler = TimestampProfiler::new(device, frames.len(), self.settings.queries_per_frame)?;
        Ok(GpuCompute {
            pipeline,
            workgroup_size,
            families: QueueFamilies::query(device),
            frames,
            profiler: Box::new(profiler),
        })
    }

    // Blocks until every submitted compute frame has finished.
    fn drain(&self) -> Result<(), DeviceError> {
        if let (Some(context), Some(gpu)) = (&self.context, &self.gpu) {
            if let Some(latest) = gpu.frames.latest_submission() {
                context.device().wait(ContextKind::Compute, latest)?;
            }
        }
        Ok(())
    }

    /// Switches between host and device simulation, carrying particle state
    /// across. Blocks until the hand-off has executed.
    pub fn toggle_computation_device(&mut self) -> Result<ComputationMode, HandlerError> {
        let device = match &self.context {
            Some(context) => context.device().clone(),
            None => return Err(HandlerError::NotInitialized),
        };
        let next = match self.mode {
            ComputationMode::Cpu => {
                if self.gpu.is_none() {
                    return Err(HandlerError::GpuUnavailable);
                }
                self.move_to_gpu(device.as_ref())?;
                ComputationMode::Gpu
            }
            ComputationMode::Gpu => {
                self.drain()?;
                self.move_to_cpu(device.as_ref())?;
                ComputationMode::Cpu
            }
        };
        info!("Particle simulation moved from {} to {}", self.mode, next);
        self.mode = next;
        Ok(next)
    }

    fn move_to_gpu(&mut self, device: &dyn Device) -> Result<(), DeviceError> {
        let mut batch = SyncBatch::new(QueueFamilies::query(device), ContextKind::Graphics);
        for emitter in self.emitters.values_mut() {
            let Some(buffers) = emitter.buffers_mut() else {
                continue;
            };
            let positions = buffers.positions.buffer;
            buffers.positions_ownership =
                buffers
                    .take_positions_ownership()
                    .move_to(positions, ContextKind::Compute, &mut batch)?;
        }
        for emitter in self.emitters.values_mut() {
            // Detached while recording, the upload needs the emitter mutably.
            if let Some(buffers) = emitter.take_buffers() {
                upload_host_state(emitter, &buffers, &mut batch);
                emitter.attach_buffers(buffers);
            }
        }
        batch.submit_and_wait(device)
    }

    fn move_to_cpu(&mut self, device: &dyn Device) -> Result<(), DeviceError> {
        let mut batch = SyncBatch::new(QueueFamilies::query(device), ContextKind::Compute);
        for emitter in self.emitters.values_mut() {
            let Some(buffers) = emitter.buffers_mut() else {
                continue;
            };
            let positions = buffers.positions.buffer;
            buffers.positions_ownership =
                buffers
                    .take_positions_ownership()
                    .move_to(positions, ContextKind::Graphics, &mut batch)?;
        }
        batch.submit_and_wait(device)?;

        for emitter in self.emitters.values_mut() {
            let Some(buffers) = emitter.buffers() else {
                continue;
            };
            let positions: Vec<[f32; 4]> = read_back(device, buffers.positions.buffer)?;
            let velocities: Vec<[f32; 4]> = read_back(device, buffers.velocities.buffer)?;
            let ages: Vec<f32> = read_back(device, buffers.ages.buffer)?;
            emitter.load_device_state(&positions, &velocities, &ages);
        }
        Ok(())
    }

    /// Advances the simulation by `dt` seconds on whichever side is active.
    pub fn update(&mut self, dt: f32) {
        match self.mode {
            ComputationMode::Cpu => {
                for emitter in self.emitters.values_mut() {
                    emitter.update(dt);
                }
            }
            ComputationMode::Gpu => self.run_gpu_frame(dt),
        }
    }

    fn run_gpu_frame(&mut self, dt: f32) {
        let (Some(context), Some(gpu)) = (&self.context, self.gpu.as_mut()) else {
            warn!("GPU frame requested without GPU compute");
            return;
        };
        let device = context.device().as_ref();
        let families = gpu.families;
        let workgroup_size = gpu.workgroup_size;
        let share = self.settings.share_positions_with_graphics;

        let slot_index = gpu.frames.current_index();
        let slot = gpu.frames.current_mut();
        slot.commands.reset();
        gpu.profiler.begin_frame(slot_index, &mut slot.commands);
        slot.commands.bind_pipeline(gpu.pipeline);
        slot.commands.push_constants(0, &FrameConstants { dt });
        // Host state to put back if the device never runs this frame.
        let mut rollback = Vec::with_capacity(self.emitters.len());
        for (handle, emitter) in self.emitters.iter_mut() {
            let Some(buffers) = emitter.buffers_mut() else {
                continue;
            };
            let positions = buffers.positions.buffer;
            let before = buffers.positions_ownership.snapshot();
            let (before, ownership) = match buffers.take_positions_ownership() {
                BufferOwnership::InTransit(pending) if pending.destination() == ContextKind::Compute => {
                    pending.acquire(&mut slot.commands);
                    (before, BufferOwnership::Owned(ContextKind::Compute))
                }
                owned @ BufferOwnership::Owned(ContextKind::Compute) => (before, owned),
                other => {
                    // The renderer never handed positions back, fetch them synchronously.
                    debug!("Reclaiming positions of {:?} from graphics", handle);
                    match other.move_and_wait(device, positions, ContextKind::Compute) {
                        Ok(owned) => (owned.snapshot(), owned),
                        Err((reached, e)) => {
                            error!("Skipping emitter {:?}: {}", handle, e);
                            buffers.positions_ownership = reached;
                            continue;
                        }
                    }
                }
            };
            buffers.positions_ownership = ownership;
            rollback.push((handle, emitter.spawn_checkpoint(), before));

            emitter.advance_device_spawn(dt);
            let count = emitter.particle_count();
            let uniform = emitter.take_dirty_uniform();
            let Some(buffers) = emitter.buffers_mut() else {
                continue;
            };
            if let Some(uniform) = uniform {
                slot.commands.write_buffer(buffers.uniform.buffer, 0, &[uniform]);
            }
            slot.descriptors.write_all(buffers.bindings());
            slot.commands.bind_descriptor_set(slot.descriptors.bindings());
            let groups = kernel::dispatch_size(count, workgroup_size);
            if groups > 0 {
                let label = format!("emitter {:?}", handle);
                gpu.profiler.write_timestamp(&mut slot.commands, &label);
                slot.commands.dispatch(groups);
                gpu.profiler.write_timestamp(&mut slot.commands, &label);
                trace!("Dispatching {} work groups for {:?}", groups, handle);
            }
            if share {
                let pending = OwnershipTransfer::to_graphics(positions).release(&mut slot.commands, families);
                buffers.positions_ownership = BufferOwnership::InTransit(pending);
            }
        }
        gpu.profiler.end_frame(&mut slot.commands);

        match device.submit(ContextKind::Compute, &slot.commands) {
            Ok(submission) => slot.last_submission = Some(submission),
            Err(e) => {
                error!("Dropping particle frame {}: {}", slot_index, e);
                gpu.profiler.abandon_frame();
                for (handle, checkpoint, ownership) in rollback {
                    let Some(emitter) = self.emitters.get_mut(handle) else {
                        continue;
                    };
                    emitter.restore_spawn(checkpoint);
                    if let Some(buffers) = emitter.buffers_mut() {
                        buffers.positions_ownership = ownership;
                    }
                }
                return;
            }
        }
        if let Err(e) = gpu.profiler.collect(device, gpu.frames.oldest_index()) {
            warn!("Dropping profiler sample: {}", e);
        }
        gpu.frames.advance();
    }

    /// Records graphics side work for this frame and lists what to draw.
    pub fn update_rendering_buffers(&mut self, rendering: &mut RenderingContext) {
        let Some(context) = &self.context else {
            return;
        };
        let families = QueueFamilies::query(context.device().as_ref());
        for (handle, emitter) in self.emitters.iter_mut() {
            let count = emitter.particle_count();
            let size = emitter.info().size;
            let dirty = emitter.take_positions_dirty();
            let upload = if dirty && count > 0 {
                Some(emitter.gpu_positions())
            } else {
                None
            };
            let Some(buffers) = emitter.buffers_mut() else {
                continue;
            };
            let positions = buffers.positions.buffer;
            match self.mode {
                ComputationMode::Cpu => {
                    if buffers.positions_holder() != Some(ContextKind::Graphics) {
                        continue;
                    }
                    if let Some(data) = upload {
                        rendering.pre_draw.write_buffer(positions, 0, &data);
                    }
                }
                ComputationMode::Gpu => match buffers.take_positions_ownership() {
                    BufferOwnership::InTransit(pending) if pending.destination() == ContextKind::Graphics => {
                        pending.acquire(&mut rendering.pre_draw);
                        let back = OwnershipTransfer::to_compute(positions).release(&mut rendering.post_draw, families);
                        buffers.positions_ownership = BufferOwnership::InTransit(back);
                    }
                    other => {
                        buffers.positions_ownership = other;
                        trace!("Positions of {:?} not shared this frame", handle);
                        continue;
                    }
                },
            }
            rendering.draw_batches.push(DrawBatch {
                emitter: handle,
                positions,
                count,
                size,
            });
        }
    }

    pub fn draw_profiler_ui(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "Particles: {} in {} emitters ({})",
            self.total_particles(),
            self.emitters.len(),
            self.mode
        )?;
        match &self.gpu {
            Some(gpu) => gpu.profiler.draw_ui(out),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::tests::FlakyDevice;
    use crate::device::{Command, HostDevice, HostDeviceOptions};
    use crate::emitter::tests::{assert_close, fountain};
    use crate::ownership::TransferEventKind;
    use std::collections::HashMap;

    fn setup(options: HostDeviceOptions, settings: HandlerSettings) -> (Arc<HostDevice>, ParticleEmitterHandler) {
        let device = Arc::new(HostDevice::new(options));
        let mut handler = ParticleEmitterHandler::new(settings);
        handler.initialize(GraphicsContext::new(device.clone())).unwrap();
        (device, handler)
    }

    fn gpu_setup(options: HostDeviceOptions) -> (Arc<HostDevice>, ParticleEmitterHandler) {
        let (device, mut handler) = setup(options, HandlerSettings::default());
        handler.initialize_gpu_compute().unwrap();
        (device, handler)
    }

    fn flaky_gpu_setup(label: &'static str, failing: &[usize]) -> (Arc<FlakyDevice>, ParticleEmitterHandler) {
        let device = Arc::new(FlakyDevice::new(HostDeviceOptions::default(), label, failing));
        let mut handler = ParticleEmitterHandler::new(HandlerSettings::default());
        handler.initialize(GraphicsContext::new(device.clone())).unwrap();
        handler.initialize_gpu_compute().unwrap();
        (device, handler)
    }

    fn assert_matches_reference(emitter: &ParticleEmitter, reference: &ParticleEmitter) {
        assert_eq!(emitter.particle_count(), reference.particle_count());
        assert_eq!(emitter.ages().len(), reference.ages().len());
        for i in 0..reference.ages().len() {
            assert_close(emitter.ages()[i], reference.ages()[i], 1e-4);
            assert_close(emitter.positions()[i].x, reference.positions()[i].x, 1e-3);
            assert_close(emitter.positions()[i].y, reference.positions()[i].y, 1e-3);
            assert_close(emitter.velocities()[i].y, reference.velocities()[i].y, 1e-3);
        }
    }

    fn render_frame(handler: &mut ParticleEmitterHandler, device: &HostDevice, rendering: &mut RenderingContext, dt: f32) {
        handler.update(dt);
        rendering.begin_frame();
        handler.update_rendering_buffers(rendering);
        rendering.submit_pre_draw(device).unwrap();
        rendering.submit_post_draw(device).unwrap();
    }

    fn assert_transfers_paired(device: &HostDevice) {
        let mut in_flight: HashMap<BufferHandle, (ContextKind, ContextKind)> = HashMap::new();
        for event in device.transfer_events() {
            match event.kind {
                TransferEventKind::Release => {
                    assert!(in_flight.insert(event.buffer, (event.from, event.to)).is_none());
                }
                TransferEventKind::Acquire => {
                    assert_eq!(in_flight.remove(&event.buffer), Some((event.from, event.to)));
                }
            }
        }
        assert!(in_flight.is_empty(), "unacquired releases: {:?}", in_flight);
        assert!(device.unmatched_releases().is_empty());
    }

    #[test]
    fn round_trip_through_gpu_matches_cpu_run() {
        let info = fountain(9.7, 1.37);
        let mut reference = ParticleEmitter::new(info, 9.81).unwrap();
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        let handle = handler.create_emitter(info).unwrap();
        let mut rendering = RenderingContext::new();

        for frame in 0..20 {
            if frame == 5 {
                assert_eq!(handler.toggle_computation_device().unwrap(), ComputationMode::Gpu);
            }
            if frame == 15 {
                assert_eq!(handler.toggle_computation_device().unwrap(), ComputationMode::Cpu);
            }
            render_frame(&mut handler, &device, &mut rendering, 0.1);
            reference.update(0.1);
        }

        assert_matches_reference(handler.emitter(handle).unwrap(), &reference);
        assert_eq!(device.dispatches().len(), 10);
        assert_transfers_paired(&device);
    }

    #[test]
    fn gpu_init_failure_stays_on_cpu() {
        let (_device, mut handler) = setup(
            HostDeviceOptions {
                timestamps: false,
                ..HostDeviceOptions::default()
            },
            HandlerSettings::default(),
        );
        let handle = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        assert!(handler.initialize_gpu_compute().is_err());
        assert!(!handler.is_gpu_compute_available());
        assert!(matches!(
            handler.toggle_computation_device(),
            Err(HandlerError::GpuUnavailable)
        ));
        assert_eq!(handler.mode(), ComputationMode::Cpu);
        handler.update(0.5);
        assert_eq!(handler.emitter(handle).unwrap().particle_count(), 5);
    }

    #[test]
    fn gpu_compute_needs_a_context() {
        let mut handler = ParticleEmitterHandler::new(HandlerSettings::default());
        assert!(matches!(
            handler.initialize_gpu_compute(),
            Err(HandlerError::NotInitialized)
        ));
        assert!(matches!(
            handler.toggle_computation_device(),
            Err(HandlerError::NotInitialized)
        ));
    }

    #[test]
    fn emitters_created_early_get_buffers_on_initialize() {
        let device = Arc::new(HostDevice::new(HostDeviceOptions::default()));
        let mut handler = ParticleEmitterHandler::new(HandlerSettings::default());
        let handle = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        assert!(handler.emitter(handle).unwrap().buffers().is_none());
        handler.initialize(GraphicsContext::new(device.clone())).unwrap();
        let buffers = handler.emitter(handle).unwrap().buffers().unwrap();
        assert_eq!(buffers.positions_holder(), Some(ContextKind::Graphics));
        assert_eq!(device.owner(buffers.positions.buffer), Some(ContextKind::Graphics));
        assert_eq!(device.live_buffers(), 4);
    }

    #[test]
    fn workgroup_size_is_capped_and_dispatches_cover_every_particle() {
        let (device, mut handler) = setup(
            HostDeviceOptions {
                max_workgroup_size: 64,
                ..HostDeviceOptions::default()
            },
            HandlerSettings::default(),
        );
        handler.initialize_gpu_compute().unwrap();
        assert_eq!(handler.workgroup_size(), Some(64));
        handler.create_emitter(fountain(1000.0, 1.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        let mut rendering = RenderingContext::new();

        render_frame(&mut handler, &device, &mut rendering, 0.1);
        render_frame(&mut handler, &device, &mut rendering, 0.1);
        let groups: Vec<[u32; 3]> = device.dispatches().iter().map(|d| d.groups).collect();
        assert_eq!(groups, vec![[2, 1, 1], [4, 1, 1]]);
        assert_eq!(handler.total_particles(), 200);
    }

    #[test]
    fn frame_index_cycles_through_slots() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        let mut rendering = RenderingContext::new();
        assert_eq!(handler.frame_slots(), 3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(handler.frame_index());
            render_frame(&mut handler, &device, &mut rendering, 1.0 / 60.0);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(handler.frame_index(), 1);
    }

    #[test]
    fn failed_timestamp_reads_do_not_stop_frames() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        let handle = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        device.set_timestamp_reads_failing(true);
        let mut rendering = RenderingContext::new();
        for _ in 0..6 {
            render_frame(&mut handler, &device, &mut rendering, 0.1);
        }
        assert_eq!(handler.emitter(handle).unwrap().particle_count(), 6);
        assert_eq!(device.dispatches().len(), 6);
        assert_eq!(handler.frame_index(), 0);

        let mut ui = String::new();
        handler.draw_profiler_ui(&mut ui).unwrap();
        assert!(ui.contains("dropped samples"));
    }

    #[test]
    fn profiler_reports_each_emitter() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        let mut rendering = RenderingContext::new();
        for _ in 0..4 {
            render_frame(&mut handler, &device, &mut rendering, 0.1);
        }
        let mut ui = String::new();
        handler.draw_profiler_ui(&mut ui).unwrap();
        assert!(ui.contains("GPU timings"));
        assert!(ui.contains("emitter"));
        assert!(ui.contains("(GPU)"));
    }

    #[test]
    fn rendering_lists_follow_the_mode() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        let handle = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        let mut rendering = RenderingContext::new();

        render_frame(&mut handler, &device, &mut rendering, 0.3);
        assert!(matches!(rendering.pre_draw.commands(), [Command::WriteBuffer { .. }]));
        assert!(rendering.post_draw.is_empty());
        assert_eq!(rendering.draw_batches.len(), 1);
        assert_eq!(rendering.draw_batches[0].emitter, handle);
        assert_eq!(rendering.draw_batches[0].count, 3);

        handler.toggle_computation_device().unwrap();
        render_frame(&mut handler, &device, &mut rendering, 0.1);
        assert!(matches!(rendering.pre_draw.commands(), [Command::Acquire(_)]));
        assert!(matches!(rendering.post_draw.commands(), [Command::Release(_)]));
        assert_eq!(rendering.particle_count(), 4);
    }

    #[test]
    fn unshared_positions_stay_on_compute() {
        let (device, mut handler) = setup(
            HostDeviceOptions::default(),
            HandlerSettings {
                share_positions_with_graphics: false,
                ..HandlerSettings::default()
            },
        );
        handler.initialize_gpu_compute().unwrap();
        let handle = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        let mut rendering = RenderingContext::new();
        render_frame(&mut handler, &device, &mut rendering, 0.1);
        assert!(rendering.draw_batches.is_empty());
        let positions = handler.emitter(handle).unwrap().buffers().unwrap().positions.buffer;
        assert_eq!(device.owner(positions), Some(ContextKind::Compute));

        handler.toggle_computation_device().unwrap();
        assert_eq!(device.owner(positions), Some(ContextKind::Graphics));
        assert_transfers_paired(&device);
    }

    #[test]
    fn positions_left_with_graphics_are_reclaimed() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        // No renderer picks up the released positions in between.
        handler.update(0.1);
        handler.update(0.1);
        assert_eq!(device.dispatches().len(), 2);

        let mut rendering = RenderingContext::new();
        render_frame(&mut handler, &device, &mut rendering, 0.1);
        assert_eq!(device.dispatches().len(), 3);
        handler.toggle_computation_device().unwrap();
        assert_transfers_paired(&device);
    }

    #[test]
    fn removing_emitters_frees_device_buffers() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions::default());
        let first = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        let second = handler.create_emitter(fountain(20.0, 1.0)).unwrap();
        handler.toggle_computation_device().unwrap();
        handler.update(0.1);
        assert_eq!(device.live_buffers(), 8);
        handler.remove_emitter(first).unwrap();
        assert_eq!(device.live_buffers(), 4);
        assert_eq!(handler.len(), 1);
        assert!(matches!(
            handler.remove_emitter(first),
            Err(HandlerError::UnknownEmitter(_))
        ));
        handler.update(0.1);
        assert_eq!(handler.emitter(second).unwrap().particle_count(), 4);
    }

    #[test]
    fn invalid_emitters_are_rejected() {
        let (_device, mut handler) = setup(HostDeviceOptions::default(), HandlerSettings::default());
        let result = handler.create_emitter(EmitterInfo {
            rate: -1.0,
            ..EmitterInfo::default()
        });
        assert!(matches!(
            result,
            Err(HandlerError::Emitter(EmitterError::InvalidRate(_)))
        ));
        assert!(handler.is_empty());
    }

    #[test]
    fn shared_queue_family_needs_no_barriers() {
        let (device, mut handler) = gpu_setup(HostDeviceOptions {
            compute_queue_family: 0,
            ..HostDeviceOptions::default()
        });
        let handle = handler.create_emitter(fountain(10.0, 2.0)).unwrap();
        let mut rendering = RenderingContext::new();
        handler.toggle_computation_device().unwrap();
        for _ in 0..3 {
            render_frame(&mut handler, &device, &mut rendering, 0.1);
        }
        assert!(rendering.pre_draw.is_empty());
        handler.toggle_computation_device().unwrap();
        assert!(device.transfer_events().is_empty());
        assert_eq!(handler.emitter(handle).unwrap().particle_count(), 3);
    }

    #[test]
    fn dropped_frame_is_replayed_from_the_same_state() {
        let info = fountain(9.7, 1.37);
        let mut reference = ParticleEmitter::new(info, 9.81).unwrap();
        let (device, mut handler) = flaky_gpu_setup("Particle frame", &[1]);
        let handle = handler.create_emitter(info).unwrap();
        let mut rendering = RenderingContext::new();
        handler.toggle_computation_device().unwrap();

        for _ in 0..8 {
            render_frame(&mut handler, &device.inner, &mut rendering, 0.25);
        }
        for _ in 0..7 {
            reference.update(0.25);
        }
        assert_eq!(device.inner.dispatches().len(), 7);
        assert_eq!(handler.frame_index(), 7 % 3);
        let mut overlay = String::new();
        handler.draw_profiler_ui(&mut overlay).unwrap();
        assert!(overlay.contains("dropped samples: 1"), "{}", overlay);

        assert_eq!(handler.toggle_computation_device().unwrap(), ComputationMode::Cpu);
        assert_matches_reference(handler.emitter(handle).unwrap(), &reference);
        assert_transfers_paired(&device.inner);
    }

    #[test]
    fn failed_reclaim_skips_the_emitter_and_resumes() {
        let info = fountain(9.7, 1.37);
        let mut reference = ParticleEmitter::new(info, 9.81).unwrap();
        // Creation and the toggle each submit one compute sync list first.
        let (device, mut handler) = flaky_gpu_setup("sync compute", &[2]);
        let handle = handler.create_emitter(info).unwrap();
        let mut rendering = RenderingContext::new();
        handler.toggle_computation_device().unwrap();
        let positions = handler.emitter(handle).unwrap().buffers().unwrap().positions.buffer;

        // No renderer this frame, so positions stay released to graphics.
        handler.update(0.25);
        reference.update(0.25);
        handler.update(0.25);
        assert_eq!(device.inner.dispatches().len(), 1);
        assert_eq!(handler.emitter(handle).unwrap().particle_count(), 2);
        assert_eq!(device.inner.unmatched_releases(), vec![positions]);

        render_frame(&mut handler, &device.inner, &mut rendering, 0.25);
        reference.update(0.25);
        assert_eq!(device.inner.dispatches().len(), 2);
        assert_eq!(rendering.draw_batches.len(), 1);

        assert_eq!(handler.toggle_computation_device().unwrap(), ComputationMode::Cpu);
        assert_matches_reference(handler.emitter(handle).unwrap(), &reference);
        assert_transfers_paired(&device.inner);
    }
}
