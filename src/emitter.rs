use crate::buffer_util::{make_array_buffer, make_buffer, SizedBuffer};
use crate::device::{BufferUsage, ContextKind, DescriptorBindings, Device, DeviceError};
use crate::kernel::EmitterUniform;
use crate::ownership::BufferOwnership;
use cgmath::{InnerSpace, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// Static description of an emitter. Direction is normalized on construction.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct EmitterInfo {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub lifetime: f32,
    pub speed: f32,
    pub rate: f32,
    pub size: f32,
}

impl Default for EmitterInfo {
    fn default() -> Self {
        EmitterInfo {
            position: [0.0, 0.0, 0.0],
            direction: [0.0, 1.0, 0.0],
            lifetime: 2.0,
            speed: 5.0,
            rate: 100.0,
            size: 0.05,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EmitterError {
    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f32 },
    #[error("emission rate must be positive, got {0}")]
    InvalidRate(f32),
    #[error("particle lifetime must be positive, got {0}")]
    InvalidLifetime(f32),
    #[error("speed and size must not be negative")]
    Negative,
    #[error("emission direction has zero length")]
    ZeroDirection,
    #[error("rate {rate}/s over {lifetime}s leaves room for no particles")]
    NoCapacity { rate: f32, lifetime: f32 },
}

/// Motion under constant downward acceleration, starting at the emitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ballistics {
    pub origin: Vector3<f32>,
    pub initial_velocity: Vector3<f32>,
    pub gravity: f32,
}

impl Ballistics {
    pub fn velocity_at(&self, t: f32) -> Vector3<f32> {
        self.initial_velocity - Vector3::new(0.0, self.gravity * t, 0.0)
    }

    pub fn position_at(&self, t: f32) -> Vector3<f32> {
        self.origin + self.initial_velocity * t - Vector3::new(0.0, 0.5 * self.gravity * t * t, 0.0)
    }
}

// Ages at or past the lifetime wrap around. A particle spawned later than the
// emitter's clock (never the case for valid input) starts at zero.
pub fn wrap_age(age: f32, lifetime: f32) -> f32 {
    if age >= lifetime {
        age % lifetime
    } else {
        age.max(0.0)
    }
}

fn check_finite(field: &'static str, value: f32) -> Result<(), EmitterError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(EmitterError::NonFinite { field, value })
    }
}

pub(crate) const PARTICLE_USAGE: BufferUsage = BufferUsage::STORAGE;

/// Device mirror of one emitter. Buffers are freed when this is dropped.
pub struct EmitterBuffers {
    device: Arc<dyn Device>,
    pub positions: SizedBuffer,
    pub velocities: SizedBuffer,
    pub ages: SizedBuffer,
    pub uniform: SizedBuffer,
    pub(crate) positions_ownership: BufferOwnership,
}

impl EmitterBuffers {
    pub fn create(device: &Arc<dyn Device>, capacity: u32) -> Result<Self, DeviceError> {
        let positions = make_array_buffer::<[f32; 4]>(
            device.as_ref(),
            "Particle positions",
            capacity,
            PARTICLE_USAGE | BufferUsage::VERTEX,
        )?;
        let velocities =
            make_array_buffer::<[f32; 4]>(device.as_ref(), "Particle velocities", capacity, PARTICLE_USAGE)?;
        let ages = make_array_buffer::<f32>(device.as_ref(), "Particle ages", capacity, PARTICLE_USAGE)?;
        let uniform = make_buffer(
            device.as_ref(),
            "Emitter uniform",
            std::mem::size_of::<EmitterUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        Ok(EmitterBuffers {
            device: device.clone(),
            positions,
            velocities,
            ages,
            uniform,
            positions_ownership: BufferOwnership::Owned(ContextKind::Compute),
        })
    }

    pub fn bindings(&self) -> DescriptorBindings {
        [
            Some(self.positions.buffer),
            Some(self.velocities.buffer),
            Some(self.ages.buffer),
            Some(self.uniform.buffer),
        ]
    }

    pub fn positions_holder(&self) -> Option<ContextKind> {
        self.positions_ownership.holder()
    }

    pub(crate) fn take_positions_ownership(&mut self) -> BufferOwnership {
        std::mem::replace(
            &mut self.positions_ownership,
            BufferOwnership::Owned(ContextKind::Compute),
        )
    }
}

impl Drop for EmitterBuffers {
    fn drop(&mut self) {
        for buffer in [&self.positions, &self.velocities, &self.ages, &self.uniform] {
            self.device.destroy_buffer(buffer.buffer);
        }
    }
}

// Host bookkeeping a GPU frame advances before it is submitted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpawnCheckpoint {
    emitter_age: f64,
    particle_count: u32,
    uniform: EmitterUniform,
    uniform_dirty: bool,
}

pub struct ParticleEmitter {
    info: EmitterInfo,
    ballistics: Ballistics,
    max_particles: u32,

    // State
    emitter_age: f64,
    particle_count: u32,
    positions: Vec<Vector3<f32>>,
    velocities: Vec<Vector3<f32>>,
    ages: Vec<f32>,
    positions_dirty: bool,

    // Device side bookkeeping
    uniform: EmitterUniform,
    uniform_dirty: bool,
    buffers: Option<EmitterBuffers>,
}

impl ParticleEmitter {
    pub fn new(info: EmitterInfo, gravity: f32) -> Result<Self, EmitterError> {
        for (field, value) in [
            ("lifetime", info.lifetime),
            ("speed", info.speed),
            ("rate", info.rate),
            ("size", info.size),
            ("gravity", gravity),
        ] {
            check_finite(field, value)?;
        }
        for (axis, value) in info.position.iter().chain(info.direction.iter()).enumerate() {
            check_finite(if axis < 3 { "position" } else { "direction" }, *value)?;
        }
        if info.rate <= 0.0 {
            return Err(EmitterError::InvalidRate(info.rate));
        }
        if info.lifetime <= 0.0 {
            return Err(EmitterError::InvalidLifetime(info.lifetime));
        }
        if info.speed < 0.0 || info.size < 0.0 {
            return Err(EmitterError::Negative);
        }
        let direction = Vector3::from(info.direction);
        if direction.magnitude2() == 0.0 {
            return Err(EmitterError::ZeroDirection);
        }
        let max_particles = (info.rate as f64 * info.lifetime as f64).floor();
        if max_particles < 1.0 {
            return Err(EmitterError::NoCapacity {
                rate: info.rate,
                lifetime: info.lifetime,
            });
        }
        let max_particles = max_particles.min(u32::MAX as f64) as u32;
        let direction = direction.normalize();
        let ballistics = Ballistics {
            origin: Vector3::from(info.position),
            initial_velocity: direction * info.speed,
            gravity,
        };
        log::info!(
            "New emitter at {:?}: {} particles max",
            info.position,
            max_particles
        );
        Ok(ParticleEmitter {
            info: EmitterInfo {
                direction: direction.into(),
                ..info
            },
            ballistics,
            max_particles,
            emitter_age: 0.0,
            particle_count: 0,
            positions: Vec::new(),
            velocities: Vec::new(),
            ages: Vec::new(),
            positions_dirty: false,
            uniform: EmitterUniform::new(&ballistics, &info),
            uniform_dirty: true,
            buffers: None,
        })
    }

    pub fn info(&self) -> &EmitterInfo {
        &self.info
    }

    pub fn ballistics(&self) -> &Ballistics {
        &self.ballistics
    }

    pub fn max_particles(&self) -> u32 {
        self.max_particles
    }

    pub fn emitter_age(&self) -> f64 {
        self.emitter_age
    }

    // Live particles, whichever side is simulating them.
    pub fn particle_count(&self) -> u32 {
        self.particle_count
    }

    // The host arrays are only current in CPU mode or right after a readback.
    pub fn positions(&self) -> &[Vector3<f32>] {
        &self.positions
    }

    pub fn velocities(&self) -> &[Vector3<f32>] {
        &self.velocities
    }

    pub fn ages(&self) -> &[f32] {
        &self.ages
    }

    pub fn buffers(&self) -> Option<&EmitterBuffers> {
        self.buffers.as_ref()
    }

    pub(crate) fn buffers_mut(&mut self) -> Option<&mut EmitterBuffers> {
        self.buffers.as_mut()
    }

    pub(crate) fn take_buffers(&mut self) -> Option<EmitterBuffers> {
        self.buffers.take()
    }

    pub(crate) fn attach_buffers(&mut self, buffers: EmitterBuffers) {
        self.buffers = Some(buffers);
    }

    fn target_count(&self) -> u32 {
        let due = (self.emitter_age * self.info.rate as f64).floor();
        due.min(self.max_particles as f64) as u32
    }

    fn spawn_age(&self, index: u32) -> f32 {
        let spawn_time = (index as f64 + 1.0) / self.info.rate as f64;
        wrap_age((self.emitter_age - spawn_time) as f32, self.info.lifetime)
    }

    /// Host simulation step: integrate live particles, respawn expired ones from
    /// the closed form, then append whatever the emission rate says is due.
    pub fn update(&mut self, dt: f32) {
        if dt <= 0.0 || !dt.is_finite() {
            if dt != 0.0 {
                log::warn!("Ignoring emitter update with dt = {}", dt);
            }
            return;
        }
        self.emitter_age += dt as f64;

        let lifetime = self.info.lifetime;
        let gravity = self.ballistics.gravity;
        for ((position, velocity), age) in self
            .positions
            .iter_mut()
            .zip(self.velocities.iter_mut())
            .zip(self.ages.iter_mut())
        {
            *position += *velocity * dt;
            velocity.y -= gravity * dt;
            *age += dt;
            if *age >= lifetime {
                *age %= lifetime;
                *position = self.ballistics.position_at(*age);
                *velocity = self.ballistics.velocity_at(*age);
            }
        }

        let target = self.target_count();
        for index in self.particle_count..target {
            let age = self.spawn_age(index);
            self.positions.push(self.ballistics.position_at(age));
            self.velocities.push(self.ballistics.velocity_at(age));
            self.ages.push(age);
        }
        self.particle_count = self.positions.len() as u32;
        self.positions_dirty = true;
    }

    /// GPU mode counterpart of the spawn half of [`update`](Self::update): the
    /// kernel does the particle work, the host keeps the clock and the count.
    pub(crate) fn advance_device_spawn(&mut self, dt: f32) {
        if dt <= 0.0 || !dt.is_finite() {
            return;
        }
        self.emitter_age += dt as f64;
        let previous = self.particle_count;
        let target = self.target_count();
        self.particle_count = target;
        if target != previous || self.uniform.previous_count != self.uniform.particle_count {
            self.uniform.previous_count = previous;
            self.uniform.particle_count = target;
            self.uniform.emitter_age = self.emitter_age as f32;
            self.uniform_dirty = true;
        }
    }

    pub(crate) fn spawn_checkpoint(&self) -> SpawnCheckpoint {
        SpawnCheckpoint {
            emitter_age: self.emitter_age,
            particle_count: self.particle_count,
            uniform: self.uniform,
            uniform_dirty: self.uniform_dirty,
        }
    }

    /// Undoes device spawn accounting for a frame the device never ran.
    pub(crate) fn restore_spawn(&mut self, checkpoint: SpawnCheckpoint) {
        self.emitter_age = checkpoint.emitter_age;
        self.particle_count = checkpoint.particle_count;
        self.uniform = checkpoint.uniform;
        self.uniform_dirty = checkpoint.uniform_dirty;
    }

    /// Steady-state uniform matching the host arrays, for uploads on a mode switch.
    pub(crate) fn sync_uniform_to_host(&mut self) -> EmitterUniform {
        self.uniform.previous_count = self.particle_count;
        self.uniform.particle_count = self.particle_count;
        self.uniform.emitter_age = self.emitter_age as f32;
        self.uniform_dirty = false;
        self.uniform
    }

    pub(crate) fn take_dirty_uniform(&mut self) -> Option<EmitterUniform> {
        if self.uniform_dirty {
            self.uniform_dirty = false;
            Some(self.uniform)
        } else {
            None
        }
    }

    pub(crate) fn take_positions_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.positions_dirty, false)
    }

    pub(crate) fn mark_positions_dirty(&mut self) {
        self.positions_dirty = true;
    }

    // Device layouts: vec4 positions carrying the visual size in w, vec4
    // velocities, scalar ages.
    pub fn gpu_positions(&self) -> Vec<[f32; 4]> {
        self.positions
            .iter()
            .map(|p| [p.x, p.y, p.z, self.info.size])
            .collect()
    }

    pub fn gpu_velocities(&self) -> Vec<[f32; 4]> {
        self.velocities.iter().map(|v| [v.x, v.y, v.z, 0.0]).collect()
    }

    /// Replaces the host arrays with a device snapshot of `particle_count`
    /// particles.
    pub(crate) fn load_device_state(
        &mut self,
        positions: &[[f32; 4]],
        velocities: &[[f32; 4]],
        ages: &[f32],
    ) {
        let count = (self.particle_count as usize)
            .min(positions.len())
            .min(velocities.len())
            .min(ages.len());
        self.positions = positions[..count]
            .iter()
            .map(|p| Vector3::new(p[0], p[1], p[2]))
            .collect();
        self.velocities = velocities[..count]
            .iter()
            .map(|v| Vector3::new(v[0], v[1], v[2]))
            .collect();
        self.ages = ages[..count].to_vec();
        self.particle_count = count as u32;
        self.positions_dirty = true;
    }

    pub fn is_empty(&self) -> bool {
        self.particle_count == 0
    }
}
