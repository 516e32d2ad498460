//! The particle update program: GPU data layouts, the WGSL source and a host
//! implementation with identical semantics for the software device.

use crate::device::{BindingType, ComputeProgram, DeviceError, HostDispatch};
use crate::emitter::{wrap_age, Ballistics, EmitterInfo};
use crate::shader_utils::render_shader;
use cgmath::Vector3;

pub const ENTRY_POINT: &str = "update_particles";

pub const POSITIONS_BINDING: u32 = 0;
pub const VELOCITIES_BINDING: u32 = 1;
pub const AGES_BINDING: u32 = 2;
pub const UNIFORM_BINDING: u32 = 3;

pub const BINDINGS: [BindingType; 4] = [
    BindingType::Storage,
    BindingType::Storage,
    BindingType::Storage,
    BindingType::Uniform,
];

// This should match the struct defined in particles.wgsl.
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct EmitterUniform {
    // xyz origin, w visual size
    pub origin: [f32; 4],
    pub initial_velocity: [f32; 4],
    pub lifetime: f32,
    pub gravity: f32,
    pub rate: f32,
    pub emitter_age: f32,
    pub previous_count: u32,
    pub particle_count: u32,
    pub _padding: [u32; 2],
}

impl EmitterUniform {
    pub fn new(ballistics: &Ballistics, info: &EmitterInfo) -> Self {
        let origin = ballistics.origin;
        let v0 = ballistics.initial_velocity;
        EmitterUniform {
            origin: [origin.x, origin.y, origin.z, info.size],
            initial_velocity: [v0.x, v0.y, v0.z, 0.0],
            lifetime: info.lifetime,
            gravity: ballistics.gravity,
            rate: info.rate,
            ..EmitterUniform::default()
        }
    }

    fn ballistics(&self) -> Ballistics {
        Ballistics {
            origin: Vector3::new(self.origin[0], self.origin[1], self.origin[2]),
            initial_velocity: Vector3::new(
                self.initial_velocity[0],
                self.initial_velocity[1],
                self.initial_velocity[2],
            ),
            gravity: self.gravity,
        }
    }
}

// Push constant block, one per dispatch.
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct FrameConstants {
    pub dt: f32,
}

pub fn program(workgroup_size: u32) -> Result<ComputeProgram, DeviceError> {
    let mut context = tera::Context::new();
    context.insert("workgroup_size", &workgroup_size);
    context.insert("entry_point", ENTRY_POINT);
    context.insert("positions_binding", &POSITIONS_BINDING);
    context.insert("velocities_binding", &VELOCITIES_BINDING);
    context.insert("ages_binding", &AGES_BINDING);
    context.insert("uniform_binding", &UNIFORM_BINDING);
    Ok(ComputeProgram {
        label: "Particle update",
        wgsl: render_shader("particles.wgsl", &context)?,
        entry_point: ENTRY_POINT,
        host: update_particles_host,
    })
}

pub fn dispatch_size(particle_count: u32, workgroup_size: u32) -> u32 {
    particle_count.div_ceil(workgroup_size.max(1))
}

fn layout_error(what: &str, e: bytemuck::PodCastError) -> DeviceError {
    DeviceError::Binding(format!("{}: {:?}", what, e))
}

/// Host side twin of `update_particles` in particles.wgsl.
pub fn update_particles_host(dispatch: HostDispatch<'_>) -> Result<(), DeviceError> {
    let invocations = dispatch.invocations;
    let frame: FrameConstants = dispatch
        .push_constants
        .get(..std::mem::size_of::<FrameConstants>())
        .map(bytemuck::pod_read_unaligned)
        .ok_or_else(|| DeviceError::Binding("missing frame constants".to_string()))?;
    let bindings = dispatch.bindings;
    let bound = bindings.len();
    let [positions, velocities, ages, uniform] = bindings else {
        return Err(DeviceError::Binding(format!("expected 4 bindings, got {}", bound)));
    };
    let uniform: EmitterUniform = bytemuck::cast_slice::<u32, u8>(uniform.as_slice())
        .get(..std::mem::size_of::<EmitterUniform>())
        .map(bytemuck::pod_read_unaligned)
        .ok_or_else(|| DeviceError::Binding("emitter uniform too small".to_string()))?;
    let positions: &mut [[f32; 4]] =
        bytemuck::try_cast_slice_mut(positions.as_mut_slice()).map_err(|e| layout_error("positions", e))?;
    let velocities: &mut [[f32; 4]] =
        bytemuck::try_cast_slice_mut(velocities.as_mut_slice()).map_err(|e| layout_error("velocities", e))?;
    let ages: &mut [f32] =
        bytemuck::try_cast_slice_mut(ages.as_mut_slice()).map_err(|e| layout_error("ages", e))?;

    let ballistics = uniform.ballistics();
    let size = uniform.origin[3];
    let place = |age: f32| {
        let p = ballistics.position_at(age);
        let v = ballistics.velocity_at(age);
        ([p.x, p.y, p.z, size], [v.x, v.y, v.z, 0.0], age)
    };

    let count = invocations
        .min(uniform.particle_count)
        .min(positions.len() as u32)
        .min(velocities.len() as u32)
        .min(ages.len() as u32) as usize;
    let dt = frame.dt;
    for index in 0..count {
        let state = if index as u32 >= uniform.previous_count {
            let spawn_time = (index as u32 + 1) as f32 / uniform.rate;
            place(wrap_age(uniform.emitter_age - spawn_time, uniform.lifetime))
        } else {
            let [vx, mut vy, vz, _] = velocities[index];
            let [px, py, pz, _] = positions[index];
            let position = [px + vx * dt, py + vy * dt, pz + vz * dt, size];
            vy -= uniform.gravity * dt;
            let age = ages[index] + dt;
            if age >= uniform.lifetime {
                place(age % uniform.lifetime)
            } else {
                (position, [vx, vy, vz, 0.0], age)
            }
        };
        positions[index] = state.0;
        velocities[index] = state.1;
        ages[index] = state.2;
    }
    Ok(())
}
