use geyser::device::GraphicsContext;
use geyser::fps_estimator::FpsEstimator;
use geyser::handler::{ComputationMode, ParticleEmitterHandler};
use geyser::params::SimulationParams;
use geyser::rendering::RenderingContext;
use log::{error, info, warn};

gflags::define! {
    --config: &str = "simulation.toml"
}
gflags::define! {
    --log_filter: &str = "warn,geyser=info"
}
gflags::define! {
    /// Overrides the frame count from the config when non-zero.
    --frames: u64 = 0
}
gflags::define! {
    -h, --help = false
}

const OVERLAY_EVERY: u64 = 60;

fn read_config_from_file(path: &str) -> anyhow::Result<SimulationParams> {
    let params = std::fs::read_to_string(path)?.parse()?;
    Ok(params)
}

fn get_config() -> SimulationParams {
    match read_config_from_file(CONFIG.flag) {
        Ok(params) => params,
        Err(e) => {
            error!("Failed to parse config file({}): {:?}", CONFIG.flag, e);
            geyser::params::get_config_from_default_file()
        }
    }
}

fn run(params: &SimulationParams) -> anyhow::Result<()> {
    let device = params.device.open()?;
    let context = GraphicsContext::new(device.clone());
    let mut handler = ParticleEmitterHandler::new(params.handler);
    for info in &params.emitters {
        handler.create_emitter(*info)?;
    }
    handler.initialize(context)?;
    if let Err(e) = handler.initialize_gpu_compute() {
        warn!("Continuing on the CPU only: {}", e);
    }
    if params.start_on_gpu && handler.is_gpu_compute_available() {
        handler.toggle_computation_device()?;
    }

    let frames = if FRAMES.flag > 0 { FRAMES.flag } else { params.frames };
    let mut fps = FpsEstimator::new(params.fps);
    let mut rendering = RenderingContext::new();
    let mut frame: u64 = 0;
    while frames == 0 || frame < frames {
        let dt = fps.tick().as_secs_f32();
        if params.toggle_every > 0 && frame > 0 && frame % params.toggle_every == 0 {
            if handler.is_gpu_compute_available() {
                let mode = handler.toggle_computation_device()?;
                info!("Frame {}: now simulating on the {}", frame, mode);
            }
        }

        handler.update(dt);
        rendering.begin_frame();
        handler.update_rendering_buffers(&mut rendering);
        if let Err(e) = rendering.submit_pre_draw(device.as_ref()) {
            error!("Frame {}: dropping pre-draw work: {}", frame, e);
        }
        // The particle draw itself belongs to the embedding renderer.
        if let Err(e) = rendering.submit_post_draw(device.as_ref()) {
            error!("Frame {}: dropping post-draw work: {}", frame, e);
        }

        if frame % OVERLAY_EVERY == 0 {
            let mut overlay = String::new();
            handler.draw_profiler_ui(&mut overlay)?;
            info!(
                "Frame {} at {:.1} fps, {} particles drawn\n{}",
                frame,
                fps.fps(),
                rendering.particle_count(),
                overlay.trim_end()
            );
        }
        frame += 1;
    }

    if handler.mode() == ComputationMode::Gpu {
        handler.toggle_computation_device()?;
    }
    info!(
        "Finished {} frames with {} particles",
        frame,
        handler.total_particles()
    );
    Ok(())
}

fn main() {
    gflags::parse();
    if HELP.flag {
        gflags::print_help_and_exit(0);
    }
    scrub_log::init_with_filter_string(LOG_FILTER.flag).unwrap();

    let params = get_config();
    geyser::shader_utils::list_shaders();
    if let Err(e) = run(&params) {
        error!("Simulation failed: {:?}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_config() {
        let deserialized_config = read_config_from_file(CONFIG.flag).unwrap();
        println!("deserialized = {:?}", deserialized_config);
        assert!(!deserialized_config.emitters.is_empty());
    }

    #[test]
    fn short_run_on_host_device() {
        let params = SimulationParams {
            fps: 1000.0,
            frames: 12,
            toggle_every: 4,
            start_on_gpu: true,
            ..SimulationParams::default()
        };
        run(&params).unwrap();
    }
}
