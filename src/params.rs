use crate::device::DeviceParams;
use crate::emitter::EmitterInfo;
use crate::handler::HandlerSettings;
use serde::{Deserialize, Serialize};

// Parameters for one simulation run. These don't change at runtime.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SimulationParams {
    pub fps: f64,
    // Number of frames to run, 0 runs until killed.
    pub frames: u64,
    // Toggle between CPU and GPU every this many frames, 0 never toggles.
    pub toggle_every: u64,
    pub start_on_gpu: bool,

    #[serde(default)]
    pub handler: HandlerSettings,

    #[serde(default)]
    pub device: DeviceParams,

    #[serde(default)]
    pub emitters: Vec<EmitterInfo>,
}

impl std::str::FromStr for SimulationParams {
    type Err = toml::de::Error;
    fn from_str(serialized: &str) -> Result<Self, Self::Err> {
        let params = toml::from_str(serialized)?;
        Ok(params)
    }
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            fps: 60.0,
            frames: 600,
            toggle_every: 120,
            start_on_gpu: false,
            handler: HandlerSettings::default(),
            device: DeviceParams::default(),
            emitters: vec![EmitterInfo::default()],
        }
    }
}

pub fn get_config_from_default_file() -> SimulationParams {
    let config_data = include_str!("../simulation.toml");
    match config_data.parse() {
        Ok(params) => params,
        Err(e) => {
            log::error!("Failed to parse config file({}): {:?}", "../simulation.toml", e);
            SimulationParams::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Backend;

    #[test]
    fn smoke() {
        let params = SimulationParams {
            fps: 30.0,
            frames: 10,
            toggle_every: 0,
            start_on_gpu: true,
            handler: HandlerSettings {
                frame_slots: 2,
                ..HandlerSettings::default()
            },
            device: DeviceParams::default(),
            emitters: vec![
                EmitterInfo::default(),
                EmitterInfo {
                    rate: 500.0,
                    ..EmitterInfo::default()
                },
            ],
        };
        let serialized = toml::to_string(&params).unwrap();
        println!("serialized = {}", serialized);
        let deserialized: SimulationParams = serialized.parse().unwrap();
        assert_eq!(params.fps, deserialized.fps);
        assert_eq!(params.frames, deserialized.frames);
        assert_eq!(params.handler, deserialized.handler);
        assert_eq!(params.emitters, deserialized.emitters);
    }

    #[test]
    fn default_file_parses() {
        let params: SimulationParams = include_str!("../simulation.toml").parse().unwrap();
        assert_eq!(params.device.backend, Backend::Host);
        assert!(!params.emitters.is_empty());
        assert_eq!(get_config_from_default_file().emitters, params.emitters);
    }

    #[test]
    fn sections_are_optional() {
        let params: SimulationParams = "fps = 60.0\nframes = 1\ntoggle_every = 0\nstart_on_gpu = false\n"
            .parse()
            .unwrap();
        assert_eq!(params.handler, HandlerSettings::default());
        assert!(params.emitters.is_empty());
    }
}
