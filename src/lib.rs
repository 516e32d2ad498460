pub mod buffer_util;
pub mod device;
pub mod emitter;
pub mod fps_estimator;
pub mod frame;
pub mod handler;
pub mod kernel;
pub mod ownership;
pub mod params;
pub mod profiler;
pub mod rendering;
pub mod shader_utils;
