use crate::device::DeviceError;
use log::{debug, info};

// WGSL templates embedded in the binary. Values that are only known once a
// device is open (workgroup size, binding slots) are filled in with tera.
static SHADERS: &[(&str, &str)] = &[("particles.wgsl", include_str!("shaders/particles.wgsl"))];

pub fn shader_template(name: &str) -> Option<&'static str> {
    SHADERS
        .iter()
        .find(|(shader_name, _)| *shader_name == name)
        .map(|(_, source)| *source)
}

pub fn list_shaders() {
    for (name, source) in SHADERS {
        info!("Found shader: {} ({} bytes)", name, source.len());
    }
}

pub fn render_shader(name: &str, context: &tera::Context) -> Result<String, DeviceError> {
    let template = shader_template(name)
        .ok_or_else(|| DeviceError::ShaderCompilation(format!("no shader named {}", name)))?;
    let rendered = tera::Tera::one_off(template, context, false)
        .map_err(|e| DeviceError::ShaderCompilation(format!("rendering {}: {:?}", name, e)))?;
    debug!("Rendered {} ({} bytes)", name, rendered.len());
    Ok(rendered)
}
