use crate::device::{BufferHandle, CommandList, ContextKind, Device, DeviceError, SubmissionIndex};
use crate::handler::EmitterHandle;

// What the external renderer needs to draw one emitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawBatch {
    pub emitter: EmitterHandle,
    pub positions: BufferHandle,
    pub count: u32,
    pub size: f32,
}

/// Graphics side work for one frame. `pre_draw` runs before the particle draw
/// and `post_draw` after it, both on the graphics context.
#[derive(Debug)]
pub struct RenderingContext {
    pub pre_draw: CommandList,
    pub post_draw: CommandList,
    pub draw_batches: Vec<DrawBatch>,
}

impl Default for RenderingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderingContext {
    pub fn new() -> Self {
        RenderingContext {
            pre_draw: CommandList::new("Particle pre-draw"),
            post_draw: CommandList::new("Particle post-draw"),
            draw_batches: Vec::new(),
        }
    }

    pub fn begin_frame(&mut self) {
        self.pre_draw.reset();
        self.post_draw.reset();
        self.draw_batches.clear();
    }

    pub fn particle_count(&self) -> u64 {
        self.draw_batches.iter().map(|batch| batch.count as u64).sum()
    }

    pub fn submit_pre_draw(&self, device: &dyn Device) -> Result<Option<SubmissionIndex>, DeviceError> {
        submit_if_any(device, &self.pre_draw)
    }

    pub fn submit_post_draw(&self, device: &dyn Device) -> Result<Option<SubmissionIndex>, DeviceError> {
        submit_if_any(device, &self.post_draw)
    }
}

fn submit_if_any(device: &dyn Device, commands: &CommandList) -> Result<Option<SubmissionIndex>, DeviceError> {
    if commands.is_empty() {
        return Ok(None);
    }
    device.submit(ContextKind::Graphics, commands).map(Some)
}
