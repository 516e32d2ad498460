use crate::device::{BufferDescriptor, BufferHandle, BufferUsage, Device, DeviceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedBuffer {
    pub buffer: BufferHandle,
    pub size: u64,
}

pub fn make_buffer(
    device: &dyn Device,
    label: &str,
    size: u64,
    usage: BufferUsage,
) -> Result<SizedBuffer, DeviceError> {
    let buffer = device.create_buffer(&BufferDescriptor { label, size, usage })?;
    Ok(SizedBuffer { buffer, size })
}

// Room for `len` elements of T. Never zero sized, some backends refuse to bind
// empty buffers.
pub fn make_array_buffer<T>(
    device: &dyn Device,
    label: &str,
    len: u32,
    usage: BufferUsage,
) -> Result<SizedBuffer, DeviceError> {
    let size = (std::mem::size_of::<T>() * len.max(1) as usize) as u64;
    make_buffer(device, label, size, usage)
}
