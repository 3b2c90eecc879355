// Buffer wrapper and copy helpers
//
// Buffers are created unbound; memory comes from a MemoryBlock through the
// allocator. Copies are recorded into a caller-provided command buffer.

use anyhow::{Context, Result};
use ash::vk;

use super::memory::Allocation;
use super::texture::{subresource_range, Texture};
use super::VulkanDevice;

#[derive(Debug)]
pub struct Buffer {
    pub handle: vk::Buffer,
    /// Requested size, the allocation may be larger
    pub size: vk::DeviceSize,
    pub allocation: Option<Allocation>,
}

/// Creates an unbound buffer. With more than one queue family the buffer is
/// shared concurrently between them.
pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    queue_families: &[u32],
) -> Result<Buffer> {
    let mut buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    if queue_families.len() > 1 {
        buffer_info = buffer_info
            .sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(queue_families);
    }

    let handle = unsafe {
        device
            .device
            .create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?
    };

    Ok(Buffer {
        handle,
        size,
        allocation: None,
    })
}

/// Records a copy of `size` bytes from the start of `src` to the start of `dst`
pub fn copy_buffer_to_buffer(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    src: &Buffer,
    dst: &Buffer,
    size: vk::DeviceSize,
) {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };

    unsafe {
        device
            .device
            .cmd_copy_buffer(cmd, src.handle, dst.handle, &[region]);
    }
}

/// Records a copy of tightly packed pixels into the whole of `dst`. The image
/// has to be in TRANSFER_DST_OPTIMAL by the time the copy executes.
pub fn copy_buffer_to_image(
    device: &VulkanDevice,
    cmd: vk::CommandBuffer,
    src: &Buffer,
    dst: &Texture,
    aspect: vk::ImageAspectFlags,
) {
    let range = subresource_range(aspect);
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: range.base_mip_level,
            base_array_layer: range.base_array_layer,
            layer_count: range.layer_count,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(dst.extent_3d())
        .build();

    unsafe {
        device.device.cmd_copy_buffer_to_image(
            cmd,
            src.handle,
            dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}
