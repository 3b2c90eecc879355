// Allocator capability
//
// Everything that creates GPU resources (framebuffers, meshes, the texture
// cache) goes through the `Allocator` trait. `GpuAllocator` backs it with the
// two memory blocks; tests use the recording fake at the bottom of this file.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::buffer::{self, copy_buffer_to_buffer, copy_buffer_to_image, Buffer};
use super::command::{CommandBuffer, QueueKind};
use super::memory::{MemoryBlock, MemoryType};
use super::texture::{self, Texture};
use super::VulkanDevice;
use crate::asset::{decode_image, DecodedImage};
use crate::config::MemoryConfig;

/// Format used for every sampled color texture
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub trait Allocator {
    /// Decodes an image file, uploads it to device local memory and leaves it
    /// in `layout`
    fn load_image(
        &mut self,
        path: &Path,
        layout: vk::ImageLayout,
        usage: vk::ImageUsageFlags,
    ) -> Result<Texture>;

    /// Creates an unbound image
    fn create_image(
        &mut self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Texture>;

    fn create_image_view(
        &mut self,
        texture: &Texture,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;

    /// Creates an unbound buffer
    fn create_buffer(&mut self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Buffer>;

    /// `Ok(false)` when the memory block is full
    fn allocate_buffer(&mut self, buffer: &mut Buffer, memory: MemoryType) -> Result<bool>;

    /// `Ok(false)` when the memory block is full
    fn allocate_texture(&mut self, texture: &mut Texture, memory: MemoryType) -> Result<bool>;

    /// Copies `bytes` into a host visible buffer at `offset`
    fn write_buffer(&mut self, buffer: &Buffer, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()>;

    /// Copies `bytes` into a device local buffer through the staging buffer
    fn upload_buffer(&mut self, buffer: &Buffer, bytes: &[u8]) -> Result<()>;

    fn free_buffer(&mut self, buffer: Buffer);

    fn free_texture(&mut self, texture: Texture);

    fn destroy_image_view(&mut self, view: vk::ImageView);
}

pub struct GpuAllocator {
    host: MemoryBlock,
    local: MemoryBlock,
    staging: Option<Buffer>,
    device: Arc<VulkanDevice>,
}

impl GpuAllocator {
    pub fn new(device: Arc<VulkanDevice>, config: &MemoryConfig) -> Result<Self> {
        let host = MemoryBlock::new(
            &device,
            device.host_memory_index,
            config.host_block_size,
            MemoryType::Host,
        )?;
        let (host, local) = chain_or_release(
            host,
            |host| {
                host.map(&device)?;
                MemoryBlock::new(
                    &device,
                    device.local_memory_index,
                    config.local_block_size,
                    MemoryType::Local,
                )
            },
            |mut host| host.destroy(&device),
        )?;

        let mut allocator = Self {
            host,
            local,
            staging: None,
            device,
        };

        let mut staging =
            allocator.create_buffer(config.staging_size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        if !allocator.allocate_buffer(&mut staging, MemoryType::Host)? {
            allocator.free_buffer(staging);
            anyhow::bail!(
                "Staging buffer of {} bytes does not fit in host memory ({} bytes)",
                config.staging_size,
                config.host_block_size
            );
        }
        allocator.staging = Some(staging);

        Ok(allocator)
    }

    pub fn block(&self, memory: MemoryType) -> &MemoryBlock {
        match memory {
            MemoryType::Host => &self.host,
            MemoryType::Local => &self.local,
        }
    }

    fn block_mut(&mut self, memory: MemoryType) -> &mut MemoryBlock {
        match memory {
            MemoryType::Host => &mut self.host,
            MemoryType::Local => &mut self.local,
        }
    }

    /// Copies `bytes` into the start of the staging buffer
    fn stage(&self, bytes: &[u8]) -> Result<&Buffer> {
        let staging = self.staging.as_ref().context("Staging buffer missing")?;
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= staging.size,
            "Upload of {} bytes exceeds the {} byte staging buffer",
            bytes.len(),
            staging.size
        );

        write_host(&self.host, staging, 0, bytes)?;
        Ok(staging)
    }

    /// Decoded pixels into a sampled, device local texture
    pub fn create_texture_from_pixels(
        &mut self,
        image: &DecodedImage,
        layout: vk::ImageLayout,
        usage: vk::ImageUsageFlags,
    ) -> Result<Texture> {
        let extent = vk::Extent2D {
            width: image.width,
            height: image.height,
        };
        let mut texture = self.create_image(
            TEXTURE_FORMAT,
            extent,
            usage | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        if !self.allocate_texture(&mut texture, MemoryType::Local)? {
            self.free_texture(texture);
            anyhow::bail!(
                "Out of device local memory for a {}x{} texture",
                image.width,
                image.height
            );
        }

        if let Err(e) = self.copy_pixels(&mut texture, &image.pixels, layout) {
            self.free_texture(texture);
            return Err(e);
        }

        Ok(texture)
    }

    /// Transfer queue: UNDEFINED -> TRANSFER_DST, copy, release.
    /// Graphics queue: acquire into `layout`.
    fn copy_pixels(
        &self,
        texture: &mut Texture,
        pixels: &[u8],
        layout: vk::ImageLayout,
    ) -> Result<()> {
        let staging = self.stage(pixels)?;

        let aspect = vk::ImageAspectFlags::COLOR;
        let families = self.device.queue_families;
        let (src_family, dst_family) = (families.transfer.family, families.graphics.family);

        let to_transfer = texture.propose_transition(
            aspect,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );
        let mut transfer = CommandBuffer::new(self.device.clone(), QueueKind::Transfer)?;
        transfer.begin(None)?;
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                transfer.buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer.barrier],
            );
        }
        copy_buffer_to_image(&self.device, transfer.buffer, staging, texture, aspect);

        let mut to_shader = to_transfer.then(
            layout,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        if src_family != dst_family {
            to_shader = to_shader.with_queue_transfer(src_family, dst_family);
            let mut release = to_shader.barrier;
            release.dst_access_mask = vk::AccessFlags::empty();
            unsafe {
                self.device.device.cmd_pipeline_barrier(
                    transfer.buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[release],
                );
            }
        }
        transfer.end(true)?;
        texture.commit_transition(&to_transfer);

        let mut graphics = CommandBuffer::new(self.device.clone(), QueueKind::Graphics)?;
        graphics.begin(Some(transfer.semaphore))?;
        let mut acquire = to_shader.barrier;
        let src_stage = if src_family != dst_family {
            acquire.src_access_mask = vk::AccessFlags::empty();
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            vk::PipelineStageFlags::TRANSFER
        };
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                graphics.buffer,
                src_stage,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[acquire],
            );
        }
        graphics.end(false)?;

        transfer.fence_wait()?;
        graphics.fence_wait()?;
        texture.commit_transition(&to_shader);

        Ok(())
    }

    /// Tears down both blocks, destroying anything still allocated
    fn destroy(&mut self) {
        for memory in [MemoryType::Host, MemoryType::Local] {
            let block = self.block(memory);
            let stats = block.stats();
            log::info!(
                "{:?} memory at shutdown: {} / {} bytes in {} allocations, largest gap {}",
                block.memory_type(),
                stats.used,
                stats.size,
                stats.allocations,
                stats.largest_gap
            );
        }

        // The staging buffer is destroyed with the host block
        self.staging = None;
        self.host.destroy(&self.device);
        self.local.destroy(&self.device);
    }
}

/// Copies into a buffer living in the mapped host block
fn write_host(
    host: &MemoryBlock,
    buffer: &Buffer,
    offset: vk::DeviceSize,
    bytes: &[u8],
) -> Result<()> {
    let allocation = buffer.allocation.context("Buffer has no memory bound")?;
    anyhow::ensure!(
        allocation.memory_type == MemoryType::Host,
        "Buffer lives in {:?} memory and cannot be written from the CPU",
        allocation.memory_type
    );
    anyhow::ensure!(
        offset + bytes.len() as vk::DeviceSize <= buffer.size,
        "Write of {} bytes at offset {} overruns a {} byte buffer",
        bytes.len(),
        offset,
        buffer.size
    );

    let target = host
        .get_memory(allocation.offset + offset)
        .context("Host memory is not mapped")?;

    unsafe {
        target
            .as_ptr()
            .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    Ok(())
}

impl Allocator for GpuAllocator {
    fn load_image(
        &mut self,
        path: &Path,
        layout: vk::ImageLayout,
        usage: vk::ImageUsageFlags,
    ) -> Result<Texture> {
        let image = decode_image(path)?;
        let texture = self
            .create_texture_from_pixels(&image, layout, usage)
            .with_context(|| format!("Failed to upload {:?}", path))?;

        log::info!("Loaded texture {:?} ({}x{})", path, image.width, image.height);
        Ok(texture)
    }

    fn create_image(
        &mut self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Texture> {
        texture::create_image(&self.device, format, extent, usage)
    }

    fn create_image_view(
        &mut self,
        texture: &Texture,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        texture::create_image_view(&self.device, texture, aspect)
    }

    fn create_buffer(&mut self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Buffer> {
        // Uploaded on the transfer queue, read on the graphics queue
        let families = self.device.queue_families.unique_families();
        buffer::create_buffer(&self.device, size, usage, &families)
    }

    fn allocate_buffer(&mut self, buffer: &mut Buffer, memory: MemoryType) -> Result<bool> {
        let device = self.device.clone();
        self.block_mut(memory).allocate_buffer(&device, buffer)
    }

    fn allocate_texture(&mut self, texture: &mut Texture, memory: MemoryType) -> Result<bool> {
        let device = self.device.clone();
        self.block_mut(memory).allocate_texture(&device, texture)
    }

    fn write_buffer(&mut self, buffer: &Buffer, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        write_host(&self.host, buffer, offset, bytes)
    }

    fn upload_buffer(&mut self, buffer: &Buffer, bytes: &[u8]) -> Result<()> {
        let staging = self.stage(bytes)?;

        let mut cmd = CommandBuffer::new(self.device.clone(), QueueKind::Transfer)?;
        cmd.begin(None)?;
        copy_buffer_to_buffer(
            &self.device,
            cmd.buffer,
            staging,
            buffer,
            bytes.len() as vk::DeviceSize,
        );
        cmd.end(false)?;
        cmd.fence_wait()
    }

    fn free_buffer(&mut self, buffer: Buffer) {
        if let Some(allocation) = buffer.allocation {
            self.block_mut(allocation.memory_type).delete(allocation.id);
        }
        unsafe { self.device.device.destroy_buffer(buffer.handle, None) };
    }

    fn free_texture(&mut self, texture: Texture) {
        if let Some(allocation) = texture.allocation {
            self.block_mut(allocation.memory_type).delete(allocation.id);
        }
        unsafe { self.device.device.destroy_image(texture.image, None) };
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(view, None) };
    }
}

/// Runs `next` on `first`. On failure `first` goes to `release` before the
/// error is returned.
fn chain_or_release<A, B>(
    mut first: A,
    next: impl FnOnce(&mut A) -> Result<B>,
    release: impl FnOnce(A),
) -> Result<(A, B)> {
    match next(&mut first) {
        Ok(second) => Ok((first, second)),
        Err(e) => {
            release(first);
            Err(e)
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory allocator: records every call and places resources with a
    //! real `FreeList` so offsets are deterministic.

    use super::*;
    use crate::backend::memory::{Allocation, FreeList, ResourceHandle};
    use ash::vk::Handle;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        LoadImage(PathBuf),
        CreateImage(vk::Format, vk::Extent2D),
        CreateImageView(vk::Image),
        CreateBuffer(vk::DeviceSize),
        AllocateBuffer(vk::Buffer, MemoryType),
        AllocateTexture(vk::Image, MemoryType),
        WriteBuffer(vk::Buffer, vk::DeviceSize, usize),
        UploadBuffer(vk::Buffer, usize),
        FreeBuffer(vk::Buffer),
        FreeTexture(vk::Image),
        DestroyImageView(vk::ImageView),
    }

    pub struct FakeAllocator {
        pub calls: Vec<Call>,
        pub host: FreeList,
        pub local: FreeList,
        /// Paths for which `load_image` fails
        pub missing: Vec<PathBuf>,
        next_handle: u64,
    }

    impl FakeAllocator {
        pub fn new(host_size: vk::DeviceSize, local_size: vk::DeviceSize) -> Self {
            Self {
                calls: Vec::new(),
                host: FreeList::new(host_size),
                local: FreeList::new(local_size),
                missing: Vec::new(),
                next_handle: 1,
            }
        }

        fn handle(&mut self) -> u64 {
            let handle = self.next_handle;
            self.next_handle += 1;
            handle
        }

        fn list(&mut self, memory: MemoryType) -> &mut FreeList {
            match memory {
                MemoryType::Host => &mut self.host,
                MemoryType::Local => &mut self.local,
            }
        }

        fn place(
            &mut self,
            memory: MemoryType,
            size: vk::DeviceSize,
            alignment: vk::DeviceSize,
            owner: ResourceHandle,
        ) -> Option<Allocation> {
            self.list(memory)
                .allocate(size, alignment, owner)
                .map(|header| Allocation {
                    id: header.id,
                    offset: header.start,
                    size: header.size,
                    memory_type: memory,
                })
        }

        pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|call| matches(call)).count()
        }
    }

    impl Allocator for FakeAllocator {
        fn load_image(
            &mut self,
            path: &Path,
            layout: vk::ImageLayout,
            usage: vk::ImageUsageFlags,
        ) -> Result<Texture> {
            self.calls.push(Call::LoadImage(path.to_path_buf()));
            if self.missing.iter().any(|missing| missing == path) {
                anyhow::bail!("Failed to open image {:?}", path);
            }

            let extent = vk::Extent2D {
                width: 2,
                height: 2,
            };
            let mut texture = self.create_image(TEXTURE_FORMAT, extent, usage)?;
            self.allocate_texture(&mut texture, MemoryType::Local)?;
            texture.barrier(
                vk::ImageAspectFlags::COLOR,
                layout,
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_READ,
            );
            Ok(texture)
        }

        fn create_image(
            &mut self,
            format: vk::Format,
            extent: vk::Extent2D,
            _usage: vk::ImageUsageFlags,
        ) -> Result<Texture> {
            self.calls.push(Call::CreateImage(format, extent));
            let image = vk::Image::from_raw(self.handle());
            Ok(Texture::new(image, format, extent))
        }

        fn create_image_view(
            &mut self,
            texture: &Texture,
            _aspect: vk::ImageAspectFlags,
        ) -> Result<vk::ImageView> {
            self.calls.push(Call::CreateImageView(texture.image));
            Ok(vk::ImageView::from_raw(self.handle()))
        }

        fn create_buffer(
            &mut self,
            size: vk::DeviceSize,
            _usage: vk::BufferUsageFlags,
        ) -> Result<Buffer> {
            self.calls.push(Call::CreateBuffer(size));
            Ok(Buffer {
                handle: vk::Buffer::from_raw(self.handle()),
                size,
                allocation: None,
            })
        }

        fn allocate_buffer(&mut self, buffer: &mut Buffer, memory: MemoryType) -> Result<bool> {
            self.calls.push(Call::AllocateBuffer(buffer.handle, memory));
            buffer.allocation =
                self.place(memory, buffer.size, 16, ResourceHandle::Buffer(buffer.handle));
            Ok(buffer.allocation.is_some())
        }

        fn allocate_texture(&mut self, texture: &mut Texture, memory: MemoryType) -> Result<bool> {
            self.calls.push(Call::AllocateTexture(texture.image, memory));
            let size = texture.extent.width as vk::DeviceSize * texture.extent.height as vk::DeviceSize * 4;
            texture.allocation =
                self.place(memory, size, 256, ResourceHandle::Image(texture.image));
            Ok(texture.allocation.is_some())
        }

        fn write_buffer(
            &mut self,
            buffer: &Buffer,
            offset: vk::DeviceSize,
            bytes: &[u8],
        ) -> Result<()> {
            self.calls
                .push(Call::WriteBuffer(buffer.handle, offset, bytes.len()));
            Ok(())
        }

        fn upload_buffer(&mut self, buffer: &Buffer, bytes: &[u8]) -> Result<()> {
            self.calls.push(Call::UploadBuffer(buffer.handle, bytes.len()));
            Ok(())
        }

        fn free_buffer(&mut self, buffer: Buffer) {
            self.calls.push(Call::FreeBuffer(buffer.handle));
            if let Some(allocation) = buffer.allocation {
                self.list(allocation.memory_type).delete(allocation.id);
            }
        }

        fn free_texture(&mut self, texture: Texture) {
            self.calls.push(Call::FreeTexture(texture.image));
            if let Some(allocation) = texture.allocation {
                self.list(allocation.memory_type).delete(allocation.id);
            }
        }

        fn destroy_image_view(&mut self, view: vk::ImageView) {
            self.calls.push(Call::DestroyImageView(view));
        }
    }

    #[test]
    fn fake_places_resources_deterministically() {
        let mut allocator = FakeAllocator::new(1024, 4096);
        let mut a = allocator
            .create_buffer(100, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        let mut b = allocator
            .create_buffer(100, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();

        assert!(allocator.allocate_buffer(&mut a, MemoryType::Local).unwrap());
        assert!(allocator.allocate_buffer(&mut b, MemoryType::Local).unwrap());

        assert_eq!(a.allocation.unwrap().offset, 0);
        assert_eq!(b.allocation.unwrap().offset, 112);

        allocator.free_buffer(a);
        assert_eq!(allocator.local.headers().len(), 1);
    }

    #[test]
    fn fake_reports_exhaustion() {
        let mut allocator = FakeAllocator::new(64, 64);
        let mut buffer = allocator
            .create_buffer(128, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();

        assert!(!allocator.allocate_buffer(&mut buffer, MemoryType::Host).unwrap());
        assert!(buffer.allocation.is_none());
    }

    #[test]
    fn failed_second_step_releases_first_resource() {
        let mut released = Vec::new();
        let result: Result<(u32, u32)> = chain_or_release(
            7,
            |first| {
                *first += 1;
                anyhow::bail!("out of device memory")
            },
            |first| released.push(first),
        );

        assert!(result.is_err());
        assert_eq!(released, vec![8]);
    }

    #[test]
    fn successful_second_step_keeps_both_resources() {
        let mut released = Vec::new();
        let (first, second) =
            chain_or_release(7, |first| Ok(*first * 2), |first: u32| released.push(first)).unwrap();

        assert_eq!((first, second), (7, 14));
        assert!(released.is_empty());
    }
}
