// Renderer
//
// Owns the device-level objects (surface, swapchain, memory, render pass,
// framebuffers, shader resources) and hands out what the frame loop needs.
//
// Field order is drop order: everything that lives in the memory blocks is
// released in `Drop` before the allocator goes, and the device goes last.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::asset::{DecodedImage, TextureCache, TextureId};
use crate::backend::allocator::{Allocator, GpuAllocator};
use crate::backend::attachment::FrameBufferAttachment;
use crate::backend::buffer::Buffer;
use crate::backend::command::{CommandBuffer, QueueKind, RecordingState};
use crate::backend::descriptors::{create_sampler, ShaderResources, MAX_TEXTURES};
use crate::backend::framebuffer::FrameBuffers;
use crate::backend::memory::MemoryType;
use crate::backend::pipeline::Pipeline;
use crate::backend::query::depth_format;
use crate::backend::render_pass::RenderPass;
use crate::backend::shader::Material;
use crate::backend::surface::Surface;
use crate::backend::sync::AcquireFence;
use crate::backend::{Swapchain, VulkanDevice};
use crate::camera::CameraUniform;
use crate::config::Config;
use crate::mesh::{GltfImporter, Mesh, UpAxis, UvOrigin};

/// Texture slot every element of the texture array points at until a real
/// texture takes it over
pub const FALLBACK_TEXTURE: TextureId = 0;

pub struct Renderer {
    acquire: AcquireFence,
    shader_resources: ShaderResources,
    sampler: vk::Sampler,
    textures: TextureCache,
    camera_buffer: Option<Buffer>,
    framebuffers: FrameBuffers,
    render_pass: RenderPass,
    swapchain: Swapchain,
    allocator: GpuAllocator,
    _surface: Surface,
    device: Arc<VulkanDevice>,

    clear_values: Vec<vk::ClearValue>,
    /// Swapchain image acquired by the last `begin_render`
    image_index: u32,
}

impl Renderer {
    pub fn new(config: &Config, display: RawDisplayHandle, window: RawWindowHandle) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // Device, surface, memory
        // ─────────────────────────────────────────────────────────────────────
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, enable_validation, display)?;

        let surface = Surface::new(device.clone(), display, window)?;
        let graphics_family = device.queue_families.graphics.family;
        anyhow::ensure!(
            surface.supports_family(&device, graphics_family)?,
            "Graphics queue family {} cannot present to this window",
            graphics_family
        );

        let mut allocator = GpuAllocator::new(device.clone(), &config.memory)?;

        // ─────────────────────────────────────────────────────────────────────
        // Swapchain, attachments, render pass, framebuffers
        // ─────────────────────────────────────────────────────────────────────
        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            config.window.width,
            config.window.height,
            config.get_present_mode(),
        )?;

        let mut attachments = vec![swapchain.attachment(1)];
        if config.graphics.depth {
            attachments.push(FrameBufferAttachment::depth(depth_format(&device)?, 1));
        }

        let render_pass = RenderPass::new(
            device.clone(),
            &attachments,
            &[vk::PipelineBindPoint::GRAPHICS],
        )?;

        let framebuffers = FrameBuffers::new(
            device.clone(),
            &mut allocator,
            &render_pass,
            &attachments,
            swapchain.textures(),
            swapchain.extent,
        )?;

        let clear_values = attachments
            .iter()
            .map(|attachment| attachment.clear_value(config.graphics.clear_color))
            .collect();

        let mut renderer = Self {
            acquire: AcquireFence::new(device.clone())?,
            shader_resources: ShaderResources::new(device.clone())?,
            sampler: create_sampler(&device)?,
            textures: TextureCache::new(MAX_TEXTURES as usize),
            camera_buffer: None,
            framebuffers,
            render_pass,
            swapchain,
            allocator,
            _surface: surface,
            device,
            clear_values,
            image_index: 0,
        };

        // ─────────────────────────────────────────────────────────────────────
        // Shader resources: camera block and a white fallback texture
        // ─────────────────────────────────────────────────────────────────────
        renderer.create_camera_buffer()?;
        renderer.create_fallback_texture()?;

        log::info!("Vulkan initialization complete!");
        Ok(renderer)
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn aspect(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    fn create_camera_buffer(&mut self) -> Result<()> {
        let size = std::mem::size_of::<CameraUniform>() as vk::DeviceSize;
        let mut buffer = self
            .allocator
            .create_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER)?;

        if !self.allocator.allocate_buffer(&mut buffer, MemoryType::Host)? {
            self.allocator.free_buffer(buffer);
            anyhow::bail!("Out of host memory for the camera uniform buffer");
        }

        self.shader_resources.write_uniform(&buffer);
        self.camera_buffer = Some(buffer);
        Ok(())
    }

    fn create_fallback_texture(&mut self) -> Result<()> {
        let texture = self.allocator.create_texture_from_pixels(
            &DecodedImage::solid([255, 255, 255, 255]),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        let view = match self
            .allocator
            .create_image_view(&texture, vk::ImageAspectFlags::COLOR)
        {
            Ok(view) => view,
            Err(e) => {
                self.allocator.free_texture(texture);
                return Err(e);
            }
        };

        let id = self
            .textures
            .insert(PathBuf::from("<white>"), texture, view)?;
        debug_assert_eq!(id, FALLBACK_TEXTURE);

        // Every element must be valid before the first draw
        for element in 0..MAX_TEXTURES {
            self.shader_resources
                .write_texture(element, view, self.sampler);
        }
        Ok(())
    }

    fn fallback_view(&self) -> Result<vk::ImageView> {
        self.textures
            .get(FALLBACK_TEXTURE)
            .map(|cached| cached.view)
            .context("Fallback texture missing")
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    pub fn create_material(&self, vertex: &Path, fragment: &Path) -> Result<Material> {
        // { uint textureIndex; uint shading; }
        Ok(Material::load(self.device.clone(), vertex, fragment)?.with_push_constant(
            vk::ShaderStageFlags::FRAGMENT,
            0,
            2 * std::mem::size_of::<u32>() as u32,
        ))
    }

    pub fn create_pipeline(&self, material: &Material) -> Result<Pipeline> {
        Pipeline::new(
            self.device.clone(),
            material,
            self.shader_resources.layout,
            &self.render_pass,
            0,
            self.swapchain.extent,
        )
    }

    /// Loads a mesh and its albedo texture. A texture that fails to load is
    /// reported and the mesh falls back to plain white.
    pub fn create_mesh(
        &mut self,
        path: &Path,
        up_axis: Option<UpAxis>,
        uv_origin: Option<UvOrigin>,
    ) -> Result<Mesh> {
        let mut mesh = Mesh::load(&mut self.allocator, &GltfImporter, path, up_axis, uv_origin)?;

        if let Some(albedo) = mesh.albedo.clone() {
            match self.textures.request(&mut self.allocator, &albedo) {
                Ok(id) => {
                    if let Some(cached) = self.textures.get(id) {
                        self.shader_resources
                            .write_texture(id, cached.view, self.sampler);
                    }
                    mesh.texture = id;
                }
                Err(e) => {
                    log::warn!("Mesh {:?} drawn untextured: {:#}", path, e);
                    mesh.texture = FALLBACK_TEXTURE;
                }
            }
        }

        Ok(mesh)
    }

    pub fn destroy_mesh(&mut self, mesh: Mesh) -> Result<()> {
        self.device.wait_idle()?;
        log::debug!("Destroying mesh {}", mesh.name);
        mesh.destroy(&mut self.allocator);
        Ok(())
    }

    /// Frees a cached texture; its slot shows the fallback until reused
    pub fn unload_texture(&mut self, path: &Path) -> Result<()> {
        self.device.wait_idle()?;

        match self.textures.unload(&mut self.allocator, path) {
            Some(id) => {
                let view = self.fallback_view()?;
                self.shader_resources.write_texture(id, view, self.sampler);
                log::info!("Unloaded texture {:?} from slot {}", path, id);
            }
            None => log::warn!("Texture {:?} is not loaded", path),
        }
        Ok(())
    }

    pub fn update_camera(&mut self, uniform: &CameraUniform) -> Result<()> {
        let buffer = self
            .camera_buffer
            .as_ref()
            .context("Camera buffer missing")?;
        self.allocator
            .write_buffer(buffer, 0, bytemuck::bytes_of(uniform))
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    pub fn command_buffer(&self, kind: QueueKind) -> Result<CommandBuffer> {
        CommandBuffer::new(self.device.clone(), kind)
    }

    /// Acquires the next swapchain image and begins the render pass on it
    pub fn begin_render(&mut self, cmd: &CommandBuffer) -> Result<()> {
        anyhow::ensure!(
            cmd.state() == RecordingState::Recording,
            "Render pass needs a recording command buffer, got {:?}",
            cmd.state()
        );
        self.image_index = self.acquire.acquire(&self.swapchain)?;

        let framebuffer = self
            .framebuffers
            .get(self.image_index)
            .with_context(|| format!("No framebuffer for swapchain image {}", self.image_index))?;

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.handle)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent,
            })
            .clear_values(&self.clear_values);

        unsafe {
            self.device.device.cmd_begin_render_pass(
                cmd.buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
        }
        Ok(())
    }

    pub fn bind_shader_resources(&self, cmd: &CommandBuffer, pipeline: &Pipeline) {
        self.shader_resources.bind(cmd.buffer, pipeline.layout);
    }

    pub fn end_render(&self, cmd: &CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(cmd.buffer) };
    }

    /// Presents the acquired image once `cmd` has signalled its semaphore
    pub fn present(&self, cmd: &CommandBuffer) -> Result<()> {
        let suboptimal = self.swapchain.present(
            self.device.queue(QueueKind::Graphics),
            self.image_index,
            &[cmd.semaphore],
        )?;
        if suboptimal {
            log::debug!("Presented to a suboptimal swapchain");
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        let _ = self.device.wait_idle();

        self.textures.clear(&mut self.allocator);
        self.framebuffers.destroy(&mut self.allocator);
        if let Some(buffer) = self.camera_buffer.take() {
            self.allocator.free_buffer(buffer);
        }
        unsafe { self.device.device.destroy_sampler(self.sampler, None) };

        // Remaining fields drop in declaration order
    }
}
