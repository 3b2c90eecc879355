// Framebuffers
//
// One framebuffer per swapchain image. Slot 0 of every framebuffer is the
// swapchain image itself; every other declared attachment gets its own image
// in device local memory, per frame.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::allocator::Allocator;
use super::attachment::FrameBufferAttachment;
use super::command::{CommandBuffer, QueueKind};
use super::memory::MemoryType;
use super::render_pass::RenderPass;
use super::texture::{LayoutTransition, Texture};
use super::VulkanDevice;

/// Slot in every framebuffer holding the presented image
pub const SWAPCHAIN_SLOT: usize = 0;

/// Images and views of every framebuffer, indexed `[frame][slot]`
#[derive(Debug, Default)]
pub struct AttachmentImages {
    pub images: Vec<Vec<Texture>>,
    pub views: Vec<Vec<vk::ImageView>>,
}

impl AttachmentImages {
    /// Wraps the swapchain images and creates the rest. Running out of device
    /// local memory is an error.
    pub fn create(
        allocator: &mut dyn Allocator,
        attachments: &[FrameBufferAttachment],
        swapchain_images: Vec<Texture>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        anyhow::ensure!(!attachments.is_empty(), "No framebuffer attachments declared");

        let mut created = Self::default();
        if let Err(e) = created.fill(allocator, attachments, swapchain_images, extent) {
            created.release(allocator);
            return Err(e);
        }

        log::info!(
            "Created {} framebuffer image sets of {} attachments",
            created.images.len(),
            attachments.len()
        );
        Ok(created)
    }

    fn fill(
        &mut self,
        allocator: &mut dyn Allocator,
        attachments: &[FrameBufferAttachment],
        swapchain_images: Vec<Texture>,
        extent: vk::Extent2D,
    ) -> Result<()> {
        for (frame, swapchain_image) in swapchain_images.into_iter().enumerate() {
            self.images.push(vec![swapchain_image]);
            self.views.push(Vec::with_capacity(attachments.len()));

            for (slot, attachment) in attachments.iter().enumerate().skip(1) {
                let mut texture =
                    allocator.create_image(attachment.format, extent, attachment.usage)?;
                if !allocator.allocate_texture(&mut texture, MemoryType::Local)? {
                    allocator.free_texture(texture);
                    anyhow::bail!(
                        "Out of device local memory for framebuffer {} attachment {} ({}x{} {:?})",
                        frame,
                        slot,
                        extent.width,
                        extent.height,
                        attachment.format
                    );
                }
                self.images[frame].push(texture);
            }

            for (texture, attachment) in self.images[frame].iter().zip(attachments) {
                let view = allocator.create_image_view(texture, attachment.aspect)?;
                self.views[frame].push(view);
            }
        }
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.images.len()
    }

    /// UNDEFINED -> declared initial layout for every image that needs one,
    /// keyed by (frame, slot)
    pub fn initial_transitions(
        &self,
        attachments: &[FrameBufferAttachment],
    ) -> Vec<((usize, usize), LayoutTransition)> {
        self.images
            .iter()
            .enumerate()
            .flat_map(|(frame, images)| {
                images
                    .iter()
                    .zip(attachments)
                    .enumerate()
                    .filter(|(_, (texture, attachment))| {
                        attachment.initial_layout != vk::ImageLayout::UNDEFINED
                            && texture.layout() != attachment.initial_layout
                    })
                    .map(move |(slot, (texture, attachment))| {
                        let transition = texture.propose_transition(
                            attachment.aspect,
                            attachment.initial_layout,
                            vk::AccessFlags::empty(),
                            vk::AccessFlags::empty(),
                        );
                        ((frame, slot), transition)
                    })
            })
            .collect()
    }

    /// Records transitions that have been submitted and completed
    pub fn commit(&mut self, transitions: &[((usize, usize), LayoutTransition)]) {
        for ((frame, slot), transition) in transitions {
            if let Some(texture) = self.images.get_mut(*frame).and_then(|f| f.get_mut(*slot)) {
                texture.commit_transition(transition);
            }
        }
    }

    /// Destroys every view and every image except the swapchain's
    pub fn release(&mut self, allocator: &mut dyn Allocator) {
        for view in self.views.drain(..).flatten() {
            allocator.destroy_image_view(view);
        }
        for frame in self.images.drain(..) {
            for texture in frame.into_iter().skip(SWAPCHAIN_SLOT + 1) {
                allocator.free_texture(texture);
            }
        }
    }
}

pub struct FrameBuffers {
    pub framebuffers: Vec<vk::Framebuffer>,
    pub attachments: AttachmentImages,
    device: Arc<VulkanDevice>,
}

impl FrameBuffers {
    pub fn new(
        device: Arc<VulkanDevice>,
        allocator: &mut dyn Allocator,
        render_pass: &RenderPass,
        attachments: &[FrameBufferAttachment],
        swapchain_images: Vec<Texture>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let images = AttachmentImages::create(allocator, attachments, swapchain_images, extent)?;
        let mut framebuffers = Self {
            framebuffers: Vec::with_capacity(images.frame_count()),
            attachments: images,
            device,
        };

        if let Err(e) = framebuffers.build(render_pass, attachments, extent) {
            framebuffers.destroy(allocator);
            return Err(e);
        }

        Ok(framebuffers)
    }

    fn build(
        &mut self,
        render_pass: &RenderPass,
        attachments: &[FrameBufferAttachment],
        extent: vk::Extent2D,
    ) -> Result<()> {
        for views in &self.attachments.views {
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.handle)
                .attachments(views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")?;
            self.framebuffers.push(framebuffer);
        }

        // Every image of every frame moved to its initial layout in one barrier
        let transitions = self.attachments.initial_transitions(attachments);
        if transitions.is_empty() {
            return Ok(());
        }
        let barriers: Vec<vk::ImageMemoryBarrier> =
            transitions.iter().map(|(_, transition)| transition.barrier).collect();

        let mut cmd = CommandBuffer::new(self.device.clone(), QueueKind::Graphics)?;
        cmd.begin(None)?;
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd.buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }
        cmd.end(false)?;
        cmd.fence_wait()?;

        self.attachments.commit(&transitions);
        log::debug!("Moved {} framebuffer images to their initial layouts", barriers.len());
        Ok(())
    }

    pub fn get(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    pub fn destroy(&mut self, allocator: &mut dyn Allocator) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
        self.attachments.release(allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::fake::{Call, FakeAllocator};
    use crate::backend::attachment::AttachmentRole;
    use ash::vk::Handle;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 16,
        height: 8,
    };

    fn swapchain_images(count: u64) -> Vec<Texture> {
        (0..count)
            .map(|i| Texture::new(vk::Image::from_raw(1000 + i), vk::Format::B8G8R8A8_SRGB, EXTENT))
            .collect()
    }

    fn declarations() -> Vec<FrameBufferAttachment> {
        vec![
            FrameBufferAttachment::new(
                vk::Format::B8G8R8A8_SRGB,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
            )
            .layouts(vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::PRESENT_SRC_KHR)
            .subpass(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, AttachmentRole::Color),
            FrameBufferAttachment::depth(vk::Format::D32_SFLOAT, 1),
        ]
    }

    #[test]
    fn swapchain_slot_is_never_allocated() {
        let mut allocator = FakeAllocator::new(0, 1 << 20);

        let images =
            AttachmentImages::create(&mut allocator, &declarations(), swapchain_images(3), EXTENT)
                .unwrap();

        assert_eq!(images.frame_count(), 3);
        assert_eq!(images.images[1][SWAPCHAIN_SLOT].image, vk::Image::from_raw(1001));
        assert!(images.images[1][SWAPCHAIN_SLOT].allocation.is_none());
        assert!(images.images[1][1].allocation.is_some());
        assert_eq!(
            allocator.count(|call| matches!(call, Call::AllocateTexture(_, MemoryType::Local))),
            3
        );
        // one view per attachment per frame
        assert_eq!(images.views.iter().map(Vec::len).sum::<usize>(), 6);
    }

    #[test]
    fn exhausted_local_memory_is_fatal_and_cleans_up() {
        // two 16x8 depth images fit, the third does not
        let mut allocator = FakeAllocator::new(0, 1024);

        let result =
            AttachmentImages::create(&mut allocator, &declarations(), swapchain_images(3), EXTENT);

        assert!(result.is_err());
        assert!(allocator.local.is_empty());
        assert_eq!(allocator.count(|call| matches!(call, Call::FreeTexture(_))), 3);
        assert_eq!(allocator.count(|call| matches!(call, Call::DestroyImageView(_))), 4);
    }

    #[test]
    fn every_image_gets_its_initial_layout() {
        let mut allocator = FakeAllocator::new(0, 1 << 20);
        let attachments = declarations();
        let mut images =
            AttachmentImages::create(&mut allocator, &attachments, swapchain_images(2), EXTENT)
                .unwrap();

        let transitions = images.initial_transitions(&attachments);

        assert_eq!(transitions.len(), 4);
        let ((frame, slot), depth) = transitions[1];
        assert_eq!((frame, slot), (0, 1));
        assert_eq!(depth.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(depth.new_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(depth.barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);

        // proposing alone leaves the images untouched
        assert_eq!(images.images[0][1].layout(), vk::ImageLayout::UNDEFINED);

        images.commit(&transitions);
        assert_eq!(images.images[0][0].layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            images.images[1][1].layout(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert!(images.initial_transitions(&attachments).is_empty());
    }

    #[test]
    fn undefined_initial_layout_needs_no_barrier() {
        let mut allocator = FakeAllocator::new(0, 1 << 20);
        let attachments = vec![FrameBufferAttachment::new(
            vk::Format::B8G8R8A8_SRGB,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
        )
        .subpass(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, AttachmentRole::Color)];
        let images =
            AttachmentImages::create(&mut allocator, &attachments, swapchain_images(2), EXTENT)
                .unwrap();

        assert!(images.initial_transitions(&attachments).is_empty());
    }

    #[test]
    fn release_keeps_swapchain_images() {
        let mut allocator = FakeAllocator::new(0, 1 << 20);
        let mut images =
            AttachmentImages::create(&mut allocator, &declarations(), swapchain_images(2), EXTENT)
                .unwrap();

        images.release(&mut allocator);

        assert_eq!(allocator.count(|call| matches!(call, Call::FreeTexture(_))), 2);
        assert!(!allocator
            .calls
            .contains(&Call::FreeTexture(vk::Image::from_raw(1000))));
        assert!(allocator.local.is_empty());
        assert_eq!(images.frame_count(), 0);
    }
}
