// Image wrapper with layout tracking
//
// A Texture owns one VkImage and remembers which layout it is in. Layout
// changes go through a two-step protocol: `propose_transition` builds the
// barrier without touching the bookkeeping, `commit_transition` records the
// new layout once the barrier has actually been submitted.

use anyhow::{Context, Result};
use ash::vk;

use super::memory::Allocation;
use super::VulkanDevice;

#[derive(Debug)]
pub struct Texture {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    layout: vk::ImageLayout,
    /// `None` for swapchain images and images not bound yet
    pub allocation: Option<Allocation>,
}

/// A layout change that has been built but not necessarily submitted
#[derive(Debug, Clone, Copy)]
pub struct LayoutTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub barrier: vk::ImageMemoryBarrier,
}

impl LayoutTransition {
    /// Turns the barrier into a queue family ownership transfer
    pub fn with_queue_transfer(mut self, src_family: u32, dst_family: u32) -> Self {
        self.barrier.src_queue_family_index = src_family;
        self.barrier.dst_queue_family_index = dst_family;
        self
    }

    /// The next transition on the same image, starting from this one's
    /// target layout. Lets several barriers be recorded before any commit.
    pub fn then(
        &self,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> LayoutTransition {
        let mut barrier = self.barrier;
        barrier.old_layout = self.new_layout;
        barrier.new_layout = new_layout;
        barrier.src_access_mask = src_access;
        barrier.dst_access_mask = dst_access;
        barrier.src_queue_family_index = vk::QUEUE_FAMILY_IGNORED;
        barrier.dst_queue_family_index = vk::QUEUE_FAMILY_IGNORED;

        LayoutTransition {
            image: self.image,
            old_layout: self.new_layout,
            new_layout,
            barrier,
        }
    }
}

impl Texture {
    /// Wraps an existing image whose contents are undefined
    pub fn new(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            image,
            format,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
            allocation: None,
        }
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.extent.width,
            height: self.extent.height,
            depth: 1,
        }
    }

    /// Builds a barrier from the recorded layout to `new_layout`. Does not
    /// change the recorded layout.
    pub fn propose_transition(
        &self,
        aspect: vk::ImageAspectFlags,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> LayoutTransition {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(subresource_range(aspect))
            .build();

        LayoutTransition {
            image: self.image,
            old_layout: self.layout,
            new_layout,
            barrier,
        }
    }

    /// Records that `transition` has been submitted
    pub fn commit_transition(&mut self, transition: &LayoutTransition) {
        if transition.image != self.image {
            log::error!(
                "Transition for {:?} committed on {:?}, ignoring",
                transition.image,
                self.image
            );
            return;
        }

        if transition.old_layout != self.layout {
            log::warn!(
                "Stale transition on {:?}: expected {:?}, image is in {:?}",
                self.image,
                transition.old_layout,
                self.layout
            );
        }

        self.layout = transition.new_layout;
    }

    /// Propose and commit in one step, for barriers that are recorded right away
    pub fn barrier(
        &mut self,
        aspect: vk::ImageAspectFlags,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> vk::ImageMemoryBarrier {
        let transition = self.propose_transition(aspect, new_layout, src_access, dst_access);
        self.commit_transition(&transition);
        transition.barrier
    }
}

pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Creates an unbound 2D image, one mip level, optimal tiling
pub fn create_image(
    device: &VulkanDevice,
    format: vk::Format,
    extent: vk::Extent2D,
    usage: vk::ImageUsageFlags,
) -> Result<Texture> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe {
        device
            .device
            .create_image(&image_info, None)
            .with_context(|| format!("Failed to create {:?} image", format))?
    };

    Ok(Texture::new(image, format, extent))
}

pub fn create_image_view(
    device: &VulkanDevice,
    texture: &Texture,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(texture.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(texture.format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(subresource_range(aspect));

    unsafe {
        device
            .device
            .create_image_view(&view_info, None)
            .context("Failed to create image view")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn texture() -> Texture {
        Texture::new(
            vk::Image::from_raw(7),
            vk::Format::R8G8B8A8_SRGB,
            vk::Extent2D {
                width: 4,
                height: 4,
            },
        )
    }

    #[test]
    fn new_texture_starts_undefined() {
        assert_eq!(texture().layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn proposing_does_not_change_layout() {
        let texture = texture();
        let transition = texture.propose_transition(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );

        assert_eq!(transition.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(transition.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(transition.barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(transition.barrier.image, texture.image);
        assert_eq!(transition.barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(texture.layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn chained_transitions_commit_in_order() {
        let mut texture = texture();
        let to_transfer = texture.propose_transition(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );
        let to_shader = to_transfer
            .with_queue_transfer(2, 0)
            .then(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            );

        assert_eq!(texture.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(to_shader.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_shader.barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_shader.barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(to_shader.barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_shader.barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(to_shader.barrier.subresource_range.level_count, 1);

        texture.commit_transition(&to_transfer);
        assert_eq!(texture.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        texture.commit_transition(&to_shader);
        assert_eq!(texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn committing_applies_new_layout() {
        let mut texture = texture();
        let transition = texture.propose_transition(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_READ,
        );
        texture.commit_transition(&transition);

        assert_eq!(texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn eager_barrier_updates_layout_even_if_never_submitted() {
        let mut texture = texture();
        texture.barrier(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );

        let barrier = texture.barrier(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );

        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn stale_commit_is_still_applied() {
        let mut texture = texture();
        let first = texture.propose_transition(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
        );
        let second = texture.propose_transition(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
        );

        texture.commit_transition(&first);
        texture.commit_transition(&second);

        assert_eq!(texture.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn transition_for_another_image_is_ignored() {
        let mut texture = texture();
        let other = Texture::new(
            vk::Image::from_raw(8),
            vk::Format::R8G8B8A8_SRGB,
            texture.extent,
        );
        let transition = other.propose_transition(
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
        );

        texture.commit_transition(&transition);

        assert_eq!(texture.layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn queue_transfer_sets_families() {
        let texture = texture();
        let transition = texture
            .propose_transition(
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
            )
            .with_queue_transfer(2, 0);

        assert_eq!(transition.barrier.src_queue_family_index, 2);
        assert_eq!(transition.barrier.dst_queue_family_index, 0);
    }

    #[test]
    fn barrier_covers_single_mip_and_layer() {
        let transition = texture().propose_transition(
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
        );
        let range = transition.barrier.subresource_range;

        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}
