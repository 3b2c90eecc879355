// Render pass assembly
//
// Walks every attachment declaration (attachment-major, subpass-minor) and
// sorts it into the color/input/preserve/resolve/depth lists of each subpass.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::attachment::{AttachmentRole, FrameBufferAttachment, RenderPassError};
use super::VulkanDevice;

/// Reference lists of one subpass
#[derive(Debug, Default, Clone)]
pub struct SubpassAttachments {
    pub color: Vec<vk::AttachmentReference>,
    pub input: Vec<vk::AttachmentReference>,
    pub preserve: Vec<u32>,
    pub resolve: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

#[derive(Debug, Clone)]
pub struct RenderPassLayout {
    pub descriptions: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassAttachments>,
    /// Any attachment is a depth-stencil attachment
    pub depth_enabled: bool,
}

pub fn classify_attachments(
    attachments: &[FrameBufferAttachment],
    subpass_count: usize,
) -> Result<RenderPassLayout, RenderPassError> {
    if subpass_count == 0 {
        return Err(RenderPassError::NoSubpasses);
    }

    let mut subpasses = vec![SubpassAttachments::default(); subpass_count];

    for (index, attachment) in attachments.iter().enumerate() {
        let attachment_index = index as u32;

        for (subpass_index, subpass) in subpasses.iter_mut().enumerate() {
            let usage = attachment
                .usage_in(subpass_index)
                .ok_or(RenderPassError::MissingSubpassRole {
                    attachment: index,
                    subpass: subpass_index,
                })?;

            let reference = vk::AttachmentReference {
                attachment: attachment_index,
                layout: usage.layout,
            };

            match usage.role {
                AttachmentRole::Color => subpass.color.push(reference),
                AttachmentRole::Input => subpass.input.push(reference),
                AttachmentRole::Preserve => subpass.preserve.push(attachment_index),
                AttachmentRole::Resolve => subpass.resolve.push(reference),
                AttachmentRole::Depth => {
                    if let Some(existing) = subpass.depth {
                        return Err(RenderPassError::MultipleDepthAttachments {
                            subpass: subpass_index,
                            first: existing.attachment,
                            second: attachment_index,
                        });
                    }
                    subpass.depth = Some(reference);
                }
            }
        }
    }

    for (subpass_index, subpass) in subpasses.iter().enumerate() {
        if !subpass.resolve.is_empty() && subpass.resolve.len() != subpass.color.len() {
            return Err(RenderPassError::ResolveCountMismatch {
                subpass: subpass_index,
                colors: subpass.color.len(),
                resolves: subpass.resolve.len(),
            });
        }
    }

    Ok(RenderPassLayout {
        descriptions: attachments.iter().map(|a| a.description()).collect(),
        subpasses,
        depth_enabled: attachments.iter().any(|a| a.is_depth()),
    })
}

pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub layout: RenderPassLayout,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    /// One subpass per bind point
    pub fn new(
        device: Arc<VulkanDevice>,
        attachments: &[FrameBufferAttachment],
        bind_points: &[vk::PipelineBindPoint],
    ) -> Result<Self> {
        let layout = classify_attachments(attachments, bind_points.len())
            .context("Invalid framebuffer attachment configuration")?;

        let subpasses: Vec<vk::SubpassDescription> = layout
            .subpasses
            .iter()
            .zip(bind_points)
            .map(|(subpass, &bind_point)| {
                let mut description = vk::SubpassDescription::builder()
                    .pipeline_bind_point(bind_point)
                    .color_attachments(&subpass.color)
                    .input_attachments(&subpass.input)
                    .preserve_attachments(&subpass.preserve);
                if !subpass.resolve.is_empty() {
                    description = description.resolve_attachments(&subpass.resolve);
                }
                if let Some(depth) = subpass.depth.as_ref() {
                    description = description.depth_stencil_attachment(depth);
                }
                description.build()
            })
            .collect();

        let mut dst_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if layout.depth_enabled {
            dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(dst_access)
            .build();
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&layout.descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        log::info!(
            "Created render pass: {} attachments, {} subpasses, depth {}",
            attachments.len(),
            subpasses.len(),
            if layout.depth_enabled { "on" } else { "off" }
        );

        Ok(Self {
            handle,
            layout,
            device,
        })
    }

    pub fn color_count(&self, subpass: usize) -> usize {
        self.layout
            .subpasses
            .get(subpass)
            .map_or(0, |subpass| subpass.color.len())
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}
