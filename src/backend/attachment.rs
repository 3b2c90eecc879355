// Framebuffer attachment declarations
//
// Every framebuffer slot is declared once, up front, with its format, usage,
// layouts, load/store ops and exactly one role per subpass. The render pass
// and the framebuffers are both derived from these declarations.

use ash::vk;
use std::str::FromStr;
use thiserror::Error;

use super::query::depth_aspect;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderPassError {
    #[error("attachment {attachment} has no role for subpass {subpass}")]
    MissingSubpassRole { attachment: usize, subpass: usize },
    #[error("unknown attachment role {0:?}")]
    UnknownRole(String),
    #[error("subpass {subpass} has more than one depth attachment ({first} and {second})")]
    MultipleDepthAttachments {
        subpass: usize,
        first: u32,
        second: u32,
    },
    #[error("subpass {subpass} has {resolves} resolve attachments for {colors} color attachments")]
    ResolveCountMismatch {
        subpass: usize,
        colors: usize,
        resolves: usize,
    },
    #[error("a render pass needs at least one subpass")]
    NoSubpasses,
}

/// What an attachment is used as within one subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentRole {
    Color = 1,
    Input = 2,
    Preserve = 3,
    Resolve = 4,
    Depth = 5,
}

impl TryFrom<u32> for AttachmentRole {
    type Error = RenderPassError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Color),
            2 => Ok(Self::Input),
            3 => Ok(Self::Preserve),
            4 => Ok(Self::Resolve),
            5 => Ok(Self::Depth),
            other => Err(RenderPassError::UnknownRole(other.to_string())),
        }
    }
}

impl FromStr for AttachmentRole {
    type Err = RenderPassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "color" => Ok(Self::Color),
            "input" => Ok(Self::Input),
            "preserve" => Ok(Self::Preserve),
            "resolve" => Ok(Self::Resolve),
            "depth" => Ok(Self::Depth),
            _ => Err(RenderPassError::UnknownRole(s.to_string())),
        }
    }
}

/// Layout + role of an attachment in one subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassUsage {
    pub layout: vk::ImageLayout,
    pub role: AttachmentRole,
}

#[derive(Debug, Clone)]
pub struct FrameBufferAttachment {
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    /// Indexed by subpass
    pub subpasses: Vec<SubpassUsage>,
}

impl FrameBufferAttachment {
    pub fn new(format: vk::Format, usage: vk::ImageUsageFlags, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            format,
            usage,
            aspect,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::GENERAL,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            subpasses: Vec::new(),
        }
    }

    /// Depth buffer cleared every frame, used as depth in every subpass
    pub fn depth(format: vk::Format, subpass_count: usize) -> Self {
        let mut attachment = Self::new(
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(format),
        )
        .layouts(
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .ops(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::DONT_CARE);

        if attachment.aspect.contains(vk::ImageAspectFlags::STENCIL) {
            attachment = attachment
                .stencil_ops(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::DONT_CARE);
        }

        for _ in 0..subpass_count {
            attachment = attachment.subpass(
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                AttachmentRole::Depth,
            );
        }
        attachment
    }

    pub fn layouts(mut self, initial: vk::ImageLayout, final_layout: vk::ImageLayout) -> Self {
        self.initial_layout = initial;
        self.final_layout = final_layout;
        self
    }

    pub fn ops(mut self, load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> Self {
        self.load_op = load;
        self.store_op = store;
        self
    }

    pub fn stencil_ops(mut self, load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> Self {
        self.stencil_load_op = load;
        self.stencil_store_op = store;
        self
    }

    /// Appends the usage for the next subpass index
    pub fn subpass(mut self, layout: vk::ImageLayout, role: AttachmentRole) -> Self {
        self.subpasses.push(SubpassUsage { layout, role });
        self
    }

    pub fn usage_in(&self, subpass: usize) -> Option<SubpassUsage> {
        self.subpasses.get(subpass).copied()
    }

    pub fn is_depth(&self) -> bool {
        self.usage
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    pub fn description(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }

    /// Clear value for the first subpass: far depth for depth slots, the
    /// given color otherwise
    pub fn clear_value(&self, color: [f32; 4]) -> vk::ClearValue {
        match self.usage_in(0).map(|usage| usage.role) {
            Some(AttachmentRole::Depth) => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
            _ => vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_roles_parse() {
        assert_eq!(AttachmentRole::try_from(1u32), Ok(AttachmentRole::Color));
        assert_eq!(AttachmentRole::try_from(5u32), Ok(AttachmentRole::Depth));
        assert_eq!(
            AttachmentRole::try_from(0u32),
            Err(RenderPassError::UnknownRole("0".to_string()))
        );
        assert!(AttachmentRole::try_from(6u32).is_err());
    }

    #[test]
    fn named_roles_parse_case_insensitively() {
        assert_eq!("Resolve".parse::<AttachmentRole>(), Ok(AttachmentRole::Resolve));
        assert_eq!("preserve".parse::<AttachmentRole>(), Ok(AttachmentRole::Preserve));
        assert!("stencil".parse::<AttachmentRole>().is_err());
    }

    #[test]
    fn depth_preset_uses_depth_role_everywhere() {
        let depth = FrameBufferAttachment::depth(vk::Format::D32_SFLOAT, 2);

        assert!(depth.is_depth());
        assert_eq!(depth.subpasses.len(), 2);
        assert!(depth
            .subpasses
            .iter()
            .all(|usage| usage.role == AttachmentRole::Depth));
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn description_mirrors_declaration() {
        let attachment = FrameBufferAttachment::new(
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
        )
        .layouts(vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR)
        .ops(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE)
        .stencil_ops(vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::STORE);

        let description = attachment.description();

        assert_eq!(description.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(description.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(description.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(description.stencil_load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(description.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(!attachment.is_depth());
    }

    #[test]
    fn stencil_is_cleared_only_for_stencil_formats() {
        let packed = FrameBufferAttachment::depth(vk::Format::D24_UNORM_S8_UINT, 1);
        assert_eq!(packed.stencil_load_op, vk::AttachmentLoadOp::CLEAR);

        let plain = FrameBufferAttachment::depth(vk::Format::D32_SFLOAT, 1);
        assert_eq!(plain.stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
    }

    #[test]
    fn depth_clear_value_is_far_plane() {
        let depth = FrameBufferAttachment::depth(vk::Format::D32_SFLOAT, 1);
        let value = depth.clear_value([0.1, 0.2, 0.3, 1.0]);

        // Safety: depth attachments produce the depth_stencil variant
        let depth_value = unsafe { value.depth_stencil };
        assert_eq!(depth_value.depth, 1.0);
    }
}
