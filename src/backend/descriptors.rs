// Shader resources
//
// One descriptor set shared by every pipeline:
//   binding 0: camera uniform block
//   binding 1: sampler2D textures[MAX_TEXTURES]

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::VulkanDevice;

pub const CAMERA_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;
/// Must match MAX_TEXTURES in mesh.frag
pub const MAX_TEXTURES: u32 = 8;

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(CAMERA_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_TEXTURES)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

/// One pool size per binding, sized by its descriptor count
pub fn pool_sizes(bindings: &[vk::DescriptorSetLayoutBinding]) -> Vec<vk::DescriptorPoolSize> {
    bindings
        .iter()
        .map(|binding| vk::DescriptorPoolSize {
            ty: binding.descriptor_type,
            descriptor_count: binding.descriptor_count,
        })
        .collect()
}

pub struct ShaderResources {
    pub pool: vk::DescriptorPool,
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
    device: Arc<VulkanDevice>,
}

impl ShaderResources {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let bindings = layout_bindings();
        let sizes = pool_sizes(&bindings);

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1);
        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = match unsafe { device.device.create_descriptor_set_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_pool(pool, None) };
                return Err(e).context("Failed to create descriptor set layout");
            }
        };

        // From here on Drop cleans up
        let mut resources = Self {
            pool,
            layout,
            set: vk::DescriptorSet::null(),
            device,
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        resources.set = unsafe { resources.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?[0];

        Ok(resources)
    }

    pub fn write_uniform(&self, buffer: &Buffer) {
        let info = [vk::DescriptorBufferInfo {
            buffer: buffer.handle,
            offset: 0,
            range: buffer.size,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(CAMERA_BINDING)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    /// Points one element of the texture array at `view`
    pub fn write_texture(&self, element: u32, view: vk::ImageView, sampler: vk::Sampler) {
        debug_assert!(element < MAX_TEXTURES);

        let info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(TEXTURE_BINDING)
            .dst_array_element(element)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn bind(&self, cmd: vk::CommandBuffer, pipeline_layout: vk::PipelineLayout) {
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[self.set],
                &[],
            );
        }
    }
}

impl Drop for ShaderResources {
    fn drop(&mut self) {
        // The set is freed with the pool
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None);
            self.device.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Linear, repeating sampler used for every texture
pub fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

    unsafe { device.device.create_sampler(&info, None) }.context("Failed to create sampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_covers_every_binding() {
        let bindings = layout_bindings();
        let sizes = pool_sizes(&bindings);

        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 1);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, MAX_TEXTURES);
    }

    #[test]
    fn camera_is_visible_to_both_stages() {
        let camera = layout_bindings()[CAMERA_BINDING as usize];
        assert!(camera
            .stage_flags
            .contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT));
    }
}
