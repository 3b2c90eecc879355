// Shader module loading and management
//
// Shaders are compiled to SPIR-V by build.rs and loaded from disk at runtime.
// A `Material` is the vertex + fragment pair a pipeline is built from.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv copies into u32 words, so the byte slice needs no alignment
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Shader code is not valid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?} (was build.rs able to run glslc?)", path))?;

    let module = create_shader_module(device, &code)
        .with_context(|| format!("Failed to load shader {:?}", path))?;

    log::info!("Loaded shader {:?} ({} bytes)", path, code.len());
    Ok(module)
}

pub struct Material {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
    pub push_constants: Vec<vk::PushConstantRange>,
    device: Arc<VulkanDevice>,
}

impl Material {
    pub fn load(device: Arc<VulkanDevice>, vertex: &Path, fragment: &Path) -> Result<Self> {
        let vertex = load_shader_module(&device, vertex)?;
        let fragment = match load_shader_module(&device, fragment) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };

        Ok(Self {
            vertex,
            fragment,
            push_constants: Vec::new(),
            device,
        })
    }

    pub fn with_push_constant(
        mut self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        size: u32,
    ) -> Self {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.vertex, None);
            self.device.device.destroy_shader_module(self.fragment, None);
        }
    }
}
