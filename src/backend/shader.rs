// Shader module loading
//
// Vulkan consumes SPIR-V. build.rs compiles shaders/*.vert|frag with glslc;
// the modules are read from disk at pipeline creation so the shader
// directory is configurable.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

use super::VulkanDevice;

/// Shader module that only lives as long as pipeline creation.
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a VulkanDevice,
}

impl<'a> ShaderModule<'a> {
    pub fn load(device: &'a VulkanDevice, path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open shader {}", path.display()))?;
        // read_spv checks the magic number and handles alignment
        let code = ash::util::read_spv(&mut file)
            .with_context(|| format!("Invalid SPIR-V in {}", path.display()))?;

        let module = create_shader_module(device, &code)?;
        log::debug!("Loaded shader {} ({} words)", path.display(), code.len());
        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
