// GPU memory resources: vertex buffer and depth buffer
//
// Memory comes from the device's gpu-allocator. Every resource frees its
// allocation in Drop, before the device tears the allocator down.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer: vk::Buffer,
    pub size: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilView {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation> {
    let mut allocator = device.allocator.lock();
    let allocator = allocator.as_mut().context("GPU allocator already destroyed")?;
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for {}", name))
}

fn free(device: &VulkanDevice, allocation: Allocation) {
    if let Some(allocator) = device.allocator.lock().as_mut() {
        if let Err(e) = allocator.free(allocation) {
            log::error!("Failed to free GPU allocation: {}", e);
        }
    }
}

/// Host-visible vertex buffer, written once at creation.
pub struct VertexBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u32,
    stride: u32,
    device: Arc<VulkanDevice>,
}

impl VertexBuffer {
    pub fn new<T: Pod>(device: Arc<VulkanDevice>, vertices: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let size = u32::try_from(bytes.len()).context("Vertex data too large")?;
        let stride = std::mem::size_of::<T>() as u32;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create vertex buffer")?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let mut allocation = match allocate(&device, "vertex buffer", requirements, MemoryLocation::CpuToGpu, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let upload = (|| -> Result<()> {
            unsafe {
                device
                    .device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                    .context("Failed to bind vertex buffer memory")?;
            }
            let mapped = allocation
                .mapped_slice_mut()
                .context("Vertex buffer memory is not host visible")?;
            mapped[..bytes.len()].copy_from_slice(bytes);
            Ok(())
        })();

        if let Err(e) = upload {
            free(&device, allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }

        log::debug!("Uploaded {} bytes of vertex data (stride {})", size, stride);

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            stride,
            device,
        })
    }

    pub fn view(&self) -> VertexBufferView {
        VertexBufferView {
            buffer: self.buffer,
            size: self.size,
            stride: self.stride,
        }
    }
}

impl Drop for VertexBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Depth-stencil target matching the swap chain extent.
pub struct DepthBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl DepthBuffer {
    pub fn new(device: Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create depth image")?;
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = match allocate(&device, "depth buffer", requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = (|| -> Result<vk::ImageView> {
            unsafe {
                device
                    .device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
                    .context("Failed to bind depth image memory")?;
            }

            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(DEPTH_FORMAT)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            unsafe { device.device.create_image_view(&view_info, None) }
                .context("Failed to create depth image view")
        })();

        let view = match view {
            Ok(view) => view,
            Err(e) => {
                free(&device, allocation);
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        log::debug!("Created depth buffer {}x{}", extent.width, extent.height);

        Ok(Self {
            image,
            view,
            allocation: Some(allocation),
            device,
        })
    }

    pub fn view(&self) -> DepthStencilView {
        DepthStencilView {
            image: self.image,
            view: self.view,
        }
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
        }
        if let Some(allocation) = self.allocation.take() {
            free(&self.device, allocation);
        }
        unsafe {
            self.device.device.destroy_image(self.image, None);
        }
    }
}
