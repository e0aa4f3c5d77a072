// Swapchain - Window presentation
//
// Manages the ring of images we render to and present to the screen.
// After every present the next image is acquired and waited for on the CPU,
// so `current` is always the index the platform handed out, never a guess.

use anyhow::Context;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::sync::{AcquireFence, PresentSemaphores};
use super::{SwapChain, Vulkan, VulkanDevice, VulkanQueue};
use crate::error::{FrameError, FrameResult};

/// Upper bound on how long the presentation engine may hold an image.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetView {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
}

/// What the swap chain is (re)created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub vsync_interval: u32,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    desc: SwapchainDesc,
    current: u32,
    present_semaphores: PresentSemaphores,
    acquire_fence: AcquireFence,
    device: Arc<VulkanDevice>,
}

/// Choose present mode from the sync interval.
/// IMMEDIATE: No vsync, lowest latency, may tear
/// MAILBOX: No vsync, no tearing
/// FIFO: Vsync enabled, guaranteed available
fn choose_present_mode(available: &[vk::PresentModeKHR], vsync_interval: u32) -> vk::PresentModeKHR {
    if vsync_interval > 0 {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

impl Swapchain {
    pub fn new(device: Arc<VulkanDevice>, desc: SwapchainDesc) -> anyhow::Result<Self> {
        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);
        let acquire_fence =
            AcquireFence::new(Arc::clone(&device)).context("Failed to create acquire fence")?;

        let parts = build(&device, &loader, desc, vk::SwapchainKHR::null())
            .context("Failed to create swapchain")?;
        let present_semaphores = PresentSemaphores::new(Arc::clone(&device), parts.images.len())
            .context("Failed to create present semaphores")?;

        let mut swapchain = Self {
            swapchain: parts.swapchain,
            swapchain_loader: loader,
            images: parts.images,
            image_views: parts.image_views,
            format: parts.format,
            extent: parts.extent,
            present_mode: parts.present_mode,
            desc,
            current: 0,
            present_semaphores,
            acquire_fence,
            device,
        };
        swapchain.acquire().context("Failed to acquire first swapchain image")?;
        Ok(swapchain)
    }

    /// Rebuild for a new window size. All GPU work touching the old images
    /// must have completed.
    pub fn recreate(&mut self, width: u32, height: u32) -> FrameResult<()> {
        let desc = SwapchainDesc {
            width,
            height,
            ..self.desc
        };
        log::info!("Recreating swapchain: {}x{}", width, height);

        let parts = build(&self.device, &self.swapchain_loader, desc, self.swapchain)?;
        self.destroy_images();
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }

        if parts.images.len() != self.images.len() {
            self.present_semaphores = PresentSemaphores::new(Arc::clone(&self.device), parts.images.len())?;
        }
        self.swapchain = parts.swapchain;
        self.images = parts.images;
        self.image_views = parts.image_views;
        self.format = parts.format;
        self.extent = parts.extent;
        self.present_mode = parts.present_mode;
        self.desc = desc;

        self.acquire()
    }

    /// Acquire the next image and block until it is ready to render into.
    fn acquire(&mut self) -> FrameResult<()> {
        let timeout_ns = ACQUIRE_TIMEOUT.as_nanos() as u64;
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                vk::Semaphore::null(),
                self.acquire_fence.fence,
            )
        }?;
        self.acquire_fence.wait_and_reset(ACQUIRE_TIMEOUT)?;

        if suboptimal {
            log::debug!("Swapchain is suboptimal for the surface");
        }
        self.current = index;
        Ok(())
    }

    fn destroy_images(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
        }
        self.image_views.clear();
        self.images.clear();
    }
}

struct SwapchainParts {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

fn build(
    device: &VulkanDevice,
    loader: &ash::extensions::khr::Swapchain,
    desc: SwapchainDesc,
    old_swapchain: vk::SwapchainKHR,
) -> FrameResult<SwapchainParts> {
    let surface = &device.surface;

    // Query surface capabilities
    let surface_caps = unsafe {
        surface
            .loader
            .get_physical_device_surface_capabilities(device.physical_device, surface.handle)
    }?;

    // Query supported formats
    let formats = unsafe {
        surface
            .loader
            .get_physical_device_surface_formats(device.physical_device, surface.handle)
    }?;

    // Query supported present modes
    let present_modes = unsafe {
        surface
            .loader
            .get_physical_device_surface_present_modes(device.physical_device, surface.handle)
    }?;

    // Choose surface format (prefer UNORM; the clear color is already sRGB-encoded)
    let surface_format = formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| FrameError::SwapChainLost("surface reports no formats".to_string()))?;

    let present_mode = choose_present_mode(&present_modes, desc.vsync_interval);
    let extent = choose_extent(&surface_caps, desc.width, desc.height);
    let image_count = choose_image_count(&surface_caps, desc.buffer_count);

    log::info!(
        "Swapchain {}x{}, {} images requested, {:?}",
        extent.width,
        extent.height,
        image_count,
        present_mode
    );

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface.handle)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe { loader.create_swapchain(&create_info, None) }?;

    // Get swapchain images
    let images = match unsafe { loader.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { loader.destroy_swapchain(swapchain, None) };
            return Err(e.into());
        }
    };

    if images.len() as u32 != image_count {
        log::info!("Driver created {} swapchain images", images.len());
    }

    // Create image views
    let mut image_views = Vec::with_capacity(images.len());
    for &image in &images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(surface_format.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.device.create_image_view(&create_info, None) } {
            Ok(view) => image_views.push(view),
            Err(e) => unsafe {
                for &view in &image_views {
                    device.device.destroy_image_view(view, None);
                }
                loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            },
        }
    }

    Ok(SwapchainParts {
        swapchain,
        images,
        image_views,
        format: surface_format.format,
        extent,
        present_mode,
    })
}

impl SwapChain<Vulkan> for Swapchain {
    fn buffer_count(&self) -> usize {
        self.images.len()
    }

    fn current_back_buffer_index(&self) -> FrameResult<usize> {
        Ok(self.current as usize)
    }

    fn render_target_view(&self, index: usize) -> RenderTargetView {
        RenderTargetView {
            image: self.images[index],
            view: self.image_views[index],
            extent: self.extent,
        }
    }

    /// Present rendered image to screen, then acquire the next one.
    fn present(&mut self, queue: &VulkanQueue, sync_interval: u32) -> FrameResult<()> {
        if sync_interval != self.desc.vsync_interval {
            log::trace!(
                "Sync interval {} differs from swapchain mode {:?}",
                sync_interval,
                self.present_mode
            );
        }

        // Presentation waits on everything submitted to the queue so far
        let semaphore = self.present_semaphores.get(self.current as usize);
        queue.signal_binary(semaphore)?;

        let wait_semaphores = [semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [self.current];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe { self.swapchain_loader.queue_present(queue.queue, &present_info) }?;
        if suboptimal {
            log::debug!("Presented to a suboptimal swapchain");
        }

        self.acquire()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // The presentation engine may still wait on our semaphores
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait failed before swapchain teardown: {}", e);
        }
        self.destroy_images();
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
