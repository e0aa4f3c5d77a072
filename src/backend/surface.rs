// Surface - platform window -> VkSurfaceKHR
//
// The instance extensions depend on the display server, so they are chosen
// from the window's display handle before the instance exists.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

pub struct Surface {
    pub loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl Surface {
    /// Instance extensions needed to present to `display`.
    pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
        let platform = match display {
            RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
            RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
            RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
            other => anyhow::bail!("Unsupported display server: {:?}", other),
        };
        Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
    }

    pub fn new(
        entry: &Entry,
        instance: &ash::Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let handle = unsafe { create_platform_surface(entry, instance, display, window) }
            .context("Failed to create window surface")?;
        log::debug!("Created surface for {:?}", display);

        Ok(Self {
            loader: khr::Surface::new(entry, instance),
            handle,
        })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }
        .unwrap_or(false)
    }

    /// Must run before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_surface(self.handle, None);
    }
}

unsafe fn create_platform_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let hinstance = window.hinstance.map_or(0, |h| h.get());
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(window.hwnd.get() as vk::HWND);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .context("Xlib display handle without a display")?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(window.window as vk::Window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut vk::wl_display)
                .surface(window.surface.as_ptr() as *mut vk::wl_surface);
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)?
        }
        (display, window) => {
            anyhow::bail!("Unsupported window system: {:?} / {:?}", display, window)
        }
    };
    Ok(surface)
}
