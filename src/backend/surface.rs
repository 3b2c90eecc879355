// Presentation surface
//
// Creates the VkSurfaceKHR for a winit window straight from its raw handles.
// Supported: Xlib, Xcb, Wayland, Win32.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

use super::VulkanDevice;

/// Instance extensions needed to present on `display`
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };

    Ok(vec![khr::Surface::name(), platform])
}

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: khr::Surface,
    _device: Arc<VulkanDevice>,
}

impl Surface {
    pub fn new(
        device: Arc<VulkanDevice>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let entry = &device.entry;
        let instance = &device.instance;

        let handle = unsafe {
            match (display, window) {
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                    let dpy = display
                        .display
                        .context("Xlib display handle without a display")?;
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy.as_ptr() as *mut vk::Display)
                        .window(window.window);
                    khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
                }
                (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
                    let connection = display
                        .connection
                        .context("Xcb display handle without a connection")?;
                    let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                        .connection(connection.as_ptr())
                        .window(window.window.get());
                    khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr())
                        .surface(window.surface.as_ptr());
                    khr::WaylandSurface::new(entry, instance)
                        .create_wayland_surface(&create_info, None)
                }
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
                    let hinstance = window.hinstance.map(|h| h.get()).unwrap_or(0);
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance as vk::HINSTANCE)
                        .hwnd(window.hwnd.get() as vk::HWND);
                    khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
                }
                (display, window) => {
                    anyhow::bail!("Unsupported window handle pair: {:?} / {:?}", display, window)
                }
            }
        }
        .context("Failed to create surface")?;

        let loader = khr::Surface::new(entry, instance);

        Ok(Self {
            handle,
            loader,
            _device: device,
        })
    }

    /// Whether the queue family can present to this surface
    pub fn supports_family(&self, device: &VulkanDevice, family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(device.physical_device, family, self.handle)
                .context("Failed to query surface support")
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}
