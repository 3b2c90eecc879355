// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Objects that own Vulkan handles hold an
// Arc<VulkanDevice> and destroy themselves on drop; everything carved out of
// the two memory blocks is released through the `Allocator` instead.

pub mod allocator;
pub mod attachment;
pub mod buffer;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod framebuffer;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod render_pass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
