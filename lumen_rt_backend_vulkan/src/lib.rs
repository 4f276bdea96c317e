/*!
# Lumen RT - Vulkan Backend

Vulkan implementation of the lumen_rt backend traits.

This crate provides a headless ray tracing device built on
VK_KHR_acceleration_structure and VK_KHR_ray_tracing_pipeline, using the Ash
library for Vulkan bindings and gpu-allocator for memory management.

```no_run
use lumen_rt_backend_vulkan::lumen::{VulkanConfig, VulkanGraphicsDevice};
use std::sync::{Arc, Mutex};

let device = VulkanGraphicsDevice::new(VulkanConfig::default())?;
let device = Arc::new(Mutex::new(device));
# Ok::<(), lumen_rt::lumen::Error>(())
```
*/

// Vulkan implementation modules
mod vulkan;
mod vulkan_context;
mod vulkan_buffer;
mod vulkan_spatial_index;
mod vulkan_pipeline;
mod vulkan_conversion;
mod debug;

pub use vulkan::{VulkanConfig, VulkanGraphicsDevice};
pub use vulkan_context::RayTracingLimits;

// Re-export debug utilities
pub use debug::{validation_stats, DebugSeverity, ValidationStats};

/// Backend namespace, mirroring `lumen_rt::lumen`
pub mod lumen {
    pub use crate::vulkan::{VulkanConfig, VulkanGraphicsDevice};
    pub use crate::vulkan_context::RayTracingLimits;
    pub use crate::debug::{validation_stats, DebugSeverity, ValidationStats};
}
