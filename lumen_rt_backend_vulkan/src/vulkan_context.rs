/// GpuContext - Shared GPU resources for all Vulkan objects
///
/// Contains everything buffers, indices and pipelines need to release
/// themselves: the logical device, the allocator and the ray tracing
/// extension loaders.

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

/// Ray tracing limits queried from the physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingLimits {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    /// Alignment of build scratch addresses
    pub min_scratch_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
}

/// Shared GPU context for all Vulkan resources.
///
/// Device and instance destruction is handled by `VulkanGraphicsDevice::drop()`
/// once every resource holding this context is gone.
pub struct GpuContext {
    /// Vulkan logical device
    pub device: ash::Device,

    /// GPU memory allocator
    /// Wrapped in ManuallyDrop so it is dropped BEFORE the device is destroyed
    pub allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,

    /// Queue used for builds, copies and traces
    pub queue: vk::Queue,

    pub queue_family: u32,

    /// Pool for every command buffer (TRANSIENT + RESET_COMMAND_BUFFER)
    pub command_pool: Mutex<vk::CommandPool>,

    /// VK_KHR_acceleration_structure entry points
    pub acceleration_structure: ash::khr::acceleration_structure::Device,

    /// VK_KHR_ray_tracing_pipeline entry points
    pub ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,

    pub limits: RayTracingLimits,

    /// Debug utils loader (for validation layers)
    pub(crate) debug_utils_loader: Option<ash::ext::debug_utils::Instance>,

    /// Debug messenger handle
    pub(crate) debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl GpuContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        queue: vk::Queue,
        queue_family: u32,
        command_pool: vk::CommandPool,
        limits: RayTracingLimits,
        debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
        debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    ) -> Self {
        let acceleration_structure = ash::khr::acceleration_structure::Device::new(instance, &device);
        let ray_tracing_pipeline = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);
        Self {
            device,
            allocator: ManuallyDrop::new(allocator),
            queue,
            queue_family,
            command_pool: Mutex::new(command_pool),
            acceleration_structure,
            ray_tracing_pipeline,
            limits,
            debug_utils_loader,
            debug_messenger,
        }
    }

    /// Device address of a buffer created with SHADER_DEVICE_ADDRESS
    pub fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }
}
