/// Pipeline - Vulkan ray tracing pipeline

use ash::vk;

/// Vulkan pipeline implementation
pub struct Pipeline {
    /// Vulkan ray tracing pipeline
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) group_count: u32,
    /// Vulkan device (for cleanup)
    pub(crate) device: ash::Device,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}
