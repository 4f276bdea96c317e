/// VulkanGraphicsDevice - headless Vulkan ray tracing backend
///
/// Implements the three lumen backend traits on top of VK_KHR_acceleration_structure
/// and VK_KHR_ray_tracing_pipeline. Command streams are translated into one
/// primary command buffer per submission; frames are tracked with one fence each.

use lumen_rt::lumen::{Error, Result};
use lumen_rt::lumen::device::{
    BufferDesc, BufferHandle, BufferUsage, Command, CommandStream, FrameTicket, IndexBuildCommand, IndexDescriptor,
    IndexGeometry, IndexHandle, IndexMemoryRequirements, PipelineBackend, PipelineHandle, RayTracingPipelineDesc,
    ResourceBackend, SpatialIndexBackend, TraceRaysCommand,
};
use lumen_rt::{lumen_bail, lumen_debug, lumen_err, lumen_info, lumen_trace, lumen_warn};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use slotmap::SlotMap;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::debug::DebugSeverity;
use crate::vulkan_buffer::Buffer;
use crate::vulkan_context::{GpuContext, RayTracingLimits};
use crate::vulkan_conversion::*;
use crate::vulkan_pipeline::Pipeline;
use crate::vulkan_spatial_index::SpatialIndex;

/// Device extensions every ray tracing device must expose
const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Backend configuration
#[derive(Debug, Clone)]
pub struct VulkanConfig {
    pub application_name: String,
    /// Enable VK_LAYER_KHRONOS_validation (needs the `vulkan-validation` feature)
    pub enable_validation: bool,
    pub debug_severity: DebugSeverity,
    pub panic_on_validation_error: bool,
    /// Prefer a discrete GPU when several devices qualify
    pub prefer_discrete_gpu: bool,
    /// Use this physical device (enumeration order) instead of picking one
    pub preferred_device: Option<usize>,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            application_name: "Lumen RT".to_string(),
            enable_validation: cfg!(feature = "vulkan-validation"),
            debug_severity: DebugSeverity::default(),
            panic_on_validation_error: false,
            prefer_discrete_gpu: true,
            preferred_device: None,
        }
    }
}

/// A submitted stream whose fence has not been observed yet
struct InFlightFrame {
    ticket: FrameTicket,
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    /// Indices built or updated by the stream
    built: Vec<IndexHandle>,
}

/// Vulkan device implementation
pub struct VulkanGraphicsDevice {
    /// Vulkan entry (keeps the loader alive)
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device_name: String,

    /// Shared GPU context for buffers, indices and pipelines
    ctx: Arc<GpuContext>,
    /// GPU memory allocator reference (also held by GpuContext)
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,

    buffers: SlotMap<BufferHandle, Buffer>,
    indices: SlotMap<IndexHandle, SpatialIndex>,
    pipelines: SlotMap<PipelineHandle, Pipeline>,

    /// Descriptor set layouts of every pipeline created from now on
    pipeline_set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Descriptor sets bound before each trace, per pipeline
    trace_descriptor_sets: slotmap::SecondaryMap<PipelineHandle, Vec<vk::DescriptorSet>>,

    in_flight: Vec<InFlightFrame>,
    next_frame: u64,
}

impl VulkanGraphicsDevice {
    /// Create a headless ray tracing device
    ///
    /// Picks the first physical device exposing acceleration structures, ray
    /// tracing pipelines and buffer device addresses (a discrete GPU first if
    /// `prefer_discrete_gpu` is set), unless `preferred_device` names one.
    pub fn new(config: VulkanConfig) -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| lumen_err!("lumen::vulkan", InitializationFailed, "Failed to load Vulkan library: {:?}", e))?;

            let validation = config.enable_validation && cfg!(feature = "vulkan-validation");
            if config.enable_validation && !validation {
                lumen_warn!("lumen::vulkan", "validation requested but the vulkan-validation feature is disabled");
            }

            let app_name = CString::new(config.application_name.as_str())
                .map_err(|_| lumen_err!("lumen::vulkan", InvalidArgument, "application name contains a NUL byte"))?;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"Lumen RT")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let mut extension_names = Vec::new();
            let mut layer_names = Vec::new();
            if validation {
                extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
                layer_names.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
            }

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names)
                .enabled_extension_names(&extension_names);

            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|e| lumen_err!("lumen::vulkan", InitializationFailed, "Failed to create instance: {:?}", e))?;

            let (debug_utils_loader, debug_messenger) = if validation {
                let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
                crate::debug::init_debug_config(crate::debug::Config {
                    panic_on_error: config.panic_on_validation_error,
                });

                let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(config.debug_severity.to_vk())
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(crate::debug::vulkan_debug_callback));

                match debug_utils.create_debug_utils_messenger(&debug_info, None) {
                    Ok(messenger) => (Some(debug_utils), Some(messenger)),
                    Err(e) => {
                        instance.destroy_instance(None);
                        lumen_bail!("lumen::vulkan", InitializationFailed, "Failed to create debug messenger: {:?}", e);
                    }
                }
            } else {
                (None, None)
            };

            match Self::create_device(entry, instance, config, debug_utils_loader, debug_messenger) {
                Ok(device) => Ok(device),
                Err((instance, debug, e)) => {
                    crate::debug::cleanup_debug_config();
                    if let Some((loader, messenger)) = debug {
                        loader.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                    Err(e)
                }
            }
        }
    }

    /// Everything after instance creation; hands the instance back on failure
    #[allow(clippy::type_complexity)]
    unsafe fn create_device(
        entry: ash::Entry,
        instance: ash::Instance,
        config: VulkanConfig,
        debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
        debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    ) -> std::result::Result<
        Self,
        (ash::Instance, Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>, Error),
    > {
        let debug = debug_utils_loader.clone().zip(debug_messenger);
        macro_rules! fail {
            ($e:expr) => {
                return Err((instance, debug, $e))
            };
        }

        let physical_device = match Self::pick_physical_device(&instance, &config) {
            Ok(pd) => pd,
            Err(e) => fail!(e),
        };
        let properties = instance.get_physical_device_properties(physical_device);
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let queue_family = match instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .position(|qf| qf.queue_flags.contains(vk::QueueFlags::COMPUTE))
        {
            Some(index) => index as u32,
            None => fail!(lumen_err!("lumen::vulkan", InitializationFailed, "No compute queue family on '{}'", device_name)),
        };

        // Device with buffer device address, acceleration structures and RT pipelines
        let queue_priorities = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];
        let extension_ptrs: Vec<_> = REQUIRED_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut ray_tracing = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan12)
            .push_next(&mut acceleration)
            .push_next(&mut ray_tracing);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);

        let device = match instance.create_device(physical_device, &device_create_info, None) {
            Ok(device) => device,
            Err(e) => fail!(lumen_err!("lumen::vulkan", InitializationFailed, "Failed to create device: {:?}", e)),
        };
        let queue = device.get_device_queue(queue_family, 0);
        let limits = Self::query_limits(&instance, physical_device);

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                device.destroy_device(None);
                fail!(lumen_err!("lumen::vulkan", InitializationFailed, "Failed to create allocator: {:?}", e));
            }
        };

        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match device.create_command_pool(&pool_create_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                drop(allocator);
                device.destroy_device(None);
                fail!(lumen_err!("lumen::vulkan", InitializationFailed, "Failed to create command pool: {:?}", e));
            }
        };

        let allocator_arc = Arc::new(Mutex::new(allocator));
        let ctx = Arc::new(GpuContext::new(
            &instance,
            device,
            Arc::clone(&allocator_arc),
            queue,
            queue_family,
            command_pool,
            limits,
            debug_utils_loader,
            debug_messenger,
        ));

        lumen_info!("lumen::vulkan", "ray tracing device '{}' ready (handle {} bytes, base alignment {}, max recursion {})",
            device_name, limits.shader_group_handle_size, limits.shader_group_base_alignment, limits.max_ray_recursion_depth);

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device_name,
            ctx,
            allocator: ManuallyDrop::new(allocator_arc),
            buffers: SlotMap::with_key(),
            indices: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            pipeline_set_layouts: Vec::new(),
            trace_descriptor_sets: slotmap::SecondaryMap::new(),
            in_flight: Vec::new(),
            next_frame: 0,
        })
    }

    unsafe fn pick_physical_device(instance: &ash::Instance, config: &VulkanConfig) -> Result<vk::PhysicalDevice> {
        let physical_devices = instance
            .enumerate_physical_devices()
            .map_err(|e| lumen_err!("lumen::vulkan", InitializationFailed, "Failed to enumerate physical devices: {:?}", e))?;

        if let Some(index) = config.preferred_device {
            return match physical_devices.get(index) {
                Some(&pd) if Self::supports_ray_tracing(instance, pd) => Ok(pd),
                Some(_) => lumen_bail!("lumen::vulkan", InitializationFailed,
                    "physical device {} has no ray tracing support", index),
                None => lumen_bail!("lumen::vulkan", InitializationFailed,
                    "physical device {} requested, {} available", index, physical_devices.len()),
            };
        }

        let mut candidates: Vec<_> = physical_devices
            .into_iter()
            .filter(|&pd| Self::supports_ray_tracing(instance, pd))
            .collect();
        if config.prefer_discrete_gpu {
            candidates.sort_by_key(|&pd| {
                instance.get_physical_device_properties(pd).device_type != vk::PhysicalDeviceType::DISCRETE_GPU
            });
        }
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| lumen_err!("lumen::vulkan", InitializationFailed, "No GPU with ray tracing support found"))
    }

    unsafe fn supports_ray_tracing(instance: &ash::Instance, pd: vk::PhysicalDevice) -> bool {
        let extensions = match instance.enumerate_device_extension_properties(pd) {
            Ok(extensions) => extensions,
            Err(_) => return false,
        };
        let has_extension = |needle: &CStr| {
            extensions
                .iter()
                .any(|e| e.extension_name_as_c_str().map_or(false, |name| name == needle))
        };
        if !REQUIRED_EXTENSIONS.iter().all(|name| has_extension(name)) {
            return false;
        }

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan12)
            .push_next(&mut acceleration)
            .push_next(&mut ray_tracing);
        instance.get_physical_device_features2(pd, &mut features2);

        vulkan12.buffer_device_address == vk::TRUE
            && acceleration.acceleration_structure == vk::TRUE
            && ray_tracing.ray_tracing_pipeline == vk::TRUE
    }

    unsafe fn query_limits(instance: &ash::Instance, pd: vk::PhysicalDevice) -> RayTracingLimits {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_properties)
            .push_next(&mut as_properties);
        instance.get_physical_device_properties2(pd, &mut properties2);
        let non_coherent_atom_size = properties2.properties.limits.non_coherent_atom_size;

        RayTracingLimits {
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
            shader_group_base_alignment: rt_properties.shader_group_base_alignment,
            max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
            min_scratch_offset_alignment: as_properties.min_acceleration_structure_scratch_offset_alignment as u64,
            non_coherent_atom_size,
        }
    }

    // ===== ACCESSORS =====

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn limits(&self) -> RayTracingLimits {
        self.ctx.limits
    }

    /// Vulkan object behind an index, for descriptor writes
    pub fn raw_acceleration_structure(&self, index: IndexHandle) -> Option<vk::AccelerationStructureKHR> {
        self.indices.get(index).map(|i| i.structure)
    }

    /// Layout of a pipeline, for descriptor set allocation
    pub fn raw_pipeline_layout(&self, pipeline: PipelineHandle) -> Option<vk::PipelineLayout> {
        self.pipelines.get(pipeline).map(|p| p.pipeline_layout)
    }

    pub fn raw_device(&self) -> &ash::Device {
        &self.ctx.device
    }

    /// Descriptor set layouts used by pipelines created after this call
    pub fn set_pipeline_set_layouts(&mut self, layouts: &[vk::DescriptorSetLayout]) {
        self.pipeline_set_layouts = layouts.to_vec();
    }

    /// Descriptor sets bound (from set 0) before every trace with `pipeline`
    pub fn bind_trace_descriptor_sets(&mut self, pipeline: PipelineHandle, sets: Vec<vk::DescriptorSet>) -> Result<()> {
        if !self.pipelines.contains_key(pipeline) {
            lumen_bail!("lumen::vulkan", InvalidArgument, "unknown pipeline");
        }
        self.trace_descriptor_sets.insert(pipeline, sets);
        Ok(())
    }

    // ===== INTERNAL LOOKUPS =====

    fn buffer(&self, handle: BufferHandle) -> Result<&Buffer> {
        match self.buffers.get(handle) {
            Some(buffer) => Ok(buffer),
            None => lumen_bail!("lumen::vulkan", InvalidArgument, "unknown buffer {:?}", handle),
        }
    }

    fn index(&self, handle: IndexHandle) -> Result<&SpatialIndex> {
        match self.indices.get(handle) {
            Some(index) => Ok(index),
            None => lumen_bail!("lumen::vulkan", InvalidArgument, "unknown spatial index {:?}", handle),
        }
    }

    fn lock_allocator(&self) -> Result<MutexGuard<'_, Allocator>> {
        self.allocator
            .lock()
            .map_err(|_| lumen_err!("lumen::vulkan", "allocator mutex poisoned"))
    }

    /// Geometry of a build; a missing instance buffer yields a null address (size queries)
    fn build_geometry(
        &self,
        descriptor: &IndexDescriptor,
        instance_data: Option<BufferHandle>,
    ) -> Result<vk::AccelerationStructureGeometryKHR<'static>> {
        let geometry = match descriptor {
            IndexDescriptor::BottomLevel { geometry: IndexGeometry::Triangles {
                vertex_buffer, vertex_format, vertex_stride, vertex_count, index_buffer, opaque, ..
            }, .. } => {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vertex_format_to_vk(*vertex_format))
                    .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: self.buffer(*vertex_buffer)?.address })
                    .vertex_stride(*vertex_stride)
                    .max_vertex(vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR { device_address: self.buffer(*index_buffer)?.address });
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(geometry_flags(*opaque))
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            }
            IndexDescriptor::BottomLevel { geometry: IndexGeometry::Aabbs { aabb_buffer, stride, opaque, .. }, .. } => {
                let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR { device_address: self.buffer(*aabb_buffer)?.address })
                    .stride(*stride);
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .flags(geometry_flags(*opaque))
                    .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
            }
            IndexDescriptor::TopLevel { .. } => {
                let address = match instance_data {
                    Some(buffer) => self.buffer(buffer)?.address,
                    None => 0,
                };
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR { device_address: address });
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
            }
        };
        Ok(geometry)
    }

    // ===== COMMAND TRANSLATION =====

    unsafe fn memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        self.ctx.device.cmd_pipeline_barrier(cmd, src_stage, dst_stage, vk::DependencyFlags::empty(), &[barrier], &[], &[]);
    }

    unsafe fn record_commands(&self, cmd: vk::CommandBuffer, commands: &CommandStream) -> Result<()> {
        for command in commands.commands() {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    let region = vk::BufferCopy::default().size(*size);
                    self.ctx.device.cmd_copy_buffer(cmd, self.buffer(*src)?.buffer, self.buffer(*dst)?.buffer, &[region]);
                    // Copies feed builds recorded later in the same stream
                    self.memory_barrier(
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                        vk::AccessFlags::SHADER_READ | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                    );
                }
                Command::BuildIndex(build) => self.record_build(cmd, build)?,
                Command::IndexBuildBarrier => self.memory_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                ),
                Command::TraceRays(trace) => self.record_trace(cmd, trace)?,
            }
        }
        Ok(())
    }

    unsafe fn record_build(&self, cmd: vk::CommandBuffer, build: &IndexBuildCommand) -> Result<()> {
        let destination = self.index(build.destination)?.structure;
        if destination == vk::AccelerationStructureKHR::null() {
            lumen_bail!("lumen::vulkan", InvalidArgument, "build into an index without bound memory");
        }
        if build.descriptor.level() == lumen_rt::lumen::device::IndexLevel::Top && build.instance_data.is_none() {
            lumen_bail!("lumen::vulkan", InvalidArgument, "top-level build without instance data");
        }
        let (mode, source) = if build.update_only {
            let source = match build.source {
                Some(source) => self.index(source)?.structure,
                None => lumen_bail!("lumen::vulkan", InvalidArgument, "index update without a source index"),
            };
            (vk::BuildAccelerationStructureModeKHR::UPDATE, source)
        } else {
            (vk::BuildAccelerationStructureModeKHR::BUILD, vk::AccelerationStructureKHR::null())
        };

        let geometry = self.build_geometry(&build.descriptor, build.instance_data)?;
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(index_level_to_vk(build.descriptor.level()))
            .flags(build_flags_to_vk(build.descriptor.flags()))
            .mode(mode)
            .src_acceleration_structure(source)
            .dst_acceleration_structure(destination)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: self.buffer(build.scratch)?.address });
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(build.descriptor.element_count());

        self.ctx
            .acceleration_structure
            .cmd_build_acceleration_structures(cmd, &[info], &[std::slice::from_ref(&range)]);
        Ok(())
    }

    unsafe fn record_trace(&self, cmd: vk::CommandBuffer, trace: &TraceRaysCommand) -> Result<()> {
        let pipeline = match self.pipelines.get(trace.pipeline) {
            Some(pipeline) => pipeline,
            None => lumen_bail!("lumen::vulkan", InvalidArgument, "trace with an unknown pipeline"),
        };
        self.index(trace.top_level)?;
        let table_address = self.buffer(trace.table)?.address;

        self.ctx.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
        if let Some(sets) = self.trace_descriptor_sets.get(trace.pipeline) {
            self.ctx.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline.pipeline_layout,
                0,
                sets,
                &[],
            );
        }
        self.ctx.ray_tracing_pipeline.cmd_trace_rays(
            cmd,
            &strided_region_to_vk(table_address, &trace.raygen),
            &strided_region_to_vk(table_address, &trace.miss),
            &strided_region_to_vk(table_address, &trace.hit_group),
            &strided_region_to_vk(table_address, &trace.callable),
            trace.width,
            trace.height,
            trace.depth,
        );
        Ok(())
    }

    // ===== SUBMISSION =====

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        if let Ok(pool) = self.ctx.command_pool.lock() {
            unsafe { self.ctx.device.free_command_buffers(*pool, &[command_buffer]) };
        }
    }

    /// Record and submit a stream with a fresh fence
    fn submit_stream(&mut self, commands: &CommandStream) -> Result<(vk::Fence, vk::CommandBuffer)> {
        unsafe {
            let command_buffer = {
                let pool = self
                    .ctx
                    .command_pool
                    .lock()
                    .map_err(|_| lumen_err!("lumen::vulkan", "command pool mutex poisoned"))?;
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(*pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let buffers = self
                    .ctx
                    .device
                    .allocate_command_buffers(&allocate_info)
                    .map_err(|e| lumen_err!("lumen::vulkan", "Failed to allocate command buffer: {:?}", e))?;
                match buffers.into_iter().next() {
                    Some(buffer) => buffer,
                    None => lumen_bail!("lumen::vulkan", "driver returned no command buffer"),
                }
            };

            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let recorded = self
                .ctx
                .device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(|e| lumen_err!("lumen::vulkan", "Failed to begin command buffer: {:?}", e))
                .and_then(|_| self.record_commands(command_buffer, commands))
                .and_then(|_| {
                    self.ctx
                        .device
                        .end_command_buffer(command_buffer)
                        .map_err(|e| lumen_err!("lumen::vulkan", "Failed to end command buffer: {:?}", e))
                });
            if let Err(e) = recorded {
                self.free_command_buffer(command_buffer);
                return Err(e);
            }

            let fence = match self.ctx.device.create_fence(&vk::FenceCreateInfo::default(), None) {
                Ok(fence) => fence,
                Err(e) => {
                    self.free_command_buffer(command_buffer);
                    lumen_bail!("lumen::vulkan", "Failed to create fence: {:?}", e);
                }
            };

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            if let Err(e) = self.ctx.device.queue_submit(self.ctx.queue, &[submit_info], fence) {
                self.ctx.device.destroy_fence(fence, None);
                self.free_command_buffer(command_buffer);
                return Err(match e {
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                        lumen_rt::lumen_error!("lumen::vulkan", "Out of memory submitting '{}'", commands.label());
                        Error::OutOfMemory
                    }
                    e => lumen_err!("lumen::vulkan", "Failed to submit '{}': {:?}", commands.label(), e),
                });
            }

            lumen_trace!("lumen::vulkan", "submitted '{}' ({} commands)", commands.label(), commands.len());
            Ok((fence, command_buffer))
        }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.ctx.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                lumen_bail!("lumen::vulkan", "fence wait timed out after {} ns", timeout_ns)
            }
            Err(e) => lumen_bail!("lumen::vulkan", "Failed to wait for fence: {:?}", e),
        }
    }

    /// Release a completed submission and mark its indices resident
    fn retire(&mut self, frame: InFlightFrame) {
        unsafe { self.ctx.device.destroy_fence(frame.fence, None) };
        self.free_command_buffer(frame.command_buffer);
        for handle in frame.built {
            if let Some(index) = self.indices.get_mut(handle) {
                index.built = true;
            }
        }
    }
}

fn built_indices(commands: &CommandStream) -> Vec<IndexHandle> {
    commands
        .commands()
        .iter()
        .filter_map(|command| match command {
            Command::BuildIndex(build) => Some(build.destination),
            _ => None,
        })
        .collect()
}

// ============================================================================
// ResourceBackend
// ============================================================================

impl ResourceBackend for VulkanGraphicsDevice {
    fn allocate_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            lumen_bail!("lumen::vulkan", ResourceCreationFailed, "buffer '{}' has zero size", desc.name);
        }
        unsafe {
            let buffer_create_info = vk::BufferCreateInfo::default()
                .size(desc.size)
                .usage(buffer_usage_to_vk(desc.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self.ctx.device.create_buffer(&buffer_create_info, None).map_err(|e| {
                lumen_err!("lumen::vulkan", ResourceCreationFailed,
                    "Failed to create buffer '{}' of {} bytes: {:?}", desc.name, desc.size, e)
            })?;

            let mut requirements = self.ctx.device.get_buffer_memory_requirements(buffer);
            if desc.usage.contains(BufferUsage::SPATIAL_INDEX_SCRATCH) {
                requirements.alignment = requirements.alignment.max(self.ctx.limits.min_scratch_offset_alignment);
            }

            let allocation = self.lock_allocator().and_then(|mut allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name: &desc.name,
                        requirements,
                        location: memory_kind_to_location(desc.memory),
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|_| {
                        let size_mb = requirements.size as f64 / (1024.0 * 1024.0);
                        lumen_rt::lumen_error!("lumen::vulkan", "Out of GPU memory for buffer '{}' (required: {:.2} MB)",
                            desc.name, size_mb);
                        Error::OutOfMemory
                    })
            });
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.ctx.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            if let Err(e) = self.ctx.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) {
                if let Ok(mut allocator) = self.lock_allocator() {
                    allocator.free(allocation).ok();
                }
                self.ctx.device.destroy_buffer(buffer, None);
                lumen_bail!("lumen::vulkan", ResourceCreationFailed, "Failed to bind buffer memory: {:?}", e);
            }

            let address = if needs_device_address(desc.usage) {
                self.ctx.buffer_address(buffer)
            } else {
                0
            };
            lumen_trace!("lumen::vulkan", "buffer '{}' allocated ({} bytes, {:?})", desc.name, desc.size, desc.memory);
            Ok(self.buffers.insert(Buffer::new(
                Arc::clone(&self.ctx),
                buffer,
                allocation,
                desc.size,
                desc.memory,
                address,
            )))
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(buffer);
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(buffer).map(|b| b.size)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        self.buffer(buffer)?.write(offset, data)
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.buffer(buffer)?.read(offset, size)
    }

    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<()> {
        self.buffer(buffer)?.flush(offset, size)
    }

    fn submit_and_wait(&mut self, commands: CommandStream) -> Result<()> {
        let (fence, command_buffer) = self.submit_stream(&commands)?;
        let waited = self.wait_fence(fence, u64::MAX);
        let built = if waited.is_ok() { built_indices(&commands) } else { Vec::new() };
        self.retire(InFlightFrame {
            ticket: FrameTicket(0),
            fence,
            command_buffer,
            built,
        });
        waited
    }

    fn submit_frame(&mut self, commands: CommandStream) -> Result<FrameTicket> {
        let (fence, command_buffer) = self.submit_stream(&commands)?;
        self.next_frame += 1;
        let ticket = FrameTicket(self.next_frame);
        self.in_flight.push(InFlightFrame {
            ticket,
            fence,
            command_buffer,
            built: built_indices(&commands),
        });
        Ok(ticket)
    }

    fn wait_frame(&mut self, ticket: FrameTicket, timeout_ns: u64) -> Result<()> {
        if ticket.0 == 0 || ticket.0 > self.next_frame {
            lumen_bail!("lumen::vulkan", "frame {} was never submitted", ticket.0);
        }
        let position = match self.in_flight.iter().position(|frame| frame.ticket == ticket) {
            Some(position) => position,
            None => return Ok(()),
        };
        self.wait_fence(self.in_flight[position].fence, timeout_ns)?;

        // One queue: earlier frames are complete too
        let completed: Vec<_> = self.in_flight.drain(..=position).collect();
        for frame in completed {
            self.retire(frame);
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .device_wait_idle()
                .map_err(|e| lumen_err!("lumen::vulkan", "Failed to wait idle: {:?}", e))?;
        }
        let completed: Vec<_> = self.in_flight.drain(..).collect();
        for frame in completed {
            self.retire(frame);
        }
        Ok(())
    }
}

// ============================================================================
// SpatialIndexBackend
// ============================================================================

impl SpatialIndexBackend for VulkanGraphicsDevice {
    fn query_memory_requirements(&self, descriptor: &IndexDescriptor) -> Result<IndexMemoryRequirements> {
        let geometry = self.build_geometry(descriptor, None)?;
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(index_level_to_vk(descriptor.level()))
            .flags(build_flags_to_vk(descriptor.flags()))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &[descriptor.element_count()],
                &mut sizes,
            );
        }
        lumen_debug!("lumen::vulkan", "{:?} index of {} elements: result {} bytes, scratch {}/{} bytes",
            descriptor.level(), descriptor.element_count(), sizes.acceleration_structure_size,
            sizes.build_scratch_size, sizes.update_scratch_size);

        Ok(IndexMemoryRequirements {
            result_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_index(&mut self, descriptor: &IndexDescriptor) -> Result<IndexHandle> {
        if descriptor.element_count() == 0 {
            lumen_bail!("lumen::vulkan", ResourceCreationFailed, "{:?} index without elements", descriptor.level());
        }
        Ok(self.indices.insert(SpatialIndex::new(Arc::clone(&self.ctx), descriptor.clone())))
    }

    fn bind_memory(&mut self, index: IndexHandle, memory: BufferHandle) -> Result<()> {
        let (buffer, size) = {
            let buffer = self.buffer(memory)?;
            (buffer.buffer, buffer.size)
        };
        let entry = match self.indices.get_mut(index) {
            Some(entry) => entry,
            None => lumen_bail!("lumen::vulkan", InvalidArgument, "unknown spatial index {:?}", index),
        };
        if entry.structure != vk::AccelerationStructureKHR::null() {
            lumen_bail!("lumen::vulkan", InvalidArgument, "spatial index already has memory bound");
        }

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(0)
            .size(size)
            .ty(index_level_to_vk(entry.descriptor.level()));
        let structure = unsafe {
            self.ctx
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| lumen_err!("lumen::vulkan", ResourceCreationFailed, "Failed to create acceleration structure: {:?}", e))?
        };
        entry.structure = structure;
        entry.memory = Some(memory);
        Ok(())
    }

    fn destroy_index(&mut self, index: IndexHandle) {
        self.indices.remove(index);
    }

    fn index_reference(&self, index: IndexHandle) -> Result<u64> {
        match self.indices.get(index) {
            Some(entry) if entry.built => Ok(entry.device_address()),
            Some(_) => lumen_bail!("lumen::vulkan", ResourceCreationFailed, "spatial index is not built yet"),
            None => lumen_bail!("lumen::vulkan", ResourceCreationFailed, "spatial index {:?} does not exist", index),
        }
    }
}

// ============================================================================
// PipelineBackend
// ============================================================================

impl PipelineBackend for VulkanGraphicsDevice {
    fn create_pipeline(&mut self, desc: &RayTracingPipelineDesc) -> Result<PipelineHandle> {
        if desc.max_recursion_depth > self.ctx.limits.max_ray_recursion_depth {
            lumen_bail!("lumen::vulkan", InvalidArgument, "recursion depth {} exceeds device limit {}",
                desc.max_recursion_depth, self.ctx.limits.max_ray_recursion_depth);
        }
        let entry_points = desc
            .stages
            .iter()
            .map(|stage| CString::new(stage.entry_point.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| lumen_err!("lumen::vulkan", InvalidArgument, "entry point contains a NUL byte"))?;

        let device = &self.ctx.device;
        unsafe {
            let mut modules = Vec::with_capacity(desc.stages.len());
            for stage in &desc.stages {
                let info = vk::ShaderModuleCreateInfo::default().code(&stage.code);
                match device.create_shader_module(&info, None) {
                    Ok(module) => modules.push(module),
                    Err(e) => {
                        for module in modules {
                            device.destroy_shader_module(module, None);
                        }
                        lumen_bail!("lumen::vulkan", ResourceCreationFailed,
                            "Failed to create shader module '{}': {:?}", stage.name, e);
                    }
                }
            }

            let stages: Vec<_> = desc
                .stages
                .iter()
                .zip(&modules)
                .zip(&entry_points)
                .map(|((stage, module), name)| {
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(shader_stage_to_vk(stage.stage))
                        .module(*module)
                        .name(name.as_c_str())
                })
                .collect();
            let groups: Vec<_> = desc.groups.iter().map(shader_group_to_vk).collect();

            let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&self.pipeline_set_layouts);
            let layout = device.create_pipeline_layout(&layout_info, None);

            let created = layout.map_err(|e| (Vec::new(), e)).and_then(|layout| {
                let info = vk::RayTracingPipelineCreateInfoKHR::default()
                    .stages(&stages)
                    .groups(&groups)
                    .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
                    .layout(layout);
                match self.ctx.ray_tracing_pipeline.create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[info],
                    None,
                ) {
                    Ok(pipelines) => Ok((pipelines, layout)),
                    Err((pipelines, e)) => {
                        device.destroy_pipeline_layout(layout, None);
                        Err((pipelines, e))
                    }
                }
            });

            for module in modules {
                device.destroy_shader_module(module, None);
            }

            let (pipeline, layout) = match created {
                Ok((pipelines, layout)) => match pipelines.into_iter().next() {
                    Some(pipeline) => (pipeline, layout),
                    None => {
                        device.destroy_pipeline_layout(layout, None);
                        lumen_bail!("lumen::vulkan", ResourceCreationFailed, "driver returned no pipeline for '{}'", desc.name);
                    }
                },
                Err((_, e)) => {
                    lumen_bail!("lumen::vulkan", ResourceCreationFailed,
                        "Failed to create ray tracing pipeline '{}': {:?}", desc.name, e);
                }
            };

            lumen_debug!("lumen::vulkan", "pipeline '{}' created ({} stages, {} groups)",
                desc.name, desc.stages.len(), desc.groups.len());
            Ok(self.pipelines.insert(Pipeline {
                pipeline,
                pipeline_layout: layout,
                group_count: desc.groups.len() as u32,
                device: device.clone(),
            }))
        }
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.trace_descriptor_sets.remove(pipeline);
        self.pipelines.remove(pipeline);
    }

    fn shader_group_handle_size(&self) -> u32 {
        self.ctx.limits.shader_group_handle_size
    }

    fn shader_group_handle_alignment(&self) -> u32 {
        self.ctx.limits.shader_group_handle_alignment
    }

    fn shader_group_base_alignment(&self) -> u32 {
        self.ctx.limits.shader_group_base_alignment
    }

    fn group_handles(&self, pipeline: PipelineHandle, first_group: u32, group_count: u32) -> Result<Vec<u8>> {
        let entry = match self.pipelines.get(pipeline) {
            Some(entry) => entry,
            None => lumen_bail!("lumen::vulkan", InvalidArgument, "unknown pipeline"),
        };
        if first_group.checked_add(group_count).map_or(true, |end| end > entry.group_count) {
            lumen_bail!("lumen::vulkan", OutOfRange, "groups {}..{} outside pipeline of {} groups",
                first_group, first_group.saturating_add(group_count), entry.group_count);
        }
        let data_size = (group_count * self.ctx.limits.shader_group_handle_size) as usize;
        unsafe {
            self.ctx
                .ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(entry.pipeline, first_group, group_count, data_size)
                .map_err(|e| lumen_err!("lumen::vulkan", "Failed to get shader group handles: {:?}", e))
        }
    }
}

impl Drop for VulkanGraphicsDevice {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.device_wait_idle().ok();

            // 1. Release submissions and every object holding the context
            let completed: Vec<_> = self.in_flight.drain(..).collect();
            for frame in completed {
                self.retire(frame);
            }
            self.trace_descriptor_sets.clear();
            self.pipelines.clear();
            self.indices.clear();
            self.buffers.clear();

            // 2. Destroy the command pool
            if let Ok(mut pool) = self.ctx.command_pool.lock() {
                if *pool != vk::CommandPool::null() {
                    self.ctx.device.destroy_command_pool(*pool, None);
                    *pool = vk::CommandPool::null();
                }
            }

            // 3. Drop allocator: free VkDeviceMemory pages BEFORE destroying device
            ManuallyDrop::drop(&mut self.allocator);
            if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
                ManuallyDrop::drop(&mut ctx.allocator);
            }

            // 4. Stop callbacks, then destroy the messenger BEFORE device and instance
            if self.ctx.debug_messenger.is_some() {
                crate::debug::log_validation_summary();
            }
            crate::debug::cleanup_debug_config();
            if let (Some(debug_utils), Some(messenger)) = (&self.ctx.debug_utils_loader, &self.ctx.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }

            // 5. Destroy device and instance
            self.ctx.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
