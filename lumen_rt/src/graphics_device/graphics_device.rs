/// GPU resource backend and the composite GraphicsDevice trait
///
/// A backend implements three traits: [`ResourceBackend`] (buffers and
/// submission), [`SpatialIndexBackend`] and [`PipelineBackend`]. Anything that
/// implements all three is a [`GraphicsDevice`]. The core only ever talks to
/// `dyn GraphicsDevice`, so the same scene code drives the Vulkan backend and
/// the host-side mock used by the unit tests.

use std::sync::{Arc, Mutex, MutexGuard};
use crate::error::Result;
use crate::lumen_err;
use super::buffer::{BufferDesc, BufferHandle};
use super::command_stream::CommandStream;
use super::pipeline::PipelineBackend;
use super::spatial_index::SpatialIndexBackend;

/// Identifies one submitted frame; signalled when the GPU finishes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameTicket(pub u64);

/// GPU resource backend
pub trait ResourceBackend {
    /// Allocate a buffer
    ///
    /// Fails with `OutOfMemory` or `ResourceCreationFailed`.
    fn allocate_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle>;

    /// Destroy a buffer; unknown handles are ignored
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Size of a live buffer
    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64>;

    /// Map, copy `data` at `offset`, unmap (host-visible buffers only)
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Map, read `size` bytes at `offset`, unmap (host-visible buffers only)
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Make host writes in a range visible to the device
    ///
    /// A no-op for coherent memory.
    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> Result<()>;

    /// Start a one-off command stream
    fn begin_single_shot(&mut self, label: &str) -> Result<CommandStream> {
        Ok(CommandStream::new(label))
    }

    /// Submit a stream and block until the GPU has executed it
    fn submit_and_wait(&mut self, commands: CommandStream) -> Result<()>;

    /// Submit a frame's stream without waiting
    fn submit_frame(&mut self, commands: CommandStream) -> Result<FrameTicket>;

    /// Block until a submitted frame completes, at most `timeout_ns`
    fn wait_frame(&mut self, ticket: FrameTicket, timeout_ns: u64) -> Result<()>;

    /// Block until all submitted work completes
    fn wait_idle(&mut self) -> Result<()>;
}

/// A complete ray tracing backend
pub trait GraphicsDevice: ResourceBackend + SpatialIndexBackend + PipelineBackend + Send {}

impl<T> GraphicsDevice for T where T: ResourceBackend + SpatialIndexBackend + PipelineBackend + Send {}

/// Shared device handle as held by the scene driver
pub type SharedGraphicsDevice = Arc<Mutex<dyn GraphicsDevice>>;

/// Lock a shared device, mapping poisoning to a backend error
pub fn lock_device(device: &SharedGraphicsDevice) -> Result<MutexGuard<'_, dyn GraphicsDevice + 'static>> {
    device
        .lock()
        .map_err(|_| lumen_err!("lumen::GraphicsDevice", "graphics device mutex poisoned"))
}
