/// Graphics device module - backend traits consumed by the ray tracing core

pub mod graphics_device;
pub mod buffer;
pub mod command_stream;
pub mod spatial_index;
pub mod pipeline;

pub use graphics_device::*;
pub use buffer::*;
pub use command_stream::*;
pub use spatial_index::*;
pub use pipeline::*;

// Mock graphics device for tests (no GPU required)
#[cfg(test)]
pub mod mock_graphics_device;
