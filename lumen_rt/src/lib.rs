/*!
# Lumen RT

Spatial index and dispatch table core for real-time ray traced scenes.

This crate holds the backend-independent part of the ray tracer: a two-level
bounding volume hierarchy over scene geometry and the byte-packed dispatch
table that selects the program run for every traced ray. GPU work goes
through the traits of [`lumen::device`]; the Vulkan implementation lives in
the `lumen_rt_backend_vulkan` crate.

## Architecture

- **GeometryStore**: meshes and analytic spheres, each with its bottom-level index
- **SceneInstanceTable**: ordered placements of geometry
- **TopLevelIndex**: index over the instances, built once and refit per frame
- **DispatchTable**: ray generation, miss, callable and hit-group records
- **SceneDriver**: per-frame state machine tying the above together
*/

// Internal modules
mod error;
mod runtime;
mod config;
pub mod log;
pub mod graphics_device;
pub mod accel;
pub mod dispatch;
pub mod resource;
pub mod scene;

// Main lumen namespace module
pub mod lumen {
    // Error types
    pub use crate::error::{Error, Result};

    // Logging facade
    pub use crate::runtime::Lumen;

    pub use crate::config::SceneConfig;

    // Logging sub-module (types only, macros are exported at the crate root)
    pub mod log {
        pub use crate::log::{Logger, LogEntry, LogSeverity, DefaultLogger};
    }

    // Backend traits and command recording
    pub mod device {
        pub use crate::graphics_device::*;
    }

    pub mod accel {
        pub use crate::accel::*;
    }

    pub mod dispatch {
        pub use crate::dispatch::*;
    }

    pub mod resource {
        pub use crate::resource::*;
    }

    pub mod scene {
        pub use crate::scene::*;
    }
}

// Re-export math library at crate root
pub use glam;
