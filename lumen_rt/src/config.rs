/// Scene driver configuration

use crate::log::LogSeverity;

/// Configuration for a [`SceneDriver`](crate::scene::SceneDriver)
#[derive(Debug, Clone, PartialEq)]
pub struct SceneConfig {
    /// Update the top-level index in place when only transforms changed.
    /// When false every dirty frame rebuilds it.
    pub allow_refit: bool,
    /// Upper bound for waiting on the previous frame (nanoseconds)
    pub fence_timeout_ns: u64,
    /// Minimum log severity applied when the driver is created
    pub log_severity: Option<LogSeverity>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            allow_refit: true,
            fence_timeout_ns: 1_000_000_000,
            log_severity: None,
        }
    }
}
