//! Error types for the Lumen ray-tracing core
//!
//! Every fallible operation of the index builders, the dispatch table and the
//! scene driver returns [`Result`]. Variants map onto three families:
//! resource creation failures (backend could not allocate or create),
//! programmer errors (invalid argument, out of range) and backend faults.

use std::fmt;

/// Result type for Lumen operations
pub type Result<T> = std::result::Result<T, Error>;

/// Lumen errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The backend could not create a buffer, index structure or pipeline
    ResourceCreationFailed(String),

    /// Out of GPU memory (a resource creation failure)
    OutOfMemory,

    /// Caller violated a precondition (oversized payload, topology mismatch, ...)
    InvalidArgument(String),

    /// Entry or element index outside the registered bounds
    OutOfRange(String),

    /// Backend-specific failure (submit, fence wait, device lost)
    BackendError(String),

    /// Backend bring-up failed
    InitializationFailed(String),
}

impl Error {
    /// True for failures to allocate or create a backend object.
    pub fn is_resource_creation(&self) -> bool {
        matches!(self, Error::ResourceCreationFailed(_) | Error::OutOfMemory)
    }

    /// True for precondition violations that validation should have caught.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, Error::InvalidArgument(_) | Error::OutOfRange(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceCreationFailed(msg) => write!(f, "Resource creation failed: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::OutOfRange(msg) => write!(f, "Out of range: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
