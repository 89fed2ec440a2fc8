//! Error types for the executor crate.

use std::path::PathBuf;

use qvm_core::CoreError;

/// Errors that can occur while compiling, launching or supervising an instance.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// A required external binary is not on `PATH` or at the given path.
    #[error("{} is not available; please install it", path.display())]
    BinaryNotFound { path: PathBuf },

    /// The instance configuration is invalid or contradictory.
    #[error("invalid configuration for '{field}': {reason}")]
    Config { field: &'static str, reason: String },

    /// The cloud-init ISO authoring tool failed.
    #[error("{tool} failed: {diagnostic}")]
    ImageBuild { tool: String, diagnostic: String },

    /// Inspecting or resizing the disk image failed.
    #[error("disk image operation failed: {0}")]
    DiskImage(String),

    /// The hypervisor process could not be started.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The target process of a stop or attach no longer exists.
    #[error("process {pid} not found: {reason}")]
    ProcessLookup { pid: u32, reason: String },

    /// A core value failed validation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }
}
