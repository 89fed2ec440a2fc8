//! Disk image inspection and resizing via `qemu-img`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::binary::which_binary;
use crate::ExecutorError;

/// Sizes reported by `qemu-img info --output=json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Size the guest sees, in bytes.
    #[serde(rename = "virtual-size")]
    pub virtual_size_bytes: u64,

    /// Bytes allocated on the host.
    #[serde(rename = "actual-size", default)]
    pub actual_size_bytes: u64,
}

/// Disk image inspection and resizing.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait DiskImageTool: Send + Sync {
    /// Read the image's current sizes.
    ///
    /// # Errors
    /// Returns [`ExecutorError::DiskImage`] or [`ExecutorError::BinaryNotFound`]
    /// if the image cannot be inspected.
    async fn info(&self, image: &Path) -> Result<ImageInfo, ExecutorError>;

    /// Grow the image to `size_bytes`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::DiskImage`] or [`ExecutorError::BinaryNotFound`]
    /// if the resize fails.
    async fn resize(&self, image: &Path, size_bytes: u64) -> Result<(), ExecutorError>;
}

/// [`DiskImageTool`] backed by the `qemu-img` binary.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary_path: PathBuf,
}

impl QemuImg {
    /// Use the binary at `binary_path` (a bare name is looked up on `PATH`).
    #[must_use]
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    async fn run(&self, args: &[&OsStr]) -> Result<Vec<u8>, ExecutorError> {
        let binary = which_binary(&self.binary_path)?;
        let output = Command::new(&binary)
            .args(args)
            .output()
            .await
            .map_err(|e| ExecutorError::DiskImage(format!("exec {}: {e}", binary.display())))?;

        if !output.status.success() {
            return Err(ExecutorError::DiskImage(format!(
                "{} exited with {}: {}",
                binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new(PathBuf::from("qemu-img"))
    }
}

#[async_trait]
impl DiskImageTool for QemuImg {
    async fn info(&self, image: &Path) -> Result<ImageInfo, ExecutorError> {
        let stdout = self
            .run(&[OsStr::new("info"), OsStr::new("--output=json"), image.as_os_str()])
            .await?;
        parse_info(&stdout)
    }

    async fn resize(&self, image: &Path, size_bytes: u64) -> Result<(), ExecutorError> {
        let size = size_bytes.to_string();
        self.run(&[OsStr::new("resize"), image.as_os_str(), OsStr::new(&size)])
            .await?;
        Ok(())
    }
}

fn parse_info(stdout: &[u8]) -> Result<ImageInfo, ExecutorError> {
    serde_json::from_slice(stdout)
        .map_err(|e| ExecutorError::DiskImage(format!("parse qemu-img info output: {e}")))
}
