//! External binary lookup.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::ExecutorError;

/// Resolve a binary either at the given path or on `PATH`.
///
/// A path with more than one component is checked as-is; a bare name is
/// searched for in every `PATH` entry.
///
/// # Errors
/// Returns [`ExecutorError::BinaryNotFound`] if no executable file exists.
pub fn which_binary(path: &Path) -> Result<PathBuf, ExecutorError> {
    if path.is_absolute() || path.components().count() > 1 {
        if is_executable(path) {
            return Ok(path.to_owned());
        }
        return Err(ExecutorError::BinaryNotFound { path: path.to_owned() });
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(path))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| ExecutorError::BinaryNotFound { path: path.to_owned() })
}

/// A regular file with at least one execute bit set.
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}
