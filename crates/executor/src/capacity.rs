//! Free-space probing and target directory checks.

use std::fs;
use std::path::Path;

use batchpull_model::format_size;
use tracing::debug;

use crate::ExecutorError;

/// Minimum free space a download directory must offer before anything starts.
pub const MIN_TARGET_FREE_SPACE: u64 = 100 * 1024 * 1024;

/// Reports bytes available to an unprivileged writer at a path.
pub trait CapacityProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64, ExecutorError>;
}

/// `statvfs(3)` on the nearest existing ancestor of the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl CapacityProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64, ExecutorError> {
        let existing = path.ancestors().find(|p| p.exists()).ok_or_else(|| {
            ExecutorError::Capacity(format!("no existing ancestor of {}", path.display()))
        })?;
        let available = free_space(existing)?;
        debug!(
            path = %existing.display(),
            available = %format_size(available),
            "probed free space"
        );
        Ok(available)
    }
}

#[cfg(unix)]
fn free_space(path: &Path) -> Result<u64, ExecutorError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| ExecutorError::Capacity(format!("statvfs {}: {e}", path.display())))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_space(path: &Path) -> Result<u64, ExecutorError> {
    Err(ExecutorError::Capacity(format!(
        "free-space probing is not supported on this platform ({})",
        path.display()
    )))
}

/// Reports a fixed figure. Used for dry runs and when the operator states
/// the capacity of removable media explicitly.
#[derive(Debug, Clone, Copy)]
pub struct FixedCapacity(pub u64);

impl CapacityProbe for FixedCapacity {
    fn available_bytes(&self, _path: &Path) -> Result<u64, ExecutorError> {
        Ok(self.0)
    }
}

/// Creates the download directory if needed and checks that it is a
/// writable directory with at least `min_free` bytes available.
///
/// Returns the available space.
pub fn validate_download_dir(
    path: &Path,
    probe: &dyn CapacityProbe,
    min_free: u64,
) -> Result<u64, ExecutorError> {
    fs::create_dir_all(path).map_err(|e| {
        ExecutorError::InvalidTarget(format!("cannot create {}: {e}", path.display()))
    })?;
    if !path.is_dir() {
        return Err(ExecutorError::InvalidTarget(format!(
            "{} is not a directory",
            path.display()
        )));
    }

    let marker = path.join(".batchpull_write_test");
    fs::write(&marker, b"").map_err(|e| {
        ExecutorError::InvalidTarget(format!("{} is not writable: {e}", path.display()))
    })?;
    let _ = fs::remove_file(&marker);

    let available = probe.available_bytes(path)?;
    if available < min_free {
        return Err(ExecutorError::InvalidTarget(format!(
            "only {} free at {}, need at least {}",
            format_size(available),
            path.display(),
            format_size(min_free)
        )));
    }
    Ok(available)
}
