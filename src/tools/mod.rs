//! Command adapter: the typed set of host operations the pipeline consumes.
//!
//! Each method is one atomic call that either succeeds or fails with a typed
//! [`Error`](crate::Error). [`HostTools`] is the production implementation;
//! tests use an in-memory simulation.

pub mod host;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};

use crate::error::Result;

pub use host::{HostTools, ToolPaths};

/// Filesystem type tag reported by `fstyp` for ISO 9660 media.
pub const FSTYPE_HSFS: &str = "hsfs";

/// Filesystem type tag reported by `fstyp` for UFS images.
pub const FSTYPE_UFS: &str = "ufs";

/// Host operations consumed by the pipeline and the merge engine.
pub trait CommandAdapter {
    /// Attach `file` as a loop device and return the device path.
    fn attach(&self, file: &Path) -> Result<PathBuf>;

    /// Detach a loop device previously returned by [`attach`](Self::attach).
    fn detach(&self, device: &Path) -> Result<()>;

    /// Report the filesystem type found on `device`.
    fn probe_type(&self, device: &Path) -> Result<String>;

    /// Run a filesystem consistency check (with repair) against `device`.
    fn check(&self, device: &Path) -> Result<()>;

    /// Mount `device` as `fstype` on `mount_point` with `options`.
    fn mount(&self, device: &Path, fstype: &str, mount_point: &Path, options: &[&str])
        -> Result<()>;

    /// Unmount whatever is mounted on `mount_point`.
    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Copy `from` onto `to`, descending into directories when `recursive`.
    fn copy(&self, from: &Path, to: &Path, recursive: bool) -> Result<()>;

    /// Move `from` to `to`.
    fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Decompress a compressed image file in place.
    fn decompress(&self, file: &Path) -> Result<()>;

    /// Compress an image file in place.
    fn recompress(&self, file: &Path) -> Result<()>;

    /// Set numeric ownership of `path`.
    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Set permission bits of `path`.
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;

    /// Pack a bootable image from `source_tree` into `output`, using
    /// `boot_image` (relative to the tree) as the El Torito boot file.
    fn pack_image(&self, source_tree: &Path, output: &Path, boot_image: &str) -> Result<()>;

    /// Create a directory (and its parents). Fails if `path` already exists.
    fn make_directory(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    fn remove_directory(&self, path: &Path) -> Result<()>;
}
