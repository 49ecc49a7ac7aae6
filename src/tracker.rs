//! Resource tracker: the single owner of everything the pipeline holds.
//!
//! Handles are appended as they are acquired. The forward path releases them
//! one at a time in strict LIFO order through [`ResourceTracker::release`];
//! the failure path drains whatever is left with
//! [`ResourceTracker::release_all`].

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tools::CommandAdapter;

/// Something acquired on behalf of the job, with what it takes to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceHandle {
    /// Attached loop device; released by detaching it.
    LoopDevice {
        device: PathBuf,
        backing_file: PathBuf,
    },
    /// Mounted filesystem; released by unmounting it.
    Mount { mount_point: PathBuf },
    /// Directory created for a mount; released by removing it.
    Directory { path: PathBuf },
    /// File moved out of its home; released by moving it back.
    Relocated { original: PathBuf, staged: PathBuf },
    /// Image decompressed in place; released by recompressing it.
    Decompressed { path: PathBuf },
}

impl ResourceHandle {
    fn release(&self, tools: &dyn CommandAdapter) -> Result<()> {
        match self {
            Self::LoopDevice { device, .. } => tools.detach(device),
            Self::Mount { mount_point } => tools.unmount(mount_point),
            Self::Directory { path } => tools.remove_directory(path),
            Self::Relocated { original, staged } => tools.move_file(staged, original),
            Self::Decompressed { path } => tools.recompress(path),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoopDevice {
                device,
                backing_file,
            } => write!(
                f,
                "loop device {} ({})",
                device.display(),
                backing_file.display()
            ),
            Self::Mount { mount_point } => write!(f, "mount {}", mount_point.display()),
            Self::Directory { path } => write!(f, "directory {}", path.display()),
            Self::Relocated { original, staged } => write!(
                f,
                "relocated {} -> {}",
                original.display(),
                staged.display()
            ),
            Self::Decompressed { path } => write!(f, "decompressed {}", path.display()),
        }
    }
}

/// Ordered record of held resources.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    held: Vec<ResourceHandle>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly acquired resource.
    pub fn acquire(&mut self, handle: ResourceHandle) -> &ResourceHandle {
        tracing::debug!(%handle, depth = self.held.len() + 1, "acquired");
        self.held.push(handle);
        &self.held[self.held.len() - 1]
    }

    /// Release the most recently acquired resource, which must be `expected`.
    ///
    /// On failure the handle stays tracked, so a later unwind retries it.
    pub fn release(&mut self, tools: &dyn CommandAdapter, expected: &ResourceHandle) -> Result<()> {
        match self.held.last() {
            Some(top) if top == expected => {}
            top => {
                return Err(Error::OutOfOrderRelease {
                    expected: expected.clone(),
                    top: top.cloned(),
                })
            }
        }

        expected.release(tools).map_err(|e| Error::ResourceRelease {
            handle: expected.clone(),
            source: Box::new(e),
        })?;
        self.held.pop();
        tracing::debug!(handle = %expected, depth = self.held.len(), "released");
        Ok(())
    }

    /// Release everything still held, newest first.
    ///
    /// Keeps going past individual failures and returns them all. The tracker
    /// is empty afterwards, so a second call does nothing.
    pub fn release_all(&mut self, tools: &dyn CommandAdapter) -> Vec<Error> {
        let mut failures = Vec::new();
        while let Some(handle) = self.held.pop() {
            match handle.release(tools) {
                Ok(()) => tracing::info!(%handle, "unwound"),
                Err(e) => {
                    tracing::warn!(%handle, error = %e, "unwind step failed");
                    failures.push(Error::ResourceRelease {
                        handle,
                        source: Box::new(e),
                    });
                }
            }
        }
        failures
    }

    /// The loop device currently attached for `backing_file`, if any.
    pub fn loop_device(&self, backing_file: &Path) -> Option<&ResourceHandle> {
        self.held.iter().rev().find(|h| {
            matches!(h, ResourceHandle::LoopDevice { backing_file: b, .. } if b == backing_file)
        })
    }

    pub fn held(&self) -> &[ResourceHandle] {
        &self.held
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeTools;

    fn dir(path: &str) -> ResourceHandle {
        ResourceHandle::Directory { path: path.into() }
    }

    #[test]
    fn test_release_all_is_reverse_order() {
        let tools = FakeTools::new();
        let mut tracker = ResourceTracker::new();

        tools.make_directory(Path::new("/w/mnt")).unwrap();
        tracker.acquire(dir("/w/mnt"));
        let device = tools.attach(Path::new("/w/boot_archive")).unwrap();
        tracker.acquire(ResourceHandle::LoopDevice {
            device: device.clone(),
            backing_file: "/w/boot_archive".into(),
        });
        tools
            .mount(&device, "ufs", Path::new("/w/mnt"), &["rw"])
            .unwrap();
        tracker.acquire(ResourceHandle::Mount {
            mount_point: "/w/mnt".into(),
        });

        let failures = tracker.release_all(&tools);
        assert!(failures.is_empty(), "{failures:?}");
        assert!(tracker.is_empty());

        let ops = tools.ops();
        let tail: Vec<_> = ops[ops.len() - 3..].to_vec();
        assert_eq!(tail, vec!["unmount /w/mnt", "detach /dev/lofi/1", "rmdir /w/mnt"]);
        assert!(tools.attached_devices().is_empty());
        assert!(tools.mounted().is_empty());
    }

    #[test]
    fn test_release_all_continues_past_failures() {
        let tools = FakeTools::new().failing("rmdir", "/w/b");
        let mut tracker = ResourceTracker::new();
        for path in ["/w/a", "/w/b", "/w/c"] {
            tools.make_directory(Path::new(path)).unwrap();
            tracker.acquire(dir(path));
        }

        let failures = tracker.release_all(&tools);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("/w/b"));
        assert_eq!(tools.directories(), vec![PathBuf::from("/w/b")]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_release_all_twice_is_noop() {
        let tools = FakeTools::new();
        let mut tracker = ResourceTracker::new();
        tools.make_directory(Path::new("/w/a")).unwrap();
        tracker.acquire(dir("/w/a"));

        assert!(tracker.release_all(&tools).is_empty());
        let ops_after_first = tools.ops().len();
        assert!(tracker.release_all(&tools).is_empty());
        assert_eq!(tools.ops().len(), ops_after_first);
    }

    #[test]
    fn test_release_rejects_out_of_order() {
        let tools = FakeTools::new();
        let mut tracker = ResourceTracker::new();
        tools.make_directory(Path::new("/w/a")).unwrap();
        tools.make_directory(Path::new("/w/b")).unwrap();
        tracker.acquire(dir("/w/a"));
        tracker.acquire(dir("/w/b"));

        let err = tracker.release(&tools, &dir("/w/a")).unwrap_err();
        assert!(matches!(err, Error::OutOfOrderRelease { .. }));
        assert_eq!(tracker.len(), 2);

        tracker.release(&tools, &dir("/w/b")).unwrap();
        tracker.release(&tools, &dir("/w/a")).unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_failed_release_keeps_handle() {
        let tools = FakeTools::new().failing("unmount", "/w/mnt");
        let mut tracker = ResourceTracker::new();
        let mount = ResourceHandle::Mount {
            mount_point: "/w/mnt".into(),
        };
        tracker.acquire(mount.clone());

        let err = tracker.release(&tools, &mount).unwrap_err();
        assert!(matches!(err, Error::ResourceRelease { .. }));
        assert_eq!(tracker.held(), &[mount]);
    }

    #[test]
    fn test_relocated_and_decompressed_release() {
        let tools = FakeTools::new();
        let mut tracker = ResourceTracker::new();
        tracker.acquire(ResourceHandle::Relocated {
            original: "/w/root/usr.lgz".into(),
            staged: "/w/tmpusr.lgz".into(),
        });
        tools.decompress(Path::new("/w/tmpusr.lgz")).unwrap();
        tracker.acquire(ResourceHandle::Decompressed {
            path: "/w/tmpusr.lgz".into(),
        });

        assert!(tracker.release_all(&tools).is_empty());
        let ops = tools.ops();
        assert_eq!(
            &ops[ops.len() - 2..],
            &["recompress /w/tmpusr.lgz", "move /w/tmpusr.lgz"]
        );
        assert!(tools.decompressed().is_empty());
    }
}
