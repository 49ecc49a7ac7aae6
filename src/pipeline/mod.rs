//! Pipeline executor.
//!
//! Drives the rebuild as an explicit state machine over [`Stage`]. Every
//! step either completes and moves the pipeline to the next stage, or fails;
//! a failure stops forward progress, unwinds everything the
//! [`ResourceTracker`] still holds (newest first), and surfaces the original
//! error together with any unwind failures.
//!
//! Resources are acquired so that the forward path can always release in
//! strict LIFO order: a mount directory is created before the device that
//! will be mounted on it is attached.
//!
//! ```text
//! outer ISO ──attach/mount ro──▶ iso/ ──cp -r──▶ isounpack/
//!                                                    │
//!                              boot_archive ◀────────┘
//!                                    │ attach, fsck, mount rw
//!                                    ▼
//!                                  root/ ── usr.lgz ──mv, uncompress──▶ tmpusr.lgz
//!                                    │                                      │
//!                                    └── usr/ ◀──── attach, fsck, mount rw ─┘
//!                                         merge files into root/
//! ```

pub mod config;
pub mod paths;
mod stage;

use std::path::{Path, PathBuf};

pub use config::JobSpec;
pub use paths::{ImageLayout, WorkPaths};
pub use stage::Stage;

use crate::checksum;
use crate::error::{Error, PipelineError, Result};
use crate::merge;
use crate::tools::{CommandAdapter, FSTYPE_HSFS, FSTYPE_UFS};
use crate::tracker::{ResourceHandle, ResourceTracker};

/// Mount options for the outer image.
const OUTER_MOUNT_OPTIONS: &[&str] = &["ro"];

/// Mount options for the writable UFS images.
const UFS_MOUNT_OPTIONS: &[&str] = &["rw", "nologging"];

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub output: PathBuf,
    /// Number of merge entries applied.
    pub merged: usize,
    pub checksum: Option<PathBuf>,
}

/// One rebuild of one job.
pub struct Pipeline<'a, A: CommandAdapter> {
    tools: &'a A,
    job: &'a JobSpec,
    paths: WorkPaths,
    tracker: ResourceTracker,
    stage: Stage,
    failed_at: Option<Stage>,
    merged: usize,
    write_checksum: bool,
    checksum: Option<PathBuf>,
}

impl<'a, A: CommandAdapter> Pipeline<'a, A> {
    pub fn new(tools: &'a A, job: &'a JobSpec) -> Self {
        let paths = WorkPaths::new(&job.work_directory, &job.layout, job.output_image.as_deref());
        Self {
            tools,
            job,
            paths,
            tracker: ResourceTracker::new(),
            stage: Stage::Pending,
            failed_at: None,
            merged: 0,
            write_checksum: false,
            checksum: None,
        }
    }

    /// Write `<output>.sha256` after packing.
    pub fn write_checksum(mut self, enabled: bool) -> Self {
        self.write_checksum = enabled;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Stage whose step failed, once the pipeline is [`Stage::Failed`].
    pub fn failed_at(&self) -> Option<Stage> {
        self.failed_at
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn paths(&self) -> &WorkPaths {
        &self.paths
    }

    /// Run until [`Stage::Done`] or the first failure.
    pub fn run(mut self) -> std::result::Result<RunReport, PipelineError> {
        while self.advance()? != Stage::Done {}
        Ok(RunReport {
            output: self.paths.output.clone(),
            merged: self.merged,
            checksum: self.checksum.clone(),
        })
    }

    /// Execute the next step and return the stage reached.
    ///
    /// A failing step leaves the pipeline in [`Stage::Failed`] with nothing
    /// held. Advancing a failed pipeline is an error; advancing a finished
    /// one returns [`Stage::Done`] again.
    pub fn advance(&mut self) -> std::result::Result<Stage, PipelineError> {
        if let Some(at) = self.failed_at {
            return Err(PipelineError {
                stage: at,
                source: Error::Aborted(at),
                unwind: Vec::new(),
            });
        }
        let Some(next) = self.stage.next() else {
            return Ok(self.stage);
        };

        if next == Stage::Done {
            debug_assert!(self.tracker.is_empty(), "resources leaked on success");
            self.stage = Stage::Done;
            tracing::info!(output = %self.paths.output.display(), "done");
            return Ok(Stage::Done);
        }

        let span = tracing::info_span!("stage", stage = %next);
        let _entered = span.enter();
        match self.execute(next) {
            Ok(()) => {
                self.stage = next;
                tracing::debug!(held = self.tracker.len(), "stage complete");
                Ok(next)
            }
            Err(source) => Err(self.fail(next, source)),
        }
    }

    fn fail(&mut self, stage: Stage, source: Error) -> PipelineError {
        tracing::error!(error = %source, held = self.tracker.len(), "step failed, unwinding");
        let unwind = self.tracker.release_all(self.tools);
        if !unwind.is_empty() {
            tracing::warn!(failures = unwind.len(), "unwind incomplete");
        }
        self.stage = Stage::Failed;
        self.failed_at = Some(stage);
        PipelineError {
            stage,
            source,
            unwind,
        }
    }

    fn execute(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::WorkspaceCreated => self.tools.make_directory(&self.paths.workspace),
            Stage::OuterImageAttached => {
                let input = self.job.input_image.clone();
                self.attach_and_probe(&input, FSTYPE_HSFS).map(|_| ())
            }
            Stage::OuterImageMounted => self.mount_outer(),
            Stage::OuterImageCopied => {
                self.tools
                    .copy(&self.paths.outer_mount, &self.paths.unpack, true)
            }
            Stage::OuterImageReleased => self.release_outer(),
            Stage::ArchiveAttached => self.attach_archive(),
            Stage::ArchiveChecked => {
                let device = self.held_device(&self.paths.archive)?;
                self.tools.check(&device)
            }
            Stage::ArchiveMounted => {
                let device = self.held_device(&self.paths.archive)?;
                let root = self.paths.archive_root.clone();
                self.mount(&device, FSTYPE_UFS, root, UFS_MOUNT_OPTIONS)
            }
            Stage::SecondaryImageStaged => self.stage_secondary(),
            Stage::SecondaryImageAttached => {
                let staged = self.paths.secondary_staged.clone();
                self.attach_and_probe(&staged, FSTYPE_UFS).map(|_| ())
            }
            Stage::SecondaryImageMounted => {
                let device = self.held_device(&self.paths.secondary_staged)?;
                self.tools.check(&device)?;
                let mount_point = self.paths.secondary_mount.clone();
                self.mount(&device, FSTYPE_UFS, mount_point, UFS_MOUNT_OPTIONS)
            }
            Stage::FilesMerged => {
                // The secondary image is mounted beneath the archive root, so
                // destinations resolve across both filesystems.
                self.merged = merge::merge_files(
                    self.tools,
                    &self.paths.archive_root,
                    self.job.entries.values(),
                )?;
                Ok(())
            }
            Stage::SecondaryImageReleased => self.release_secondary(),
            Stage::SecondaryImageRecompressed => {
                let staged = self.paths.secondary_staged.clone();
                self.release(ResourceHandle::Decompressed {
                    path: staged.clone(),
                })?;
                self.release(ResourceHandle::Relocated {
                    original: self.paths.secondary_home.clone(),
                    staged,
                })
            }
            Stage::ArchiveReleased => self.release_archive(),
            Stage::ImageRepacked => self.repack(),
            Stage::Pending | Stage::Done | Stage::Failed => Err(Error::NoStep(stage)),
        }
    }

    fn mount_outer(&mut self) -> Result<()> {
        let device = self.held_device(&self.job.input_image)?;
        let mount_point = self.paths.outer_mount.clone();
        self.make_mount_directory(mount_point.clone())?;
        self.mount(&device, FSTYPE_HSFS, mount_point, OUTER_MOUNT_OPTIONS)
    }

    /// The copy is durable, so the outer mount, its directory and the device
    /// all go together.
    fn release_outer(&mut self) -> Result<()> {
        let device = self.held_device_handle(&self.job.input_image)?;
        let mount_point = self.paths.outer_mount.clone();
        self.release(ResourceHandle::Mount {
            mount_point: mount_point.clone(),
        })?;
        self.release(ResourceHandle::Directory { path: mount_point })?;
        self.release(device)
    }

    fn attach_archive(&mut self) -> Result<()> {
        let root = self.paths.archive_root.clone();
        let archive = self.paths.archive.clone();
        self.make_mount_directory(root)?;
        self.attach_and_probe(&archive, FSTYPE_UFS).map(|_| ())
    }

    fn stage_secondary(&mut self) -> Result<()> {
        let home = self.paths.secondary_home.clone();
        let staged = self.paths.secondary_staged.clone();

        self.tools.move_file(&home, &staged)?;
        self.tracker.acquire(ResourceHandle::Relocated {
            original: home,
            staged: staged.clone(),
        });
        self.tools.decompress(&staged)?;
        self.tracker
            .acquire(ResourceHandle::Decompressed { path: staged });
        Ok(())
    }

    /// Unmount, re-check to catch damage done while mounted, detach.
    fn release_secondary(&mut self) -> Result<()> {
        let device = self.held_device_handle(&self.paths.secondary_staged)?;
        self.release(ResourceHandle::Mount {
            mount_point: self.paths.secondary_mount.clone(),
        })?;
        self.check_handle(&device)?;
        self.release(device)
    }

    fn release_archive(&mut self) -> Result<()> {
        let device = self.held_device_handle(&self.paths.archive)?;
        let root = self.paths.archive_root.clone();
        self.release(ResourceHandle::Mount {
            mount_point: root.clone(),
        })?;
        self.check_handle(&device)?;
        self.release(device)?;
        self.release(ResourceHandle::Directory { path: root })
    }

    fn repack(&mut self) -> Result<()> {
        self.tools.pack_image(
            &self.paths.unpack,
            &self.paths.output,
            &self.job.layout.boot_image,
        )?;
        if self.write_checksum {
            self.checksum = Some(checksum::write_sha256(&self.paths.output)?);
        }
        Ok(())
    }

    fn attach_and_probe(&mut self, file: &Path, expected: &str) -> Result<PathBuf> {
        let device = self.tools.attach(file)?;
        self.tracker.acquire(ResourceHandle::LoopDevice {
            device: device.clone(),
            backing_file: file.to_path_buf(),
        });

        let actual = self.tools.probe_type(&device)?;
        if actual != expected {
            return Err(Error::UnexpectedFilesystemType {
                device,
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(device)
    }

    fn make_mount_directory(&mut self, path: PathBuf) -> Result<()> {
        self.tools.make_directory(&path)?;
        self.tracker.acquire(ResourceHandle::Directory { path });
        Ok(())
    }

    fn mount(
        &mut self,
        device: &Path,
        fstype: &str,
        mount_point: PathBuf,
        options: &[&str],
    ) -> Result<()> {
        self.tools.mount(device, fstype, &mount_point, options)?;
        self.tracker.acquire(ResourceHandle::Mount { mount_point });
        Ok(())
    }

    fn release(&mut self, handle: ResourceHandle) -> Result<()> {
        self.tracker.release(self.tools, &handle)
    }

    fn check_handle(&self, handle: &ResourceHandle) -> Result<()> {
        match handle {
            ResourceHandle::LoopDevice { device, .. } => self.tools.check(device),
            other => Err(Error::NotHeld(format!("{other} is not a loop device"))),
        }
    }

    fn held_device_handle(&self, backing_file: &Path) -> Result<ResourceHandle> {
        self.tracker
            .loop_device(backing_file)
            .cloned()
            .ok_or_else(|| {
                Error::NotHeld(format!("loop device for {}", backing_file.display()))
            })
    }

    fn held_device(&self, backing_file: &Path) -> Result<PathBuf> {
        match self.held_device_handle(backing_file)? {
            ResourceHandle::LoopDevice { device, .. } => Ok(device),
            other => Err(Error::NotHeld(format!("{other} is not a loop device"))),
        }
    }
}
