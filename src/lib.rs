//! Rebuild a bootable illumos ISO with extra files merged into its
//! filesystems.
//!
//! The image nests three filesystems: the ISO itself (hsfs), the UFS
//! `boot_archive` inside it, and a compressed UFS `usr.lgz` inside the
//! archive. A job unpacks all three, copies its merge entries into the
//! combined tree with the requested ownership and mode, then puts everything
//! back and packs a new ISO.
//!
//! - **Command adapter** - typed host operations ([`tools`])
//! - **Resource tracker** - ordered record of everything held ([`tracker`])
//! - **Merge engine** - copy, chown, chmod per entry ([`merge`])
//! - **Pipeline** - the stage machine driving a job ([`pipeline`])
//! - **Preflight checks** - host and input validation ([`preflight`])
//!
//! # Example
//!
//! ```rust,ignore
//! use iso_merge::{HostTools, JobSpec, Pipeline, ToolPaths};
//!
//! let job = JobSpec::load("job.json".as_ref())?;
//! let tools = HostTools::new(ToolPaths::default());
//! let report = Pipeline::new(&tools, &job).run()?;
//! println!("wrote {}", report.output.display());
//! ```

pub mod checksum;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod tools;
pub mod tracker;

pub use error::{Error, PipelineError, Result};
pub use merge::{FileMode, Identity, MergeEntry};
pub use pipeline::{ImageLayout, JobSpec, Pipeline, RunReport, Stage, WorkPaths};
pub use tools::{CommandAdapter, HostTools, ToolPaths};
pub use tracker::{ResourceHandle, ResourceTracker};
