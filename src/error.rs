//! Error types for iso-merge.

use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::Stage;
use crate::tracker::ResourceHandle;

/// Result type alias using iso-merge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the adapter, tracker, merge engine and job loader.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing job input, detected before any resource is acquired.
    #[error("configuration error: {0}")]
    Config(String),

    /// A type probe reported something other than the expected filesystem.
    #[error("unexpected filesystem type on {}: expected {expected}, got {actual}", device.display())]
    UnexpectedFilesystemType {
        /// Probed device.
        device: PathBuf,
        /// Type the pipeline requires at this stage.
        expected: String,
        /// Type the probe returned.
        actual: String,
    },

    /// An external tool exited unsuccessfully or could not be started.
    #[error("{tool} failed: {message}")]
    ExternalTool {
        /// Tool name or path.
        tool: String,
        /// Exit status and captured output.
        message: String,
    },

    /// Copy, chown or chmod failed for one merge entry.
    #[error("merging {destination}: {source}")]
    MergeEntry {
        /// Destination path of the offending entry, as written in the job.
        destination: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Releasing a tracked resource failed.
    #[error("releasing {handle}: {source}")]
    ResourceRelease {
        /// The handle that could not be released.
        handle: ResourceHandle,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A forward release named a handle that is not the most recent one.
    #[error("out-of-order release: expected {expected}, tracker top is {}", top.as_ref().map(ToString::to_string).unwrap_or_else(|| "empty".to_string()))]
    OutOfOrderRelease {
        /// Handle the caller tried to release.
        expected: ResourceHandle,
        /// Handle currently on top of the tracker, if any.
        top: Option<ResourceHandle>,
    },

    /// A step needed a resource the tracker does not hold.
    #[error("resource not held: {0}")]
    NotHeld(String),

    /// The pipeline already failed and cannot advance.
    #[error("pipeline already failed at stage {0}")]
    Aborted(Stage),

    /// The executor was asked to run a stage that has no step.
    #[error("no step to execute for stage {0}")]
    NoStep(Stage),

    /// A merge destination reaches outside the target root through a
    /// symlink already present in the image.
    #[error("refusing to write {}: {} points outside {}", target.display(), link.display(), root.display())]
    OutsideRoot {
        /// Where the entry would have been written.
        target: PathBuf,
        /// The offending symlink.
        link: PathBuf,
        /// Root of the target tree.
        root: PathBuf,
    },

    /// Local filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an external tool failure.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Wrap a failure as belonging to one merge entry.
    pub fn merge_entry(destination: impl Into<String>, source: Error) -> Self {
        Self::MergeEntry {
            destination: destination.into(),
            source: Box::new(source),
        }
    }
}

/// Terminal failure of a pipeline run.
///
/// `source` is always the forward error that stopped the pipeline; failures
/// hit while unwinding are kept in `unwind` and never replace it.
#[derive(Error, Debug)]
#[error("stage {stage} failed: {source}")]
pub struct PipelineError {
    /// Stage whose step failed.
    pub stage: Stage,
    /// The forward error.
    #[source]
    pub source: Error,
    /// Release failures collected during unwind.
    pub unwind: Vec<Error>,
}
