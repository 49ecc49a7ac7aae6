//! Preflight checks run before anything is acquired.
//!
//! A job that fails here leaves no trace on the host: no workspace, no loop
//! device, no mount. Every failure is an [`Error::Config`].

use std::path::Path;

use crate::error::{Error, Result};
use crate::pipeline::JobSpec;
use crate::process;
use crate::tools::ToolPaths;

/// Check that every configured host tool can be found.
///
/// Reports all missing tools at once.
pub fn check_required_tools(paths: &ToolPaths) -> Result<()> {
    let missing: Vec<_> = paths
        .required()
        .into_iter()
        .filter(|(tool, _)| !process::exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(tool, hint)| format!("  {} (provides: {})", tool.display(), hint))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::config(format!("missing required host tools:\n{msg}")));
    }
    Ok(())
}

/// Loop devices and mounts need an effective uid of 0.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::config(format!(
            "must run as root (effective uid is {euid})"
        )));
    }
    Ok(())
}

/// Validate the job against the host filesystem.
pub fn check_inputs(job: &JobSpec) -> Result<()> {
    if !job.input_image.is_file() {
        return Err(Error::config(format!(
            "input image {} is not a regular file",
            job.input_image.display()
        )));
    }

    let missing: Vec<_> = job
        .entries
        .values()
        .filter(|entry| !entry.source.is_file())
        .map(|entry| format!("  {} -> {}", entry.source.display(), entry.destination))
        .collect();
    if !missing.is_empty() {
        return Err(Error::config(format!(
            "merge sources not found:\n{}",
            missing.join("\n")
        )));
    }

    if job.work_directory.exists() {
        return Err(Error::config(format!(
            "work directory {} already exists",
            job.work_directory.display()
        )));
    }

    if let Some(output) = &job.output_image {
        let parent = output.parent().unwrap_or(Path::new("/"));
        // The first stage creates the work directory itself.
        if parent != job.work_directory.as_path() && !parent.is_dir() {
            return Err(Error::config(format!(
                "output directory {} does not exist",
                parent.display()
            )));
        }
    }
    Ok(())
}

/// All checks, tools first.
pub fn check_all(paths: &ToolPaths, job: &JobSpec) -> Result<()> {
    check_required_tools(paths)?;
    check_root()?;
    check_inputs(job)
}
