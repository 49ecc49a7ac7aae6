//! Job specification: what to rebuild and which files to merge.
//!
//! Jobs arrive as JSON (on stdin or from a file) or as TOML (files ending in
//! `.toml`). Field names follow the camelCase job format; the older
//! lowercase names (`workdir`, `inputiso`, `mergefiles`, `src`, `perms`) are
//! accepted as aliases.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use super::paths::ImageLayout;
use crate::error::{Error, Result};
use crate::merge::{normalize_destination, FileMode, Identity, MergeEntry};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct JobInput {
    #[serde(alias = "workdir")]
    work_directory: PathBuf,
    #[serde(alias = "inputiso")]
    input_image_path: PathBuf,
    output_image_path: Option<PathBuf>,
    layout: Option<ImageLayout>,
    #[serde(alias = "mergefiles")]
    merge_files: BTreeMap<String, MergeFileInput>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct MergeFileInput {
    #[serde(alias = "src")]
    source_path: PathBuf,
    owner: Identity,
    group: Identity,
    #[serde(alias = "perms")]
    mode: FileMode,
}

/// Validated, immutable job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub work_directory: PathBuf,
    pub input_image: PathBuf,
    pub output_image: Option<PathBuf>,
    pub layout: ImageLayout,
    /// Entries keyed by normalised destination path.
    pub entries: BTreeMap<String, MergeEntry>,
}

impl JobSpec {
    /// Parse a JSON job from a reader (typically stdin).
    pub fn from_json_reader(mut reader: impl Read) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| Error::config(format!("reading job: {e}")))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let input: JobInput = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("config parse error: {e}")))?;
        Self::from_input(input)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let input: JobInput = toml::from_str(text)
            .map_err(|e| Error::config(format!("config parse error: {e}")))?;
        Self::from_input(input)
    }

    /// Load a job file; `.toml` files are TOML, anything else JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading job '{}': {e}", path.display())))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml_str(&text)
        } else {
            Self::from_json_str(&text)
        }
    }

    fn from_input(mut input: JobInput) -> Result<Self> {
        require_absolute(&input.work_directory, "workDirectory")?;
        require_absolute(&input.input_image_path, "inputImagePath")?;
        input.work_directory = normalize_absolute(&input.work_directory);
        input.input_image_path = normalize_absolute(&input.input_image_path);
        if let Some(output) = &mut input.output_image_path {
            require_absolute(output, "outputImagePath")?;
            *output = normalize_absolute(output);
            if output.starts_with(input.work_directory.join("isounpack")) {
                return Err(Error::config(format!(
                    "outputImagePath '{}' must not be inside the unpacked image",
                    output.display()
                )));
            }
        }

        let layout = input.layout.unwrap_or_default();
        layout.validate()?;

        let mut entries = BTreeMap::new();
        for (raw, file) in input.merge_files {
            let destination = normalize_destination(&raw).map_err(Error::config)?;
            require_absolute(&file.source_path, &format!("mergeFiles[{raw}].sourcePath"))?;
            let entry = MergeEntry {
                source: file.source_path,
                destination: destination.clone(),
                owner: file.owner,
                group: file.group,
                mode: file.mode,
            };
            if entries.insert(destination.clone(), entry).is_some() {
                return Err(Error::config(format!(
                    "duplicate merge destination '{destination}'"
                )));
            }
        }

        Ok(Self {
            work_directory: input.work_directory,
            input_image: input.input_image_path,
            output_image: input.output_image_path,
            layout,
            entries,
        })
    }
}

/// Resolve `.` and `..` lexically; `..` at the root stays at the root.
fn normalize_absolute(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn require_absolute(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::config(format!("{field} must not be empty")));
    }
    if !path.is_absolute() {
        return Err(Error::config(format!(
            "{field} must be absolute, got '{}'",
            path.display()
        )));
    }
    Ok(())
}
