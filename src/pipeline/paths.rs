//! Where things live inside the workspace and inside the unpacked image.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Locations inside the image being rebuilt, relative to the tree that
/// contains them. Defaults describe a SmartOS platform ISO.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ImageLayout {
    /// Boot archive, relative to the unpacked outer image.
    pub boot_archive: String,
    /// Compressed secondary image, relative to the archive root.
    pub secondary_image: String,
    /// Mount point of the secondary image, relative to the archive root.
    pub secondary_mount: String,
    /// El Torito boot file, relative to the unpacked outer image.
    pub boot_image: String,
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self {
            boot_archive: "platform/i86pc/amd64/boot_archive".to_string(),
            secondary_image: "usr.lgz".to_string(),
            secondary_mount: "usr".to_string(),
            boot_image: "boot/grub/stage2_eltorito".to_string(),
        }
    }
}

impl ImageLayout {
    pub fn validate(&self) -> Result<()> {
        parse_relative_path(&self.boot_archive, "layout.bootArchive")?;
        parse_relative_path(&self.secondary_image, "layout.secondaryImage")?;
        parse_relative_path(&self.secondary_mount, "layout.secondaryMount")?;
        parse_relative_path(&self.boot_image, "layout.bootImage")?;
        Ok(())
    }
}

fn parse_relative_path(raw: &str, field: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if raw.is_empty() {
        return Err(Error::config(format!("{field} must not be empty")));
    }
    if candidate.is_absolute() {
        return Err(Error::config(format!(
            "{field} must be relative, got absolute path '{raw}'"
        )));
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return Err(Error::config(format!(
                "{field} contains invalid traversal/root component in '{raw}'"
            )));
        }
    }
    Ok(candidate.to_path_buf())
}

/// Every path the pipeline touches, derived once from the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPaths {
    pub workspace: PathBuf,
    /// Temporary read-only mount of the outer image.
    pub outer_mount: PathBuf,
    /// Persistent copy of the outer image contents.
    pub unpack: PathBuf,
    /// Boot archive inside the unpacked tree.
    pub archive: PathBuf,
    /// Read-write mount of the boot archive.
    pub archive_root: PathBuf,
    /// Mount point of the secondary image under the archive root.
    pub secondary_mount: PathBuf,
    /// Secondary image at its home inside the archive.
    pub secondary_home: PathBuf,
    /// Secondary image while staged (and decompressed) in the workspace.
    pub secondary_staged: PathBuf,
    pub output: PathBuf,
}

impl WorkPaths {
    pub fn new(workspace: &Path, layout: &ImageLayout, output: Option<&Path>) -> Self {
        let unpack = workspace.join("isounpack");
        let archive_root = workspace.join("root");
        Self {
            workspace: workspace.to_path_buf(),
            outer_mount: workspace.join("iso"),
            archive: unpack.join(&layout.boot_archive),
            unpack,
            secondary_mount: archive_root.join(&layout.secondary_mount),
            secondary_home: archive_root.join(&layout.secondary_image),
            secondary_staged: workspace.join(format!("tmp{}", staged_name(&layout.secondary_image))),
            archive_root,
            output: output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| workspace.join("output.iso")),
        }
    }
}

fn staged_name(secondary_image: &str) -> String {
    Path::new(secondary_image)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| secondary_image.to_string())
}
