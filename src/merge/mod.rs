//! File merge engine.
//!
//! Applies a set of [`MergeEntry`] values onto a mounted tree. Entries run in
//! ascending destination order; each one is copy, then chown, then chmod.
//! The chmod comes last so setuid/setgid bits survive the chown. The first
//! failing entry stops the merge and nothing already applied is undone.

pub mod owners;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tools::CommandAdapter;

/// Owner or group: a numeric id or a name looked up in the target tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "IdentityRepr")]
pub enum Identity {
    Id(u32),
    Name(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdentityRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<IdentityRepr> for Identity {
    type Error = String;

    fn try_from(repr: IdentityRepr) -> std::result::Result<Self, String> {
        match repr {
            IdentityRepr::Number(n) => u32::try_from(n)
                .map(Identity::Id)
                .map_err(|_| format!("id {n} out of range")),
            IdentityRepr::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Err("owner/group must not be empty".to_string());
                }
                Ok(match s.parse::<u32>() {
                    Ok(id) => Identity::Id(id),
                    Err(_) => Identity::Name(s.to_string()),
                })
            }
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Permission bits, written as octal text (`"0644"`) or an integer whose
/// digits are read as octal (`644`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ModeRepr")]
pub struct FileMode(u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum ModeRepr {
    Number(u64),
    Text(String),
}

impl FileMode {
    pub const MAX: u32 = 0o7777;

    pub fn new(bits: u32) -> std::result::Result<Self, String> {
        if bits > Self::MAX {
            return Err(format!("mode {bits:o} exceeds {:o}", Self::MAX));
        }
        Ok(Self(bits))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let digits = text.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        if digits.is_empty() {
            return Err("mode must not be empty".to_string());
        }
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|_| format!("mode '{text}' is not an octal number"))?;
        Self::new(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl TryFrom<ModeRepr> for FileMode {
    type Error = String;

    fn try_from(repr: ModeRepr) -> std::result::Result<Self, String> {
        match repr {
            ModeRepr::Number(n) => Self::parse(&n.to_string()),
            ModeRepr::Text(s) => Self::parse(&s),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// One file to inject into the target tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEntry {
    pub source: PathBuf,
    /// Absolute path inside the target tree, e.g. `/etc/motd`.
    pub destination: String,
    pub owner: Identity,
    pub group: Identity,
    pub mode: FileMode,
}

impl MergeEntry {
    /// Location of this entry's destination under `root`.
    pub fn target(&self, root: &Path) -> PathBuf {
        root.join(self.destination.trim_start_matches('/'))
    }
}

/// Normalise a destination to `/a/b/c` form.
///
/// Rejects empty paths, `..` and anything that would point at the root
/// itself.
pub fn normalize_destination(raw: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(format!(
                    "destination '{raw}' contains invalid traversal/root component"
                ))
            }
        }
    }
    if parts.is_empty() {
        return Err(format!("destination '{raw}' does not name a file"));
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Apply `entries` onto `root` in ascending destination order.
///
/// Returns the number of entries applied. The error for a failing entry is
/// [`Error::MergeEntry`] naming its destination.
pub fn merge_files<'a, I>(tools: &dyn CommandAdapter, root: &Path, entries: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a MergeEntry>,
{
    let mut ordered: Vec<&MergeEntry> = entries.into_iter().collect();
    ordered.sort_by(|a, b| a.destination.cmp(&b.destination));

    tracing::info!(count = ordered.len(), root = %root.display(), "merging files");
    for entry in &ordered {
        apply_entry(tools, root, entry)
            .map_err(|e| Error::merge_entry(entry.destination.clone(), e))?;
    }
    tracing::info!("done merging files");
    Ok(ordered.len())
}

fn apply_entry(tools: &dyn CommandAdapter, root: &Path, entry: &MergeEntry) -> Result<()> {
    // Resolve names before touching the tree so a bad owner leaves no copy.
    let uid = owners::resolve_uid(root, &entry.owner)?;
    let gid = owners::resolve_gid(root, &entry.group)?;
    let target = entry.target(root);
    ensure_within_root(root, &target)?;

    tracing::info!(
        destination = %entry.destination,
        source = %entry.source.display(),
        owner = %entry.owner,
        group = %entry.group,
        mode = %entry.mode,
        "merge"
    );
    tools.copy(&entry.source, &target, false)?;
    tools.set_owner(&target, uid, gid)?;
    tools.set_mode(&target, entry.mode.bits())?;
    Ok(())
}

/// Refuse `target` if an existing component of it is a symlink leading out
/// of `root`.
///
/// cp, chown and chmod all follow symlinks, and the image may carry absolute
/// links that would resolve against the build host. Relative links that stay
/// inside the tree (`bin -> usr/bin`) are fine. Components that do not exist
/// yet end the walk.
fn ensure_within_root(root: &Path, target: &Path) -> Result<()> {
    let Ok(relative) = target.strip_prefix(root) else {
        return Err(Error::OutsideRoot {
            target: target.to_path_buf(),
            link: target.to_path_buf(),
            root: root.to_path_buf(),
        });
    };

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        let meta = match fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !meta.file_type().is_symlink() {
            continue;
        }

        let escapes = fs::read_link(&current)?.is_absolute()
            || match fs::canonicalize(&current) {
                Ok(resolved) => !resolved.starts_with(fs::canonicalize(root)?),
                // Dangling relative link: cp would create whatever it names.
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => return Err(e.into()),
            };
        if escapes {
            return Err(Error::OutsideRoot {
                target: target.to_path_buf(),
                link: current,
                root: root.to_path_buf(),
            });
        }
    }
    Ok(())
}
