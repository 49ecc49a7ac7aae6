//! Owner and group name lookup inside the target tree.
//!
//! Names are resolved against the image's own `etc/passwd` and `etc/group`,
//! never the build host's name service: the two databases need not agree.

use std::fs;
use std::path::Path;

use super::Identity;
use crate::error::{Error, Result};

/// uid of `root` when the target has no passwd entry for it.
const ROOT_ID: u32 = 0;

/// Look up a numeric id by name in a colon-separated database.
///
/// Returns:
/// - Ok(Some(id)) if the name is found
/// - Ok(None) if the name is absent or the file doesn't exist
/// - Err if the file exists but is unreadable or the entry is corrupted
fn lookup_id(db: &Path, name: &str) -> Result<Option<u32>> {
    // Missing database is fine - the name just doesn't resolve
    if !db.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(db)?;
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == name {
            let id = parts[2].parse().map_err(|_| {
                Error::config(format!(
                    "corrupted {}: invalid id '{}' for '{}'",
                    db.display(),
                    parts[2],
                    name
                ))
            })?;
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Resolve an owner to a uid using `<root>/etc/passwd`.
pub fn resolve_uid(root: &Path, owner: &Identity) -> Result<u32> {
    resolve(root, "etc/passwd", "user", owner)
}

/// Resolve a group to a gid using `<root>/etc/group`.
pub fn resolve_gid(root: &Path, group: &Identity) -> Result<u32> {
    resolve(root, "etc/group", "group", group)
}

fn resolve(root: &Path, db: &str, kind: &str, identity: &Identity) -> Result<u32> {
    match identity {
        Identity::Id(id) => Ok(*id),
        Identity::Name(name) => match lookup_id(&root.join(db), name)? {
            Some(id) => Ok(id),
            None if name == "root" => Ok(ROOT_ID),
            None => Err(Error::config(format!(
                "unknown {kind} '{name}' in {}",
                root.join(db).display()
            ))),
        },
    }
}
