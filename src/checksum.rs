//! SHA-256 checksum file for the rebuilt image.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Separator between hash and filename, as `sha256sum -c` expects.
const SEPARATOR: &str = "  ";

/// Write `<image>.sha256` next to `image` and return its path.
///
/// Uses just the filename (not the full path) so the image can be verified
/// with `sha256sum -c` from its own directory.
pub fn write_sha256(image: &Path) -> Result<PathBuf> {
    let mut hasher = Sha256::new();
    let mut file = File::open(image)?;
    io::copy(&mut file, &mut hasher)?;
    let hash = format!("{:x}", hasher.finalize());

    let filename = image
        .file_name()
        .ok_or_else(|| Error::config(format!("{} has no file name", image.display())))?
        .to_string_lossy();

    let mut checksum_path = image.as_os_str().to_os_string();
    checksum_path.push(".sha256");
    let checksum_path = PathBuf::from(checksum_path);
    fs::write(&checksum_path, format!("{hash}{SEPARATOR}{filename}\n"))?;

    tracing::info!(
        sha256 = %hash,
        path = %checksum_path.display(),
        "wrote checksum"
    );
    Ok(checksum_path)
}
