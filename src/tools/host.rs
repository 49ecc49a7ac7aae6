//! [`CommandAdapter`] backed by the illumos host utilities.
//!
//! Loop devices are lofi(7D) devices managed with `lofiadm`; the secondary
//! image compression also goes through `lofiadm` (`-C` / `-U`).

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::CommandAdapter;
use crate::error::{Error, Result};
use crate::process::Cmd;

/// Locations of the host utilities.
///
/// Absolute by default so a root-run build never resolves tools through a
/// caller-controlled `PATH`. Any field may be overridden from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub lofiadm: PathBuf,
    pub fstyp: PathBuf,
    pub fsck: PathBuf,
    pub mount: PathBuf,
    pub umount: PathBuf,
    pub cp: PathBuf,
    pub mv: PathBuf,
    pub mkisofs: PathBuf,
    /// Algorithm passed to `lofiadm -C`.
    pub compression: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            lofiadm: "/usr/sbin/lofiadm".into(),
            fstyp: "/usr/sbin/fstyp".into(),
            fsck: "/usr/sbin/fsck".into(),
            mount: "/sbin/mount".into(),
            umount: "/sbin/umount".into(),
            cp: "/bin/cp".into(),
            mv: "/bin/mv".into(),
            mkisofs: "mkisofs".into(),
            compression: "gzip".to_string(),
        }
    }
}

impl ToolPaths {
    /// Parse overrides from TOML text; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("parsing tool paths: {e}")))
    }

    /// Every external program the pipeline may run, with a hint for the
    /// operator when it is missing.
    pub fn required(&self) -> Vec<(&Path, &'static str)> {
        vec![
            (self.lofiadm.as_path(), "lofiadm (system/file-system/lofi)"),
            (self.fstyp.as_path(), "fstyp"),
            (self.fsck.as_path(), "fsck"),
            (self.mount.as_path(), "mount"),
            (self.umount.as_path(), "umount"),
            (self.cp.as_path(), "cp"),
            (self.mv.as_path(), "mv"),
            (self.mkisofs.as_path(), "mkisofs (media/cdrtools)"),
        ]
    }
}

/// Reported by [`HostTools::probe_type`] when `fstyp` identifies nothing.
pub const UNKNOWN_FSTYPE: &str = "unknown";

/// One `lofiadm` invocation.
#[derive(Debug, Clone, Copy)]
enum LofiAction<'a> {
    Add { file: &'a Path },
    Remove { device: &'a Path },
    Uncompress { file: &'a Path },
    Compress { file: &'a Path, algorithm: &'a str },
}

impl LofiAction<'_> {
    fn args(&self) -> Vec<OsString> {
        match *self {
            Self::Add { file } => vec!["-a".into(), file.into()],
            Self::Remove { device } => vec!["-d".into(), device.into()],
            Self::Uncompress { file } => vec!["-U".into(), file.into()],
            Self::Compress { file, algorithm } => {
                vec!["-C".into(), algorithm.into(), file.into()]
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Add { .. } => "lofi add",
            Self::Remove { .. } => "lofi remove",
            Self::Uncompress { .. } => "lofi uncompress",
            Self::Compress { .. } => "lofi compress",
        }
    }
}

/// Production adapter that shells out to the host utilities.
#[derive(Debug, Clone, Default)]
pub struct HostTools {
    paths: ToolPaths,
}

impl HostTools {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    fn lofiadm(&self, action: LofiAction<'_>) -> Result<String> {
        tracing::info!(args = ?action.args(), "{}", action.label());
        let out = Cmd::new(&self.paths.lofiadm)
            .args(action.args())
            .error_msg(action.label())
            .run()?;
        Ok(out.stdout.trim().to_string())
    }
}

impl CommandAdapter for HostTools {
    fn attach(&self, file: &Path) -> Result<PathBuf> {
        let device = self.lofiadm(LofiAction::Add { file })?;
        if device.is_empty() {
            return Err(Error::tool(
                self.paths.lofiadm.display().to_string(),
                format!("no device reported for {}", file.display()),
            ));
        }
        tracing::info!(device = %device, "attached {}", file.display());
        Ok(PathBuf::from(device))
    }

    fn detach(&self, device: &Path) -> Result<()> {
        self.lofiadm(LofiAction::Remove { device }).map(|_| ())
    }

    fn probe_type(&self, device: &Path) -> Result<String> {
        tracing::info!(device = %device.display(), "fstyp");
        let out = Cmd::new(&self.paths.fstyp)
            .arg_path(device)
            .allow_fail()
            .run()?;
        // fstyp exits non-zero when it recognises nothing on the device.
        if !out.success {
            tracing::warn!(device = %device.display(), stderr = %out.stderr.trim(), "fstyp found no filesystem");
            return Ok(UNKNOWN_FSTYPE.to_string());
        }
        let fstype = out.stdout.trim().to_string();
        tracing::info!(device = %device.display(), fstype = %fstype, "probed");
        Ok(fstype)
    }

    fn check(&self, device: &Path) -> Result<()> {
        tracing::info!(device = %device.display(), "fsck");
        Cmd::new(&self.paths.fsck)
            .arg("-y")
            .arg_path(device)
            .error_msg("fsck")
            .run()?;
        Ok(())
    }

    fn mount(
        &self,
        device: &Path,
        fstype: &str,
        mount_point: &Path,
        options: &[&str],
    ) -> Result<()> {
        tracing::info!(
            device = %device.display(),
            fstype,
            mount_point = %mount_point.display(),
            options = %options.join(","),
            "mount"
        );
        let mut cmd = Cmd::new(&self.paths.mount).args(["-F", fstype]);
        if !options.is_empty() {
            cmd = cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg_path(device)
            .arg_path(mount_point)
            .error_msg("mount")
            .run()?;
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        tracing::info!(mount_point = %mount_point.display(), "umount");
        Cmd::new(&self.paths.umount)
            .arg_path(mount_point)
            .error_msg("umount")
            .run()?;
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path, recursive: bool) -> Result<()> {
        tracing::info!(from = %from.display(), to = %to.display(), recursive, "cp");
        let mut cmd = Cmd::new(&self.paths.cp);
        if recursive {
            cmd = cmd.arg("-r");
        }
        cmd.arg_path(from).arg_path(to).error_msg("cp").run()?;
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        tracing::info!(from = %from.display(), to = %to.display(), "mv");
        Cmd::new(&self.paths.mv)
            .arg_path(from)
            .arg_path(to)
            .error_msg("mv")
            .run()?;
        Ok(())
    }

    fn decompress(&self, file: &Path) -> Result<()> {
        self.lofiadm(LofiAction::Uncompress { file }).map(|_| ())
    }

    fn recompress(&self, file: &Path) -> Result<()> {
        self.lofiadm(LofiAction::Compress {
            file,
            algorithm: &self.paths.compression,
        })
        .map(|_| ())
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        tracing::debug!(path = %path.display(), uid, gid, "chown");
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        tracing::debug!(path = %path.display(), mode = format_args!("{mode:04o}"), "chmod");
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn pack_image(&self, source_tree: &Path, output: &Path, boot_image: &str) -> Result<()> {
        tracing::info!(output = %output.display(), "mkisofs");
        // mkisofs packs the directory contents only with a trailing slash.
        let mut tree = source_tree.as_os_str().to_os_string();
        tree.push("/");
        Cmd::new(&self.paths.mkisofs)
            .args(["-R", "-b", boot_image, "-no-emul-boot"])
            .args(["-boot-load-size", "4", "-boot-info-table", "-quiet"])
            .arg("-o")
            .arg_path(output)
            .arg(tree)
            .error_msg("mkisofs")
            .run()?;
        Ok(())
    }

    fn make_directory(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "mkdir");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // create_dir itself refuses an existing path; no separate check.
        fs::create_dir(path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists already", path.display()),
            )),
            _ => Error::Io(e),
        })
    }

    fn remove_directory(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "rmdir");
        fs::remove_dir(path)?;
        Ok(())
    }
}
