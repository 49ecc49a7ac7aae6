//! In-memory adapter simulating loop devices, mounts and directories.
//!
//! Mirrors the host's refusal semantics (detach of an unknown device fails,
//! unmount of an unmounted path fails, ...) so double releases and leaks show
//! up in tests. Faults are injected per operation name and path fragment.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use super::{CommandAdapter, FSTYPE_HSFS, FSTYPE_UFS};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeFile {
    pub source: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    next_device: u32,
    devices: BTreeMap<PathBuf, PathBuf>,
    mounts: BTreeMap<PathBuf, PathBuf>,
    dirs: BTreeSet<PathBuf>,
    decompressed: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, FakeFile>,
    packed: Vec<PathBuf>,
    ops: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeTools {
    state: RefCell<State>,
    probes: HashMap<String, String>,
    faults: Vec<(&'static str, String)>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the probe of any device backed by a file named `file_name`
    /// report `fstype`.
    pub fn with_probe(mut self, file_name: &str, fstype: &str) -> Self {
        self.probes.insert(file_name.to_string(), fstype.to_string());
        self
    }

    /// Fail every `op` whose first path argument contains `fragment`.
    pub fn failing(mut self, op: &'static str, fragment: &str) -> Self {
        self.faults.push((op, fragment.to_string()));
        self
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.borrow().ops.clone()
    }

    pub fn attached_devices(&self) -> Vec<PathBuf> {
        self.state.borrow().devices.keys().cloned().collect()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.borrow().mounts.keys().cloned().collect()
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.state.borrow().dirs.iter().cloned().collect()
    }

    pub fn decompressed(&self) -> Vec<PathBuf> {
        self.state.borrow().decompressed.iter().cloned().collect()
    }

    pub fn file(&self, path: &Path) -> Option<FakeFile> {
        self.state.borrow().files.get(path).cloned()
    }

    pub fn packed(&self) -> Vec<PathBuf> {
        self.state.borrow().packed.clone()
    }

    fn record(&self, op: &'static str, target: &Path) -> Result<()> {
        self.state
            .borrow_mut()
            .ops
            .push(format!("{op} {}", target.display()));
        let target = target.to_string_lossy();
        if self
            .faults
            .iter()
            .any(|(name, fragment)| *name == op && target.contains(fragment.as_str()))
        {
            return Err(Error::tool(op, format!("injected failure on {target}")));
        }
        Ok(())
    }
}

impl CommandAdapter for FakeTools {
    fn attach(&self, file: &Path) -> Result<PathBuf> {
        self.record("attach", file)?;
        let mut state = self.state.borrow_mut();
        state.next_device += 1;
        let device = PathBuf::from(format!("/dev/lofi/{}", state.next_device));
        state.devices.insert(device.clone(), file.to_path_buf());
        Ok(device)
    }

    fn detach(&self, device: &Path) -> Result<()> {
        self.record("detach", device)?;
        let mut state = self.state.borrow_mut();
        if state.mounts.values().any(|d| d == device) {
            return Err(Error::tool("detach", format!("{} is busy", device.display())));
        }
        state
            .devices
            .remove(device)
            .map(|_| ())
            .ok_or_else(|| Error::tool("detach", format!("{} not attached", device.display())))
    }

    fn probe_type(&self, device: &Path) -> Result<String> {
        self.record("probe", device)?;
        let state = self.state.borrow();
        let file = state
            .devices
            .get(device)
            .ok_or_else(|| Error::tool("probe", format!("{} not attached", device.display())))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.probes.get(&name).cloned().unwrap_or_else(|| {
            if name.ends_with(".iso") {
                FSTYPE_HSFS.to_string()
            } else {
                FSTYPE_UFS.to_string()
            }
        }))
    }

    fn check(&self, device: &Path) -> Result<()> {
        self.record("check", device)?;
        let state = self.state.borrow();
        if !state.devices.contains_key(device) {
            return Err(Error::tool("check", format!("{} not attached", device.display())));
        }
        if state.mounts.values().any(|d| d == device) {
            return Err(Error::tool("check", format!("{} is mounted", device.display())));
        }
        Ok(())
    }

    fn mount(
        &self,
        device: &Path,
        _fstype: &str,
        mount_point: &Path,
        _options: &[&str],
    ) -> Result<()> {
        self.record("mount", mount_point)?;
        let mut state = self.state.borrow_mut();
        if !state.devices.contains_key(device) {
            return Err(Error::tool("mount", format!("{} not attached", device.display())));
        }
        if state.mounts.contains_key(mount_point) {
            return Err(Error::tool(
                "mount",
                format!("{} already mounted", mount_point.display()),
            ));
        }
        state
            .mounts
            .insert(mount_point.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.record("unmount", mount_point)?;
        let mut state = self.state.borrow_mut();
        if state
            .mounts
            .keys()
            .any(|m| m != mount_point && m.starts_with(mount_point))
        {
            return Err(Error::tool("unmount", format!("{} is busy", mount_point.display())));
        }
        state
            .mounts
            .remove(mount_point)
            .map(|_| ())
            .ok_or_else(|| {
                Error::tool("unmount", format!("{} not mounted", mount_point.display()))
            })
    }

    fn copy(&self, from: &Path, to: &Path, recursive: bool) -> Result<()> {
        self.record("copy", from)?;
        if !recursive {
            self.state.borrow_mut().files.insert(
                to.to_path_buf(),
                FakeFile {
                    source: from.to_path_buf(),
                    uid: None,
                    gid: None,
                    mode: None,
                },
            );
        }
        Ok(())
    }

    fn move_file(&self, from: &Path, _to: &Path) -> Result<()> {
        self.record("move", from)
    }

    fn decompress(&self, file: &Path) -> Result<()> {
        self.record("decompress", file)?;
        if !self.state.borrow_mut().decompressed.insert(file.to_path_buf()) {
            return Err(Error::tool("decompress", "already decompressed"));
        }
        Ok(())
    }

    fn recompress(&self, file: &Path) -> Result<()> {
        self.record("recompress", file)?;
        if !self.state.borrow_mut().decompressed.remove(file) {
            return Err(Error::tool("recompress", "not decompressed"));
        }
        Ok(())
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.record("chown", path)?;
        let mut state = self.state.borrow_mut();
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| Error::tool("chown", format!("{} missing", path.display())))?;
        file.uid = Some(uid);
        file.gid = Some(gid);
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        self.record("chmod", path)?;
        let mut state = self.state.borrow_mut();
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| Error::tool("chmod", format!("{} missing", path.display())))?;
        file.mode = Some(mode);
        Ok(())
    }

    fn pack_image(&self, _source_tree: &Path, output: &Path, _boot_image: &str) -> Result<()> {
        self.record("pack", output)?;
        self.state.borrow_mut().packed.push(output.to_path_buf());
        Ok(())
    }

    fn make_directory(&self, path: &Path) -> Result<()> {
        self.record("mkdir", path)?;
        if !self.state.borrow_mut().dirs.insert(path.to_path_buf()) {
            return Err(Error::tool("mkdir", format!("{} exists already", path.display())));
        }
        Ok(())
    }

    fn remove_directory(&self, path: &Path) -> Result<()> {
        self.record("rmdir", path)?;
        let mut state = self.state.borrow_mut();
        if state.mounts.contains_key(path) {
            return Err(Error::tool("rmdir", format!("{} is busy", path.display())));
        }
        if !state.dirs.remove(path) {
            return Err(Error::tool("rmdir", format!("{} missing", path.display())));
        }
        Ok(())
    }
}
