//! Temporary `/sys/class/net` tree for SR-IOV tests

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A directory laid out like `/sys/class/net`:
///
/// ```text
/// <root>/<pf>/dev_port, dev_id
/// <root>/<pf>/device/sriov_numvfs, sriov_totalvfs
/// <root>/<pf>/device/virtfn<N>/net/<vf>/dev_port, dev_id
/// ```
///
/// The directory is removed when the fixture is dropped.
pub struct SysfsFixture {
    dir: TempDir,
}

impl SysfsFixture {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Adds an SR-IOV capable physical function with port identity `0`/`0x0`.
    pub fn add_pf(&self, pf: &str, num_vfs: u32, total_vfs: u32) -> io::Result<()> {
        let base = self.root().join(pf);
        fs::create_dir_all(base.join("device"))?;
        fs::write(base.join("dev_port"), "0\n")?;
        fs::write(base.join("dev_id"), "0x0\n")?;
        fs::write(base.join("device/sriov_numvfs"), format!("{}\n", num_vfs))?;
        fs::write(base.join("device/sriov_totalvfs"), format!("{}\n", total_vfs))?;
        Ok(())
    }

    /// Adds a plain interface without SR-IOV control files.
    pub fn add_plain(&self, name: &str) -> io::Result<()> {
        let base = self.root().join(name);
        fs::create_dir_all(&base)?;
        fs::write(base.join("dev_port"), "0\n")?;
        fs::write(base.join("dev_id"), "0x0\n")
    }

    /// Adds virtual function `index` of `pf`, exposed as interface `vf`.
    pub fn add_vf(&self, pf: &str, index: u32, vf: &str) -> io::Result<()> {
        self.add_vf_with_port(pf, index, vf, "0")
    }

    /// Adds a virtual function that reports a different `dev_port`.
    pub fn add_vf_with_port(&self, pf: &str, index: u32, vf: &str, dev_port: &str) -> io::Result<()> {
        let dir = self.vf_dir(pf, index).join(vf);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("dev_port"), format!("{}\n", dev_port))?;
        fs::write(dir.join("dev_id"), "0x0\n")
    }

    /// Current content of `sriov_numvfs`.
    pub fn num_vfs(&self, pf: &str) -> io::Result<u32> {
        let raw = fs::read_to_string(self.root().join(pf).join("device/sriov_numvfs"))?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn vf_dir(&self, pf: &str, index: u32) -> PathBuf {
        self.root()
            .join(pf)
            .join("device")
            .join(format!("virtfn{}", index))
            .join("net")
    }
}
