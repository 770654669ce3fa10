//! Centralized path registry for the kforge working tree.
//!
//! All persisted state lives under a single workspace root:
//! `builds/<target>/` packaged archives, `logs/<target>/` one log per
//! attempt, `out/<target>/` native build-tool output, `toolchains/<name>/`
//! resolved toolchain installations. Every path operation goes through this
//! registry so the teardown routine can prune exactly what was created.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Registry of workspace-absolute paths for one kforge invocation.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        Layout { root }
    }

    /// Workspace rooted at the process working directory.
    pub fn from_cwd() -> io::Result<Self> {
        Ok(Layout::new(std::env::current_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `builds/<target>/` — packaged archives for one codename.
    pub fn builds_dir(&self, target: &str) -> PathBuf {
        self.root.join("builds").join(target)
    }

    /// `logs/<target>/` — one log file per build attempt.
    pub fn logs_dir(&self, target: &str) -> PathBuf {
        self.root.join("logs").join(target)
    }

    /// `out/<target>/` — native build-tool output directory.
    pub fn out_dir(&self, target: &str) -> PathBuf {
        self.root.join("out").join(target)
    }

    /// `toolchains/<name>/` — one installed toolchain bundle.
    pub fn toolchain_dir(&self, name: &str) -> PathBuf {
        self.root.join("toolchains").join(name)
    }

    /// Packaging template project (boot-ramdisk skeleton).
    pub fn template_dir(&self) -> PathBuf {
        self.root.join("anykernel")
    }

    /// Well-known advisory lock file enforcing one instance system-wide.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".kforge.lock")
    }

    /// Create the per-target directory set for a session.
    pub fn create_target_dirs(&self, target: &str) -> io::Result<()> {
        fs::create_dir_all(self.builds_dir(target))?;
        fs::create_dir_all(self.logs_dir(target))?;
        fs::create_dir_all(self.out_dir(target))?;
        Ok(())
    }

    /// Remove per-target directories that ended up empty. Tolerant of
    /// directories that were never created.
    pub fn prune_empty_target_dirs(&self, target: &str) {
        for dir in [
            self.builds_dir(target),
            self.logs_dir(target),
            self.out_dir(target),
        ] {
            remove_if_empty(&dir);
        }
    }
}

fn remove_if_empty(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir) {
        if entries.next().is_none() {
            let _ = fs::remove_dir(dir);
        }
    }
}
