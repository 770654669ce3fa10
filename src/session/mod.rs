//! Build session state: the validated inputs and computed paths for one
//! end-to-end pipeline run, plus the log recorder, environment snapshots,
//! and the single-instance lock.

pub mod env;
pub mod lock;
pub mod log;

pub use env::{settings_diff, EnvSnapshot, DEFAULT_DENYLIST};
pub use lock::InstanceLock;
pub use log::{strip_ansi, SessionLog, SETTINGS_SENTINEL};

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use crate::error::SessionError;
use crate::models::Arch;
use crate::paths::Layout;

/// Codenames are 3–20 chars, alnum first, then alnum/dash/underscore.
static CODENAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{2,19}$").unwrap_or_else(|_| unreachable!()));

/// Validate a target codename against the selection rule.
pub fn valid_codename(name: &str) -> bool {
    CODENAME_PATTERN.is_match(name)
}

/// Validate that a directory is a kernel source tree: it must contain the
/// build descriptor and the architecture-specific config directory.
pub fn validate_kernel_dir(dir: &Path, arch: Arch) -> Result<(), SessionError> {
    if !dir.join("Makefile").exists() {
        return Err(SessionError::SourceInvalid {
            path: dir.to_path_buf(),
            reason: "missing Makefile".to_string(),
        });
    }
    let configs = arch.configs_dir(dir);
    if !configs.is_dir() {
        return Err(SessionError::SourceInvalid {
            path: dir.to_path_buf(),
            reason: format!("missing {}", configs.display()),
        });
    }
    Ok(())
}

/// One end-to-end invocation of the build pipeline for a single codename.
///
/// Created at pipeline start, mutated through each stage. At most one
/// session is active per process; the [`InstanceLock`] enforces one
/// process system-wide.
#[derive(Debug)]
pub struct BuildSession {
    pub codename: String,
    pub kernel_dir: PathBuf,
    pub defconfig: String,
    pub cores: usize,
    pub arch: Arch,
    pub tag: String,
    pub out_dir: PathBuf,
    pub builds_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Wall-clock start, compared against build-metadata mtimes.
    pub started: SystemTime,
    started_at: Instant,
    /// Filled in once `make kernelversion` has been read.
    pub kernel_version: String,
}

impl BuildSession {
    pub fn new(
        codename: String,
        kernel_dir: PathBuf,
        arch: Arch,
        tag: String,
        layout: &Layout,
    ) -> Result<Self, SessionError> {
        if !valid_codename(&codename) {
            return Err(SessionError::InvalidCodename(codename));
        }
        validate_kernel_dir(&kernel_dir, arch)?;
        Ok(BuildSession {
            out_dir: layout.out_dir(&codename),
            builds_dir: layout.builds_dir(&codename),
            logs_dir: layout.logs_dir(&codename),
            codename,
            kernel_dir,
            defconfig: String::new(),
            cores: 1,
            arch,
            tag,
            started: SystemTime::now(),
            started_at: Instant::now(),
            kernel_version: String::new(),
        })
    }

    /// Derived kernel name: `tag-codename-version`.
    pub fn kernel_name(&self) -> String {
        format!("{}-{}-{}", self.tag, self.codename, self.kernel_version)
    }

    /// Name of the packaged archive for this session.
    pub fn zip_name(&self) -> String {
        format!(
            "{}_{}.zip",
            self.kernel_name(),
            Local::now().format("%Y%m%d")
        )
    }

    /// Wall-clock delta since session start, formatted as `XmYs`.
    pub fn elapsed_fmt(&self) -> String {
        let secs = self.started_at.elapsed().as_secs();
        format!("{}m{}s", secs / 60, secs % 60)
    }

    /// Banner rendered at the top of every log file for this session.
    pub fn banner(&self) -> String {
        format!(
            "===== kforge: {} ({} @ {}) =====",
            self.kernel_name(),
            self.defconfig,
            self.arch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_kernel_tree(root: &Path, arch: Arch) {
        fs::create_dir_all(arch.configs_dir(root)).expect("configs dir");
        fs::write(root.join("Makefile"), "VERSION = 4\n").expect("Makefile");
    }

    #[test]
    fn test_codename_rule() {
        assert!(valid_codename("pixel3"));
        assert!(valid_codename("a_b-c"));
        assert!(valid_codename("X23"));
        assert!(!valid_codename("ab"));
        assert!(!valid_codename("-lead"));
        assert!(!valid_codename("_lead"));
        assert!(!valid_codename("has space"));
        assert!(!valid_codename("waytoolongcodename-exceeding"));
        assert!(!valid_codename(""));
    }

    #[test]
    fn test_session_rejects_invalid_codename() {
        let temp = tempdir().expect("tempdir");
        make_kernel_tree(temp.path(), Arch::Arm64);
        let layout = Layout::new(temp.path().to_path_buf());
        let err = BuildSession::new(
            "a".to_string(),
            temp.path().to_path_buf(),
            Arch::Arm64,
            "KF".to_string(),
            &layout,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::InvalidCodename(_)));
    }

    #[test]
    fn test_session_rejects_bare_directory() {
        let temp = tempdir().expect("tempdir");
        let layout = Layout::new(temp.path().to_path_buf());
        let err = BuildSession::new(
            "pixel3".to_string(),
            temp.path().to_path_buf(),
            Arch::Arm64,
            "KF".to_string(),
            &layout,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::SourceInvalid { .. }));
    }

    #[test]
    fn test_kernel_name_and_paths() {
        let temp = tempdir().expect("tempdir");
        make_kernel_tree(temp.path(), Arch::Arm64);
        let layout = Layout::new(temp.path().to_path_buf());
        let mut session = BuildSession::new(
            "pixel3".to_string(),
            temp.path().to_path_buf(),
            Arch::Arm64,
            "KF".to_string(),
            &layout,
        )
        .expect("session");
        session.kernel_version = "4.14.180".to_string();

        assert_eq!(session.kernel_name(), "KF-pixel3-4.14.180");
        assert!(session.out_dir.ends_with("out/pixel3"));
        assert!(session.logs_dir.ends_with("logs/pixel3"));
    }

    #[test]
    fn test_elapsed_format() {
        let temp = tempdir().expect("tempdir");
        make_kernel_tree(temp.path(), Arch::Arm64);
        let layout = Layout::new(temp.path().to_path_buf());
        let session = BuildSession::new(
            "pixel3".to_string(),
            temp.path().to_path_buf(),
            Arch::Arm64,
            "KF".to_string(),
            &layout,
        )
        .expect("session");
        let formatted = session.elapsed_fmt();
        assert!(formatted.ends_with('s'));
        assert!(formatted.contains('m'));
    }
}
