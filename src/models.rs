//! Core data types shared across kforge modules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use crate::error::ToolchainError;

/// Target CPU architecture for the kernel build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    Arm,
}

impl Arch {
    /// The value passed as `ARCH=` to the build tool.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
        }
    }

    /// Directory of defconfig files inside the kernel source tree.
    pub fn configs_dir(&self, kernel_dir: &Path) -> PathBuf {
        kernel_dir.join("arch").join(self.as_str()).join("configs")
    }

    /// Directory the build tool drops the compressed kernel image into.
    pub fn boot_dir(&self, out_dir: &Path) -> PathBuf {
        out_dir.join("arch").join(self.as_str()).join("boot")
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ToolchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "arm" => Ok(Arch::Arm),
            other => Err(ToolchainError::Unsupported(format!("arch '{other}'"))),
        }
    }
}

/// Explicit integration surface between the resolver and the executor.
///
/// Everything the build tool needs — search path entries, named variables,
/// make option strings — travels through this struct instead of ambient
/// process environment mutation.
#[derive(Debug, Clone, Default)]
pub struct BuildEnvironment {
    /// Directories prepended (in order) to the inherited PATH.
    pub path_prepend: Vec<PathBuf>,
    /// Named variables exported to every spawned command.
    pub vars: BTreeMap<String, String>,
    /// Toolchain make-invocation options (`CC=…`, `CROSS_COMPILE=…`, …).
    pub make_options: Vec<String>,
}

impl BuildEnvironment {
    /// Compute the PATH value with the prepend entries in front of the
    /// inherited search path.
    pub fn resolved_path(&self) -> String {
        let inherited = std::env::var("PATH").unwrap_or_default();
        let mut parts: Vec<String> = self
            .path_prepend
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if !inherited.is_empty() {
            parts.push(inherited);
        }
        parts.join(":")
    }

    /// Verify by literal match that every prepend entry is present in the
    /// resolved search path. Fails fast before the build tool ever runs.
    pub fn verify_path(&self) -> Result<(), ToolchainError> {
        let resolved = self.resolved_path();
        let entries: Vec<&str> = resolved.split(':').collect();
        for dir in &self.path_prepend {
            let literal = dir.to_string_lossy();
            if !entries.iter().any(|e| *e == literal) {
                return Err(ToolchainError::PathNotExtended(dir.clone()));
            }
        }
        Ok(())
    }

    /// Apply the environment to a command about to be spawned.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env("PATH", self.resolved_path());
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

/// Entry-point options resolved by the CLI dispatcher.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Target codename; prompted for when absent.
    pub codename: Option<String>,
    /// Echo every resolved command line before execution.
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_strings() {
        assert_eq!(Arch::Arm64.as_str(), "arm64");
        assert_eq!(Arch::Arm.as_str(), "arm");
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert!("mips".parse::<Arch>().is_err());
    }

    #[test]
    fn test_configs_dir_layout() {
        let dir = Arch::Arm64.configs_dir(Path::new("/src/kernel"));
        assert_eq!(dir, PathBuf::from("/src/kernel/arch/arm64/configs"));
    }

    #[test]
    fn test_resolved_path_prepends_in_order() {
        let mut env = BuildEnvironment::default();
        env.path_prepend.push(PathBuf::from("/opt/tc/clang/bin"));
        env.path_prepend.push(PathBuf::from("/opt/tc/gcc/bin"));
        let resolved = env.resolved_path();
        assert!(resolved.starts_with("/opt/tc/clang/bin:/opt/tc/gcc/bin"));
    }

    #[test]
    fn test_verify_path_detects_all_entries() {
        let mut env = BuildEnvironment::default();
        env.path_prepend.push(PathBuf::from("/opt/tc/bin"));
        assert!(env.verify_path().is_ok());
    }
}
