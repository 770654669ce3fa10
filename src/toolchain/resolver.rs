//! Maps an abstract compiler selection to concrete filesystem paths,
//! linker validation, search-path extension, and a version string.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use super::{acquire, ToolchainKind, VersionRule};
use crate::error::ToolchainError;
use crate::exec::{CommandSpec, Executor};
use crate::models::{Arch, BuildEnvironment};
use crate::paths::Layout;
use crate::prompt::Prompt;

static INTERP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"program interpreter: ([^\]\s]+)").unwrap_or_else(|_| unreachable!())
});

/// Immutable result of toolchain resolution for one session.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub kind: ToolchainKind,
    pub version: String,
    /// Ordered make-invocation option strings.
    pub make_options: Vec<String>,
    /// Toolchain bin directories prepended to the search path.
    pub bin_dirs: Vec<PathBuf>,
}

impl Resolved {
    /// The integration surface handed to the executor for build stages.
    pub fn build_environment(&self) -> BuildEnvironment {
        let mut env = BuildEnvironment::default();
        env.path_prepend = self.bin_dirs.clone();
        env.make_options = self.make_options.clone();
        env
    }
}

/// Resolve the session's compiler selection: acquire missing components,
/// validate the linker ABI of each required binary, extend and verify the
/// search path, and extract the version string. Called once per session.
pub fn resolve(
    kind: ToolchainKind,
    layout: &Layout,
    arch: Arch,
    prompt: &mut dyn Prompt,
    executor: &Executor,
) -> Result<Resolved, ToolchainError> {
    let components = kind.components();

    for component in &components {
        acquire::ensure_component(component, layout, prompt)?;
    }

    let mut bin_dirs = Vec::new();
    for component in &components {
        let dir = component.install_dir(layout);
        if let Some(rel) = component.linker_check {
            check_linker(&dir.join(rel), executor)?;
        }
        bin_dirs.push(dir.join("bin"));
    }

    let env = BuildEnvironment {
        path_prepend: bin_dirs.clone(),
        ..Default::default()
    };
    env.verify_path()?;

    let version = read_version(kind, layout, executor)?;
    log::info!("Resolved toolchain {kind}: {version}");

    Ok(Resolved {
        kind,
        version,
        make_options: kind.make_options(arch),
        bin_dirs,
    })
}

/// Validate that a toolchain binary's program-header interpreter exists on
/// the host. A missing interpreter means the bundle was built against a
/// different host linker ABI and every invocation would fail with a
/// confusing "no such file" error.
pub fn check_linker(binary: &Path, executor: &Executor) -> Result<(), ToolchainError> {
    if !binary.exists() {
        return Err(ToolchainError::NotInstalled(binary.to_path_buf()));
    }
    let spec = CommandSpec::new(
        "readelf",
        vec!["-l".to_string(), binary.display().to_string()],
        "toolchain-check",
    );
    let output = executor
        .run_capture(&spec, &BuildEnvironment::default())
        .map_err(|e| ToolchainError::VersionUnavailable(format!("readelf failed: {e}")))?;
    let interpreter = INTERP_PATTERN
        .captures(&output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ToolchainError::NoInterpreter(binary.to_path_buf()))?;
    if !Path::new(&interpreter).exists() {
        return Err(ToolchainError::IncompatibleLinker {
            binary: binary.to_path_buf(),
            interpreter,
        });
    }
    Ok(())
}

/// Extract the family's human-readable version string.
pub fn read_version(
    kind: ToolchainKind,
    layout: &Layout,
    executor: &Executor,
) -> Result<String, ToolchainError> {
    match kind.version_rule() {
        VersionRule::MarkerFile { component, file } => {
            let path = layout.toolchain_dir(component).join(file);
            let content = fs::read_to_string(&path).map_err(|_| {
                ToolchainError::VersionUnavailable(format!("missing marker {}", path.display()))
            })?;
            Ok(content.trim().to_string())
        }
        VersionRule::FirstLine { component, file } => {
            let path = layout.toolchain_dir(component).join(file);
            let content = fs::read_to_string(&path).map_err(|_| {
                ToolchainError::VersionUnavailable(format!("missing marker {}", path.display()))
            })?;
            content
                .lines()
                .next()
                .map(|line| line.trim_start_matches('#').trim().to_string())
                .filter(|line| !line.is_empty())
                .ok_or_else(|| {
                    ToolchainError::VersionUnavailable(format!("empty marker {}", path.display()))
                })
        }
        VersionRule::HostCompiler => {
            let spec = CommandSpec::new("cc", vec!["--version".to_string()], "toolchain-version");
            let output = executor
                .run_capture(&spec, &BuildEnvironment::default())
                .map_err(|e| ToolchainError::VersionUnavailable(e.to_string()))?;
            output
                .lines()
                .next()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .ok_or_else(|| {
                    ToolchainError::VersionUnavailable("host compiler printed nothing".into())
                })
        }
    }
}

/// Versions of every locally installed family, for the `versions` mode.
pub fn installed_versions(layout: &Layout, executor: &Executor) -> Vec<(ToolchainKind, String)> {
    let mut rows = Vec::new();
    for kind in ToolchainKind::ALL {
        let present = match kind {
            ToolchainKind::Host => true,
            _ => kind
                .components()
                .iter()
                .all(|c| c.install_dir(layout).exists()),
        };
        if !present {
            continue;
        }
        match read_version(kind, layout, executor) {
            Ok(version) => rows.push((kind, version)),
            Err(e) => log::warn!("{kind}: {e}"),
        }
    }
    rows
}

/// On kernels past the 4.2 threshold, clang families must pass the 32-bit
/// cross option under its renamed key. Applied once, before any make
/// invocation.
pub fn apply_compat_rename(options: &mut [String], kernel_version: &str, is_clang: bool) {
    if !is_clang || !version_exceeds(kernel_version, 4, 2) {
        return;
    }
    for option in options.iter_mut() {
        if let Some(value) = option.strip_prefix("CROSS_COMPILE_ARM32=") {
            *option = format!("CROSS_COMPILE_COMPAT={value}");
        }
    }
}

fn version_exceeds(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version.trim().split('.');
    let v_major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let v_minor: u32 = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    v_major > major || (v_major == major && v_minor > minor)
}
