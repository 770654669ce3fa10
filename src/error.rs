//! Unified error type hierarchy for kforge.
//!
//! Each subsystem owns a thiserror enum; fatal paths converge on the
//! pipeline teardown routine, which maps errors to process exit codes.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes observed by the CLI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Success or clean user abort.
    Success,
    /// Generic user or validation error.
    Failure,
    /// Path resolution error.
    PathResolution,
    /// Environment precondition failure.
    Environment,
    /// Another pipeline instance holds the lock.
    AlreadyRunning,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failure => 1,
            ExitCode::PathResolution => 2,
            ExitCode::Environment => 68,
            ExitCode::AlreadyRunning => 114,
        }
    }
}

/// Settings file loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Build session construction and log recording errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid codename '{0}': must match ^[A-Za-z0-9][A-Za-z0-9_-]{{2,19}}$")]
    InvalidCodename(String),

    #[error("Kernel source tree invalid at {path}: {reason}")]
    SourceInvalid { path: PathBuf, reason: String },

    #[error("Another kforge instance is already running")]
    AlreadyRunning,

    #[error("IO error during session operations: {0}")]
    IoError(#[from] io::Error),
}

/// Toolchain resolution and acquisition errors.
#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("Unsupported toolchain '{0}'")]
    Unsupported(String),

    #[error("Incompatible toolchain: {binary} wants interpreter {interpreter} which does not exist on this host")]
    IncompatibleLinker {
        binary: PathBuf,
        interpreter: String,
    },

    #[error("Toolchain binary {0} has no program interpreter entry")]
    NoInterpreter(PathBuf),

    #[error("Search path was not extended with required directory {0}")]
    PathNotExtended(PathBuf),

    #[error("Toolchain not installed at {0}")]
    NotInstalled(PathBuf),

    #[error("Cannot determine toolchain version: {0}")]
    VersionUnavailable(String),

    #[error("Toolchain acquisition failed: {0}")]
    AcquireFailed(String),

    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error during toolchain operations: {0}")]
    IoError(#[from] io::Error),
}

/// Packaging and signing errors.
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Packaging template project not found at {0}")]
    TemplateMissing(PathBuf),

    #[error("Kernel image not found at {0}")]
    ImageMissing(PathBuf),

    #[error("Archive creation failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error during packaging: {0}")]
    IoError(#[from] io::Error),
}

/// Top-level pipeline errors. All variants funnel through teardown.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The operator declined to continue; not an error condition.
    #[error("Aborted by user")]
    Aborted,

    #[error("Cancelled by signal")]
    Cancelled,

    #[error("Cannot determine kernel version (empty output from build tool)")]
    KernelVersionUnknown,

    #[error("Build did not produce fresh output (stale or missing build metadata)")]
    StaleBuild,

    #[error("Command failed in stage '{stage}': {argv}")]
    CommandFailed { stage: String, argv: String },

    #[error("Upstream release query failed: {0}")]
    Upstream(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl PipelineError {
    /// Whether this is a clean operator abort rather than a failure.
    pub fn is_clean_abort(&self) -> bool {
        matches!(self, PipelineError::Aborted)
    }

    /// Map the error to the process exit code the CLI reports.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            PipelineError::Aborted => ExitCode::Success,
            PipelineError::Session(SessionError::AlreadyRunning) => ExitCode::AlreadyRunning,
            PipelineError::Toolchain(ToolchainError::NotInstalled(_)) => ExitCode::PathResolution,
            PipelineError::Toolchain(
                ToolchainError::PathNotExtended(_)
                | ToolchainError::IncompatibleLinker { .. }
                | ToolchainError::NoInterpreter(_),
            ) => ExitCode::Environment,
            _ => ExitCode::Failure,
        }
    }
}
