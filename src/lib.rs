//! kforge — interactive kernel build pipeline.
//!
//! Drives one kernel build end to end: codename selection, toolchain
//! resolution (with on-demand acquisition), kernel configuration, the
//! supervised build with operator-driven retry, freshness verification,
//! flashable packaging, signing, and distribution.
//!
//! The crate is organized into functional modules:
//! - **error**: Unified error type hierarchy and process exit codes
//! - **models**: Core data types (architecture, build environment)
//! - **config**: Operator settings persistence
//! - **paths**: Centralized workspace path registry
//! - **prompt**: Interactive layer boundary (console or scripted)
//! - **session**: Build session state, log recording, instance lock
//! - **exec**: Supervised command execution and the retry protocol
//! - **toolchain**: Compiler family resolution, acquisition, updates
//! - **pipeline**: The staged build state machine and unified teardown
//! - **package**: Flashable archive assembly and signing
//! - **notify**: Optional bot notification sink

pub mod config;
pub mod error;
pub mod exec;
pub mod models;
pub mod notify;
pub mod package;
pub mod paths;
pub mod pipeline;
pub mod prompt;
pub mod session;
pub mod toolchain;

// Re-export the log crate for macro usage
pub use log;

pub use error::{ExitCode, PipelineError};

/// Crate version reported by the CLI and stamped into session banners.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
