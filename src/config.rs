//! Settings file loading and persistence.
//!
//! kforge keeps operator preferences in a JSON file under the user config
//! directory: builder identity, release tag, kernel source location,
//! defaults for defconfig and toolchain, and the optional notification
//! credentials. Absent credentials silently disable notifications.

use crate::error::ConfigError;
use crate::models::Arch;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Operator settings for the build pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Builder identity stamped into packaged archives.
    #[serde(default = "default_builder")]
    pub builder: String,

    /// Release tag prefixed to the kernel name (`tag-codename-version`).
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Kernel variant label stamped into the package control script.
    #[serde(default = "default_variant")]
    pub variant: String,

    /// Absolute path of the kernel source tree.
    #[serde(default = "default_kernel_dir")]
    pub kernel_dir: PathBuf,

    /// Default defconfig name offered at the configure stage.
    #[serde(default)]
    pub defconfig: Option<String>,

    /// Default toolchain family name offered at the resolve stage.
    #[serde(default)]
    pub toolchain: Option<String>,

    /// Target architecture.
    #[serde(default = "default_arch")]
    pub arch: Arch,

    /// Native build tool invoked for every build stage.
    #[serde(default = "default_make")]
    pub make: String,

    /// Notification bot credential; both must be present to enable the sink.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Notification chat credential; both must be present to enable the sink.
    #[serde(default)]
    pub chat_id: Option<String>,
}

fn default_builder() -> String {
    "unknown".to_string()
}

fn default_tag() -> String {
    "KF".to_string()
}

fn default_variant() -> String {
    "stable".to_string()
}

fn default_kernel_dir() -> PathBuf {
    PathBuf::from("kernel")
}

fn default_arch() -> Arch {
    Arch::Arm64
}

fn default_make() -> String {
    "make".to_string()
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            builder: default_builder(),
            tag: default_tag(),
            variant: default_variant(),
            kernel_dir: default_kernel_dir(),
            defconfig: None,
            toolchain: None,
            arch: default_arch(),
            make: default_make(),
            bot_token: None,
            chat_id: None,
        }
    }
}

/// Get the global settings path: ~/.config/kforge/settings.json
pub fn global_settings_path() -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine user config directory".to_string())
    })?;
    Ok(base.join("kforge").join("settings.json"))
}

/// Load config from a JSON file.
pub fn load_config_from_file(path: &Path) -> Result<BuilderConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.display().to_string())
        } else {
            ConfigError::IoError(e)
        }
    })?;
    let mut config: BuilderConfig = serde_json::from_str(&content)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Save config to a JSON file, creating parent directories as needed.
pub fn save_config_to_file(config: &BuilderConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load the global settings, falling back to defaults when the file does
/// not exist yet. Credentials may also arrive via the environment.
pub fn load_or_default() -> Result<BuilderConfig, ConfigError> {
    let path = global_settings_path()?;
    match load_config_from_file(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = BuilderConfig::default();
            apply_env_overrides(&mut config);
            Ok(config)
        }
        Err(e) => Err(e),
    }
}

fn apply_env_overrides(config: &mut BuilderConfig) {
    if let Ok(token) = std::env::var("KFORGE_BOT_TOKEN") {
        if !token.is_empty() {
            config.bot_token = Some(token);
        }
    }
    if let Ok(chat) = std::env::var("KFORGE_CHAT_ID") {
        if !chat.is_empty() {
            config.chat_id = Some(chat);
        }
    }
}
