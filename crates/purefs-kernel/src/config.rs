//! Boot configuration.
//!
//! A TOML document describing block devices, what to mount where and the
//! host redirection rules:
//!
//! ```toml
//! [[devices]]
//! name = "emmc0"
//! image = "/var/lib/purefs/emmc0.img"
//! create_size = 8388608
//!
//! [[mounts]]
//! disk = "emmc0"
//! path = "/user"
//! fs_type = "flatfs"
//! format_if_invalid = true
//!
//! [redirect]
//! enabled = false
//! ```

use std::collections::HashSet;
use std::path::Path;

use purefs_types::{MountFlags, VfsPath};
use serde::{Deserialize, Serialize};

use crate::blkdev::DeviceConfig;
use crate::redirect::RedirectConfig;

/// Errors from loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// One entry of the boot mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Device, partition or hardware partition name.
    pub disk: String,
    pub path: String,
    pub fs_type: String,
    #[serde(default)]
    pub read_only: bool,
    /// Format the disk when the driver rejects it as invalid.
    #[serde(default)]
    pub format_if_invalid: bool,
}

impl MountConfig {
    pub fn new(disk: impl Into<String>, path: impl Into<String>, fs_type: impl Into<String>) -> Self {
        Self {
            disk: disk.into(),
            path: path.into(),
            fs_type: fs_type.into(),
            read_only: false,
            format_if_invalid: false,
        }
    }

    pub fn flags(&self) -> MountFlags {
        if self.read_only {
            MountFlags::RDONLY
        } else {
            MountFlags::empty()
        }
    }
}

/// Complete VFS boot configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub devices: Vec<DeviceConfig>,
    pub mounts: Vec<MountConfig>,
    pub redirect: RedirectConfig,
}

impl VfsConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading vfs config");
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the configuration for conflicts.
    ///
    /// Device names must be unique and non-empty, sector sizes non-zero,
    /// mount paths absolute and distinct, and every mount must name a
    /// disk that starts with a configured device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for dev in &self.devices {
            if dev.name.is_empty() {
                return Err(ConfigError::ValidationFailed("device with empty name".into()));
            }
            if dev.sector_size == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "device {}: sector_size must be non-zero",
                    dev.name
                )));
            }
            if !names.insert(dev.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!("duplicate device {}", dev.name)));
            }
        }

        let mut paths = HashSet::new();
        for mount in &self.mounts {
            let path = VfsPath::new(&mount.path).map_err(|e| {
                ConfigError::ValidationFailed(format!("mount path {:?}: {e}", mount.path))
            })?;
            if !paths.insert(path) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate mount path {}",
                    mount.path
                )));
            }
            if !names.iter().any(|name| mount.disk.starts_with(name)) {
                return Err(ConfigError::ValidationFailed(format!(
                    "mount {} refers to unknown disk {}",
                    mount.path, mount.disk
                )));
            }
        }
        Ok(())
    }
}
