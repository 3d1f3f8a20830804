//! Default block device construction.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use purefs_types::VfsResult;
use serde::{Deserialize, Serialize};

use super::{BlockDevice, HwPart, ImageBlockDevice};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_HW_PARTITIONS: HwPart = 1;

fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

fn default_hw_partitions() -> HwPart {
    DEFAULT_HW_PARTITIONS
}

/// Geometry and backing of one block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registry name, e.g. `emmc0`.
    pub name: String,
    /// Backing image file.
    pub image: PathBuf,
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    #[serde(default = "default_hw_partitions")]
    pub hw_partitions: HwPart,
    /// Create the image with this many bytes if it does not exist yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_size: Option<u64>,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            sector_size: DEFAULT_SECTOR_SIZE,
            hw_partitions: DEFAULT_HW_PARTITIONS,
            create_size: None,
        }
    }

    pub fn with_hw_partitions(mut self, hw_partitions: HwPart) -> Self {
        self.hw_partitions = hw_partitions;
        self
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_create_size(mut self, bytes: u64) -> Self {
        self.create_size = Some(bytes);
        self
    }
}

/// Builds the platform's default [`BlockDevice`].
///
/// On the host this is always an [`ImageBlockDevice`].
#[derive(Debug, Clone)]
pub struct BlockDeviceFactory {
    config: DeviceConfig,
}

impl BlockDeviceFactory {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Build the device, creating a blank image first if configured to.
    pub fn create(&self) -> VfsResult<Arc<dyn BlockDevice>> {
        if let Some(size) = self.config.create_size {
            if !self.config.image.exists() {
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&self.config.image)?;
                file.set_len(size)?;
                tracing::info!(image = %self.config.image.display(), size, "created blank disk image");
            }
        }
        Ok(Arc::new(ImageBlockDevice::new(
            self.config.image.clone(),
            self.config.sector_size,
            self.config.hw_partitions,
        )))
    }
}
