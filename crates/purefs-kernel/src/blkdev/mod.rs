//! Block device layer.
//!
//! - [`BlockDevice`] - sector-addressed raw storage, per hardware partition
//! - [`ImageBlockDevice`] - a device backed by image files on the host
//! - [`DiskManager`] - name → device registry handing out [`DiskHandle`]s
//! - [`BlockDeviceFactory`] - builds the platform default device
//!
//! Everything above this module only ever sees a [`DiskHandle`]; concrete
//! device types stay behind the registry.

mod disk_manager;
mod factory;
mod image;
pub mod partition;

pub use disk_manager::{DiskHandle, DiskManager};
pub use factory::{BlockDeviceFactory, DeviceConfig};
pub use image::ImageBlockDevice;
pub use partition::Partition;

use purefs_types::{Errno, VfsResult};
use serde::{Deserialize, Serialize};

/// Hardware partition selector. Zero is the main user area.
pub type HwPart = u16;

/// Geometry query for [`BlockDevice::get_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    SectorSize,
    SectorCount,
    /// Erase unit, in sectors.
    EraseBlock,
}

/// Media presence as reported by [`BlockDevice::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Ok,
    NoMedia,
}

/// Device power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    Active,
    Idle,
    Suspend,
    Off,
}

/// Raw sector storage.
///
/// Addresses are relative to the selected hardware partition and must satisfy
/// `lba + count <= sector_count(hwpart)`; anything else is `ERANGE`.
/// Implementations serialize their own operations and must tolerate the same
/// thread re-entering them.
pub trait BlockDevice: Send + Sync {
    /// Open hardware partition 0 and learn its geometry.
    ///
    /// Returns the number of trailing bytes that do not form a full sector.
    fn probe(&self, flags: u32) -> VfsResult<u64>;

    /// Close every open backing resource.
    fn cleanup(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Read `count` sectors starting at `lba` into `buf`.
    fn read(&self, buf: &mut [u8], lba: u64, count: usize, hwpart: HwPart) -> VfsResult<()>;

    /// Write `count` sectors starting at `lba` from `buf`.
    fn write(&self, buf: &[u8], lba: u64, count: usize, hwpart: HwPart) -> VfsResult<()>;

    /// Erase `count` sectors starting at `lba`.
    fn erase(&self, lba: u64, count: usize, hwpart: HwPart) -> VfsResult<()> {
        let _ = (lba, count, hwpart);
        Err(Errno::ENOTSUP)
    }

    /// Flush every open backing resource.
    fn sync(&self) -> VfsResult<()>;

    fn status(&self) -> MediaStatus;

    fn get_info(&self, what: InfoType, hwpart: HwPart) -> VfsResult<u64>;

    /// Number of hardware partitions this device exposes.
    fn partition_count(&self) -> HwPart;

    fn pm_control(&self, state: PowerState) -> VfsResult<()>;

    fn pm_read(&self) -> VfsResult<PowerState>;
}

/// Validate a sector range against a partition's size.
pub(crate) fn check_range(lba: u64, count: usize, sector_count: u64) -> VfsResult<()> {
    let end = lba.checked_add(count as u64).ok_or(Errno::ERANGE)?;
    if end > sector_count {
        return Err(Errno::ERANGE);
    }
    Ok(())
}
