//! Disk registry.
//!
//! Maps device names to [`BlockDevice`]s and turns names into opaque
//! [`DiskHandle`]s. Accepted names:
//!
//! - `emmc0` - the whole device, hardware partition 0
//! - `emmc0part1` - MBR partition 1 of `emmc0`
//! - `emmc0sys1` - hardware partition 1 of `emmc0`

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use purefs_types::{Errno, VfsResult};

use super::partition::{self, Partition};
use super::{check_range, BlockDevice, HwPart, InfoType, MediaStatus, PowerState};

const PART_INFIX: &str = "part";
const HWPART_INFIX: &str = "sys";

/// Opaque reference to (device, hardware partition, optional MBR partition).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskHandle {
    name: String,
    disk: String,
    hwpart: HwPart,
    /// `(start, count)` of an MBR partition, in sectors.
    range: Option<(u64, u64)>,
}

impl DiskHandle {
    /// The name this handle was resolved from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered device name.
    pub fn disk(&self) -> &str {
        &self.disk
    }

    pub fn hwpart(&self) -> HwPart {
        self.hwpart
    }

    pub fn is_partition(&self) -> bool {
        self.range.is_some()
    }

    /// Translate a partition-relative range to a device one.
    fn translate(&self, lba: u64, count: usize) -> VfsResult<u64> {
        match self.range {
            Some((start, sectors)) => {
                check_range(lba, count, sectors)?;
                Ok(start + lba)
            }
            None => Ok(lba),
        }
    }
}

impl fmt::Display for DiskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

struct Registered {
    device: Arc<dyn BlockDevice>,
    partitions: Vec<Partition>,
}

/// Registry of block devices.
pub struct DiskManager {
    devices: ReentrantMutex<RefCell<HashMap<String, Registered>>>,
}

impl fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskManager")
            .field("devices", &self.devices())
            .finish()
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            devices: ReentrantMutex::new(RefCell::new(HashMap::new())),
        }
    }

    /// Register `device` under `name`, probing it and scanning its
    /// partition table.
    ///
    /// Fails with `EEXIST` if the name is taken; the existing registration
    /// stays untouched. Probe errors propagate and register nothing.
    #[tracing::instrument(skip(self, device))]
    pub fn register_device(&self, device: Arc<dyn BlockDevice>, name: &str, flags: u32) -> VfsResult<()> {
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }
        let guard = self.devices.lock();
        if guard.borrow().contains_key(name) {
            tracing::error!(name, "disk already registered");
            return Err(Errno::EEXIST);
        }
        let remainder = device.probe(flags)?;
        if remainder != 0 {
            tracing::warn!(name, remainder, "image size is not a multiple of the sector size");
        }
        let partitions = match partition::scan(device.as_ref(), name) {
            Ok(parts) => parts,
            Err(Errno::ENXIO) => Vec::new(),
            Err(e) => {
                tracing::error!(name, error = %e, "partition scan failed");
                return Err(e);
            }
        };
        tracing::info!(name, partitions = partitions.len(), "registered disk");
        guard
            .borrow_mut()
            .insert(name.to_string(), Registered { device, partitions });
        Ok(())
    }

    /// Forget a device, closing its backing resources.
    pub fn unregister_device(&self, name: &str) -> VfsResult<()> {
        let guard = self.devices.lock();
        let removed = guard.borrow_mut().remove(name).ok_or(Errno::ENOENT)?;
        removed.device.cleanup()
    }

    /// Names of every registered device.
    pub fn devices(&self) -> Vec<String> {
        let guard = self.devices.lock();
        let mut names: Vec<_> = guard.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// MBR partitions found on a device.
    pub fn partitions(&self, name: &str) -> VfsResult<Vec<Partition>> {
        let guard = self.devices.lock();
        let devices = guard.borrow();
        let entry = devices.get(name).ok_or(Errno::ENOENT)?;
        Ok(entry.partitions.clone())
    }

    /// Scan the partition table again, e.g. after it was rewritten.
    pub fn reread_partitions(&self, name: &str) -> VfsResult<()> {
        let guard = self.devices.lock();
        let device = self.device(name)?;
        let partitions = match partition::scan(device.as_ref(), name) {
            Ok(parts) => parts,
            Err(Errno::ENXIO) => Vec::new(),
            Err(e) => return Err(e),
        };
        if let Some(entry) = guard.borrow_mut().get_mut(name) {
            entry.partitions = partitions;
        }
        Ok(())
    }

    /// Resolve a device, partition or hardware-partition name.
    pub fn device_handle(&self, name: &str) -> VfsResult<DiskHandle> {
        let guard = self.devices.lock();
        let devices = guard.borrow();
        if devices.contains_key(name) {
            return Ok(DiskHandle {
                name: name.to_string(),
                disk: name.to_string(),
                hwpart: 0,
                range: None,
            });
        }
        for (disk, entry) in devices.iter() {
            let Some(suffix) = name.strip_prefix(disk.as_str()) else {
                continue;
            };
            if suffix.starts_with(PART_INFIX) {
                if let Some(part) = entry.partitions.iter().find(|p| p.name == name) {
                    return Ok(DiskHandle {
                        name: name.to_string(),
                        disk: disk.clone(),
                        hwpart: 0,
                        range: Some((part.start_sector, part.num_sectors)),
                    });
                }
            } else if let Some(num) = suffix.strip_prefix(HWPART_INFIX) {
                let Ok(hwpart) = num.parse::<HwPart>() else {
                    continue;
                };
                if hwpart < entry.device.partition_count() {
                    return Ok(DiskHandle {
                        name: name.to_string(),
                        disk: disk.clone(),
                        hwpart,
                        range: None,
                    });
                }
            }
        }
        Err(Errno::ENOENT)
    }

    /// Resolve an explicit (device, hardware partition) pair.
    pub fn device_handle_hw(&self, name: &str, hwpart: HwPart) -> VfsResult<DiskHandle> {
        let device = self.device(name)?;
        if hwpart >= device.partition_count() {
            return Err(Errno::ERANGE);
        }
        let handle_name = if hwpart == 0 {
            name.to_string()
        } else {
            format!("{name}{HWPART_INFIX}{hwpart}")
        };
        Ok(DiskHandle {
            name: handle_name,
            disk: name.to_string(),
            hwpart,
            range: None,
        })
    }

    fn device(&self, name: &str) -> VfsResult<Arc<dyn BlockDevice>> {
        let guard = self.devices.lock();
        let devices = guard.borrow();
        devices
            .get(name)
            .map(|entry| Arc::clone(&entry.device))
            .ok_or(Errno::ENOENT)
    }

    pub fn read(&self, handle: &DiskHandle, buf: &mut [u8], lba: u64, count: usize) -> VfsResult<()> {
        let device = self.device(handle.disk())?;
        let lba = handle.translate(lba, count)?;
        device.read(buf, lba, count, handle.hwpart)
    }

    pub fn write(&self, handle: &DiskHandle, buf: &[u8], lba: u64, count: usize) -> VfsResult<()> {
        let device = self.device(handle.disk())?;
        let lba = handle.translate(lba, count)?;
        device.write(buf, lba, count, handle.hwpart)
    }

    pub fn erase(&self, handle: &DiskHandle, lba: u64, count: usize) -> VfsResult<()> {
        let device = self.device(handle.disk())?;
        let lba = handle.translate(lba, count)?;
        device.erase(lba, count, handle.hwpart)
    }

    pub fn sync(&self, handle: &DiskHandle) -> VfsResult<()> {
        self.device(handle.disk())?.sync()
    }

    pub fn status(&self, handle: &DiskHandle) -> VfsResult<MediaStatus> {
        Ok(self.device(handle.disk())?.status())
    }

    /// Geometry of the handle's region; partitions report their own size.
    pub fn get_info(&self, handle: &DiskHandle, what: InfoType) -> VfsResult<u64> {
        let device = self.device(handle.disk())?;
        match (what, handle.range) {
            (InfoType::SectorCount, Some((_, sectors))) => Ok(sectors),
            _ => device.get_info(what, handle.hwpart),
        }
    }

    pub fn pm_control(&self, handle: &DiskHandle, state: PowerState) -> VfsResult<()> {
        self.device(handle.disk())?.pm_control(state)
    }

    pub fn pm_read(&self, handle: &DiskHandle) -> VfsResult<PowerState> {
        self.device(handle.disk())?.pm_read()
    }
}
