//! Image-file backed block device.
//!
//! Hardware partition 0 lives in the image file itself; partition `N > 0`
//! lives in a sibling file `<image>.<N>`, created on first access and sized
//! like partition 0.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::ReentrantMutex;
use purefs_types::{Errno, VfsResult};

use super::{check_range, BlockDevice, HwPart, InfoType, MediaStatus, PowerState};

/// Fill pattern written by [`BlockDevice::erase`].
const ERASED_BYTE: u8 = 0xFF;

#[derive(Debug)]
struct ImageState {
    files: Vec<Option<File>>,
    /// Sector count of every hardware partition; zero until probed.
    sectors: u64,
    power: PowerState,
}

/// A [`BlockDevice`] stored in host image files.
#[derive(Debug)]
pub struct ImageBlockDevice {
    image: PathBuf,
    sector_size: u32,
    hw_partitions: HwPart,
    state: ReentrantMutex<RefCell<ImageState>>,
}

impl ImageBlockDevice {
    /// Create a device over `image`. Nothing is opened until [`probe`].
    ///
    /// [`probe`]: BlockDevice::probe
    pub fn new(image: impl Into<PathBuf>, sector_size: u32, hw_partitions: HwPart) -> Self {
        let hw_partitions = hw_partitions.max(1);
        Self {
            image: image.into(),
            sector_size,
            hw_partitions,
            state: ReentrantMutex::new(RefCell::new(ImageState {
                files: (0..hw_partitions).map(|_| None).collect(),
                sectors: 0,
                power: PowerState::Active,
            })),
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.image
    }

    /// Backing file for a hardware partition.
    pub fn partition_path(&self, hwpart: HwPart) -> PathBuf {
        if hwpart == 0 {
            return self.image.clone();
        }
        let mut name = OsString::from(self.image.as_os_str());
        name.push(format!(".{hwpart}"));
        PathBuf::from(name)
    }

    fn check_hwpart(&self, hwpart: HwPart) -> VfsResult<()> {
        if hwpart >= self.hw_partitions {
            return Err(Errno::ERANGE);
        }
        Ok(())
    }

    fn check_io(&self, buf_len: usize, lba: u64, count: usize, hwpart: HwPart, sectors: u64) -> VfsResult<()> {
        self.check_hwpart(hwpart)?;
        check_range(lba, count, sectors)?;
        if Some(buf_len) != count.checked_mul(self.sector_size as usize) {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn byte_offset(&self, lba: u64) -> VfsResult<u64> {
        lba.checked_mul(u64::from(self.sector_size)).ok_or(Errno::ERANGE)
    }

    /// Open (and for `hwpart > 0`, create and size) the partition's file.
    fn ensure_open<'a>(&self, state: &'a mut ImageState, hwpart: HwPart) -> VfsResult<&'a mut File> {
        let idx = usize::from(hwpart);
        if state.files[idx].is_none() {
            if hwpart == 0 {
                // Reopened after cleanup; the geometry may have changed.
                let file = OpenOptions::new().read(true).write(true).open(&self.image)?;
                state.sectors = file.metadata()?.len() / u64::from(self.sector_size);
                tracing::debug!(image = %self.image.display(), sectors = state.sectors, "reopened disk image");
                state.files[0] = Some(file);
                return state.files[0].as_mut().ok_or(Errno::EIO);
            }
            let path = self.partition_path(hwpart);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            let want = state.sectors * u64::from(self.sector_size);
            if file.metadata()?.len() != want {
                file.set_len(want)?;
            }
            tracing::debug!(path = %path.display(), hwpart, "opened hardware partition image");
            state.files[idx] = Some(file);
        }
        state.files[idx].as_mut().ok_or(Errno::EIO)
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> VfsResult<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.read(&mut buf[done..]) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_full(file: &mut File, buf: &[u8]) -> VfsResult<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.write(&buf[done..]) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl BlockDevice for ImageBlockDevice {
    fn probe(&self, _flags: u32) -> VfsResult<u64> {
        if self.sector_size == 0 {
            return Err(Errno::EINVAL);
        }
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let file = OpenOptions::new().read(true).write(true).open(&self.image)?;
        let size = file.metadata()?.len();
        let sector_size = u64::from(self.sector_size);
        state.sectors = size / sector_size;
        state.files[0] = Some(file);
        tracing::debug!(
            image = %self.image.display(),
            sectors = state.sectors,
            sector_size,
            "probed disk image"
        );
        Ok(size % sector_size)
    }

    fn cleanup(&self) -> VfsResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        for file in state.files.iter_mut() {
            *file = None;
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], lba: u64, count: usize, hwpart: HwPart) -> VfsResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.check_io(buf.len(), lba, count, hwpart, state.sectors)?;
        if count == 0 {
            return Ok(());
        }
        let offset = self.byte_offset(lba)?;
        let file = self.ensure_open(&mut state, hwpart)?;
        file.seek(SeekFrom::Start(offset))?;
        read_full(file, buf)
    }

    fn write(&self, buf: &[u8], lba: u64, count: usize, hwpart: HwPart) -> VfsResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.check_io(buf.len(), lba, count, hwpart, state.sectors)?;
        if count == 0 {
            return Ok(());
        }
        let offset = self.byte_offset(lba)?;
        let file = self.ensure_open(&mut state, hwpart)?;
        file.seek(SeekFrom::Start(offset))?;
        write_full(file, buf)
    }

    fn erase(&self, lba: u64, count: usize, hwpart: HwPart) -> VfsResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.check_hwpart(hwpart)?;
        check_range(lba, count, state.sectors)?;
        if count == 0 {
            return Ok(());
        }
        let offset = self.byte_offset(lba)?;
        let fill = vec![ERASED_BYTE; self.sector_size as usize];
        let file = self.ensure_open(&mut state, hwpart)?;
        file.seek(SeekFrom::Start(offset))?;
        for _ in 0..count {
            write_full(file, &fill)?;
        }
        Ok(())
    }

    fn sync(&self) -> VfsResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        for file in state.files.iter_mut().flatten() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn status(&self) -> MediaStatus {
        let _guard = self.state.lock();
        if self.image.exists() {
            MediaStatus::Ok
        } else {
            MediaStatus::NoMedia
        }
    }

    fn get_info(&self, what: InfoType, hwpart: HwPart) -> VfsResult<u64> {
        self.check_hwpart(hwpart)?;
        let guard = self.state.lock();
        let state = guard.borrow();
        Ok(match what {
            InfoType::SectorSize => u64::from(self.sector_size),
            InfoType::SectorCount => state.sectors,
            InfoType::EraseBlock => 1,
        })
    }

    fn partition_count(&self) -> HwPart {
        self.hw_partitions
    }

    fn pm_control(&self, state: PowerState) -> VfsResult<()> {
        let guard = self.state.lock();
        guard.borrow_mut().power = state;
        tracing::trace!(image = %self.image.display(), ?state, "power state change");
        Ok(())
    }

    fn pm_read(&self) -> VfsResult<PowerState> {
        let guard = self.state.lock();
        let power = guard.borrow().power;
        Ok(power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTOR: u32 = 512;

    fn image(sectors: u64, extra: u64) -> (tempfile::TempDir, ImageBlockDevice) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = File::create(&path).unwrap();
        file.set_len(sectors * u64::from(SECTOR) + extra).unwrap();
        let dev = ImageBlockDevice::new(path, SECTOR, 2);
        (dir, dev)
    }

    #[test]
    fn test_probe_reports_remainder() {
        let (_dir, dev) = image(16, 100);
        assert_eq!(dev.probe(0).unwrap(), 100);
        assert_eq!(dev.get_info(InfoType::SectorCount, 0).unwrap(), 16);
        assert_eq!(dev.get_info(InfoType::SectorSize, 0).unwrap(), 512);
    }

    #[test]
    fn test_probe_missing_image() {
        let dev = ImageBlockDevice::new("/nonexistent/purefs/disk.img", SECTOR, 1);
        assert_eq!(dev.probe(0), Err(Errno::ENOENT));
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, dev) = image(16, 0);
        dev.probe(0).unwrap();
        let data = vec![0xA5u8; 2 * SECTOR as usize];
        dev.write(&data, 3, 2, 0).unwrap();
        let mut back = vec![0u8; 2 * SECTOR as usize];
        dev.read(&mut back, 3, 2, 0).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_range_checks() {
        let (_dir, dev) = image(16, 0);
        dev.probe(0).unwrap();
        let mut buf = vec![0u8; 2 * SECTOR as usize];
        assert_eq!(dev.read(&mut buf, 15, 2, 0), Err(Errno::ERANGE));
        assert_eq!(dev.write(&buf, 15, 2, 0), Err(Errno::ERANGE));
        assert_eq!(dev.read(&mut buf, 0, 2, 2), Err(Errno::ERANGE));
        assert_eq!(dev.erase(16, 1, 0), Err(Errno::ERANGE));
        assert_eq!(dev.get_info(InfoType::SectorSize, 5), Err(Errno::ERANGE));
        assert_eq!(dev.read(&mut buf, 0, 1, 0), Err(Errno::EINVAL));
    }

    #[test]
    fn test_hw_partition_sibling_file() {
        let (_dir, dev) = image(8, 0);
        dev.probe(0).unwrap();
        let data = vec![7u8; SECTOR as usize];
        dev.write(&data, 0, 1, 1).unwrap();
        let sibling = dev.partition_path(1);
        assert!(sibling.to_string_lossy().ends_with("disk.img.1"));
        assert_eq!(std::fs::metadata(&sibling).unwrap().len(), 8 * u64::from(SECTOR));

        let mut main = vec![0u8; SECTOR as usize];
        dev.read(&mut main, 0, 1, 0).unwrap();
        assert_eq!(main, vec![0u8; SECTOR as usize]);
    }

    #[test]
    fn test_reopens_after_cleanup() {
        let (_dir, dev) = image(8, 0);
        dev.probe(0).unwrap();
        let data = vec![3u8; SECTOR as usize];
        dev.write(&data, 5, 1, 0).unwrap();
        dev.cleanup().unwrap();

        let mut back = vec![0u8; SECTOR as usize];
        dev.read(&mut back, 5, 1, 0).unwrap();
        assert_eq!(back, data);
        assert_eq!(dev.get_info(InfoType::SectorCount, 0).unwrap(), 8);
    }

    #[test]
    fn test_erase_fills() {
        let (_dir, dev) = image(4, 0);
        dev.probe(0).unwrap();
        dev.erase(1, 1, 0).unwrap();
        let mut buf = vec![0u8; SECTOR as usize];
        dev.read(&mut buf, 1, 1, 0).unwrap();
        assert!(buf.iter().all(|b| *b == ERASED_BYTE));
    }

    #[test]
    fn test_status_and_power() {
        let (dir, dev) = image(4, 0);
        dev.probe(0).unwrap();
        assert_eq!(dev.status(), MediaStatus::Ok);
        dev.pm_control(PowerState::Suspend).unwrap();
        assert_eq!(dev.pm_read().unwrap(), PowerState::Suspend);
        std::fs::remove_file(dir.path().join("disk.img")).unwrap();
        assert_eq!(dev.status(), MediaStatus::NoMedia);
    }

    #[test]
    fn test_reentrant_sync() {
        let (_dir, dev) = image(4, 0);
        dev.probe(0).unwrap();
        let _outer = dev.state.lock();
        // Same thread may take the device lock again.
        dev.sync().unwrap();
    }
}
