//! Flat, single-directory, disk-backed filesystem driver.
//!
//! On-disk layout (all integers little endian):
//!
//! ```text
//! sector 0            superblock
//! sectors 1..=T       entry table, MAX_ENTRIES × 64-byte entries
//! sectors T+1..       file extents, bump allocated
//! ```
//!
//! Each file is one contiguous extent. A write past the extent's capacity
//! moves the file to a fresh extent at the allocation cursor; freed space
//! is not reclaimed until the volume is formatted again.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use purefs_types::{Errno, MountFlags, OpenFlags, Stat, StatVfs, VfsPath, VfsResult, Whence};

use crate::blkdev::{DiskHandle, DiskManager, InfoType};
use crate::fs::{dir_handle, file_handle, DirHandle, DriverBase, FileHandle, FilesystemDriver, MountPoint, MountState};

pub const FLATFS_TYPE: &str = "flatfs";

const MAGIC: &[u8; 8] = b"PUREFLAT";
const VERSION: u32 = 1;
const ENTRY_SIZE: usize = 64;
pub const MAX_ENTRIES: usize = 64;
/// Longest file name, in bytes.
pub const NAME_LEN: usize = 32;
const FLAG_USED: u32 = 1;
const MIN_SECTOR_SIZE: u64 = 64;

// Superblock offsets
const SB_MAGIC: usize = 0;
const SB_VERSION: usize = 8;
const SB_SECTOR_SIZE: usize = 12;
const SB_TABLE_SECTORS: usize = 16;
const SB_MAX_ENTRIES: usize = 20;
const SB_NEXT_FREE: usize = 24;
const SB_TOTAL: usize = 32;

// Entry offsets
const E_NAME: usize = 0;
const E_FLAGS: usize = 32;
const E_MODE: usize = 36;
const E_START: usize = 40;
const E_LEN: usize = 48;
const E_CAP: usize = 56;
const E_MTIME: usize = 60;

fn le32(buf: &[u8], offs: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offs..offs + 4]);
    u32::from_le_bytes(b)
}

fn le64(buf: &[u8], offs: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offs..offs + 8]);
    u64::from_le_bytes(b)
}

fn put32(buf: &mut [u8], offs: usize, v: u32) {
    buf[offs..offs + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], offs: usize, v: u64) {
    buf[offs..offs + 8].copy_from_slice(&v.to_le_bytes());
}

fn table_sectors(sector_size: u64) -> u64 {
    ((MAX_ENTRIES * ENTRY_SIZE) as u64).div_ceil(sector_size)
}

fn unix_secs(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Entry {
    used: bool,
    name: String,
    mode: u32,
    /// First sector of the extent.
    start: u64,
    /// Length in bytes.
    len: u64,
    /// Extent capacity in sectors.
    cap: u32,
    mtime: u32,
}

impl Entry {
    fn decode(raw: &[u8]) -> Self {
        let used = le32(raw, E_FLAGS) & FLAG_USED != 0;
        let name_raw = &raw[E_NAME..E_NAME + NAME_LEN];
        let end = name_raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        Self {
            used,
            name: String::from_utf8_lossy(&name_raw[..end]).into_owned(),
            mode: le32(raw, E_MODE),
            start: le64(raw, E_START),
            len: le64(raw, E_LEN),
            cap: le32(raw, E_CAP),
            mtime: le32(raw, E_MTIME),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[..ENTRY_SIZE].fill(0);
        if !self.used {
            return;
        }
        let name = self.name.as_bytes();
        raw[E_NAME..E_NAME + name.len()].copy_from_slice(name);
        put32(raw, E_FLAGS, FLAG_USED);
        put32(raw, E_MODE, self.mode);
        put64(raw, E_START, self.start);
        put64(raw, E_LEN, self.len);
        put32(raw, E_CAP, self.cap);
        put32(raw, E_MTIME, self.mtime);
    }

    fn stat(&self, dev: u64, index: usize) -> Stat {
        let mut stat = Stat::file(self.len, self.mode);
        stat.dev = dev;
        stat.ino = index as u64 + 2;
        stat.mtime = UNIX_EPOCH + Duration::from_secs(u64::from(self.mtime));
        stat.ctime = stat.mtime;
        stat
    }
}

/// In-memory copy of a mounted volume's metadata.
#[derive(Debug)]
struct Volume {
    sector_size: u64,
    total: u64,
    table_sectors: u64,
    next_free: u64,
    entries: Vec<Entry>,
    open: Vec<usize>,
}

impl Volume {
    fn data_start(&self) -> u64 {
        1 + self.table_sectors
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.used && e.name == name)
    }

    fn superblock(&self) -> Vec<u8> {
        let mut sb = vec![0u8; self.sector_size as usize];
        sb[SB_MAGIC..SB_MAGIC + MAGIC.len()].copy_from_slice(MAGIC);
        put32(&mut sb, SB_VERSION, VERSION);
        put32(&mut sb, SB_SECTOR_SIZE, self.sector_size as u32);
        put32(&mut sb, SB_TABLE_SECTORS, self.table_sectors as u32);
        put32(&mut sb, SB_MAX_ENTRIES, MAX_ENTRIES as u32);
        put64(&mut sb, SB_NEXT_FREE, self.next_free);
        put64(&mut sb, SB_TOTAL, self.total);
        sb
    }

    fn flush_superblock(&self, disks: &DiskManager, disk: &DiskHandle) -> VfsResult<()> {
        disks.write(disk, &self.superblock(), 0, 1)
    }

    /// Rewrite the table sector holding entry `index`.
    fn flush_entry(&self, disks: &DiskManager, disk: &DiskHandle, index: usize) -> VfsResult<()> {
        let per_sector = self.sector_size as usize / ENTRY_SIZE;
        let first = index / per_sector * per_sector;
        let mut sector = vec![0u8; self.sector_size as usize];
        for (slot, entry) in self.entries.iter().enumerate().skip(first).take(per_sector) {
            let offs = (slot - first) * ENTRY_SIZE;
            entry.encode(&mut sector[offs..offs + ENTRY_SIZE]);
        }
        disks.write(disk, &sector, 1 + (index / per_sector) as u64, 1)
    }

    fn load(disks: &DiskManager, disk: &DiskHandle) -> VfsResult<Self> {
        let sector_size = disks.get_info(disk, InfoType::SectorSize)?;
        let sectors = disks.get_info(disk, InfoType::SectorCount)?;
        if sector_size < MIN_SECTOR_SIZE || sectors == 0 {
            return Err(Errno::EINVAL);
        }
        let mut sb = vec![0u8; sector_size as usize];
        disks.read(disk, &mut sb, 0, 1)?;
        if &sb[SB_MAGIC..SB_MAGIC + MAGIC.len()] != MAGIC {
            tracing::warn!(disk = %disk, "no flatfs superblock");
            return Err(Errno::EINVAL);
        }
        let version = le32(&sb, SB_VERSION);
        let on_disk_sector = u64::from(le32(&sb, SB_SECTOR_SIZE));
        let table = u64::from(le32(&sb, SB_TABLE_SECTORS));
        let max_entries = le32(&sb, SB_MAX_ENTRIES) as usize;
        let next_free = le64(&sb, SB_NEXT_FREE);
        let total = le64(&sb, SB_TOTAL);
        if version != VERSION
            || on_disk_sector != sector_size
            || table != table_sectors(sector_size)
            || max_entries != MAX_ENTRIES
            || total > sectors
            || next_free > total
            || next_free < 1 + table
        {
            tracing::error!(disk = %disk, version, on_disk_sector, total, next_free, "corrupt flatfs superblock");
            return Err(Errno::EINVAL);
        }

        let mut raw = vec![0u8; (table * sector_size) as usize];
        disks.read(disk, &mut raw, 1, table as usize)?;
        let entries: Vec<Entry> = raw
            .chunks_exact(ENTRY_SIZE)
            .take(MAX_ENTRIES)
            .map(Entry::decode)
            .collect();
        for entry in entries.iter().filter(|e| e.used) {
            let end = entry.start + u64::from(entry.cap);
            if entry.cap > 0 && (entry.start < 1 + table || end > next_free) {
                tracing::error!(disk = %disk, name = %entry.name, "flatfs extent out of bounds");
                return Err(Errno::EINVAL);
            }
            if entry.len > u64::from(entry.cap) * sector_size {
                tracing::error!(disk = %disk, name = %entry.name, len = entry.len, cap = entry.cap, "flatfs length exceeds extent");
                return Err(Errno::EINVAL);
            }
        }
        Ok(Self {
            sector_size,
            total,
            table_sectors: table,
            next_free,
            entries,
            open: vec![0; MAX_ENTRIES],
        })
    }

    /// Copy `len` bytes of the extent at `from` to the extent at `to`.
    fn copy_extent(&self, disks: &DiskManager, disk: &DiskHandle, from: u64, to: u64, len: u64) -> VfsResult<()> {
        let mut sector = vec![0u8; self.sector_size as usize];
        for i in 0..len.div_ceil(self.sector_size) {
            disks.read(disk, &mut sector, from + i, 1)?;
            disks.write(disk, &sector, to + i, 1)?;
        }
        Ok(())
    }

    /// Make room for `bytes` in entry `index`, relocating it if needed.
    fn reserve(&mut self, disks: &DiskManager, disk: &DiskHandle, index: usize, bytes: u64) -> VfsResult<()> {
        let ss = self.sector_size;
        let entry = &self.entries[index];
        if bytes <= u64::from(entry.cap) * ss {
            return Ok(());
        }
        let exact = bytes.div_ceil(ss);
        let free = self.total - self.next_free;
        if exact > free {
            tracing::warn!(disk = %disk, needed = exact, free, "flatfs volume full");
            return Err(Errno::ENOSPC);
        }
        // Double the extent when there is room, else take the exact size.
        let doubled = u64::from(entry.cap) * 2;
        let cap = if doubled > exact && doubled <= free { doubled } else { exact };
        let cap = u32::try_from(cap).map_err(|_| Errno::EFBIG)?;
        self.relocate(disks, disk, index, cap)
    }

    fn relocate(&mut self, disks: &DiskManager, disk: &DiskHandle, index: usize, cap: u32) -> VfsResult<()> {
        let new_start = self.next_free;
        let (old_start, len) = (self.entries[index].start, self.entries[index].len);
        if len > 0 {
            self.copy_extent(disks, disk, old_start, new_start, len)?;
        }
        self.next_free += u64::from(cap);
        let entry = &mut self.entries[index];
        entry.start = new_start;
        entry.cap = cap;
        self.flush_superblock(disks, disk)?;
        self.flush_entry(disks, disk, index)
    }

    /// Zero bytes `[from, to)` of entry `index`, one sector at a time.
    fn zero_range(&self, disks: &DiskManager, disk: &DiskHandle, index: usize, from: u64, to: u64) -> VfsResult<()> {
        let ss = self.sector_size;
        let start = self.entries[index].start;
        let mut sector = vec![0u8; ss as usize];
        for s in from / ss..to.div_ceil(ss) {
            let base = s * ss;
            let lo = (from.max(base) - base) as usize;
            let hi = (to.min(base + ss) - base) as usize;
            if lo > 0 || hi < sector.len() {
                disks.read(disk, &mut sector, start + s, 1)?;
            }
            sector[lo..hi].fill(0);
            disks.write(disk, &sector, start + s, 1)?;
        }
        Ok(())
    }

    /// Grow entry `index` to `len` bytes of zeros past its current end.
    fn extend(&mut self, disks: &DiskManager, disk: &DiskHandle, index: usize, len: u64) -> VfsResult<()> {
        self.reserve(disks, disk, index, len)?;
        let current = self.entries[index].len;
        if len > current {
            self.zero_range(disks, disk, index, current, len)?;
        }
        let entry = &mut self.entries[index];
        entry.len = entry.len.max(len);
        entry.mtime = unix_secs(SystemTime::now());
        self.flush_entry(disks, disk, index)
    }

    /// Write `data` at byte `pos` of entry `index`, zero-filling any gap.
    fn write_at(&mut self, disks: &DiskManager, disk: &DiskHandle, index: usize, pos: u64, data: &[u8]) -> VfsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = pos.checked_add(data.len() as u64).ok_or(Errno::EFBIG)?;
        self.reserve(disks, disk, index, end)?;
        if pos > self.entries[index].len {
            self.extend(disks, disk, index, pos)?;
        }
        let ss = self.sector_size;
        let entry = &self.entries[index];
        let old_len = entry.len;
        let first = pos / ss;
        let last = (end - 1) / ss;
        let count = (last - first + 1) as usize;

        let mut buf = vec![0u8; count * ss as usize];
        disks.read(disk, &mut buf, entry.start + first, count)?;
        let base = first * ss;
        // Bytes past the old end may hold stale data from earlier extents.
        if old_len < end {
            let stale = (old_len.max(base) - base) as usize;
            buf[stale..].fill(0);
        }
        let offs = (pos - base) as usize;
        buf[offs..offs + data.len()].copy_from_slice(data);
        disks.write(disk, &buf, entry.start + first, count)?;

        let entry = &mut self.entries[index];
        entry.len = entry.len.max(end);
        entry.mtime = unix_secs(SystemTime::now());
        self.flush_entry(disks, disk, index)
    }

    fn read_at(&self, disks: &DiskManager, disk: &DiskHandle, index: usize, pos: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let entry = &self.entries[index];
        if pos >= entry.len || buf.is_empty() {
            return Ok(0);
        }
        let n = (entry.len - pos).min(buf.len() as u64);
        let ss = self.sector_size;
        let first = pos / ss;
        let last = (pos + n - 1) / ss;
        let count = (last - first + 1) as usize;
        let mut tmp = vec![0u8; count * ss as usize];
        disks.read(disk, &mut tmp, entry.start + first, count)?;
        let offs = (pos - first * ss) as usize;
        buf[..n as usize].copy_from_slice(&tmp[offs..offs + n as usize]);
        Ok(n as usize)
    }
}

/// Per-mount state of a `flatfs` mount.
#[derive(Debug)]
pub struct FlatMount {
    disk: DiskHandle,
    volume: Mutex<Option<Volume>>,
}

impl MountState for FlatMount {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct FlatFile {
    index: usize,
    flags: OpenFlags,
    pos: Mutex<u64>,
}

impl FileHandle for FlatFile {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct FlatDir {
    next: Mutex<usize>,
}

impl DirHandle for FlatDir {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Flat disk-backed filesystem driver.
#[derive(Debug, Default)]
pub struct FlatFs {
    base: DriverBase,
}

fn check_name(path: &str) -> VfsResult<()> {
    if path.is_empty() {
        return Err(Errno::EISDIR);
    }
    if path.contains('/') {
        return Err(Errno::ENOENT);
    }
    if path.len() > NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(())
}

impl FlatFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an empty volume onto `disk`.
    #[tracing::instrument(skip(disks))]
    pub fn format(disks: &DiskManager, disk: &DiskHandle) -> VfsResult<()> {
        let sector_size = disks.get_info(disk, InfoType::SectorSize)?;
        let total = disks.get_info(disk, InfoType::SectorCount)?;
        if sector_size < MIN_SECTOR_SIZE || sector_size % ENTRY_SIZE as u64 != 0 {
            return Err(Errno::EINVAL);
        }
        let table = table_sectors(sector_size);
        if total <= 1 + table {
            return Err(Errno::ENOSPC);
        }
        let volume = Volume {
            sector_size,
            total,
            table_sectors: table,
            next_free: 1 + table,
            entries: vec![Entry::default(); MAX_ENTRIES],
            open: vec![0; MAX_ENTRIES],
        };
        let zero = vec![0u8; (table * sector_size) as usize];
        disks.write(disk, &zero, 1, table as usize)?;
        volume.flush_superblock(disks, disk)?;
        disks.sync(disk)?;
        tracing::info!(disk = %disk, total, "formatted flatfs volume");
        Ok(())
    }

    /// Run `op` on the mounted volume of `mnt`.
    fn with_volume<R>(
        &self,
        mnt: &MountPoint,
        op: impl FnOnce(&mut Volume, &DiskManager, &DiskHandle) -> VfsResult<R>,
    ) -> VfsResult<R> {
        let flat = mnt.state::<FlatMount>()?;
        let disks = self.disk_manager()?;
        let mut guard = flat.volume.lock();
        let volume = guard.as_mut().ok_or(Errno::EIO)?;
        op(volume, &disks, &flat.disk)
    }
}

impl FilesystemDriver for FlatFs {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn mount_prealloc(&self, disk: DiskHandle, _path: &VfsPath, _flags: MountFlags) -> VfsResult<Arc<dyn MountState>> {
        Ok(Arc::new(FlatMount {
            disk,
            volume: Mutex::new(None),
        }))
    }

    fn mount(&self, mnt: &MountPoint, _data: Option<&[u8]>) -> VfsResult<()> {
        let flat = mnt.state::<FlatMount>()?;
        let disks = self.disk_manager()?;
        let volume = Volume::load(&disks, &flat.disk)?;
        tracing::debug!(
            mount = %mnt.path(),
            files = volume.entries.iter().filter(|e| e.used).count(),
            "flatfs mounted"
        );
        *flat.volume.lock() = Some(volume);
        Ok(())
    }

    fn umount(&self, mnt: &MountPoint) -> VfsResult<()> {
        let flat = mnt.state::<FlatMount>()?;
        let disks = self.disk_manager()?;
        let mut guard = flat.volume.lock();
        if let Some(volume) = guard.as_ref() {
            if !mnt.is_read_only() {
                volume.flush_superblock(&disks, &flat.disk)?;
            }
            disks.sync(&flat.disk)?;
        }
        *guard = None;
        Ok(())
    }

    fn statvfs(&self, mnt: &MountPoint, _path: &str) -> VfsResult<StatVfs> {
        self.with_volume(mnt, |vol, _, _| {
            let free = vol.total - vol.next_free;
            let free_slots = vol.entries.iter().filter(|e| !e.used).count() as u64;
            Ok(StatVfs {
                bsize: vol.sector_size,
                frsize: vol.sector_size,
                blocks: vol.total - vol.data_start(),
                bfree: free,
                bavail: free,
                files: MAX_ENTRIES as u64,
                ffree: free_slots,
                favail: free_slots,
                fsid: mnt.dev(),
                flag: u64::from(mnt.is_read_only()),
                namemax: NAME_LEN as u64,
            })
        })
    }

    fn open(&self, mnt: &MountPoint, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Arc<dyn FileHandle>> {
        if flags.contains(OpenFlags::DIRECTORY) && !path.is_empty() {
            return Err(Errno::ENOTDIR);
        }
        check_name(path)?;
        self.with_volume(mnt, |vol, disks, disk| {
            let index = match vol.find(path) {
                Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => return Err(Errno::EEXIST),
                Some(index) => {
                    if flags.contains(OpenFlags::TRUNC) && flags.can_write() {
                        let entry = &mut vol.entries[index];
                        entry.len = 0;
                        entry.mtime = unix_secs(SystemTime::now());
                        vol.flush_entry(disks, disk, index)?;
                    }
                    index
                }
                None if flags.contains(OpenFlags::CREAT) => {
                    let index = vol.entries.iter().position(|e| !e.used).ok_or(Errno::ENOSPC)?;
                    vol.entries[index] = Entry {
                        used: true,
                        name: path.to_string(),
                        mode: mode & 0o7777,
                        start: vol.next_free,
                        len: 0,
                        cap: 0,
                        mtime: unix_secs(SystemTime::now()),
                    };
                    vol.flush_entry(disks, disk, index)?;
                    index
                }
                None => return Err(Errno::ENOENT),
            };
            vol.open[index] += 1;
            Ok(Arc::new(FlatFile {
                index,
                flags,
                pos: Mutex::new(0),
            }) as Arc<dyn FileHandle>)
        })
    }

    fn close(&self, mnt: &MountPoint, file: &dyn FileHandle) -> VfsResult<()> {
        let file = file_handle::<FlatFile>(file)?;
        self.with_volume(mnt, |vol, _, _| {
            vol.open[file.index] = vol.open[file.index].saturating_sub(1);
            Ok(())
        })
    }

    fn read(&self, mnt: &MountPoint, file: &dyn FileHandle, buf: &mut [u8]) -> VfsResult<usize> {
        let file = file_handle::<FlatFile>(file)?;
        self.with_volume(mnt, |vol, disks, disk| {
            let mut pos = file.pos.lock();
            let n = vol.read_at(disks, disk, file.index, *pos, buf)?;
            *pos += n as u64;
            Ok(n)
        })
    }

    fn write(&self, mnt: &MountPoint, file: &dyn FileHandle, buf: &[u8]) -> VfsResult<usize> {
        let file = file_handle::<FlatFile>(file)?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.with_volume(mnt, |vol, disks, disk| {
            let mut pos = file.pos.lock();
            if file.flags.contains(OpenFlags::APPEND) {
                *pos = vol.entries[file.index].len;
            }
            vol.write_at(disks, disk, file.index, *pos, buf)?;
            *pos += buf.len() as u64;
            Ok(buf.len())
        })
    }

    fn seek(&self, mnt: &MountPoint, file: &dyn FileHandle, offset: i64, whence: Whence) -> VfsResult<u64> {
        let file = file_handle::<FlatFile>(file)?;
        self.with_volume(mnt, |vol, _, _| {
            let mut pos = file.pos.lock();
            *pos = whence.resolve(offset, *pos, vol.entries[file.index].len)?;
            Ok(*pos)
        })
    }

    fn fstat(&self, mnt: &MountPoint, file: &dyn FileHandle) -> VfsResult<Stat> {
        let file = file_handle::<FlatFile>(file)?;
        self.with_volume(mnt, |vol, _, _| Ok(vol.entries[file.index].stat(mnt.dev(), file.index)))
    }

    fn ftruncate(&self, mnt: &MountPoint, file: &dyn FileHandle, len: u64) -> VfsResult<()> {
        let file = file_handle::<FlatFile>(file)?;
        self.with_volume(mnt, |vol, disks, disk| {
            if len > vol.entries[file.index].len {
                return vol.extend(disks, disk, file.index, len);
            }
            let entry = &mut vol.entries[file.index];
            entry.len = len;
            entry.mtime = unix_secs(SystemTime::now());
            vol.flush_entry(disks, disk, file.index)
        })
    }

    fn fsync(&self, mnt: &MountPoint, _file: &dyn FileHandle) -> VfsResult<()> {
        self.with_volume(mnt, |_, disks, disk| disks.sync(disk))
    }

    fn stat(&self, mnt: &MountPoint, path: &str) -> VfsResult<Stat> {
        if path.is_empty() {
            let mut stat = Stat::directory(0o755);
            stat.dev = mnt.dev();
            stat.ino = 1;
            return Ok(stat);
        }
        check_name(path)?;
        self.with_volume(mnt, |vol, _, _| {
            let index = vol.find(path).ok_or(Errno::ENOENT)?;
            Ok(vol.entries[index].stat(mnt.dev(), index))
        })
    }

    fn unlink(&self, mnt: &MountPoint, path: &str) -> VfsResult<()> {
        check_name(path)?;
        self.with_volume(mnt, |vol, disks, disk| {
            let index = vol.find(path).ok_or(Errno::ENOENT)?;
            if vol.open[index] > 0 {
                return Err(Errno::EBUSY);
            }
            vol.entries[index] = Entry::default();
            vol.flush_entry(disks, disk, index)
        })
    }

    fn rename(&self, mnt: &MountPoint, oldpath: &str, newpath: &str) -> VfsResult<()> {
        check_name(oldpath)?;
        check_name(newpath)?;
        self.with_volume(mnt, |vol, disks, disk| {
            let index = vol.find(oldpath).ok_or(Errno::ENOENT)?;
            if oldpath == newpath {
                return Ok(());
            }
            if let Some(dest) = vol.find(newpath) {
                if vol.open[dest] > 0 {
                    return Err(Errno::EBUSY);
                }
                vol.entries[dest] = Entry::default();
                vol.flush_entry(disks, disk, dest)?;
            }
            vol.entries[index].name = newpath.to_string();
            vol.flush_entry(disks, disk, index)
        })
    }

    fn diropen(&self, mnt: &MountPoint, path: &str) -> VfsResult<Arc<dyn DirHandle>> {
        if !path.is_empty() {
            check_name(path)?;
            return self.with_volume(mnt, |vol, _, _| match vol.find(path) {
                Some(_) => Err(Errno::ENOTDIR),
                None => Err(Errno::ENOENT),
            });
        }
        Ok(Arc::new(FlatDir { next: Mutex::new(0) }))
    }

    fn dirreset(&self, _mnt: &MountPoint, dir: &dyn DirHandle) -> VfsResult<()> {
        *dir_handle::<FlatDir>(dir)?.next.lock() = 0;
        Ok(())
    }

    fn dirnext(&self, mnt: &MountPoint, dir: &dyn DirHandle) -> VfsResult<Option<(String, Stat)>> {
        let dir = dir_handle::<FlatDir>(dir)?;
        self.with_volume(mnt, |vol, _, _| {
            let mut next = dir.next.lock();
            while *next < vol.entries.len() {
                let index = *next;
                *next += 1;
                let entry = &vol.entries[index];
                if entry.used {
                    return Ok(Some((entry.name.clone(), entry.stat(mnt.dev(), index))));
                }
            }
            Ok(None)
        })
    }

    fn dirclose(&self, _mnt: &MountPoint, dir: &dyn DirHandle) -> VfsResult<()> {
        dir_handle::<FlatDir>(dir)?;
        Ok(())
    }
}
