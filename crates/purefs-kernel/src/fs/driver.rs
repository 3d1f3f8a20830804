//! Filesystem driver contract.
//!
//! Drivers are path-based: [`FilesystemCore`](super::FilesystemCore) hands
//! them the mount-relative remainder of every path (no leading `/`, empty
//! for the mount root) together with the [`MountPoint`] it resolved to.
//! Every driver call is made under that mount point's lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use purefs_types::{Errno, MountFlags, OpenFlags, Stat, StatVfs, VfsPath, VfsResult, Whence};

use super::mount::{DirHandle, FileHandle, MountPoint, MountState};
use crate::blkdev::{DiskHandle, DiskManager};

/// State every driver embeds: the disk manager back-reference and the
/// live mount count.
#[derive(Debug, Default)]
pub struct DriverBase {
    disks: OnceLock<Weak<DiskManager>>,
    mounts: AtomicUsize,
}

impl DriverBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the disk manager reference; `EBUSY` on a second call.
    pub fn attach(&self, disks: Weak<DiskManager>) -> VfsResult<()> {
        self.disks.set(disks).map_err(|_| Errno::EBUSY)
    }

    pub fn is_attached(&self) -> bool {
        self.disks.get().is_some()
    }

    /// Upgrade the disk manager reference; `EIO` if unattached or gone.
    pub fn disk_manager(&self) -> VfsResult<Arc<DiskManager>> {
        self.disks.get().and_then(Weak::upgrade).ok_or(Errno::EIO)
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::Acquire)
    }

    pub(crate) fn mount_acquired(&self) {
        self.mounts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mount_released(&self) {
        let _ = self
            .mounts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A pluggable filesystem implementation.
///
/// Only mounting and the basic file lifecycle are required; every other
/// operation answers `ENOTSUP` until the driver overrides it.
pub trait FilesystemDriver: Send + Sync {
    /// The embedded [`DriverBase`].
    fn base(&self) -> &DriverBase;

    // ========================================================================
    // Registration
    // ========================================================================

    /// Called once when the driver is registered with a core.
    ///
    /// Fails with `EBUSY` if the driver was already registered.
    fn finalize_registration(&self, disks: Weak<DiskManager>) -> VfsResult<()> {
        self.base().attach(disks)?;
        self.registration_completed()
    }

    /// Hook run after the disk manager reference is stored.
    fn registration_completed(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Number of live mounts of this driver.
    fn mount_count(&self) -> usize {
        self.base().mount_count()
    }

    fn disk_manager(&self) -> VfsResult<Arc<DiskManager>> {
        self.base().disk_manager()
    }

    // ========================================================================
    // Mounting
    // ========================================================================

    /// Allocate per-mount state without touching the disk.
    fn mount_prealloc(&self, disk: DiskHandle, path: &VfsPath, flags: MountFlags) -> VfsResult<Arc<dyn MountState>>;

    /// Bring the mount online, validating the on-disk format.
    fn mount(&self, mnt: &MountPoint, data: Option<&[u8]>) -> VfsResult<()>;

    /// Take the mount offline, flushing anything pending.
    fn umount(&self, mnt: &MountPoint) -> VfsResult<()>;

    fn statvfs(&self, _mnt: &MountPoint, _path: &str) -> VfsResult<StatVfs> {
        Err(Errno::ENOTSUP)
    }

    // ========================================================================
    // Files
    // ========================================================================

    fn open(&self, mnt: &MountPoint, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Arc<dyn FileHandle>>;

    fn close(&self, mnt: &MountPoint, file: &dyn FileHandle) -> VfsResult<()>;

    /// Read at the handle's position, advancing it. `Ok(0)` at end of file.
    fn read(&self, mnt: &MountPoint, file: &dyn FileHandle, buf: &mut [u8]) -> VfsResult<usize>;

    /// Write at the handle's position (or the end, for `O_APPEND`).
    fn write(&self, mnt: &MountPoint, file: &dyn FileHandle, buf: &[u8]) -> VfsResult<usize>;

    /// Reposition the handle, returning the new absolute offset.
    fn seek(&self, _mnt: &MountPoint, _file: &dyn FileHandle, _offset: i64, _whence: Whence) -> VfsResult<u64> {
        Err(Errno::ENOTSUP)
    }

    fn fstat(&self, _mnt: &MountPoint, _file: &dyn FileHandle) -> VfsResult<Stat> {
        Err(Errno::ENOTSUP)
    }

    fn ftruncate(&self, _mnt: &MountPoint, _file: &dyn FileHandle, _len: u64) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn fsync(&self, _mnt: &MountPoint, _file: &dyn FileHandle) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn ioctl(&self, _mnt: &MountPoint, _file: &dyn FileHandle, _cmd: u32, _arg: usize) -> VfsResult<i32> {
        Err(Errno::ENOTSUP)
    }

    fn flock(&self, _mnt: &MountPoint, _file: &dyn FileHandle, _cmd: i32) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn isatty(&self, _mnt: &MountPoint, _file: &dyn FileHandle) -> bool {
        false
    }

    fn fchmod(&self, _mnt: &MountPoint, _file: &dyn FileHandle, _mode: u32) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    // ========================================================================
    // Paths
    // ========================================================================

    fn stat(&self, _mnt: &MountPoint, _path: &str) -> VfsResult<Stat> {
        Err(Errno::ENOTSUP)
    }

    /// Create a hard link `newpath` to `oldpath`.
    fn link(&self, _mnt: &MountPoint, _oldpath: &str, _newpath: &str) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    /// Create a symlink at `linkpath`; `target` is stored verbatim.
    fn symlink(&self, _mnt: &MountPoint, _target: &str, _linkpath: &str) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn readlink(&self, _mnt: &MountPoint, _path: &str) -> VfsResult<String> {
        Err(Errno::ENOTSUP)
    }

    fn unlink(&self, _mnt: &MountPoint, _path: &str) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn rmdir(&self, _mnt: &MountPoint, _path: &str) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn rename(&self, _mnt: &MountPoint, _oldpath: &str, _newpath: &str) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn mkdir(&self, _mnt: &MountPoint, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn chmod(&self, _mnt: &MountPoint, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn utimens(&self, _mnt: &MountPoint, _path: &str, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    // ========================================================================
    // Directories
    // ========================================================================

    fn diropen(&self, _mnt: &MountPoint, _path: &str) -> VfsResult<Arc<dyn DirHandle>> {
        Err(Errno::ENOTSUP)
    }

    /// Restart iteration from the first entry.
    fn dirreset(&self, _mnt: &MountPoint, _dir: &dyn DirHandle) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }

    /// Next `(name, stat)` pair, or `None` once the listing is exhausted.
    fn dirnext(&self, _mnt: &MountPoint, _dir: &dyn DirHandle) -> VfsResult<Option<(String, Stat)>> {
        Err(Errno::ENOTSUP)
    }

    fn dirclose(&self, _mnt: &MountPoint, _dir: &dyn DirHandle) -> VfsResult<()> {
        Err(Errno::ENOTSUP)
    }
}
