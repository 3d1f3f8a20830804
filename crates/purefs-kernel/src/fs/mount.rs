//! Mount points and the opaque objects drivers hang off them.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use purefs_types::{Errno, MountFlags, VfsPath, VfsResult};
use serde::Serialize;

use super::driver::FilesystemDriver;
use crate::blkdev::DiskHandle;

/// Driver-private per-mount state, created by `mount_prealloc`.
pub trait MountState: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Driver-private state of one open file.
pub trait FileHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Driver-private state of one open directory listing.
pub trait DirHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Downcast a file handle to the driver's concrete type; `EBADF` on mismatch.
pub fn file_handle<T: Any>(file: &dyn FileHandle) -> VfsResult<&T> {
    file.as_any().downcast_ref::<T>().ok_or(Errno::EBADF)
}

/// Downcast a directory handle to the driver's concrete type.
pub fn dir_handle<T: Any>(dir: &dyn DirHandle) -> VfsResult<&T> {
    dir.as_any().downcast_ref::<T>().ok_or(Errno::EBADF)
}

static NEXT_DEV: AtomicU64 = AtomicU64::new(1);

/// One mounted filesystem.
pub struct MountPoint {
    path: VfsPath,
    disk: DiskHandle,
    fs_type: String,
    flags: MountFlags,
    dev: u64,
    driver: Arc<dyn FilesystemDriver>,
    state: Arc<dyn MountState>,
    lock: ReentrantMutex<()>,
    active: AtomicBool,
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountPoint")
            .field("path", &self.path)
            .field("disk", &self.disk.name())
            .field("fs_type", &self.fs_type)
            .field("flags", &self.flags)
            .field("dev", &self.dev)
            .finish()
    }
}

impl MountPoint {
    pub(crate) fn new(
        path: VfsPath,
        disk: DiskHandle,
        fs_type: &str,
        flags: MountFlags,
        driver: Arc<dyn FilesystemDriver>,
        state: Arc<dyn MountState>,
    ) -> Self {
        Self {
            path,
            disk,
            fs_type: fs_type.to_string(),
            flags,
            dev: NEXT_DEV.fetch_add(1, Ordering::Relaxed),
            driver,
            state,
            lock: ReentrantMutex::new(()),
            active: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &VfsPath {
        &self.path
    }

    pub fn disk(&self) -> &DiskHandle {
        &self.disk
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.is_read_only()
    }

    /// Device number drivers report in `Stat::dev`; unique per mount.
    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn driver(&self) -> &Arc<dyn FilesystemDriver> {
        &self.driver
    }

    /// The driver's per-mount state as its concrete type.
    ///
    /// `EIO` if the state belongs to another driver.
    pub fn state<T: Any>(&self) -> VfsResult<&T> {
        self.state.as_any().downcast_ref::<T>().ok_or_else(|| {
            tracing::error!(mount = %self.path, fs_type = %self.fs_type, "mount state type mismatch");
            Errno::EIO
        })
    }

    /// Serialize driver calls on this mount.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// `ENOENT` once the mount has been taken down under a caller.
    pub(crate) fn ensure_active(&self) -> VfsResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Errno::ENOENT)
        }
    }

    pub fn info(&self) -> MountInfo {
        MountInfo {
            path: self.path.clone(),
            disk: self.disk.name().to_string(),
            fs_type: self.fs_type.clone(),
            flags: self.flags,
        }
    }
}

/// Information about a mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    /// The mount path (e.g., "/sys").
    pub path: VfsPath,
    /// Disk name the mount was created from.
    pub disk: String,
    /// Registered filesystem type name.
    pub fs_type: String,
    #[serde(skip)]
    pub flags: MountFlags,
}

impl MountInfo {
    pub fn read_only(&self) -> bool {
        self.flags.is_read_only()
    }
}
