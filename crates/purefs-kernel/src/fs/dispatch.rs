//! Mount table and operation dispatch.
//!
//! [`FilesystemCore`] routes every POSIX-style call to the driver of the
//! longest mounted prefix and owns the file and directory descriptor
//! tables. The core lock only guards table lookups; driver calls run under
//! the target mount's own lock so separate mounts proceed in parallel.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::ReentrantMutex;
use purefs_types::{
    Errno, EventFlags, MountFlags, OpenFlags, Stat, StatVfs, VfsPath, VfsResult, Whence,
};

use super::driver::FilesystemDriver;
use super::handle_table::{Descriptor, HandleTable};
use super::mount::{DirHandle, FileHandle, MountInfo, MountPoint};
use crate::blkdev::DiskManager;
use crate::cwd;
use crate::notify::Notifier;

#[derive(Clone)]
struct OpenFile {
    mount: Arc<MountPoint>,
    handle: Arc<dyn FileHandle>,
    flags: OpenFlags,
}

#[derive(Clone)]
struct OpenDir {
    mount: Arc<MountPoint>,
    handle: Arc<dyn DirHandle>,
}

#[derive(Default)]
struct CoreState {
    drivers: HashMap<String, Arc<dyn FilesystemDriver>>,
    mounts: BTreeMap<VfsPath, Arc<MountPoint>>,
    files: HandleTable<OpenFile>,
    dirs: HandleTable<OpenDir>,
}

impl CoreState {
    /// Longest mounted prefix of `path`, matched on whole components.
    fn find_mount(&self, path: &VfsPath) -> Option<(Arc<MountPoint>, String)> {
        self.mounts
            .iter()
            .filter_map(|(prefix, mnt)| path.strip_prefix(prefix).map(|rest| (prefix, mnt, rest)))
            .max_by_key(|(prefix, _, _)| prefix.depth())
            .map(|(_, mnt, rest)| (Arc::clone(mnt), rest.to_string()))
    }

    fn is_busy(&self, mnt: &Arc<MountPoint>) -> bool {
        self.files.iter().any(|(_, f)| Arc::ptr_eq(&f.mount, mnt))
            || self.dirs.iter().any(|(_, d)| Arc::ptr_eq(&d.mount, mnt))
    }
}

/// The VFS dispatch engine.
pub struct FilesystemCore {
    disks: Arc<DiskManager>,
    notifier: Arc<Notifier>,
    state: ReentrantMutex<RefCell<CoreState>>,
}

impl fmt::Debug for FilesystemCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemCore")
            .field("mounts", &self.mounts())
            .finish()
    }
}

impl FilesystemCore {
    pub fn new(disks: Arc<DiskManager>, notifier: Arc<Notifier>) -> Self {
        Self {
            disks,
            notifier,
            state: ReentrantMutex::new(RefCell::new(CoreState::default())),
        }
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disks
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CoreState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn resolve(&self, path: &VfsPath) -> VfsResult<(Arc<MountPoint>, String)> {
        self.with_state(|s| s.find_mount(path)).ok_or_else(|| {
            tracing::debug!(%path, "no mount for path");
            Errno::ENOENT
        })
    }

    /// Resolve `path` and run `op` on its driver under the mount lock.
    fn dispatch<R>(
        &self,
        path: &VfsPath,
        write: bool,
        op: impl FnOnce(&dyn FilesystemDriver, &MountPoint, &str) -> VfsResult<R>,
    ) -> VfsResult<R> {
        let (mnt, rel) = self.resolve(path)?;
        if write && mnt.is_read_only() {
            return Err(Errno::EROFS);
        }
        let _guard = mnt.lock();
        mnt.ensure_active()?;
        op(mnt.driver().as_ref(), &mnt, &rel)
    }

    fn file(&self, fd: Descriptor) -> VfsResult<OpenFile> {
        self.with_state(|s| s.files.get(fd).cloned()).ok_or(Errno::EBADF)
    }

    fn dir(&self, fd: Descriptor) -> VfsResult<OpenDir> {
        self.with_state(|s| s.dirs.get(fd).cloned()).ok_or(Errno::EBADF)
    }

    /// Run `op` on the driver owning `fd`.
    fn with_file<R>(
        &self,
        fd: Descriptor,
        op: impl FnOnce(&dyn FilesystemDriver, &MountPoint, &OpenFile) -> VfsResult<R>,
    ) -> VfsResult<R> {
        let entry = self.file(fd)?;
        let _guard = entry.mount.lock();
        op(entry.mount.driver().as_ref(), &entry.mount, &entry)
    }

    fn with_dir<R>(
        &self,
        fd: Descriptor,
        op: impl FnOnce(&dyn FilesystemDriver, &MountPoint, &dyn DirHandle) -> VfsResult<R>,
    ) -> VfsResult<R> {
        let entry = self.dir(fd)?;
        let _guard = entry.mount.lock();
        op(entry.mount.driver().as_ref(), &entry.mount, entry.handle.as_ref())
    }

    // ========================================================================
    // Drivers and mounts
    // ========================================================================

    /// Register a driver under `fs_type`.
    ///
    /// `EEXIST` if the name is taken; errors from the driver's
    /// `finalize_registration` abort the registration.
    #[tracing::instrument(skip(self, driver))]
    pub fn register_filesystem(&self, fs_type: &str, driver: Arc<dyn FilesystemDriver>) -> VfsResult<()> {
        if self.with_state(|s| s.drivers.contains_key(fs_type)) {
            tracing::error!(fs_type, "filesystem type already registered");
            return Err(Errno::EEXIST);
        }
        driver.finalize_registration(Arc::downgrade(&self.disks))?;
        let inserted = self.with_state(|s| {
            if s.drivers.contains_key(fs_type) {
                return false;
            }
            s.drivers.insert(fs_type.to_string(), driver);
            true
        });
        if !inserted {
            return Err(Errno::EEXIST);
        }
        tracing::info!(fs_type, "registered filesystem");
        Ok(())
    }

    /// Names of the registered filesystem types.
    pub fn filesystems(&self) -> Vec<String> {
        let mut names: Vec<_> = self.with_state(|s| s.drivers.keys().cloned().collect());
        names.sort();
        names
    }

    /// Mount `disk_name` at `path` with the `fs_type` driver.
    #[tracing::instrument(skip(self, data))]
    pub fn mount(
        &self,
        disk_name: &str,
        path: &str,
        fs_type: &str,
        flags: MountFlags,
        data: Option<&[u8]>,
    ) -> VfsResult<()> {
        let target = cwd::absolutize(path)?;
        let driver = self.with_state(|s| {
            if s.mounts.contains_key(&target) {
                tracing::error!(%target, "path already mounted");
                return Err(Errno::EBUSY);
            }
            s.drivers.get(fs_type).cloned().ok_or_else(|| {
                tracing::error!(fs_type, "unknown filesystem type");
                Errno::ENODEV
            })
        })?;
        let disk = self.disks.device_handle(disk_name)?;

        let state = driver.mount_prealloc(disk.clone(), &target, flags)?;
        let mnt = Arc::new(MountPoint::new(
            target.clone(),
            disk,
            fs_type,
            flags,
            Arc::clone(&driver),
            state,
        ));
        let _guard = mnt.lock();
        driver.mount(&mnt, data).inspect_err(|e| {
            tracing::error!(%target, fs_type, error = %e, "driver refused mount");
        })?;

        let inserted = self.with_state(|s| {
            if s.mounts.contains_key(&target) {
                return false;
            }
            s.mounts.insert(target.clone(), Arc::clone(&mnt));
            true
        });
        if !inserted {
            // Lost a race with another mount of the same path.
            if let Err(e) = driver.umount(&mnt) {
                tracing::warn!(%target, error = %e, "rollback umount failed");
            }
            return Err(Errno::EBUSY);
        }
        mnt.set_active(true);
        driver.base().mount_acquired();
        tracing::info!(%target, disk = disk_name, fs_type, read_only = flags.is_read_only(), "mounted");
        Ok(())
    }

    /// Unmount the filesystem mounted exactly at `path`.
    #[tracing::instrument(skip(self))]
    pub fn umount(&self, path: &str) -> VfsResult<()> {
        let target = cwd::absolutize(path)?;
        let mnt = self
            .with_state(|s| s.mounts.get(&target).cloned())
            .ok_or(Errno::ENOENT)?;
        let _guard = mnt.lock();
        if self.with_state(|s| s.is_busy(&mnt)) {
            tracing::warn!(%target, "umount with open handles");
            return Err(Errno::EBUSY);
        }
        mnt.driver().umount(&mnt)?;
        self.with_state(|s| s.mounts.remove(&target));
        mnt.set_active(false);
        mnt.driver().base().mount_released();
        tracing::info!(%target, "unmounted");
        Ok(())
    }

    /// Snapshot of the mount table, ordered by path.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.with_state(|s| s.mounts.values().map(|m| m.info()).collect())
    }

    /// The mount that serves `path`, and the remainder its driver sees.
    pub fn find_mount_point(&self, path: &str) -> VfsResult<(MountInfo, String)> {
        let abs = cwd::absolutize(path)?;
        let (mnt, rel) = self.resolve(&abs)?;
        Ok((mnt.info(), rel))
    }

    // ========================================================================
    // Files
    // ========================================================================

    #[tracing::instrument(skip(self))]
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Descriptor> {
        let abs = cwd::absolutize(path)?;
        let (mnt, rel) = self.resolve(&abs)?;
        if flags.wants_write() && mnt.is_read_only() {
            return Err(Errno::EROFS);
        }
        let guard = mnt.lock();
        mnt.ensure_active()?;
        let handle = mnt.driver().open(&mnt, &rel, flags, mode)?;
        let entry = OpenFile {
            mount: Arc::clone(&mnt),
            handle: Arc::clone(&handle),
            flags,
        };
        let fd = match self.with_state(|s| s.files.insert(entry)) {
            Ok(fd) => fd,
            Err(e) => {
                if let Err(close_err) = mnt.driver().close(&mnt, handle.as_ref()) {
                    tracing::warn!(path = %abs, error = %close_err, "rollback close failed");
                }
                return Err(e);
            }
        };
        drop(guard);
        self.notifier.notify_open(abs.as_str(), fd.raw(), !flags.can_write());
        Ok(fd)
    }

    /// Close `fd`. The descriptor is released even if the driver fails.
    #[tracing::instrument(skip(self))]
    pub fn close(&self, fd: Descriptor) -> VfsResult<()> {
        let entry = self.file(fd)?;
        let _guard = entry.mount.lock();
        let entry = self
            .with_state(|s| s.files.remove(fd))
            .ok_or(Errno::EBADF)?;
        let result = entry.mount.driver().close(&entry.mount, entry.handle.as_ref());
        self.notifier.notify_close(fd.raw());
        result
    }

    pub fn read(&self, fd: Descriptor, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_file(fd, |driver, mnt, f| {
            if !f.flags.can_read() {
                return Err(Errno::EBADF);
            }
            driver.read(mnt, f.handle.as_ref(), buf)
        })
    }

    pub fn write(&self, fd: Descriptor, buf: &[u8]) -> VfsResult<usize> {
        self.with_file(fd, |driver, mnt, f| {
            if !f.flags.can_write() {
                return Err(Errno::EBADF);
            }
            driver.write(mnt, f.handle.as_ref(), buf)
        })
    }

    pub fn seek(&self, fd: Descriptor, offset: i64, whence: Whence) -> VfsResult<u64> {
        self.with_file(fd, |driver, mnt, f| driver.seek(mnt, f.handle.as_ref(), offset, whence))
    }

    pub fn fstat(&self, fd: Descriptor) -> VfsResult<Stat> {
        self.with_file(fd, |driver, mnt, f| driver.fstat(mnt, f.handle.as_ref()))
    }

    pub fn ftruncate(&self, fd: Descriptor, len: u64) -> VfsResult<()> {
        self.with_file(fd, |driver, mnt, f| {
            if !f.flags.can_write() {
                return Err(Errno::EBADF);
            }
            driver.ftruncate(mnt, f.handle.as_ref(), len)
        })
    }

    pub fn fsync(&self, fd: Descriptor) -> VfsResult<()> {
        self.with_file(fd, |driver, mnt, f| driver.fsync(mnt, f.handle.as_ref()))
    }

    pub fn ioctl(&self, fd: Descriptor, cmd: u32, arg: usize) -> VfsResult<i32> {
        self.with_file(fd, |driver, mnt, f| driver.ioctl(mnt, f.handle.as_ref(), cmd, arg))
    }

    pub fn flock(&self, fd: Descriptor, cmd: i32) -> VfsResult<()> {
        self.with_file(fd, |driver, mnt, f| driver.flock(mnt, f.handle.as_ref(), cmd))
    }

    pub fn isatty(&self, fd: Descriptor) -> VfsResult<bool> {
        self.with_file(fd, |driver, mnt, f| Ok(driver.isatty(mnt, f.handle.as_ref())))
    }

    pub fn fchmod(&self, fd: Descriptor, mode: u32) -> VfsResult<()> {
        self.with_file(fd, |driver, mnt, f| {
            if mnt.is_read_only() {
                return Err(Errno::EROFS);
            }
            driver.fchmod(mnt, f.handle.as_ref(), mode)
        })
    }

    /// Number of open file descriptors.
    pub fn open_files(&self) -> usize {
        self.with_state(|s| s.files.len())
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub fn stat(&self, path: &str) -> VfsResult<Stat> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, false, |driver, mnt, rel| driver.stat(mnt, rel))
    }

    /// Same as [`stat`](Self::stat); drivers do not follow links in `stat`.
    pub fn lstat(&self, path: &str) -> VfsResult<Stat> {
        self.stat(path)
    }

    pub fn statvfs(&self, path: &str) -> VfsResult<StatVfs> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, false, |driver, mnt, rel| driver.statvfs(mnt, rel))
    }

    #[tracing::instrument(skip(self))]
    pub fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, true, |driver, mnt, rel| driver.mkdir(mnt, rel, mode))?;
        self.notifier.notify(abs.as_str(), EventFlags::CREATED);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, true, |driver, mnt, rel| driver.rmdir(mnt, rel))?;
        self.notifier.notify(abs.as_str(), EventFlags::REMOVED);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, true, |driver, mnt, rel| driver.unlink(mnt, rel))?;
        self.notifier.notify(abs.as_str(), EventFlags::REMOVED);
        Ok(())
    }

    /// Resolve two paths that must live on the same mount; `EXDEV` otherwise.
    fn same_mount(&self, a: &VfsPath, b: &VfsPath) -> VfsResult<(Arc<MountPoint>, String, String)> {
        let (mnt_a, rel_a) = self.resolve(a)?;
        let (mnt_b, rel_b) = self.resolve(b)?;
        if !Arc::ptr_eq(&mnt_a, &mnt_b) {
            tracing::debug!(from = %a, to = %b, "cross-mount operation");
            return Err(Errno::EXDEV);
        }
        if mnt_a.is_read_only() {
            return Err(Errno::EROFS);
        }
        Ok((mnt_a, rel_a, rel_b))
    }

    #[tracing::instrument(skip(self))]
    pub fn rename(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let old_abs = cwd::absolutize(oldpath)?;
        let new_abs = cwd::absolutize(newpath)?;
        let (mnt, old_rel, new_rel) = self.same_mount(&old_abs, &new_abs)?;
        {
            let _guard = mnt.lock();
            mnt.ensure_active()?;
            mnt.driver().rename(&mnt, &old_rel, &new_rel)?;
        }
        self.notifier
            .notify_rename(new_abs.as_str(), old_abs.as_str(), EventFlags::RENAMED);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn link(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let old_abs = cwd::absolutize(oldpath)?;
        let new_abs = cwd::absolutize(newpath)?;
        let (mnt, old_rel, new_rel) = self.same_mount(&old_abs, &new_abs)?;
        {
            let _guard = mnt.lock();
            mnt.ensure_active()?;
            mnt.driver().link(&mnt, &old_rel, &new_rel)?;
        }
        self.notifier.notify(new_abs.as_str(), EventFlags::CREATED);
        Ok(())
    }

    /// Create a symlink at `linkpath`; `target` is stored as given.
    #[tracing::instrument(skip(self))]
    pub fn symlink(&self, target: &str, linkpath: &str) -> VfsResult<()> {
        let abs = cwd::absolutize(linkpath)?;
        self.dispatch(&abs, true, |driver, mnt, rel| driver.symlink(mnt, target, rel))?;
        self.notifier.notify(abs.as_str(), EventFlags::CREATED);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, false, |driver, mnt, rel| driver.readlink(mnt, rel))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, true, |driver, mnt, rel| driver.chmod(mnt, rel, mode))
    }

    pub fn utimens(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let abs = cwd::absolutize(path)?;
        self.dispatch(&abs, true, |driver, mnt, rel| driver.utimens(mnt, rel, atime, mtime))
    }

    /// Change the calling thread's current directory.
    pub fn chdir(&self, path: &str) -> VfsResult<()> {
        let abs = cwd::absolutize(path)?;
        let stat = self.stat(abs.as_str())?;
        if !stat.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        cwd::set_current_dir(abs);
        Ok(())
    }

    pub fn getcwd(&self) -> VfsPath {
        cwd::current_dir()
    }

    // ========================================================================
    // Directories
    // ========================================================================

    pub fn diropen(&self, path: &str) -> VfsResult<Descriptor> {
        let abs = cwd::absolutize(path)?;
        let (mnt, rel) = self.resolve(&abs)?;
        let _guard = mnt.lock();
        mnt.ensure_active()?;
        let handle = mnt.driver().diropen(&mnt, &rel)?;
        let entry = OpenDir {
            mount: Arc::clone(&mnt),
            handle: Arc::clone(&handle),
        };
        self.with_state(|s| s.dirs.insert(entry)).inspect_err(|_| {
            if let Err(e) = mnt.driver().dirclose(&mnt, handle.as_ref()) {
                tracing::warn!(path = %abs, error = %e, "rollback dirclose failed");
            }
        })
    }

    /// Next entry of the listing, `None` at the end.
    pub fn dirnext(&self, fd: Descriptor) -> VfsResult<Option<(String, Stat)>> {
        self.with_dir(fd, |driver, mnt, dir| driver.dirnext(mnt, dir))
    }

    pub fn dirreset(&self, fd: Descriptor) -> VfsResult<()> {
        self.with_dir(fd, |driver, mnt, dir| driver.dirreset(mnt, dir))
    }

    pub fn dirclose(&self, fd: Descriptor) -> VfsResult<()> {
        let entry = self.dir(fd)?;
        let _guard = entry.mount.lock();
        let entry = self.with_state(|s| s.dirs.remove(fd)).ok_or(Errno::EBADF)?;
        entry.mount.driver().dirclose(&entry.mount, entry.handle.as_ref())
    }
}
