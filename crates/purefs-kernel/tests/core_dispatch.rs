//! Integration tests for mount resolution and call dispatch.
//!
//! Most tests run against `ramfs`; routing details are checked with a
//! recording driver that only implements the required operations.

mod common;

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use purefs_kernel::fs::{file_handle, FileHandle, MountState};
use purefs_kernel::{
    BlockDeviceFactory, Descriptor, DeviceConfig, DiskHandle, DriverBase, Errno, EventFlags, FilesystemDriver,
    FlatFs, MountFlags, MountPoint, OpenFlags, VfsPath, VfsResult, Whence, FLATFS_TYPE, RAMFS_TYPE,
};

use common::{consumer_on_other_thread, drain, Fixture, SECTOR};

// ============================================================================
// Recording driver
// ============================================================================

#[derive(Default)]
struct RecordingFs {
    base: DriverBase,
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingFs {
    fn record(&self, op: &str, path: &str) {
        self.calls.lock().push((op.to_string(), path.to_string()));
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

struct RecordingMount;

impl MountState for RecordingMount {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RecordingFile {
    path: String,
}

impl FileHandle for RecordingFile {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl FilesystemDriver for RecordingFs {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn mount_prealloc(&self, _disk: DiskHandle, _path: &VfsPath, _flags: MountFlags) -> VfsResult<Arc<dyn MountState>> {
        Ok(Arc::new(RecordingMount))
    }

    fn mount(&self, mnt: &MountPoint, _data: Option<&[u8]>) -> VfsResult<()> {
        mnt.state::<RecordingMount>()?;
        self.record("mount", mnt.path().as_str());
        Ok(())
    }

    fn umount(&self, mnt: &MountPoint) -> VfsResult<()> {
        self.record("umount", mnt.path().as_str());
        Ok(())
    }

    fn open(&self, _mnt: &MountPoint, path: &str, _flags: OpenFlags, _mode: u32) -> VfsResult<Arc<dyn FileHandle>> {
        self.record("open", path);
        Ok(Arc::new(RecordingFile { path: path.to_string() }))
    }

    fn close(&self, _mnt: &MountPoint, file: &dyn FileHandle) -> VfsResult<()> {
        let file = file_handle::<RecordingFile>(file)?;
        self.record("close", &file.path);
        if file.path == "stuck" {
            return Err(Errno::EIO);
        }
        Ok(())
    }

    fn read(&self, _mnt: &MountPoint, _file: &dyn FileHandle, _buf: &mut [u8]) -> VfsResult<usize> {
        Ok(0)
    }

    fn write(&self, _mnt: &MountPoint, _file: &dyn FileHandle, buf: &[u8]) -> VfsResult<usize> {
        Ok(buf.len())
    }

    fn stat(&self, mnt: &MountPoint, path: &str) -> VfsResult<purefs_kernel::Stat> {
        self.record("stat", path);
        let mut stat = purefs_kernel::Stat::directory(0o755);
        stat.dev = mnt.dev();
        Ok(stat)
    }
}

fn with_recording() -> (Fixture, Arc<RecordingFs>) {
    let fx = Fixture::new();
    fx.add_disk("rec0", 16);
    let driver = Arc::new(RecordingFs::default());
    fx.core.register_filesystem("recfs", driver.clone()).unwrap();
    fx.core.mount("rec0", "/m", "recfs", MountFlags::empty(), None).unwrap();
    (fx, driver)
}

fn with_two_ramfs() -> Fixture {
    let fx = Fixture::new();
    fx.add_disk("ram0", 64);
    fx.add_disk("ram1", 64);
    fx.core.mount("ram0", "/a", RAMFS_TYPE, MountFlags::empty(), None).unwrap();
    fx.core.mount("ram1", "/b", RAMFS_TYPE, MountFlags::empty(), None).unwrap();
    fx
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_driver_sees_mount_relative_paths() {
    let (fx, driver) = with_recording();
    fx.core.stat("/m").unwrap();
    fx.core.stat("/m/dir/file").unwrap();
    fx.core.stat("/m//dir/./x/../file").unwrap();

    let stats: Vec<_> = driver
        .calls()
        .into_iter()
        .filter(|(op, _)| op == "stat")
        .map(|(_, path)| path)
        .collect();
    assert_eq!(stats, vec!["", "dir/file", "dir/file"]);
}

#[test]
fn test_longest_prefix_wins_on_component_boundaries() {
    let fx = Fixture::new();
    fx.add_disk("ram0", 64);
    fx.add_disk("ram1", 64);
    fx.core.mount("ram0", "/", RAMFS_TYPE, MountFlags::empty(), None).unwrap();
    fx.core.mount("ram1", "/sys/user", RAMFS_TYPE, MountFlags::empty(), None).unwrap();

    let (info, rel) = fx.core.find_mount_point("/sys/user/music/a.mp3").unwrap();
    assert_eq!(info.path.as_str(), "/sys/user");
    assert_eq!(rel, "music/a.mp3");

    let (info, rel) = fx.core.find_mount_point("/sys/username").unwrap();
    assert_eq!(info.path.as_str(), "/");
    assert_eq!(rel, "sys/username");

    let (info, rel) = fx.core.find_mount_point("/sys/user").unwrap();
    assert_eq!(info.path.as_str(), "/sys/user");
    assert_eq!(rel, "");
}

#[test]
fn test_unmounted_path_is_enoent() {
    let fx = with_two_ramfs();
    assert_eq!(fx.core.stat("/c/file").unwrap_err(), Errno::ENOENT);
    assert_eq!(fx.core.open("/ab", OpenFlags::create(), 0o644).unwrap_err(), Errno::ENOENT);
}

#[test]
fn test_unimplemented_operations_are_enotsup() {
    let (fx, _driver) = with_recording();
    assert_eq!(fx.core.mkdir("/m/d", 0o755).unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.unlink("/m/f").unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.readlink("/m/l").unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.symlink("x", "/m/l").unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.statvfs("/m").unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.diropen("/m").unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.rename("/m/a", "/m/b").unwrap_err(), Errno::ENOTSUP);

    let fd = fx.core.open("/m/f", OpenFlags::RDWR, 0).unwrap();
    assert_eq!(fx.core.seek(fd, 0, Whence::Set).unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.fstat(fd).unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.ioctl(fd, 1, 0).unwrap_err(), Errno::ENOTSUP);
    assert_eq!(fx.core.flock(fd, 2).unwrap_err(), Errno::ENOTSUP);
    assert!(!fx.core.isatty(fd).unwrap());
    assert_eq!(fx.core.write(fd, b"abc").unwrap(), 3);
    fx.core.close(fd).unwrap();
}

// ============================================================================
// Mount table
// ============================================================================

#[test]
fn test_mount_errors() {
    let fx = with_two_ramfs();
    assert_eq!(
        fx.core.mount("ram0", "/a", RAMFS_TYPE, MountFlags::empty(), None).unwrap_err(),
        Errno::EBUSY
    );
    assert_eq!(
        fx.core.mount("ram0", "/c", "nosuchfs", MountFlags::empty(), None).unwrap_err(),
        Errno::ENODEV
    );
    assert_eq!(
        fx.core.mount("nodisk", "/c", RAMFS_TYPE, MountFlags::empty(), None).unwrap_err(),
        Errno::ENOENT
    );
    assert_eq!(fx.core.umount("/c").unwrap_err(), Errno::ENOENT);
    assert_eq!(fx.core.umount("/a/sub").unwrap_err(), Errno::ENOENT);
    assert_eq!(fx.core.mounts().len(), 2);
}

#[test]
fn test_register_twice() {
    let (fx, driver) = with_recording();
    assert_eq!(
        fx.core.register_filesystem("recfs", Arc::new(RecordingFs::default())).unwrap_err(),
        Errno::EEXIST
    );
    // The same driver instance cannot be attached a second time.
    assert_eq!(fx.core.register_filesystem("recfs2", driver).unwrap_err(), Errno::EBUSY);
    assert!(!fx.core.filesystems().contains(&"recfs2".to_string()));
}

#[test]
fn test_failed_driver_mount_leaves_no_trace() {
    let fx = Fixture::new();
    fx.add_disk("blank0", 64);
    assert_eq!(
        fx.core.mount("blank0", "/flat", "flatfs", MountFlags::empty(), None).unwrap_err(),
        Errno::EINVAL
    );
    assert!(fx.core.mounts().is_empty());
    assert_eq!(fx.core.stat("/flat").unwrap_err(), Errno::ENOENT);
}

#[test]
fn test_umount_busy_until_handles_close() {
    let (fx, driver) = with_recording();
    let fd = fx.core.open("/m/f", OpenFlags::RDONLY, 0).unwrap();
    assert_eq!(fx.core.umount("/m").unwrap_err(), Errno::EBUSY);
    fx.core.close(fd).unwrap();
    fx.core.umount("/m").unwrap();
    assert_eq!(driver.mount_count(), 0);
    assert_eq!(
        driver.calls().last().unwrap(),
        &("umount".to_string(), "/m".to_string())
    );
    assert_eq!(fx.core.stat("/m").unwrap_err(), Errno::ENOENT);
}

#[test]
fn test_umount_busy_with_open_directory() {
    let fx = with_two_ramfs();
    let dir = fx.core.diropen("/a").unwrap();
    assert_eq!(fx.core.umount("/a").unwrap_err(), Errno::EBUSY);
    fx.core.dirclose(dir).unwrap();
    fx.core.umount("/a").unwrap();
}

#[test]
fn test_mount_count_and_remount() {
    let fx = with_two_ramfs();
    fx.core.umount("/a").unwrap();
    fx.core.umount("/b").unwrap();
    fx.core.mount("ram0", "/a", RAMFS_TYPE, MountFlags::empty(), None).unwrap();
    let mounts = fx.core.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].disk, "ram0");
    assert_eq!(mounts[0].fs_type, RAMFS_TYPE);
    assert!(!mounts[0].read_only());
}

// ============================================================================
// Files
// ============================================================================

#[test]
fn test_copy_between_mounts() {
    let fx = with_two_ramfs();

    let src = fx.core.open("/b/source.txt", OpenFlags::create(), 0o644).unwrap();
    fx.write_all(src, b"01234567");
    fx.core.seek(src, 0, Whence::Set).unwrap();

    let dst = fx.core.open("/a/copy.txt", OpenFlags::create_truncate(), 0o644).unwrap();
    let data = fx.read_to_end(src);
    fx.write_all(dst, &data);

    let src_stat = fx.core.fstat(src).unwrap();
    let dst_stat = fx.core.fstat(dst).unwrap();
    assert_ne!(src_stat.dev, dst_stat.dev);
    assert_eq!(dst_stat.size, 8);

    fx.core.close(src).unwrap();
    fx.core.close(dst).unwrap();
    assert_eq!(fx.core.open_files(), 0);

    let fd = fx.core.open("/a/copy.txt", OpenFlags::RDONLY, 0).unwrap();
    assert_eq!(fx.read_to_end(fd), b"01234567");
    fx.core.close(fd).unwrap();
}

#[test]
fn test_stale_descriptor_is_ebadf() {
    let fx = with_two_ramfs();
    let first = fx.core.open("/a/x", OpenFlags::create(), 0o644).unwrap();
    assert_eq!(first.raw(), 3);
    fx.core.close(first).unwrap();
    let second = fx.core.open("/a/y", OpenFlags::create(), 0o644).unwrap();
    assert_ne!(first, second);

    let mut buf = [0u8; 4];
    assert_eq!(fx.core.read(first, &mut buf).unwrap_err(), Errno::EBADF);
    assert_eq!(fx.core.close(first).unwrap_err(), Errno::EBADF);
    assert_eq!(fx.core.fstat(Descriptor::from_raw(-1)).unwrap_err(), Errno::EBADF);
    assert_eq!(fx.core.write(second, b"ok").unwrap(), 2);
}

#[test]
fn test_full_descriptor_table_closes_driver_handle() {
    let (fx, driver) = with_recording();
    let mut fds = Vec::new();
    loop {
        match fx.core.open("/m/f", OpenFlags::RDONLY, 0) {
            Ok(fd) => fds.push(fd),
            Err(e) => {
                assert_eq!(e, Errno::EMFILE);
                break;
            }
        }
    }
    assert_eq!(fx.core.open_files(), fds.len());

    // A failing close during cleanup must not hide the table error.
    assert_eq!(fx.core.open("/m/stuck", OpenFlags::RDONLY, 0).unwrap_err(), Errno::EMFILE);
    let closes: Vec<_> = driver
        .calls()
        .into_iter()
        .filter(|(op, _)| op == "close")
        .map(|(_, path)| path)
        .collect();
    assert_eq!(closes, vec!["f", "stuck"]);

    for fd in fds {
        fx.core.close(fd).unwrap();
    }
    assert_eq!(fx.core.open_files(), 0);
    fx.core.umount("/m").unwrap();
}

#[test]
fn test_access_mode_is_enforced() {
    let fx = with_two_ramfs();
    let fd = fx.core.open("/a/f", OpenFlags::WRONLY | OpenFlags::CREAT, 0o644).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fx.core.read(fd, &mut buf).unwrap_err(), Errno::EBADF);
    fx.core.write(fd, b"data").unwrap();
    fx.core.close(fd).unwrap();

    let fd = fx.core.open("/a/f", OpenFlags::RDONLY, 0).unwrap();
    assert_eq!(fx.core.write(fd, b"x").unwrap_err(), Errno::EBADF);
    assert_eq!(fx.core.ftruncate(fd, 0).unwrap_err(), Errno::EBADF);
    fx.core.close(fd).unwrap();
}

#[test]
fn test_read_only_mount_rejects_changes() {
    let fx = Fixture::new();
    fx.add_disk("ram0", 64);
    fx.core.mount("ram0", "/rw", RAMFS_TYPE, MountFlags::empty(), None).unwrap();
    fx.core.mount("ram0", "/ro", RAMFS_TYPE, MountFlags::RDONLY, None).unwrap();

    assert_eq!(fx.core.open("/ro/f", OpenFlags::create(), 0o644).unwrap_err(), Errno::EROFS);
    assert_eq!(fx.core.open("/ro/f", OpenFlags::RDONLY | OpenFlags::TRUNC, 0).unwrap_err(), Errno::EROFS);
    assert_eq!(fx.core.mkdir("/ro/d", 0o755).unwrap_err(), Errno::EROFS);
    assert_eq!(fx.core.unlink("/ro/f").unwrap_err(), Errno::EROFS);
    assert_eq!(fx.core.chmod("/ro", 0o700).unwrap_err(), Errno::EROFS);
    assert_eq!(fx.core.open("/ro/f", OpenFlags::RDONLY, 0).unwrap_err(), Errno::ENOENT);
    assert!(fx.core.stat("/ro").unwrap().is_dir());

    fx.core.mkdir("/rw/d", 0o755).unwrap();
}

#[test]
fn test_cross_mount_rename_and_link() {
    let fx = with_two_ramfs();
    let fd = fx.core.open("/a/f", OpenFlags::create(), 0o644).unwrap();
    fx.core.close(fd).unwrap();
    assert_eq!(fx.core.rename("/a/f", "/b/f").unwrap_err(), Errno::EXDEV);
    assert_eq!(fx.core.link("/a/f", "/b/f").unwrap_err(), Errno::EXDEV);

    fx.core.rename("/a/f", "/a/g").unwrap();
    fx.core.link("/a/g", "/a/h").unwrap();
    assert_eq!(fx.core.stat("/a/h").unwrap().nlink, 2);
    assert_eq!(fx.core.stat("/a/f").unwrap_err(), Errno::ENOENT);
}

#[test]
fn test_seek_and_truncate() {
    let fx = with_two_ramfs();
    let fd = fx.core.open("/a/f", OpenFlags::create(), 0o644).unwrap();
    fx.write_all(fd, b"hello world");
    assert_eq!(fx.core.seek(fd, -5, Whence::End).unwrap(), 6);
    assert_eq!(fx.read_to_end(fd), b"world");
    fx.core.ftruncate(fd, 5).unwrap();
    assert_eq!(fx.core.fstat(fd).unwrap().size, 5);
    assert_eq!(fx.core.seek(fd, -1, Whence::Set).unwrap_err(), Errno::EINVAL);
    fx.core.fsync(fd).unwrap();
    fx.core.close(fd).unwrap();
}

// ============================================================================
// Paths and directories
// ============================================================================

#[test]
fn test_directory_tree() {
    let fx = with_two_ramfs();
    fx.core.mkdir("/a/music", 0o755).unwrap();
    fx.core.mkdir("/a/music/rock", 0o755).unwrap();
    for name in ["b.mp3", "a.mp3"] {
        let fd = fx.core.open(&format!("/a/music/{name}"), OpenFlags::create(), 0o644).unwrap();
        fx.core.close(fd).unwrap();
    }
    assert_eq!(fx.list("/a/music"), vec!["a.mp3", "b.mp3", "rock"]);
    assert_eq!(fx.list("/a"), vec!["music"]);

    assert_eq!(fx.core.rmdir("/a/music").unwrap_err(), Errno::ENOTEMPTY);
    assert_eq!(fx.core.diropen("/a/music/a.mp3").unwrap_err(), Errno::ENOTDIR);
    fx.core.rmdir("/a/music/rock").unwrap();
    fx.core.unlink("/a/music/a.mp3").unwrap();
    assert_eq!(fx.list("/a/music"), vec!["b.mp3"]);
}

#[test]
fn test_dirreset_restarts_listing() {
    let fx = with_two_ramfs();
    fx.core.mkdir("/a/one", 0o755).unwrap();
    fx.core.mkdir("/a/two", 0o755).unwrap();
    let dir = fx.core.diropen("/a").unwrap();
    assert_eq!(fx.core.dirnext(dir).unwrap().unwrap().0, "one");
    fx.core.dirreset(dir).unwrap();
    assert_eq!(fx.core.dirnext(dir).unwrap().unwrap().0, "one");
    assert_eq!(fx.core.dirnext(dir).unwrap().unwrap().0, "two");
    assert!(fx.core.dirnext(dir).unwrap().is_none());
    fx.core.dirclose(dir).unwrap();
    assert_eq!(fx.core.dirnext(dir).unwrap_err(), Errno::EBADF);
}

#[test]
fn test_symlinks() {
    let fx = with_two_ramfs();
    fx.core.mkdir("/a/etc", 0o755).unwrap();
    let fd = fx.core.open("/a/etc/real.conf", OpenFlags::create(), 0o644).unwrap();
    fx.write_all(fd, b"key=1");
    fx.core.close(fd).unwrap();

    fx.core.symlink("/etc/real.conf", "/a/absolute").unwrap();
    fx.core.symlink("real.conf", "/a/etc/relative").unwrap();
    assert_eq!(fx.core.readlink("/a/absolute").unwrap(), "/etc/real.conf");
    assert!(fx.core.lstat("/a/absolute").unwrap().is_symlink());

    for link in ["/a/absolute", "/a/etc/relative"] {
        let fd = fx.core.open(link, OpenFlags::RDONLY, 0).unwrap();
        assert_eq!(fx.read_to_end(fd), b"key=1");
        fx.core.close(fd).unwrap();
    }
    assert_eq!(
        fx.core.open("/a/absolute", OpenFlags::RDONLY | OpenFlags::NOFOLLOW, 0).unwrap_err(),
        Errno::ELOOP
    );
    assert_eq!(fx.core.readlink("/a/etc/real.conf").unwrap_err(), Errno::EINVAL);
}

#[test]
fn test_rename_onto_own_hard_link_keeps_both() {
    let fx = with_two_ramfs();
    let fd = fx.core.open("/a/x", OpenFlags::create(), 0o644).unwrap();
    fx.write_all(fd, b"shared");
    fx.core.close(fd).unwrap();
    fx.core.link("/a/x", "/a/y").unwrap();

    fx.core.rename("/a/x", "/a/y").unwrap();
    assert_eq!(fx.list("/a"), vec!["x", "y"]);
    assert_eq!(fx.core.stat("/a/x").unwrap().nlink, 2);
    assert_eq!(fx.core.stat("/a/y").unwrap().nlink, 2);
}

#[test]
fn test_ramfs_growth_is_bounded_by_disk() {
    let fx = with_two_ramfs();
    let fd = fx.core.open("/a/big", OpenFlags::create(), 0o644).unwrap();
    assert_eq!(fx.core.ftruncate(fd, 1u64 << 46).unwrap_err(), Errno::ENOSPC);
    fx.core.seek(fd, 1 << 40, Whence::Set).unwrap();
    assert_eq!(fx.core.write(fd, b"x").unwrap_err(), Errno::ENOSPC);
    assert_eq!(fx.core.fstat(fd).unwrap().size, 0);

    // ram0 has 64 sectors.
    fx.core.ftruncate(fd, 64 * SECTOR).unwrap();
    fx.core.seek(fd, 0, Whence::End).unwrap();
    assert_eq!(fx.core.write(fd, b"x").unwrap_err(), Errno::ENOSPC);
    fx.core.close(fd).unwrap();
}

#[test]
fn test_chmod_and_utimens() {
    let fx = with_two_ramfs();
    let fd = fx.core.open("/a/f", OpenFlags::create(), 0o644).unwrap();
    fx.core.fchmod(fd, 0o600).unwrap();
    fx.core.close(fd).unwrap();
    assert_eq!(fx.core.stat("/a/f").unwrap().perm, 0o600);

    fx.core.chmod("/a/f", 0o640).unwrap();
    let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    fx.core.utimens("/a/f", when, when).unwrap();
    let stat = fx.core.stat("/a/f").unwrap();
    assert_eq!(stat.perm, 0o640);
    assert_eq!(stat.mtime, when);
}

#[test]
fn test_relative_paths_follow_chdir() {
    let fx = with_two_ramfs();
    fx.core.mkdir("/b/work", 0o755).unwrap();
    std::thread::scope(|s| {
        s.spawn(|| {
            fx.core.chdir("/b/work").unwrap();
            assert_eq!(fx.core.getcwd().as_str(), "/b/work");
            let fd = fx.core.open("notes.txt", OpenFlags::create(), 0o644).unwrap();
            fx.core.close(fd).unwrap();
            assert!(fx.core.stat("../work/notes.txt").unwrap().is_file());
        });
    });
    assert!(fx.core.stat("/b/work/notes.txt").unwrap().is_file());
    assert_eq!(fx.core.getcwd().as_str(), "/");

    let fd = fx.core.open("/a/file", OpenFlags::create(), 0o644).unwrap();
    fx.core.close(fd).unwrap();
    assert_eq!(fx.core.chdir("/a/file").unwrap_err(), Errno::ENOTDIR);
}

#[test]
fn test_statvfs_reports_geometry() {
    let fx = with_two_ramfs();
    let vfs = fx.core.statvfs("/a").unwrap();
    assert_eq!(vfs.bsize, 512);
    assert_eq!(vfs.blocks, 64);
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn test_core_operations_notify_other_threads() {
    let fx = with_two_ramfs();
    let (consumer, mut rx) = consumer_on_other_thread("watcher");
    fx.notifier.register_path("/a", &consumer, EventFlags::all()).unwrap();

    let fd = fx.core.open("/a/f", OpenFlags::create(), 0o644).unwrap();
    fx.core.close(fd).unwrap();
    let fd = fx.core.open("/a/f", OpenFlags::RDONLY, 0).unwrap();
    fx.core.close(fd).unwrap();
    fx.core.rename("/a/f", "/a/g").unwrap();
    fx.core.unlink("/a/g").unwrap();
    fx.core.mkdir("/b/elsewhere", 0o755).unwrap();

    let events: Vec<_> = drain(&mut rx)
        .into_iter()
        .map(|n| (n.events, n.path.to_string(), n.previous_path.map(|p| p.to_string())))
        .collect();
    assert_eq!(
        events,
        vec![
            (EventFlags::OPENED, "/a/f".to_string(), None),
            (EventFlags::CLOSED_WRITE, "/a/f".to_string(), None),
            (EventFlags::OPENED, "/a/f".to_string(), None),
            (EventFlags::CLOSED_READ, "/a/f".to_string(), None),
            (EventFlags::RENAMED, "/a/g".to_string(), Some("/a/f".to_string())),
            (EventFlags::REMOVED, "/a/g".to_string(), None),
        ]
    );
}

#[test]
fn test_failed_operations_do_not_notify() {
    let fx = with_two_ramfs();
    let (consumer, mut rx) = consumer_on_other_thread("watcher");
    fx.notifier.register_path("/", &consumer, EventFlags::all()).unwrap();

    assert!(fx.core.unlink("/a/missing").is_err());
    assert!(fx.core.open("/a/missing", OpenFlags::RDONLY, 0).is_err());
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_dropped_consumer_stops_receiving() {
    let fx = with_two_ramfs();
    let (consumer, rx) = consumer_on_other_thread("short-lived");
    fx.notifier.register_path("/a", &consumer, EventFlags::CREATED).unwrap();
    drop(consumer);
    drop(rx);

    fx.core.mkdir("/a/d", 0o755).unwrap();
    assert_eq!(fx.notifier.subscription_count(), 0);
}

#[test]
fn test_mount_snapshot_serializes() {
    let fx = with_two_ramfs();
    let json = serde_json::to_value(fx.core.mounts()).unwrap();
    assert_eq!(json[0]["path"], "/a");
    assert_eq!(json[0]["disk"], "ram0");
    assert_eq!(json[1]["fs_type"], RAMFS_TYPE);
    assert!(json[0].get("flags").is_none());
}

#[test]
fn test_concurrent_io_across_mounts() {
    let fx = Fixture::new();
    let config = DeviceConfig::new("emmc0", fx.dir.path().join("emmc0.img"))
        .with_create_size(256 * SECTOR)
        .with_hw_partitions(2);
    let device = BlockDeviceFactory::new(config).create().unwrap();
    fx.disks.register_device(device, "emmc0", 0).unwrap();
    let sys = fx.disks.device_handle("emmc0sys1").unwrap();
    FlatFs::format(&fx.disks, &sys).unwrap();
    fx.core.mount("emmc0", "/a", RAMFS_TYPE, MountFlags::empty(), None).unwrap();
    fx.core.mount("emmc0sys1", "/b", FLATFS_TYPE, MountFlags::empty(), None).unwrap();

    const THREADS: usize = 4;
    const ROUNDS: usize = 25;
    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let fx = &fx;
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    for root in ["/a", "/b"] {
                        let path = format!("{root}/t{t}");
                        let payload = format!("thread {t} round {round}");
                        let fd = fx.core.open(&path, OpenFlags::create_truncate(), 0o644).unwrap();
                        fx.write_all(fd, payload.as_bytes());
                        fx.core.close(fd).unwrap();

                        let fd = fx.core.open(&path, OpenFlags::RDONLY, 0).unwrap();
                        assert_eq!(fx.read_to_end(fd), payload.as_bytes());
                        fx.core.close(fd).unwrap();
                    }
                }
            });
        }
    });

    for t in 0..THREADS {
        let last = format!("thread {t} round {}", ROUNDS - 1);
        for root in ["/a", "/b"] {
            let fd = fx.core.open(&format!("{root}/t{t}"), OpenFlags::RDONLY, 0).unwrap();
            assert_eq!(fx.read_to_end(fd), last.as_bytes());
            fx.core.close(fd).unwrap();
        }
    }
    assert_eq!(fx.core.open_files(), 0);
    fx.core.umount("/a").unwrap();
    fx.core.umount("/b").unwrap();
}
