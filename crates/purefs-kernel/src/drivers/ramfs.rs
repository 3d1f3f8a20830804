//! In-memory filesystem driver.
//!
//! Used for scratch mounts and testing. All data is ephemeral and lives in
//! the per-mount state, so two mounts of `ramfs` never share files. The
//! disk is only consulted for `statvfs` geometry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use purefs_types::{Errno, MountFlags, OpenFlags, Stat, StatVfs, VfsPath, VfsResult, Whence, NAME_MAX};

use crate::blkdev::{DiskHandle, InfoType};
use crate::fs::{dir_handle, file_handle, DirHandle, DriverBase, FileHandle, FilesystemDriver, MountPoint, MountState};

pub const RAMFS_TYPE: &str = "ramfs";

const ROOT_INO: u64 = 1;
const MAX_SYMLINK_HOPS: usize = 8;

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Directory,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Inode {
    stat: Stat,
    content: Content,
}

/// Names map onto inodes so open handles survive rename and unlink.
#[derive(Debug)]
struct Tree {
    names: HashMap<String, u64>,
    inodes: HashMap<u64, Inode>,
    open: HashMap<u64, usize>,
    next_ino: u64,
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Resolve a symlink `target` found in directory `dir`.
///
/// Absolute targets are taken from the mount root.
fn link_target(dir: &str, target: &str) -> String {
    let mut parts: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        dir.split('/').filter(|c| !c.is_empty()).collect()
    };
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    parts.join("/")
}

impl Tree {
    fn new() -> Self {
        let mut root = Stat::directory(0o755);
        root.ino = ROOT_INO;
        let mut names = HashMap::new();
        let mut inodes = HashMap::new();
        names.insert(String::new(), ROOT_INO);
        inodes.insert(
            ROOT_INO,
            Inode {
                stat: root,
                content: Content::Directory,
            },
        );
        Self {
            names,
            inodes,
            open: HashMap::new(),
            next_ino: ROOT_INO + 1,
        }
    }

    /// `ENOTDIR` if some ancestor of `path` is not a directory, else `ENOENT`.
    fn missing(&self, path: &str) -> Errno {
        let mut dir = parent_of(path);
        loop {
            if let Some(inode) = self.names.get(dir).and_then(|ino| self.inodes.get(ino)) {
                if !matches!(inode.content, Content::Directory) {
                    return Errno::ENOTDIR;
                }
            }
            if dir.is_empty() {
                return Errno::ENOENT;
            }
            dir = parent_of(dir);
        }
    }

    fn lookup(&self, path: &str) -> VfsResult<u64> {
        self.names.get(path).copied().ok_or_else(|| self.missing(path))
    }

    /// Look `path` up, following symlinks.
    fn resolve(&self, path: &str) -> VfsResult<u64> {
        let mut current = path.to_string();
        for _ in 0..MAX_SYMLINK_HOPS {
            let ino = self.lookup(&current)?;
            match &self.inode(ino)?.content {
                Content::Symlink(target) => current = link_target(parent_of(&current), target),
                _ => return Ok(ino),
            }
        }
        Err(Errno::ELOOP)
    }

    fn inode(&self, ino: u64) -> VfsResult<&Inode> {
        self.inodes.get(&ino).ok_or(Errno::EIO)
    }

    fn inode_mut(&mut self, ino: u64) -> VfsResult<&mut Inode> {
        self.inodes.get_mut(&ino).ok_or(Errno::EIO)
    }

    fn is_dir(&self, ino: u64) -> bool {
        matches!(self.inodes.get(&ino).map(|i| &i.content), Some(Content::Directory))
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .keys()
            .filter(|k| !k.is_empty() && parent_of(k) == dir)
            .map(|k| k.rsplit('/').next().unwrap_or(k.as_str()).to_string())
            .collect();
        names.sort();
        names
    }

    /// Link a fresh inode at `path`; the parent must be a directory.
    fn create(&mut self, path: &str, content: Content, mut stat: Stat) -> VfsResult<u64> {
        if path.is_empty() || self.names.contains_key(path) {
            return Err(Errno::EEXIST);
        }
        if path.rsplit('/').next().is_some_and(|name| name.len() > NAME_MAX) {
            return Err(Errno::ENAMETOOLONG);
        }
        let parent = self.lookup(parent_of(path))?;
        if !self.is_dir(parent) {
            return Err(Errno::ENOTDIR);
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        stat.ino = ino;
        self.inodes.insert(ino, Inode { stat, content });
        self.names.insert(path.to_string(), ino);
        Ok(ino)
    }

    /// Drop the name `path`, freeing its inode once unlinked and closed.
    fn release(&mut self, path: &str) -> VfsResult<()> {
        let ino = self.names.remove(path).ok_or(Errno::ENOENT)?;
        let inode = self.inode_mut(ino)?;
        inode.stat.nlink = inode.stat.nlink.saturating_sub(1);
        inode.stat.ctime = SystemTime::now();
        self.maybe_free(ino);
        Ok(())
    }

    fn maybe_free(&mut self, ino: u64) {
        let linked = self.inodes.get(&ino).is_some_and(|i| i.stat.nlink > 0);
        let open = self.open.get(&ino).copied().unwrap_or(0) > 0;
        if !linked && !open {
            self.inodes.remove(&ino);
            self.open.remove(&ino);
        }
    }

    fn used_bytes(&self) -> u64 {
        self.inodes
            .values()
            .map(|i| match &i.content {
                Content::File(data) => data.len() as u64,
                Content::Symlink(target) => target.len() as u64,
                Content::Directory => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Geometry {
    sector_size: u64,
    sectors: u64,
}

impl Geometry {
    fn capacity(&self) -> u64 {
        self.sector_size.saturating_mul(self.sectors)
    }
}

/// Per-mount state of a `ramfs` mount.
#[derive(Debug)]
pub struct RamMount {
    tree: RwLock<Tree>,
    geometry: Mutex<Geometry>,
}

impl MountState for RamMount {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct RamFile {
    ino: u64,
    flags: OpenFlags,
    pos: Mutex<u64>,
}

impl FileHandle for RamFile {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct Cursor {
    names: Vec<String>,
    next: usize,
}

#[derive(Debug)]
struct RamDir {
    path: String,
    cursor: Mutex<Cursor>,
}

impl DirHandle for RamDir {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory filesystem driver.
#[derive(Debug, Default)]
pub struct RamFs {
    base: DriverBase,
}

impl RamFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ENOSPC` unless the mount's disk can hold `grow` more bytes.
    fn check_room(ram: &RamMount, tree: &Tree, grow: u64) -> VfsResult<()> {
        let capacity = ram.geometry.lock().capacity();
        let used = tree.used_bytes();
        if used.checked_add(grow).is_none_or(|total| total > capacity) {
            tracing::warn!(used, grow, capacity, "ramfs mount full");
            return Err(Errno::ENOSPC);
        }
        Ok(())
    }

    fn stat_of(mnt: &MountPoint, inode: &Inode) -> Stat {
        let mut stat = inode.stat.clone();
        stat.dev = mnt.dev();
        stat
    }
}

impl FilesystemDriver for RamFs {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn mount_prealloc(&self, _disk: DiskHandle, _path: &VfsPath, _flags: MountFlags) -> VfsResult<Arc<dyn MountState>> {
        Ok(Arc::new(RamMount {
            tree: RwLock::new(Tree::new()),
            geometry: Mutex::new(Geometry::default()),
        }))
    }

    fn mount(&self, mnt: &MountPoint, _data: Option<&[u8]>) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let disks = self.disk_manager()?;
        let geometry = Geometry {
            sector_size: disks.get_info(mnt.disk(), InfoType::SectorSize)?,
            sectors: disks.get_info(mnt.disk(), InfoType::SectorCount)?,
        };
        *ram.geometry.lock() = geometry;
        tracing::debug!(mount = %mnt.path(), sectors = geometry.sectors, "ramfs mounted");
        Ok(())
    }

    fn umount(&self, mnt: &MountPoint) -> VfsResult<()> {
        mnt.state::<RamMount>()?;
        Ok(())
    }

    fn statvfs(&self, mnt: &MountPoint, _path: &str) -> VfsResult<StatVfs> {
        let ram = mnt.state::<RamMount>()?;
        let geometry = *ram.geometry.lock();
        let tree = ram.tree.read();
        let bsize = geometry.sector_size.max(1);
        let free = geometry
            .sectors
            .saturating_sub(tree.used_bytes().div_ceil(bsize));
        Ok(StatVfs {
            bsize,
            frsize: bsize,
            blocks: geometry.sectors,
            bfree: free,
            bavail: free,
            files: tree.inodes.len() as u64,
            ffree: free,
            favail: free,
            fsid: mnt.dev(),
            flag: u64::from(mnt.is_read_only()),
            namemax: NAME_MAX as u64,
        })
    }

    fn open(&self, mnt: &MountPoint, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Arc<dyn FileHandle>> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        let found = if flags.contains(OpenFlags::NOFOLLOW) {
            tree.lookup(path)
        } else {
            tree.resolve(path)
        };
        let ino = match found {
            Ok(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => return Err(Errno::EEXIST),
            Ok(ino) => ino,
            Err(Errno::ENOENT) if flags.contains(OpenFlags::CREAT) => {
                tree.create(path, Content::File(Vec::new()), Stat::file(0, mode))?
            }
            Err(e) => return Err(e),
        };

        let inode = tree.inode_mut(ino)?;
        match &mut inode.content {
            Content::Directory if flags.can_write() => return Err(Errno::EISDIR),
            Content::Directory => {}
            Content::Symlink(_) => return Err(Errno::ELOOP),
            Content::File(_) if flags.contains(OpenFlags::DIRECTORY) => return Err(Errno::ENOTDIR),
            Content::File(data) => {
                if flags.contains(OpenFlags::TRUNC) && flags.can_write() {
                    data.clear();
                    inode.stat.set_size(0);
                    inode.stat.mtime = SystemTime::now();
                }
            }
        }
        *tree.open.entry(ino).or_default() += 1;
        Ok(Arc::new(RamFile {
            ino,
            flags,
            pos: Mutex::new(0),
        }))
    }

    fn close(&self, mnt: &MountPoint, file: &dyn FileHandle) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let mut tree = ram.tree.write();
        if let Some(count) = tree.open.get_mut(&file.ino) {
            *count = count.saturating_sub(1);
        }
        tree.maybe_free(file.ino);
        Ok(())
    }

    fn read(&self, mnt: &MountPoint, file: &dyn FileHandle, buf: &mut [u8]) -> VfsResult<usize> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let tree = ram.tree.read();
        let Content::File(data) = &tree.inode(file.ino)?.content else {
            return Err(Errno::EISDIR);
        };
        let mut pos = file.pos.lock();
        let start = (*pos).min(data.len() as u64) as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, mnt: &MountPoint, file: &dyn FileHandle, buf: &[u8]) -> VfsResult<usize> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let mut tree = ram.tree.write();
        let mut pos = file.pos.lock();
        let size = tree.inode(file.ino)?.stat.size;
        if file.flags.contains(OpenFlags::APPEND) {
            *pos = size;
        }
        let end = pos.checked_add(buf.len() as u64).ok_or(Errno::EFBIG)?;
        if end > size {
            Self::check_room(ram, &tree, end - size)?;
        }
        let start = usize::try_from(*pos).map_err(|_| Errno::EFBIG)?;
        let end = usize::try_from(end).map_err(|_| Errno::EFBIG)?;
        let inode = tree.inode_mut(file.ino)?;
        let Content::File(data) = &mut inode.content else {
            return Err(Errno::EISDIR);
        };
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        let size = data.len() as u64;
        inode.stat.set_size(size);
        inode.stat.mtime = SystemTime::now();
        *pos = end as u64;
        Ok(buf.len())
    }

    fn seek(&self, mnt: &MountPoint, file: &dyn FileHandle, offset: i64, whence: Whence) -> VfsResult<u64> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let size = ram.tree.read().inode(file.ino)?.stat.size;
        let mut pos = file.pos.lock();
        *pos = whence.resolve(offset, *pos, size)?;
        Ok(*pos)
    }

    fn fstat(&self, mnt: &MountPoint, file: &dyn FileHandle) -> VfsResult<Stat> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let tree = ram.tree.read();
        Ok(Self::stat_of(mnt, tree.inode(file.ino)?))
    }

    fn ftruncate(&self, mnt: &MountPoint, file: &dyn FileHandle, len: u64) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let mut tree = ram.tree.write();
        let size = tree.inode(file.ino)?.stat.size;
        if len > size {
            Self::check_room(ram, &tree, len - size)?;
        }
        let new_len = usize::try_from(len).map_err(|_| Errno::EFBIG)?;
        let inode = tree.inode_mut(file.ino)?;
        let Content::File(data) = &mut inode.content else {
            return Err(Errno::EISDIR);
        };
        data.resize(new_len, 0);
        inode.stat.set_size(len);
        inode.stat.mtime = SystemTime::now();
        Ok(())
    }

    fn fsync(&self, _mnt: &MountPoint, _file: &dyn FileHandle) -> VfsResult<()> {
        Ok(())
    }

    fn fchmod(&self, mnt: &MountPoint, file: &dyn FileHandle, mode: u32) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let file = file_handle::<RamFile>(file)?;
        let mut tree = ram.tree.write();
        let inode = tree.inode_mut(file.ino)?;
        inode.stat.perm = mode & 0o7777;
        inode.stat.ctime = SystemTime::now();
        Ok(())
    }

    fn stat(&self, mnt: &MountPoint, path: &str) -> VfsResult<Stat> {
        let ram = mnt.state::<RamMount>()?;
        let tree = ram.tree.read();
        let ino = tree.lookup(path)?;
        Ok(Self::stat_of(mnt, tree.inode(ino)?))
    }

    fn link(&self, mnt: &MountPoint, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        let ino = tree.lookup(oldpath)?;
        if tree.is_dir(ino) {
            return Err(Errno::EPERM);
        }
        if tree.names.contains_key(newpath) {
            return Err(Errno::EEXIST);
        }
        let parent = tree.lookup(parent_of(newpath))?;
        if !tree.is_dir(parent) {
            return Err(Errno::ENOTDIR);
        }
        tree.names.insert(newpath.to_string(), ino);
        let inode = tree.inode_mut(ino)?;
        inode.stat.nlink += 1;
        inode.stat.ctime = SystemTime::now();
        Ok(())
    }

    fn symlink(&self, mnt: &MountPoint, target: &str, linkpath: &str) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        tree.create(
            linkpath,
            Content::Symlink(target.to_string()),
            Stat::symlink(target.len() as u64),
        )?;
        Ok(())
    }

    fn readlink(&self, mnt: &MountPoint, path: &str) -> VfsResult<String> {
        let ram = mnt.state::<RamMount>()?;
        let tree = ram.tree.read();
        match &tree.inode(tree.lookup(path)?)?.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(Errno::EINVAL),
        }
    }

    fn unlink(&self, mnt: &MountPoint, path: &str) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        let ino = tree.lookup(path)?;
        if tree.is_dir(ino) {
            return Err(Errno::EISDIR);
        }
        tree.release(path)
    }

    fn rmdir(&self, mnt: &MountPoint, path: &str) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        if path.is_empty() {
            return Err(Errno::EBUSY);
        }
        let ino = tree.lookup(path)?;
        if !tree.is_dir(ino) {
            return Err(Errno::ENOTDIR);
        }
        if !tree.children(path).is_empty() {
            return Err(Errno::ENOTEMPTY);
        }
        tree.release(path)
    }

    fn rename(&self, mnt: &MountPoint, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        if oldpath.is_empty() || newpath.is_empty() {
            return Err(Errno::EBUSY);
        }
        let ino = tree.lookup(oldpath)?;
        if oldpath == newpath {
            return Ok(());
        }
        let src_is_dir = tree.is_dir(ino);
        if src_is_dir && newpath.starts_with(&format!("{oldpath}/")) {
            return Err(Errno::EINVAL);
        }
        let parent = tree.lookup(parent_of(newpath))?;
        if !tree.is_dir(parent) {
            return Err(Errno::ENOTDIR);
        }

        if let Some(&dest) = tree.names.get(newpath) {
            // Two names for one inode: nothing to do.
            if dest == ino {
                return Ok(());
            }
            match (src_is_dir, tree.is_dir(dest)) {
                (true, false) => return Err(Errno::ENOTDIR),
                (false, true) => return Err(Errno::EISDIR),
                (true, true) if !tree.children(newpath).is_empty() => return Err(Errno::ENOTEMPTY),
                _ => {}
            }
            tree.release(newpath)?;
        }

        // Move the entry and, for directories, everything under it.
        let old_prefix = format!("{oldpath}/");
        let moved: Vec<(String, u64)> = tree
            .names
            .iter()
            .filter(|(k, _)| k.as_str() == oldpath || k.starts_with(&old_prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (old_key, ino) in moved {
            tree.names.remove(&old_key);
            let new_key = format!("{newpath}{}", &old_key[oldpath.len()..]);
            tree.names.insert(new_key, ino);
        }
        tree.inode_mut(ino)?.stat.ctime = SystemTime::now();
        Ok(())
    }

    fn mkdir(&self, mnt: &MountPoint, path: &str, mode: u32) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        tree.create(path, Content::Directory, Stat::directory(mode))?;
        Ok(())
    }

    fn chmod(&self, mnt: &MountPoint, path: &str, mode: u32) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        let ino = tree.lookup(path)?;
        let inode = tree.inode_mut(ino)?;
        inode.stat.perm = mode & 0o7777;
        inode.stat.ctime = SystemTime::now();
        Ok(())
    }

    fn utimens(&self, mnt: &MountPoint, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let mut tree = ram.tree.write();
        let ino = tree.lookup(path)?;
        let inode = tree.inode_mut(ino)?;
        inode.stat.atime = atime;
        inode.stat.mtime = mtime;
        Ok(())
    }

    fn diropen(&self, mnt: &MountPoint, path: &str) -> VfsResult<Arc<dyn DirHandle>> {
        let ram = mnt.state::<RamMount>()?;
        let tree = ram.tree.read();
        let ino = tree.resolve(path)?;
        if !tree.is_dir(ino) {
            return Err(Errno::ENOTDIR);
        }
        Ok(Arc::new(RamDir {
            path: path.to_string(),
            cursor: Mutex::new(Cursor {
                names: tree.children(path),
                next: 0,
            }),
        }))
    }

    fn dirreset(&self, mnt: &MountPoint, dir: &dyn DirHandle) -> VfsResult<()> {
        let ram = mnt.state::<RamMount>()?;
        let dir = dir_handle::<RamDir>(dir)?;
        let names = ram.tree.read().children(&dir.path);
        *dir.cursor.lock() = Cursor { names, next: 0 };
        Ok(())
    }

    fn dirnext(&self, mnt: &MountPoint, dir: &dyn DirHandle) -> VfsResult<Option<(String, Stat)>> {
        let ram = mnt.state::<RamMount>()?;
        let dir = dir_handle::<RamDir>(dir)?;
        let tree = ram.tree.read();
        let mut cursor = dir.cursor.lock();
        while cursor.next < cursor.names.len() {
            let name = cursor.names[cursor.next].clone();
            cursor.next += 1;
            // Entries removed since the snapshot are skipped.
            if let Some(inode) = tree.names.get(&join(&dir.path, &name)).and_then(|ino| tree.inodes.get(ino)) {
                return Ok(Some((name, Self::stat_of(mnt, inode))));
            }
        }
        Ok(None)
    }

    fn dirclose(&self, _mnt: &MountPoint, dir: &dyn DirHandle) -> VfsResult<()> {
        dir_handle::<RamDir>(dir)?;
        Ok(())
    }
}
