//! File and filesystem metadata.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// The `S_IF*` bits for this type.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        }
    }
}

/// `struct stat` equivalent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    /// Device the entry lives on. Unique per mount.
    pub dev: u64,
    /// Inode number, unique within `dev`.
    pub ino: u64,
    pub kind: FileType,
    /// Permission bits (e.g. 0o644).
    pub perm: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Stat {
    /// Attributes for a new regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self::new(FileType::File, size, perm, 1)
    }

    /// Attributes for a new directory.
    pub fn directory(perm: u32) -> Self {
        Self::new(FileType::Directory, 0, perm, 2) // . and ..
    }

    /// Attributes for a symlink.
    pub fn symlink(target_len: u64) -> Self {
        Self::new(FileType::Symlink, target_len, 0o777, 1)
    }

    fn new(kind: FileType, size: u64, perm: u32, nlink: u32) -> Self {
        let now = SystemTime::now();
        Self {
            dev: 0,
            ino: 0,
            kind,
            perm: perm & 0o7777,
            nlink,
            uid: 0,
            gid: 0,
            size,
            blksize: 512,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Full `st_mode`: type bits plus permissions.
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | self.perm
    }

    /// Update the size and the derived block count.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.blocks = size.div_ceil(512);
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// `struct statvfs` equivalent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatVfs {
    /// Block size.
    pub bsize: u64,
    /// Fragment size.
    pub frsize: u64,
    /// Total blocks, in `frsize` units.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    /// Mount flags (`ST_RDONLY` = 1).
    pub flag: u64,
    /// Maximum name length.
    pub namemax: u64,
}
