//! Open, mount and notification flag sets.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::errno::{Errno, VfsResult};

bitflags! {
    /// `open(2)` flags. The access mode lives in the low two bits, with
    /// read-only being the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = libc::O_WRONLY as u32;
        const RDWR = libc::O_RDWR as u32;
        const CREAT = libc::O_CREAT as u32;
        const EXCL = libc::O_EXCL as u32;
        const TRUNC = libc::O_TRUNC as u32;
        const APPEND = libc::O_APPEND as u32;
        const DIRECTORY = libc::O_DIRECTORY as u32;
        const NOFOLLOW = libc::O_NOFOLLOW as u32;
    }
}

/// Access mode extracted from [`OpenFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    pub const RDONLY: Self = Self::empty();

    /// Interpret raw `open(2)` flags, ignoring bits we do not model.
    pub fn from_posix(flags: i32) -> Self {
        Self::from_bits_truncate(flags as u32)
    }

    pub fn access_mode(&self) -> AccessMode {
        if self.contains(Self::RDWR) {
            AccessMode::ReadWrite
        } else if self.contains(Self::WRONLY) {
            AccessMode::WriteOnly
        } else {
            AccessMode::ReadOnly
        }
    }

    pub fn can_read(&self) -> bool {
        !matches!(self.access_mode(), AccessMode::WriteOnly)
    }

    pub fn can_write(&self) -> bool {
        !matches!(self.access_mode(), AccessMode::ReadOnly)
    }

    /// True if the open may modify the filesystem.
    pub fn wants_write(&self) -> bool {
        self.can_write() || self.intersects(Self::CREAT | Self::TRUNC | Self::APPEND)
    }

    /// Read-write, create if missing.
    pub fn create() -> Self {
        Self::RDWR | Self::CREAT
    }

    /// Read-write, create if missing, truncate.
    pub fn create_truncate() -> Self {
        Self::RDWR | Self::CREAT | Self::TRUNC
    }
}

bitflags! {
    /// `mount(2)` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        const RDONLY = 1;
    }
}

impl MountFlags {
    pub fn is_read_only(&self) -> bool {
        self.contains(Self::RDONLY)
    }
}

bitflags! {
    /// Filesystem change events a subscriber can ask for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EventFlags: u32 {
        const OPENED = 1 << 0;
        const CLOSED_WRITE = 1 << 1;
        const CLOSED_READ = 1 << 2;
        const CREATED = 1 << 3;
        const REMOVED = 1 << 4;
        const RENAMED = 1 << 5;
    }
}

/// `lseek(2)` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_posix(whence: i32) -> VfsResult<Self> {
        match whence {
            libc::SEEK_SET => Ok(Whence::Set),
            libc::SEEK_CUR => Ok(Whence::Cur),
            libc::SEEK_END => Ok(Whence::End),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Resolve a seek against the current position and file size.
    pub fn resolve(&self, offset: i64, current: u64, size: u64) -> VfsResult<u64> {
        let base = match self {
            Whence::Set => 0,
            Whence::Cur => current,
            Whence::End => size,
        };
        let base = i64::try_from(base).map_err(|_| Errno::EOVERFLOW)?;
        let target = base.checked_add(offset).ok_or(Errno::EOVERFLOW)?;
        u64::try_from(target).map_err(|_| Errno::EINVAL)
    }
}
