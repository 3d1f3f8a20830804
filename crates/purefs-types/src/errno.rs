//! POSIX error codes.
//!
//! Every fallible VFS operation returns [`VfsResult`]. The error carries a
//! positive POSIX code; [`Errno::as_negative`] yields the C-style negative
//! return value expected by the libc shim.

use std::io;
use thiserror::Error;

/// A POSIX error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("{} (errno {})", errno_name(.0), .0)]
pub struct Errno(i32);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const ENXIO: Errno = Errno(libc::ENXIO);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const EXDEV: Errno = Errno(libc::EXDEV);
    pub const ENODEV: Errno = Errno(libc::ENODEV);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EMFILE: Errno = Errno(libc::EMFILE);
    pub const EFBIG: Errno = Errno(libc::EFBIG);
    pub const ENOSPC: Errno = Errno(libc::ENOSPC);
    pub const ESPIPE: Errno = Errno(libc::ESPIPE);
    pub const EROFS: Errno = Errno(libc::EROFS);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const ELOOP: Errno = Errno(libc::ELOOP);
    pub const ENODATA: Errno = Errno(libc::ENODATA);
    pub const EOVERFLOW: Errno = Errno(libc::EOVERFLOW);
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);

    /// Build an errno from a raw code. Negative codes are accepted as well,
    /// so a C-style `-ENOENT` return converts back losslessly.
    pub fn from_raw(code: i32) -> Self {
        Self(code.saturating_abs())
    }

    /// The positive POSIX code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// The negative code, as returned by C-style VFS entry points.
    pub fn as_negative(self) -> i32 {
        -self.0
    }

    /// Symbolic name of the code, e.g. `"ENOENT"`.
    pub fn name(self) -> &'static str {
        errno_name(&self.0)
    }
}

fn errno_name(code: &i32) -> &'static str {
    match *code {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::EIO => "EIO",
        libc::ENXIO => "ENXIO",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EBUSY => "EBUSY",
        libc::EEXIST => "EEXIST",
        libc::EXDEV => "EXDEV",
        libc::ENODEV => "ENODEV",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EINVAL => "EINVAL",
        libc::EMFILE => "EMFILE",
        libc::EFBIG => "EFBIG",
        libc::ENOSPC => "ENOSPC",
        libc::ESPIPE => "ESPIPE",
        libc::EROFS => "EROFS",
        libc::ERANGE => "ERANGE",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::ELOOP => "ELOOP",
        libc::ENODATA => "ENODATA",
        libc::EOVERFLOW => "EOVERFLOW",
        libc::ENOTSUP => "ENOTSUP",
        _ => "EUNKNOWN",
    }
}

/// Convert host I/O errors, preferring the raw OS code when there is one.
impl From<io::Error> for Errno {
    fn from(e: io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            return Errno::from_raw(code);
        }
        match e.kind() {
            io::ErrorKind::NotFound => Errno::ENOENT,
            io::ErrorKind::PermissionDenied => Errno::EACCES,
            io::ErrorKind::AlreadyExists => Errno::EEXIST,
            io::ErrorKind::InvalidInput => Errno::EINVAL,
            io::ErrorKind::OutOfMemory => Errno::ENOMEM,
            io::ErrorKind::Unsupported => Errno::ENOTSUP,
            _ => Errno::EIO,
        }
    }
}

/// Convert Errno to std::io::Error for compatibility.
impl From<Errno> for io::Error {
    fn from(e: Errno) -> Self {
        io::Error::from_raw_os_error(e.code())
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, Errno>;

/// Collapse a result into the C-style return convention: the value on
/// success, the negative errno on failure.
pub fn posix_return<T: Into<i64>>(result: VfsResult<T>) -> i64 {
    match result {
        Ok(value) => value.into(),
        Err(e) => i64::from(e.as_negative()),
    }
}
