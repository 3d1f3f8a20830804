//! Shared types for the purefs VFS core.
//!
//! This crate is a leaf: the error type every layer returns, the owned path
//! type used for mount resolution, `stat`/`statvfs` records and the flag
//! sets that cross the VFS boundary. Services that only talk to the VFS
//! (and the libc shim) depend on this crate alone.
//!
//! # Key Types
//!
//! |---------------|------------------------------------------------|
//! | Type          | Purpose                                        |
//! |---------------|------------------------------------------------|
//! | [`Errno`]     | POSIX error code, negative on the C boundary   |
//! | [`VfsPath`]   | Normalized absolute path with prefix helpers   |
//! | [`Stat`]      | Per-entry metadata                             |
//! | [`StatVfs`]   | Per-filesystem metadata                        |
//! | [`OpenFlags`] | `open(2)` flags                                |
//! | [`EventFlags`]| Change-notification mask                       |
//! |---------------|------------------------------------------------|

pub mod errno;
pub mod flags;
pub mod path;
pub mod stat;

pub use errno::{posix_return, Errno, VfsResult};
pub use flags::{AccessMode, EventFlags, MountFlags, OpenFlags, Whence};
pub use path::{Ancestors, VfsPath, NAME_MAX, PATH_MAX};
pub use stat::{FileType, Stat, StatVfs};
