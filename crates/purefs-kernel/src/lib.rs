//! # purefs-kernel
//!
//! VFS core for purefs.
//!
//! The VFS sits between the libc shim and the filesystem drivers:
//! - Block devices are registered by name in a [`DiskManager`]
//! - Drivers register under a type name and are mounted onto disks
//! - [`FilesystemCore`] routes every call to the mount owning the path
//! - [`Notifier`] tells interested threads what changed
//!
//! [`VfsSystem`] wires all of this up from a TOML [`VfsConfig`].

pub mod blkdev;
pub mod config;
pub mod cwd;
pub mod drivers;
pub mod fs;
pub mod notify;
pub mod redirect;
pub mod system;

pub use blkdev::{BlockDevice, BlockDeviceFactory, DeviceConfig, DiskHandle, DiskManager, HwPart, InfoType, MediaStatus, PowerState};
pub use config::{ConfigError, MountConfig, VfsConfig};
pub use drivers::{FlatFs, RamFs, FLATFS_TYPE, RAMFS_TYPE};
pub use fs::{
    Descriptor, DirHandle, DriverBase, FileHandle, FilesystemCore, FilesystemDriver, MountInfo,
    MountPoint, MountState,
};
pub use notify::{ChannelConsumer, FsNotification, Notifier, NotifyConsumer, SubscriptionId};
pub use redirect::{HostRedirect, Redirect, RedirectConfig};
pub use system::{SystemError, VfsSystem};

pub use purefs_types::{Errno, EventFlags, MountFlags, OpenFlags, Stat, StatVfs, VfsPath, VfsResult, Whence};
