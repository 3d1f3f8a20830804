//! Filesystem driver contract, mount points and the dispatch core.
//!
//! ```text
//! FilesystemCore ──(longest prefix)──► MountPoint ──► dyn FilesystemDriver
//!       │                                  │                 │
//!   HandleTable<OpenFile>           Arc<dyn MountState>   DiskManager
//! ```

mod dispatch;
mod driver;
mod handle_table;
mod mount;

pub use dispatch::FilesystemCore;
pub use driver::{DriverBase, FilesystemDriver};
pub use handle_table::{Descriptor, HandleTable};
pub use mount::{dir_handle, file_handle, DirHandle, FileHandle, MountInfo, MountPoint, MountState};
