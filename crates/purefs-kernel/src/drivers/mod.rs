//! Built-in filesystem drivers.
//!
//! - [`RamFs`] - ephemeral in-memory tree, one per mount
//! - [`FlatFs`] - single-directory volume stored on a block device

mod flatfs;
mod ramfs;

use std::sync::Arc;

use purefs_types::VfsResult;

pub use flatfs::{FlatFs, FlatMount, FLATFS_TYPE, MAX_ENTRIES, NAME_LEN};
pub use ramfs::{RamFs, RamMount, RAMFS_TYPE};

use crate::fs::FilesystemCore;

/// Register every built-in driver under its type name.
pub fn register_builtin(core: &FilesystemCore) -> VfsResult<()> {
    core.register_filesystem(RAMFS_TYPE, Arc::new(RamFs::new()))?;
    core.register_filesystem(FLATFS_TYPE, Arc::new(FlatFs::new()))?;
    Ok(())
}
