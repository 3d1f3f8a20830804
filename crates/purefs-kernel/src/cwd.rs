//! Per-thread current working directory.
//!
//! Each OS-service thread has its own notion of `.`; relative paths handed
//! to the VFS or the notifier are resolved against it.

use std::cell::RefCell;

use purefs_types::{VfsPath, VfsResult};

thread_local! {
    static CWD: RefCell<VfsPath> = RefCell::new(VfsPath::root());
}

/// The calling thread's current directory.
pub fn current_dir() -> VfsPath {
    CWD.with(|cwd| cwd.borrow().clone())
}

/// Replace the calling thread's current directory.
///
/// No existence check happens here; see `FilesystemCore::chdir`.
pub fn set_current_dir(path: VfsPath) {
    CWD.with(|cwd| *cwd.borrow_mut() = path);
}

/// Resolve `path` against the calling thread's current directory.
pub fn absolutize(path: &str) -> VfsResult<VfsPath> {
    CWD.with(|cwd| VfsPath::absolutize(&cwd.borrow(), path))
}
