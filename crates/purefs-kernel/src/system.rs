//! VFS bring-up from a [`VfsConfig`].

use std::sync::Arc;

use purefs_types::{Errno, VfsResult};

use crate::blkdev::{BlockDeviceFactory, DiskManager};
use crate::config::{ConfigError, MountConfig, VfsConfig};
use crate::drivers::{self, FlatFs, FLATFS_TYPE};
use crate::fs::FilesystemCore;
use crate::notify::Notifier;
use crate::redirect::HostRedirect;

/// Errors from bringing the VFS up.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("device {name}: {source}")]
    Device { name: String, source: Errno },
    #[error("mount {path}: {source}")]
    Mount { path: String, source: Errno },
    #[error("driver registration: {0}")]
    Driver(Errno),
    #[error("redirect rules: {0}")]
    Redirect(Errno),
}

/// A fully wired VFS: disks, drivers, mounts and the notifier.
pub struct VfsSystem {
    disks: Arc<DiskManager>,
    notifier: Arc<Notifier>,
    core: Arc<FilesystemCore>,
    redirect: HostRedirect,
}

impl std::fmt::Debug for VfsSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsSystem")
            .field("devices", &self.disks.devices())
            .field("mounts", &self.core.mounts().len())
            .field("redirect", &self.redirect.is_enabled())
            .finish()
    }
}

impl VfsSystem {
    /// An empty system with the built-in drivers registered.
    pub fn new() -> VfsResult<Self> {
        let disks = Arc::new(DiskManager::new());
        let notifier = Arc::new(Notifier::new());
        let core = Arc::new(FilesystemCore::new(Arc::clone(&disks), Arc::clone(&notifier)));
        drivers::register_builtin(&core)?;
        Ok(Self {
            disks,
            notifier,
            core,
            redirect: HostRedirect::disabled(),
        })
    }

    /// Register devices and mount everything `config` lists, in order.
    #[tracing::instrument(skip(config), fields(devices = config.devices.len(), mounts = config.mounts.len()))]
    pub fn from_config(config: &VfsConfig) -> Result<Self, SystemError> {
        config.validate()?;
        let mut system = Self::new().map_err(SystemError::Driver)?;

        for dev in &config.devices {
            let device_err = |source| SystemError::Device {
                name: dev.name.clone(),
                source,
            };
            let device = BlockDeviceFactory::new(dev.clone()).create().map_err(device_err)?;
            system
                .disks
                .register_device(device, &dev.name, 0)
                .map_err(device_err)?;
        }

        for mount in &config.mounts {
            system.mount_configured(mount).map_err(|source| SystemError::Mount {
                path: mount.path.clone(),
                source,
            })?;
        }

        system.redirect = HostRedirect::new(&config.redirect).map_err(SystemError::Redirect)?;
        tracing::info!(mounts = system.core.mounts().len(), "vfs ready");
        Ok(system)
    }

    fn mount_configured(&self, mount: &MountConfig) -> VfsResult<()> {
        let attempt = || {
            self.core
                .mount(&mount.disk, &mount.path, &mount.fs_type, mount.flags(), None)
        };
        match attempt() {
            Err(Errno::EINVAL) if mount.format_if_invalid && mount.fs_type == FLATFS_TYPE => {
                tracing::warn!(disk = %mount.disk, path = %mount.path, "no valid volume, formatting");
                let handle = self.disks.device_handle(&mount.disk)?;
                FlatFs::format(&self.disks, &handle)?;
                attempt()
            }
            other => other,
        }
    }

    pub fn core(&self) -> &Arc<FilesystemCore> {
        &self.core
    }

    pub fn disks(&self) -> &Arc<DiskManager> {
        &self.disks
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn redirect(&self) -> &HostRedirect {
        &self.redirect
    }

    /// Unmount everything, deepest first, then drop all devices.
    ///
    /// Stops at the first busy mount and leaves the rest in place.
    pub fn shutdown(&self) -> VfsResult<()> {
        let mut mounts = self.core.mounts();
        mounts.sort_by_key(|m| std::cmp::Reverse(m.path.depth()));
        for info in mounts {
            self.core.umount(info.path.as_str())?;
        }
        for name in self.disks.devices() {
            self.disks.unregister_device(&name)?;
        }
        tracing::info!("vfs shut down");
        Ok(())
    }
}
