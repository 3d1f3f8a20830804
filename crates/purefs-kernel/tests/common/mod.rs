//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use purefs_kernel::notify::{ChannelConsumer, FsNotification, NotifyConsumer};
use purefs_kernel::{
    drivers, BlockDeviceFactory, Descriptor, DeviceConfig, DiskManager, FilesystemCore, Notifier,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const SECTOR: u64 = 512;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A core with the built-in drivers and a scratch directory for images.
pub struct Fixture {
    pub dir: TempDir,
    pub disks: Arc<DiskManager>,
    pub notifier: Arc<Notifier>,
    pub core: FilesystemCore,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let disks = Arc::new(DiskManager::new());
        let notifier = Arc::new(Notifier::new());
        let core = FilesystemCore::new(Arc::clone(&disks), Arc::clone(&notifier));
        drivers::register_builtin(&core).unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            disks,
            notifier,
            core,
        }
    }

    /// Register a zero-filled image of `sectors` sectors as `name`.
    pub fn add_disk(&self, name: &str, sectors: u64) {
        let config = DeviceConfig::new(name, self.dir.path().join(format!("{name}.img")))
            .with_create_size(sectors * SECTOR);
        let device = BlockDeviceFactory::new(config).create().unwrap();
        self.disks.register_device(device, name, 0).unwrap();
    }

    pub fn write_all(&self, fd: Descriptor, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let n = self.core.write(fd, &data[done..]).unwrap();
            assert!(n > 0, "short write");
            done += n;
        }
    }

    pub fn read_to_end(&self, fd: Descriptor) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = self.core.read(fd, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Every entry of the directory at `path`, in listing order.
    pub fn list(&self, path: &str) -> Vec<String> {
        let fd = self.core.diropen(path).unwrap();
        let mut names = Vec::new();
        while let Some((name, _)) = self.core.dirnext(fd).unwrap() {
            names.push(name);
        }
        self.core.dirclose(fd).unwrap();
        names
    }
}

/// A channel consumer owned by a thread other than the test thread.
pub fn consumer_on_other_thread(
    name: &str,
) -> (Arc<dyn NotifyConsumer>, UnboundedReceiver<FsNotification>) {
    let name = name.to_string();
    let (consumer, rx) = thread::spawn(move || ChannelConsumer::new(name))
        .join()
        .unwrap();
    (consumer as Arc<dyn NotifyConsumer>, rx)
}

pub fn drain(rx: &mut UnboundedReceiver<FsNotification>) -> Vec<FsNotification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}
