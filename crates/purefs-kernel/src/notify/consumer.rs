//! Notification messages and the consumers that receive them.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use purefs_types::{EventFlags, VfsPath};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A filesystem change, as delivered to a subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FsNotification {
    /// Events that fired, already masked by the subscription.
    pub events: EventFlags,
    /// Absolute path the event is about.
    pub path: VfsPath,
    /// Where the entry lived before, for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<VfsPath>,
    pub timestamp: SystemTime,
}

impl FsNotification {
    pub fn new(events: EventFlags, path: VfsPath) -> Self {
        Self {
            events,
            path,
            previous_path: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_previous(mut self, previous: VfsPath) -> Self {
        self.previous_path = Some(previous);
        self
    }
}

/// Something that wants to hear about filesystem changes.
///
/// The notifier only keeps weak references; a consumer that is dropped
/// stops receiving and its subscriptions are pruned on the next match.
pub trait NotifyConsumer: Send + Sync {
    /// The thread that owns this consumer. Changes made from this thread
    /// are not echoed back to it.
    fn thread(&self) -> ThreadId;

    /// Hand over one message. Must not block.
    fn deliver(&self, notification: FsNotification);
}

/// Consumer backed by an unbounded channel, owned by the creating thread.
#[derive(Debug)]
pub struct ChannelConsumer {
    name: String,
    thread: ThreadId,
    tx: mpsc::UnboundedSender<FsNotification>,
}

impl ChannelConsumer {
    /// Create a consumer bound to the calling thread, with its receiver.
    pub fn new(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<FsNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            name: name.into(),
            thread: thread::current().id(),
            tx,
        });
        (consumer, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NotifyConsumer for ChannelConsumer {
    fn thread(&self) -> ThreadId {
        self.thread
    }

    fn deliver(&self, notification: FsNotification) {
        if self.tx.send(notification).is_err() {
            tracing::trace!(consumer = %self.name, "receiver dropped, discarding notification");
        }
    }
}
