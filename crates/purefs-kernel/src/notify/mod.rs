//! Path-prefix change notification.
//!
//! Subscribers register a directory (or file) path, a consumer and an
//! [`EventFlags`] mask. A change to `/a/b/c` is offered to subscriptions
//! on `/a/b/c`, `/a/b`, `/a` and `/`, deepest first.
//!
//! The notifier also remembers which path every open descriptor refers to,
//! so close events can be reported by path.

mod consumer;

pub use consumer::{ChannelConsumer, FsNotification, NotifyConsumer};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::ReentrantMutex;
use purefs_types::{EventFlags, VfsPath, VfsResult};
use serde::{Deserialize, Serialize};

use crate::cwd;

/// Identifies one subscription for [`Notifier::unregister_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    consumer: Weak<dyn NotifyConsumer>,
    mask: EventFlags,
}

#[derive(Debug, Clone)]
struct FdPathEntry {
    path: VfsPath,
    read_only: bool,
}

#[derive(Default)]
struct NotifierState {
    subscriptions: HashMap<VfsPath, Vec<Subscription>>,
    fds: HashMap<i32, FdPathEntry>,
    next_id: u64,
}

/// Fans filesystem changes out to subscribed consumers.
pub struct Notifier {
    state: ReentrantMutex<RefCell<NotifierState>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock();
        let state = guard.borrow();
        f.debug_struct("Notifier")
            .field("paths", &state.subscriptions.len())
            .field("open_fds", &state.fds.len())
            .finish()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(NotifierState::default())),
        }
    }

    /// Subscribe `consumer` to changes at or below `path`.
    ///
    /// Registering the same consumer on the same path again returns the
    /// existing id; the mask is left as first registered.
    pub fn register_path(
        &self,
        path: &str,
        consumer: &Arc<dyn NotifyConsumer>,
        mask: EventFlags,
    ) -> VfsResult<SubscriptionId> {
        let path = cwd::absolutize(path)?;
        let weak = Arc::downgrade(consumer);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if let Some(existing) = state
            .subscriptions
            .get(&path)
            .and_then(|subs| subs.iter().find(|s| Weak::ptr_eq(&s.consumer, &weak)))
        {
            return Ok(existing.id);
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        tracing::debug!(%path, ?mask, ?id, "registered notification path");
        state.subscriptions.entry(path).or_default().push(Subscription {
            id,
            consumer: weak,
            mask,
        });
        Ok(id)
    }

    /// Drop a subscription. Returns `false` if it was not registered.
    pub fn unregister_path(&self, id: SubscriptionId) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let mut found = false;
        state.subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    /// Number of live subscriptions (expired ones may linger until the
    /// next matching event).
    pub fn subscription_count(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.subscriptions.values().map(Vec::len).sum()
    }

    /// Report `mask` events on `path`.
    pub fn notify(&self, path: &str, mask: EventFlags) {
        self.dispatch(path, None, mask);
    }

    /// Report a rename of `previous` to `path`.
    pub fn notify_rename(&self, path: &str, previous: &str, mask: EventFlags) {
        let previous = match cwd::absolutize(previous) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(previous, error = %e, "unusable previous path in rename notification");
                None
            }
        };
        self.dispatch(path, previous, mask);
    }

    /// Report `mask` events on whatever `fd` was opened as.
    pub fn notify_fd(&self, fd: i32, mask: EventFlags) {
        let path = {
            let guard = self.state.lock();
            let state = guard.borrow();
            state.fds.get(&fd).map(|e| e.path.clone())
        };
        match path {
            Some(path) => self.dispatch(path.as_str(), None, mask),
            None => tracing::trace!(fd, "notification for unknown descriptor"),
        }
    }

    /// Remember `fd` → `path` and report `OPENED`.
    pub fn notify_open(&self, path: &str, fd: i32, read_only: bool) {
        let Ok(abs) = cwd::absolutize(path) else {
            tracing::warn!(path, fd, "unusable path in open notification");
            return;
        };
        {
            let guard = self.state.lock();
            guard.borrow_mut().fds.insert(
                fd,
                FdPathEntry {
                    path: abs.clone(),
                    read_only,
                },
            );
        }
        self.dispatch(abs.as_str(), None, EventFlags::OPENED);
    }

    /// Forget `fd` and report `CLOSED_READ` or `CLOSED_WRITE`.
    pub fn notify_close(&self, fd: i32) {
        let entry = self.state.lock().borrow_mut().fds.remove(&fd);
        let Some(entry) = entry else {
            tracing::trace!(fd, "close of untracked descriptor");
            return;
        };
        let mask = if entry.read_only {
            EventFlags::CLOSED_READ
        } else {
            EventFlags::CLOSED_WRITE
        };
        self.dispatch(entry.path.as_str(), None, mask);
    }

    fn dispatch(&self, path: &str, previous: Option<VfsPath>, mask: EventFlags) {
        let path = match cwd::absolutize(path) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path, error = %e, "unusable path in notification");
                return;
            }
        };
        let me = thread::current().id();
        let mut deliveries: Vec<(Arc<dyn NotifyConsumer>, EventFlags)> = Vec::new();
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            for ancestor in path.ancestors() {
                let Some(subs) = state.subscriptions.get_mut(ancestor) else {
                    continue;
                };
                subs.retain(|s| s.consumer.strong_count() > 0);
                for sub in subs.iter() {
                    let events = sub.mask & mask;
                    if events.is_empty() {
                        continue;
                    }
                    let Some(consumer) = sub.consumer.upgrade() else {
                        continue;
                    };
                    if consumer.thread() == me {
                        continue;
                    }
                    deliveries.push((consumer, events));
                }
                if subs.is_empty() {
                    state.subscriptions.remove(ancestor);
                }
            }
        }

        for (consumer, events) in deliveries {
            let mut message = FsNotification::new(events, path.clone());
            if let Some(previous) = &previous {
                message = message.with_previous(previous.clone());
            }
            consumer.deliver(message);
        }
    }
}
