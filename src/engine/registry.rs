//! Subscriber registry (part of C4): channel → session/handler fan-out.
//!
//! Mutated by handler threads (register/unregister) and read by the
//! reliable-pubsub dispatcher; dispatches are brief (push + notify), so a
//! `dashmap::DashMap` per channel (the teacher's concurrent-map dependency,
//! used the same way elsewhere in the stack) is sufficient — no dedicated
//! reader/writer split is needed (`spec.md` §5 "Shared state").

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::engine::identity::Identity;
use crate::message::Message;

/// A local in-process listener registered via `Engine::local_subscribe`.
pub type LocalHandler = Arc<dyn Fn(&Message) + Send + Sync>;

enum Entry {
    Handler(LocalHandler),
    Wait { threshold: u64, identity: Arc<Identity>, shared: Arc<WaitShared> },
}

struct Registered {
    id: u64,
    entry: Entry,
}

#[derive(Default)]
struct WaitShared {
    buffer: parking_lot::Mutex<Vec<Message>>,
    notify: Notify,
}

/// Handle to a single `wait_for_messages` call, covering every channel it
/// registered across.
pub struct WaitToken {
    id: u64,
    channels: Vec<String>,
    shared: Arc<WaitShared>,
}

/// Handle returned by `local_subscribe`, used to unregister the listener.
pub struct LocalSubscription {
    id: u64,
    channel: Option<String>,
}

/// Registry of everything that wants to hear about published messages:
/// blocked long-poll sessions and in-process local handlers.
pub struct Registry {
    by_channel: DashMap<String, Vec<Registered>>,
    wildcard: parking_lot::Mutex<Vec<Registered>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            by_channel: DashMap::new(),
            wildcard: parking_lot::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe_handler(&self, channel: Option<&str>, handler: LocalHandler) -> LocalSubscription {
        let id = self.alloc_id();
        let registered = Registered { id, entry: Entry::Handler(handler) };
        match channel {
            Some(c) => self.by_channel.entry(c.to_string()).or_default().push(registered),
            None => self.wildcard.lock().push(registered),
        }
        LocalSubscription { id, channel: channel.map(str::to_string) }
    }

    pub fn unsubscribe_handler(&self, sub: &LocalSubscription) {
        match &sub.channel {
            Some(c) => {
                if let Some(mut entries) = self.by_channel.get_mut(c) {
                    entries.retain(|r| r.id != sub.id);
                }
            }
            None => self.wildcard.lock().retain(|r| r.id != sub.id),
        }
    }

    /// Register a blocking wait across `cursors` (channel → last-seen ID).
    pub fn register_wait(&self, cursors: &HashMap<String, u64>, identity: Arc<Identity>) -> WaitToken {
        let id = self.alloc_id();
        let shared = Arc::new(WaitShared::default());
        let channels: Vec<String> = cursors.keys().cloned().collect();

        for (channel, threshold) in cursors {
            let registered = Registered {
                id,
                entry: Entry::Wait { threshold: *threshold, identity: Arc::clone(&identity), shared: Arc::clone(&shared) },
            };
            self.by_channel.entry(channel.clone()).or_default().push(registered);
        }

        WaitToken { id, channels, shared }
    }

    fn unregister_wait(&self, token: &WaitToken) {
        for channel in &token.channels {
            if let Some(mut entries) = self.by_channel.get_mut(channel) {
                entries.retain(|r| r.id != token.id);
            }
        }
    }

    /// Register a blocking wait and return an RAII handle that unregisters
    /// it on drop. Use this instead of `register_wait` directly so the
    /// `Entry::Wait` is removed even if the caller's future is dropped
    /// mid-wait — the case when an HTTP client disconnects mid long-poll
    /// (`spec.md` §5 "Cancellation") and axum drops the handler future while
    /// it's suspended inside [`WaitGuard::wait`].
    pub fn register_wait_guard<'a>(&'a self, cursors: &HashMap<String, u64>, identity: Arc<Identity>) -> WaitGuard<'a> {
        WaitGuard { registry: self, token: self.register_wait(cursors, identity) }
    }

    #[cfg(test)]
    fn waiter_count(&self, channel: &str) -> usize {
        self.by_channel
            .get(channel)
            .map(|entries| entries.iter().filter(|r| matches!(r.entry, Entry::Wait { .. })).count())
            .unwrap_or(0)
    }

    /// Suspend until a matching message arrives or `timeout` elapses.
    /// Returns whatever accumulated in the shared buffer (possibly empty on
    /// timeout).
    pub async fn wait(&self, token: &WaitToken, timeout: Duration) -> Vec<Message> {
        {
            let buf = token.shared.buffer.lock();
            if !buf.is_empty() {
                drop(buf);
                return std::mem::take(&mut *token.shared.buffer.lock());
            }
        }
        let _ = tokio::time::timeout(timeout, token.shared.notify.notified()).await;
        std::mem::take(&mut *token.shared.buffer.lock())
    }

    /// Deliver `message` (already past server filters) to every matching
    /// handler and waiter. Visibility (`spec.md` §4.3 step 2) is applied
    /// per-waiter here; local handlers are trusted in-process code and see
    /// every message that reaches their channel.
    pub fn dispatch(&self, message: &Message) {
        self.dispatch_channel(&message.channel, message);
        self.dispatch_wildcard(message);
    }

    fn dispatch_channel(&self, channel: &str, message: &Message) {
        if let Some(entries) = self.by_channel.get(channel) {
            for r in entries.iter() {
                Self::deliver_one(&r.entry, message);
            }
        }
    }

    fn dispatch_wildcard(&self, message: &Message) {
        for r in self.wildcard.lock().iter() {
            Self::deliver_one(&r.entry, message);
        }
    }

    fn deliver_one(entry: &Entry, message: &Message) {
        match entry {
            Entry::Handler(h) => h(message),
            Entry::Wait { threshold, identity, shared } => {
                if message.message_id > *threshold && visible(message, identity) {
                    shared.buffer.lock().push(message.clone());
                    shared.notify.notify_one();
                }
            }
        }
    }
}

/// RAII handle for a `register_wait_guard` registration. `Drop` unregisters
/// the wait regardless of whether [`WaitGuard::wait`] ran to completion,
/// timed out, or was cancelled partway through.
pub struct WaitGuard<'a> {
    registry: &'a Registry,
    token: WaitToken,
}

impl WaitGuard<'_> {
    /// Suspend until a matching message arrives or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Vec<Message> {
        self.registry.wait(&self.token, timeout).await
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister_wait(&self.token);
    }
}

/// Session visibility check (`spec.md` §4.3 step 2 / P6): a message whose
/// allow-set for a dimension is non-empty is delivered only to identities
/// that intersect it; an empty/absent allow-set does not restrict.
fn visible(message: &Message, identity: &Identity) -> bool {
    if let Some(ids) = &message.user_ids {
        if !ids.is_empty() {
            match &identity.user_id {
                Some(uid) if ids.contains(uid) => {}
                _ => return false,
            }
        }
    }
    if let Some(ids) = &message.group_ids {
        if !ids.is_empty() && !identity.group_ids.iter().any(|g| ids.contains(g)) {
            return false;
        }
    }
    if let Some(ids) = &message.client_ids {
        if !ids.is_empty() && !ids.contains(&identity.client_id) {
            return false;
        }
    }
    true
}
