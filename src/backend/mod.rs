//! Backend Contract (C2): the abstract store behind the bus.
//!
//! Grounded on the teacher's `data/topics::TopicBackend` trait
//! (`async_trait`, broadcast vs. stream delivery semantics) and
//! `data/cache::CacheBackend` (key-based atomic ops), generalized to the
//! sorted-set-backlog + fan-out contract `spec.md` §4.1 requires.

pub mod memory;
pub mod redis;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

/// Errors a [`Backend`] implementation may surface (`spec.md` §7).
#[derive(Debug, Error)]
pub enum BusError {
    /// Transient: the store could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Internal to the subscribe loop; never escapes `catch_up`.
    #[error("backlog out of order at global_id {0}")]
    BacklogOutOfOrder(u64),
    /// The store has failed over to a read-only replica.
    #[error("backend is read-only")]
    BackendReadOnly,
    /// A stored entry failed to decode; the caller should skip it.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// 400-equivalent: caller supplied a bad request.
    #[error("client error: {0}")]
    ClientError(String),
    /// Not really an error; the long-poll deadline elapsed.
    #[error("timeout")]
    Timeout,
}

/// The closed set of options recognized by `publish` (`spec.md` §4.1, §4.3).
///
/// Modeled as a struct rather than an open map, per the REDESIGN FLAGS
/// guidance on "Dynamic `opts` mapping".
#[derive(Debug, Clone, Default)]
pub struct PublishOpts {
    pub site_id: Option<String>,
    pub user_ids: Option<HashSet<String>>,
    pub group_ids: Option<HashSet<String>>,
    pub client_ids: Option<HashSet<String>>,
    pub max_backlog_age: Option<u64>,
    pub max_backlog_size: Option<u64>,
}

/// Trimming policy shared by every channel and the global backlog
/// (`spec.md` §4.1 "Trimming policy").
#[derive(Debug, Clone, Copy)]
pub struct TrimPolicy {
    pub max_backlog_size: u64,
    pub max_global_backlog_size: u64,
    pub clear_every: u64,
    pub max_backlog_age_secs: u64,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self {
            max_backlog_size: 1000,
            max_global_backlog_size: 2000,
            clear_every: 1,
            max_backlog_age_secs: 7 * 24 * 3600,
        }
    }
}

/// A live subscription returned by `subscribe`/`global_subscribe`.
///
/// Models the spec's "coroutine-style subscribe blocks" (REDESIGN FLAGS) as
/// a cancellable stream instead of a blocking callback: the contract is the
/// ordered `Message` stream, not the control-flow style used to produce it.
pub struct Subscription {
    pub receiver: tokio::sync::mpsc::Receiver<Message>,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn new(receiver: tokio::sync::mpsc::Receiver<Message>, task: tokio::task::JoinHandle<()>) -> Self {
        Self { receiver, task }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The abstract backend store (`spec.md` §4.1).
///
/// All operations may fail with [`BusError::BackendUnavailable`]; specific
/// methods may additionally return the errors documented on them.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Atomically allocate IDs, persist the message, fan it out, and
    /// conditionally trim. Returns the assigned per-channel `message_id`.
    async fn publish(
        &self,
        channel: &str,
        data: Vec<u8>,
        opts: &PublishOpts,
    ) -> Result<u64, BusError>;

    /// Last assigned per-channel ID; non-existent channels return 0.
    async fn last_id(&self, channel: &str) -> Result<u64, BusError>;

    /// Last assigned global ID across the whole bus (0 if never published).
    async fn last_global_id(&self) -> Result<u64, BusError>;

    /// Batch form of [`Backend::last_id`].
    async fn last_ids(&self, channels: &[String]) -> Result<Vec<u64>, BusError> {
        let mut out = Vec::with_capacity(channels.len());
        for c in channels {
            out.push(self.last_id(c).await?);
        }
        Ok(out)
    }

    /// Messages on `channel` with `message_id > after_id`, ascending.
    async fn backlog(&self, channel: &str, after_id: u64) -> Result<Vec<Message>, BusError>;

    /// Messages across all channels with `global_id > after_global_id`,
    /// ascending. Entries whose per-channel record has been trimmed are
    /// omitted (invariant 5).
    async fn global_backlog(&self, after_global_id: u64) -> Result<Vec<Message>, BusError>;

    /// Fetch a single message, or `None` if absent/trimmed.
    async fn get_message(&self, channel: &str, message_id: u64) -> Result<Option<Message>, BusError>;

    /// Subscribe to every channel in `global_id` order — the authoritative
    /// delivery stream used by the reliable-pubsub loop (C9).
    async fn global_subscribe(&self, after_global_id: Option<u64>) -> Result<Subscription, BusError>;

    /// Subscribe to one channel, catching up from `after_id` first.
    ///
    /// Built on top of [`Backend::global_subscribe`], filtered by channel:
    /// `after_id` is translated to a `global_id` via [`Backend::get_message`]
    /// on a best-effort basis. If that per-channel record has already been
    /// trimmed, the raw `after_id` is used directly as a global cursor —
    /// this can replay a few messages from unrelated channels, which is the
    /// documented, deliberate behavior from `spec.md` §9 (downstream
    /// dedup-by-ID absorbs it).
    async fn subscribe(&self, channel: &str, after_id: Option<u64>) -> Result<Subscription, BusError> {
        let backlog_msgs = self.backlog(channel, after_id.unwrap_or(0)).await?;

        let after_global = match after_id {
            None => None,
            Some(id) => match self.get_message(channel, id).await? {
                Some(m) => Some(m.global_id),
                None => Some(id),
            },
        };

        let mut inner = self.global_subscribe(after_global).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(256);

        for m in backlog_msgs {
            if tx.send(m).await.is_err() {
                return Ok(Subscription::new(rx, tokio::spawn(async {})));
            }
        }

        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            while let Some(m) = inner.receiver.recv().await {
                if m.channel == channel && tx.send(m).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }

    /// Unblock a currently-running `global_subscribe` via the sentinel.
    async fn global_unsubscribe(&self) -> Result<(), BusError>;

    /// Wipe all backend state. Used by tests.
    async fn reset(&self) -> Result<(), BusError>;

    /// Expire every backlog immediately (used by tests and admin tooling).
    async fn expire_all_backlogs(&self) -> Result<(), BusError>;

    /// Re-establish connections after a process fork.
    async fn after_fork(&self) -> Result<(), BusError>;

    /// Release backend resources on shutdown.
    async fn destroy(&self) -> Result<(), BusError>;

    /// Detect whether the backend has failed over to a read-only replica
    /// (`spec.md` §4.2 "Readonly detection"). Default: never read-only.
    async fn is_readonly(&self) -> Result<bool, BusError> {
        Ok(false)
    }
}

/// Maximum gap-retry attempts before tolerant mode (`spec.md` §4.2 `catch_up`).
const MAX_GAP_RETRIES: u32 = 4;

/// Shared `catch_up`/`process_global_backlog` algorithm from `spec.md` §4.2,
/// used by every backend's `global_subscribe` loop so the retry/tolerant-mode
/// shape stays identical regardless of transport.
///
/// Advances `*highest_id` and forwards every message found to `tx`, in
/// ascending `global_id` order. On the last retry, a detected gap no longer
/// raises [`BusError::BacklogOutOfOrder`] — it is tolerated and the cursor
/// jumps forward, matching `process_global_backlog`'s `raise_on_gap = false`
/// branch.
pub(crate) async fn catch_up_global(
    backend: &dyn Backend,
    highest_id: &mut Option<u64>,
    tx: &tokio::sync::mpsc::Sender<Message>,
) -> Result<(), ()> {
    let mut attempts_left = MAX_GAP_RETRIES;
    loop {
        let raise_on_gap = attempts_left > 0;
        match process_global_backlog(backend, *highest_id, raise_on_gap, tx).await {
            Ok(h) => {
                *highest_id = Some(h);
                return Ok(());
            }
            Err(BusError::BacklogOutOfOrder(_)) => {
                attempts_left = attempts_left.saturating_sub(1);
                let jitter_ms = rand::random::<u64>() % 50;
                tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
            }
            Err(_) => {
                // Any other backend error: log, back off, and let the
                // caller's outer loop retry the subscription.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                return Err(());
            }
        }
    }
}

async fn process_global_backlog(
    backend: &dyn Backend,
    highest_id: Option<u64>,
    raise_on_gap: bool,
    tx: &tokio::sync::mpsc::Sender<Message>,
) -> Result<u64, BusError> {
    let last_global = backend.last_global_id().await?;
    let mut h = match highest_id {
        // The store was reset since we last saw it; restart from scratch.
        Some(h) if h > last_global => 0,
        Some(h) => h,
        None => 0,
    };

    for m in backend.global_backlog(h).await? {
        if m.global_id == h + 1 {
            h = m.global_id;
            let _ = tx.send(m).await;
        } else if raise_on_gap {
            return Err(BusError::BacklogOutOfOrder(h));
        } else if m.global_id > h {
            h = m.global_id;
            let _ = tx.send(m).await;
        }
    }
    Ok(h)
}
