//! In-memory backend (C3', an explicitly-allowed alternative backend).
//!
//! Grounded on the teacher's `data/topics::memory::MemoryTopicBackend`
//! (local broadcast fan-out, no network round trips), adapted from
//! ephemeral broadcast topics to sorted-set-style backlogs so the same
//! catch-up/trim contract as the Redis backend holds. Used by tests and
//! single-process deployments; not the canonical backend (`spec.md` §1).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::message::Message;

use super::{catch_up_global, Backend, BusError, PublishOpts, Subscription, TrimPolicy};

#[derive(Clone)]
enum FanoutEvent {
    Published(Message),
    Unsub,
}

struct ChannelState {
    last_id: u64,
    backlog: BTreeMap<u64, Message>,
    last_publish: Instant,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            last_id: 0,
            backlog: BTreeMap::new(),
            last_publish: Instant::now(),
        }
    }
}

struct Inner {
    channels: Mutex<std::collections::HashMap<String, ChannelState>>,
    global_backlog: Mutex<BTreeMap<u64, (String, u64)>>,
    last_global_id: Mutex<u64>,
    fanout: broadcast::Sender<FanoutEvent>,
    policy: TrimPolicy,
}

/// Process-local backend: `Vec`/`BTreeMap` backlogs behind a mutex, a
/// `tokio::sync::broadcast` channel standing in for the store's fan-out
/// primitive.
pub struct MemoryBackend {
    inner: std::sync::Arc<Inner>,
}

impl MemoryBackend {
    pub fn new(policy: TrimPolicy) -> Self {
        let (fanout, _) = broadcast::channel(4096);
        Self {
            inner: std::sync::Arc::new(Inner {
                channels: Mutex::new(std::collections::HashMap::new()),
                global_backlog: Mutex::new(BTreeMap::new()),
                last_global_id: Mutex::new(0),
                fanout,
                policy,
            }),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(TrimPolicy::default())
    }
}

fn trim_channel(state: &mut ChannelState, max_size: u64, clear_every: u64) {
    if state.last_id > max_size && state.last_id.is_multiple_of(clear_every.max(1)) {
        let floor = state.last_id - max_size;
        state.backlog.retain(|id, _| *id > floor);
    }
}

fn trim_global(backlog: &mut BTreeMap<u64, (String, u64)>, last_id: u64, max_size: u64, clear_every: u64) {
    if last_id > max_size && last_id.is_multiple_of(clear_every.max(1)) {
        let floor = last_id - max_size;
        backlog.retain(|id, _| *id > floor);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn publish(
        &self,
        channel: &str,
        data: Vec<u8>,
        opts: &PublishOpts,
    ) -> Result<u64, BusError> {
        let max_backlog_size = opts.max_backlog_size.unwrap_or(self.inner.policy.max_backlog_size);
        let max_age = opts
            .max_backlog_age
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(self.inner.policy.max_backlog_age_secs));
        let clear_every = self.inner.policy.clear_every;

        let (global_id, message_id, message);
        {
            let mut global_id_guard = self.inner.last_global_id.lock();
            let mut channels = self.inner.channels.lock();
            let state = channels
                .entry(channel.to_string())
                .or_insert_with(ChannelState::new);

            // Strict per-message age eviction (documented divergence from
            // the Redis backend's whole-backlog TTL drop, see DESIGN.md).
            if state.last_publish.elapsed() > max_age {
                state.backlog.clear();
            }
            state.last_publish = Instant::now();

            *global_id_guard += 1;
            global_id = *global_id_guard;
            state.last_id += 1;
            message_id = state.last_id;

            message = Message {
                global_id,
                message_id,
                channel: channel.to_string(),
                data,
                user_ids: opts.user_ids.clone(),
                group_ids: opts.group_ids.clone(),
                client_ids: opts.client_ids.clone(),
                site_id: opts.site_id.clone(),
            };

            state.backlog.insert(message_id, message.clone());
            trim_channel(state, max_backlog_size, clear_every);

            let mut global_backlog = self.inner.global_backlog.lock();
            global_backlog.insert(global_id, (channel.to_string(), message_id));
            trim_global(
                &mut global_backlog,
                global_id,
                self.inner.policy.max_global_backlog_size,
                clear_every,
            );
        }

        let _ = self.inner.fanout.send(FanoutEvent::Published(message));
        Ok(message_id)
    }

    async fn last_id(&self, channel: &str) -> Result<u64, BusError> {
        Ok(self
            .inner
            .channels
            .lock()
            .get(channel)
            .map(|s| s.last_id)
            .unwrap_or(0))
    }

    async fn last_global_id(&self) -> Result<u64, BusError> {
        Ok(*self.inner.last_global_id.lock())
    }

    async fn backlog(&self, channel: &str, after_id: u64) -> Result<Vec<Message>, BusError> {
        let channels = self.inner.channels.lock();
        Ok(channels
            .get(channel)
            .map(|s| {
                s.backlog
                    .range((after_id + 1)..)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn global_backlog(&self, after_global_id: u64) -> Result<Vec<Message>, BusError> {
        let pointers: Vec<(u64, String, u64)> = self
            .inner
            .global_backlog
            .lock()
            .range((after_global_id + 1)..)
            .map(|(gid, (ch, mid))| (*gid, ch.clone(), *mid))
            .collect();

        let channels = self.inner.channels.lock();
        let mut out = Vec::with_capacity(pointers.len());
        for (_, channel, message_id) in pointers {
            if let Some(m) = channels.get(&channel).and_then(|s| s.backlog.get(&message_id)) {
                out.push(m.clone());
            }
            // else: per-channel entry already trimmed, skip (invariant 5).
        }
        Ok(out)
    }

    async fn get_message(&self, channel: &str, message_id: u64) -> Result<Option<Message>, BusError> {
        Ok(self
            .inner
            .channels
            .lock()
            .get(channel)
            .and_then(|s| s.backlog.get(&message_id))
            .cloned())
    }

    async fn global_subscribe(&self, after_global_id: Option<u64>) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(4096);
        let mut fanout_rx = self.inner.fanout.subscribe();
        let inner = std::sync::Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            let backend = MemoryBackend { inner: inner.clone() };
            let mut highest_id = after_global_id;

            if highest_id.is_some() && catch_up_global(&backend, &mut highest_id, &tx).await.is_err() {
                return;
            }

            loop {
                match fanout_rx.recv().await {
                    Ok(FanoutEvent::Published(m)) => {
                        let expected = highest_id.map(|h| h + 1);
                        if highest_id.is_none() || expected == Some(m.global_id) {
                            highest_id = Some(m.global_id);
                            if tx.send(m).await.is_err() {
                                break;
                            }
                        } else if catch_up_global(&backend, &mut highest_id, &tx).await.is_err() {
                            break;
                        }
                    }
                    Ok(FanoutEvent::Unsub) => break,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if catch_up_global(&backend, &mut highest_id, &tx).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }

    async fn global_unsubscribe(&self) -> Result<(), BusError> {
        let _ = self.inner.fanout.send(FanoutEvent::Unsub);
        Ok(())
    }

    async fn reset(&self) -> Result<(), BusError> {
        self.inner.channels.lock().clear();
        self.inner.global_backlog.lock().clear();
        *self.inner.last_global_id.lock() = 0;
        Ok(())
    }

    async fn expire_all_backlogs(&self) -> Result<(), BusError> {
        for state in self.inner.channels.lock().values_mut() {
            state.backlog.clear();
        }
        self.inner.global_backlog.lock().clear();
        Ok(())
    }

    async fn after_fork(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), BusError> {
        Ok(())
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            inner: std::sync::Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> PublishOpts {
        PublishOpts::default()
    }

    #[tokio::test]
    async fn publish_assigns_increasing_ids() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        let first = backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        let second = backend.publish("/chat", b"b".to_vec(), &opts()).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(backend.last_id("/chat").await.unwrap(), 2);
        assert_eq!(backend.last_global_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn backlog_returns_messages_after_cursor() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        backend.publish("/chat", b"b".to_vec(), &opts()).await.unwrap();
        backend.publish("/chat", b"c".to_vec(), &opts()).await.unwrap();

        let got = backend.backlog("/chat", 1).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message_id, 2);
        assert_eq!(got[1].message_id, 3);
    }

    #[tokio::test]
    async fn backlog_on_unknown_channel_is_empty() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        assert!(backend.backlog("/nope", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trimming_drops_messages_past_max_backlog_size() {
        let policy = TrimPolicy {
            max_backlog_size: 2,
            max_global_backlog_size: 2000,
            clear_every: 1,
            ..TrimPolicy::default()
        };
        let backend = MemoryBackend::new(policy);
        for i in 0..5u8 {
            backend.publish("/chat", vec![i], &opts()).await.unwrap();
        }
        let got = backend.backlog("/chat", 0).await.unwrap();
        // only the last `max_backlog_size` messages survive.
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message_id, 4);
        assert_eq!(got[1].message_id, 5);
    }

    #[tokio::test]
    async fn global_backlog_skips_trimmed_channel_entries() {
        let policy = TrimPolicy {
            max_backlog_size: 1,
            max_global_backlog_size: 2000,
            clear_every: 1,
            ..TrimPolicy::default()
        };
        let backend = MemoryBackend::new(policy);
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        backend.publish("/chat", b"b".to_vec(), &opts()).await.unwrap();

        // the first message was trimmed from the per-channel backlog but its
        // global pointer remains; global_backlog must not surface a ghost.
        let got = backend.global_backlog(0).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_id, 2);
    }

    #[tokio::test]
    async fn get_message_returns_none_for_absent_id() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        assert!(backend.get_message("/chat", 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expire_all_backlogs_clears_history_but_not_counters() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        backend.expire_all_backlogs().await.unwrap();
        assert!(backend.backlog("/chat", 0).await.unwrap().is_empty());
        assert_eq!(backend.last_id("/chat").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_clears_counters_too() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        backend.reset().await.unwrap();
        assert_eq!(backend.last_id("/chat").await.unwrap(), 0);
        assert_eq!(backend.last_global_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn global_subscribe_catches_up_then_streams_live() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();

        let mut sub = backend.global_subscribe(Some(0)).await.unwrap();
        let caught_up = sub.receiver.recv().await.unwrap();
        assert_eq!(caught_up.message_id, 1);

        backend.publish("/chat", b"b".to_vec(), &opts()).await.unwrap();
        let live = sub.receiver.recv().await.unwrap();
        assert_eq!(live.message_id, 2);
    }

    #[tokio::test]
    async fn subscribe_filters_to_requested_channel() {
        let backend = MemoryBackend::new(TrimPolicy::default());
        backend.publish("/chat", b"a".to_vec(), &opts()).await.unwrap();
        backend.publish("/other", b"x".to_vec(), &opts()).await.unwrap();

        let mut sub = backend.subscribe("/chat", Some(0)).await.unwrap();
        backend.publish("/other", b"y".to_vec(), &opts()).await.unwrap();
        backend.publish("/chat", b"b".to_vec(), &opts()).await.unwrap();

        // after_id=0 on a fresh channel can replay its one backlog entry
        // twice (direct backlog plus global catch-up), per the documented
        // `Backend::subscribe` fallback; loop past duplicates rather than
        // assume an exact count.
        let mut saw_second = false;
        for _ in 0..5 {
            let Some(m) = sub.receiver.recv().await else { break };
            assert_eq!(m.channel, "/chat", "must never leak /other onto this stream");
            if m.message_id == 2 {
                saw_second = true;
                break;
            }
        }
        assert!(saw_second, "expected to observe the live /chat message");
    }
}
