//! Client Session (C5): per-HTTP-request state for one long-poll call.
//!
//! Grounded on the teacher's request-scoped connection state in
//! `api/routes/otel/sse.rs` (parse → initial snapshot → block-or-return →
//! frame response), adapted from a single open stream to the bus's
//! catch-up-then-wait lifecycle (`spec.md` §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::backend::BusError;
use crate::engine::identity::Identity;
use crate::engine::BusEngine;
use crate::message::Message;

/// One element of the JSON array returned to the client (`spec.md` §6).
#[derive(Debug, serde::Serialize)]
pub struct WireMessage {
    pub global_id: u64,
    pub message_id: u64,
    pub channel: String,
    pub data: Value,
}

/// Per-request long-poll state.
pub struct ClientSession {
    pub identity: Arc<Identity>,
    pub cursors: HashMap<String, u64>,
    pub deadline: Instant,
    pub streaming: bool,
    /// Opaque client-supplied value echoed back to detect backend resets;
    /// the server does not interpret it (`spec.md` §4.4 `since_epoch`).
    pub since_epoch: Option<String>,
}

impl ClientSession {
    pub fn new(
        identity: Arc<Identity>,
        cursors: HashMap<String, u64>,
        timeout: Duration,
        streaming: bool,
        since_epoch: Option<String>,
    ) -> Self {
        Self {
            identity,
            cursors,
            deadline: Instant::now() + timeout,
            streaming,
            since_epoch,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run one lifecycle pass (`spec.md` §4.4): initial catch-up, then block
    /// for new messages if the catch-up was empty and there were cursors to
    /// watch, then apply client filters and return wire-ready messages.
    ///
    /// Advances `self.cursors` to the highest `message_id` delivered per
    /// channel before returning, so a caller that loops `run` (the
    /// streaming endpoint) never re-delivers the same backlog twice.
    pub async fn run(&mut self, engine: &BusEngine) -> Result<Vec<WireMessage>, BusError> {
        let mut collected = self.initial_catch_up(engine).await?;

        if collected.is_empty() && !self.cursors.is_empty() {
            let woken = engine
                .wait_for_messages(&self.cursors, Arc::clone(&self.identity), self.remaining())
                .await;
            collected.extend(woken.into_iter().map(|(m, data)| to_wire(&m, data)));
        }

        self.advance_cursors(&collected);
        Ok(collected)
    }

    fn advance_cursors(&mut self, delivered: &[WireMessage]) {
        for m in delivered {
            let cursor = self.cursors.entry(m.channel.clone()).or_insert(0);
            if m.message_id > *cursor {
                *cursor = m.message_id;
            }
        }
    }

    async fn initial_catch_up(&self, engine: &BusEngine) -> Result<Vec<WireMessage>, BusError> {
        let mut out = Vec::new();
        for (channel, after_id) in &self.cursors {
            for message in engine.backend().backlog(channel, *after_id).await? {
                if !visible_to(&message, &self.identity) {
                    continue;
                }
                let data = engine.filters().apply_client(&message);
                out.push(to_wire(&message, data));
            }
        }
        out.sort_by_key(|m| m.global_id);
        Ok(out)
    }
}

fn to_wire(message: &Message, data: Value) -> WireMessage {
    WireMessage {
        global_id: message.global_id,
        message_id: message.message_id,
        channel: message.channel.clone(),
        data,
    }
}

/// Session visibility check applied during initial catch-up (the
/// `wait_for_messages` path applies the identical check inside
/// `engine::registry`).
fn visible_to(message: &Message, identity: &Identity) -> bool {
    if let Some(ids) = &message.user_ids {
        if !ids.is_empty() && identity.user_id.as_deref().is_none_or(|u| !ids.contains(u)) {
            return false;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::PublishOpts;
    use crate::engine::BusEngine;

    fn engine() -> BusEngine {
        BusEngine::new(Arc::new(MemoryBackend::new(Default::default())))
    }

    #[tokio::test]
    async fn catch_up_returns_backlog_above_cursor() {
        let engine = engine();
        engine.publish("/x", b"1".to_vec(), PublishOpts::default()).await.unwrap();
        engine.publish("/x", b"2".to_vec(), PublishOpts::default()).await.unwrap();
        engine.publish("/x", b"3".to_vec(), PublishOpts::default()).await.unwrap();

        let mut cursors = HashMap::new();
        cursors.insert("/x".to_string(), 1);
        let mut session = ClientSession::new(Arc::new(Identity::default()), cursors, Duration::from_secs(1), false, None);

        let result = session.run(&engine).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].message_id, 2);
        assert_eq!(result[1].message_id, 3);
    }

    #[tokio::test]
    async fn empty_cursor_map_returns_immediately() {
        let engine = engine();
        let mut session = ClientSession::new(Arc::new(Identity::default()), HashMap::new(), Duration::from_secs(5), false, None);
        let started = Instant::now();
        let result = session.run(&engine).await.unwrap();
        assert!(result.is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn run_advances_cursor_so_a_second_call_does_not_redeliver() {
        let engine = engine();
        engine.publish("/x", b"1".to_vec(), PublishOpts::default()).await.unwrap();
        engine.publish("/x", b"2".to_vec(), PublishOpts::default()).await.unwrap();

        let mut cursors = HashMap::new();
        cursors.insert("/x".to_string(), 0);
        let mut session = ClientSession::new(Arc::new(Identity::default()), cursors, Duration::from_millis(50), false, None);

        let first = session.run(&engine).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(session.cursors.get("/x"), Some(&2));

        let second = session.run(&engine).await.unwrap();
        assert!(second.is_empty(), "cursor must have advanced past the already-delivered backlog");
    }
}
