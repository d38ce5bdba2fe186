//! Message Filters (C8): server-side and client-side filter chains.
//!
//! Ordered maps from channel-prefix to ordered filter list
//! (`spec.md` §4.6). Server filters run once per message before dispatch
//! and may drop it (returning `None`); client filters reshape the wire
//! payload per session, after the visibility check.

use std::sync::Arc;

use serde_json::Value;

use crate::message::Message;

/// Mutates or drops a [`Message`] before it reaches any subscriber.
pub trait ServerFilter: Send + Sync {
    fn apply(&self, message: Message) -> Option<Message>;
}

/// Shapes the wire `data` value for one client, after delivery is decided.
pub trait ClientFilter: Send + Sync {
    fn apply(&self, message: &Message, data: Value) -> Value;
}

struct PrefixEntry<F: ?Sized> {
    prefix: String,
    filters: Vec<Arc<F>>,
}

/// Ordered channel-prefix → filter-list registry for both filter kinds.
#[derive(Default)]
pub struct FilterChain {
    server: Vec<PrefixEntry<dyn ServerFilter>>,
    client: Vec<PrefixEntry<dyn ClientFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_server(&mut self, channel_prefix: impl Into<String>, filter: Arc<dyn ServerFilter>) {
        let prefix = channel_prefix.into();
        match self.server.iter_mut().find(|e| e.prefix == prefix) {
            Some(e) => e.filters.push(filter),
            None => self.server.push(PrefixEntry { prefix, filters: vec![filter] }),
        }
    }

    pub fn register_client(&mut self, channel_prefix: impl Into<String>, filter: Arc<dyn ClientFilter>) {
        let prefix = channel_prefix.into();
        match self.client.iter_mut().find(|e| e.prefix == prefix) {
            Some(e) => e.filters.push(filter),
            None => self.client.push(PrefixEntry { prefix, filters: vec![filter] }),
        }
    }

    /// Run every server filter whose prefix matches `message.channel`, in
    /// registration order. Returns `None` if any filter drops the message.
    pub fn apply_server(&self, mut message: Message) -> Option<Message> {
        let matching: Vec<&Arc<dyn ServerFilter>> = self
            .server
            .iter()
            .filter(|e| message.channel.starts_with(&e.prefix))
            .flat_map(|e| e.filters.iter())
            .collect();
        for filter in matching {
            message = filter.apply(message)?;
        }
        Some(message)
    }

    /// Run every client filter whose prefix matches `message.channel`,
    /// starting from the raw payload decoded as JSON (or a JSON string if
    /// it isn't valid JSON — `spec.md` §6: "`data` ... may be a string or a
    /// nested JSON value").
    pub fn apply_client(&self, message: &Message) -> Value {
        let mut data = serde_json::from_slice(&message.data)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.data).into_owned()));
        for entry in self.client.iter().filter(|e| message.channel.starts_with(&e.prefix)) {
            for filter in &entry.filters {
                data = filter.apply(message, data);
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;
    impl ClientFilter for Uppercase {
        fn apply(&self, _message: &Message, data: Value) -> Value {
            match data {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            }
        }
    }

    struct DropEverything;
    impl ServerFilter for DropEverything {
        fn apply(&self, _message: Message) -> Option<Message> {
            None
        }
    }

    fn msg(channel: &str, data: &str) -> Message {
        Message {
            global_id: 1,
            message_id: 1,
            channel: channel.to_string(),
            data: data.as_bytes().to_vec(),
            user_ids: None,
            group_ids: None,
            client_ids: None,
            site_id: None,
        }
    }

    #[test]
    fn server_filter_drops_message() {
        let mut chain = FilterChain::new();
        chain.register_server("/chat", Arc::new(DropEverything));
        assert!(chain.apply_server(msg("/chat", "hi")).is_none());
    }

    #[test]
    fn server_filter_does_not_apply_outside_prefix() {
        let mut chain = FilterChain::new();
        chain.register_server("/chat", Arc::new(DropEverything));
        assert!(chain.apply_server(msg("/other", "hi")).is_some());
    }

    #[test]
    fn client_filter_reshapes_payload() {
        let mut chain = FilterChain::new();
        chain.register_client("/chat", Arc::new(Uppercase));
        let out = chain.apply_client(&msg("/chat", "\"hi\""));
        assert_eq!(out, Value::String("HI".to_string()));
    }
}
