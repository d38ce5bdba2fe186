//! Bus Engine (C4): wires identity, filters, registry, and backend together.
//!
//! Grounded on the teacher's `TopicService`/`ConnectionManager` split — one
//! long-lived object owning the backend handle and shared subscriber state,
//! constructed once at startup and cloned as an `Arc` into every handler.

pub mod filters;
pub mod identity;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BusError, PublishOpts};
use crate::engine::filters::FilterChain;
use crate::engine::identity::{Identity, IdentityHooks, NoopIdentityHooks};
use crate::engine::registry::{LocalHandler, LocalSubscription, Registry};
use crate::message::Message;

/// Prefix applied to every channel published/subscribed with a non-empty
/// `site_id` (`spec.md` §4.1 "Publish API"): `/siteid/<site_id><channel>`.
fn namespaced_channel(channel: &str, site_id: Option<&str>) -> String {
    match site_id {
        Some(id) if !id.is_empty() => format!("/siteid/{id}{channel}"),
        _ => channel.to_string(),
    }
}

/// The central object: one per process, shared behind an `Arc` by every
/// HTTP handler and the reliable-pubsub loop.
pub struct BusEngine {
    backend: Arc<dyn Backend>,
    registry: Registry,
    filters: FilterChain,
    identity_hooks: Arc<dyn IdentityHooks>,
}

impl BusEngine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            registry: Registry::new(),
            filters: FilterChain::new(),
            identity_hooks: Arc::new(NoopIdentityHooks),
        }
    }

    pub fn with_identity_hooks(mut self, hooks: Arc<dyn IdentityHooks>) -> Self {
        self.identity_hooks = hooks;
        self
    }

    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn identity_hooks(&self) -> &Arc<dyn IdentityHooks> {
        &self.identity_hooks
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// Publish `data` on `channel`, applying site-scoping namespacing and
    /// running it through the server filter chain before handing off to the
    /// backend (`spec.md` §4.1 "publish").
    ///
    /// A message dropped by a server filter is reported as published (the
    /// caller asked to send it; the filter's decision is a policy concern,
    /// not a client error) but never reaches the backend or any subscriber.
    pub async fn publish(&self, channel: &str, data: Vec<u8>, opts: PublishOpts) -> Result<Option<u64>, BusError> {
        let channel = namespaced_channel(channel, opts.site_id.as_deref());

        let probe = Message {
            global_id: 0,
            message_id: 0,
            channel: channel.clone(),
            data,
            user_ids: opts.user_ids.clone(),
            group_ids: opts.group_ids.clone(),
            client_ids: opts.client_ids.clone(),
            site_id: opts.site_id.clone(),
        };
        let Some(filtered) = self.filters.apply_server(probe) else {
            return Ok(None);
        };

        let mut opts = opts;
        opts.user_ids = filtered.user_ids;
        opts.group_ids = filtered.group_ids;
        opts.client_ids = filtered.client_ids;

        let message_id = self.backend.publish(&channel, filtered.data, &opts).await?;
        Ok(Some(message_id))
    }

    /// Register an in-process handler, bypassing HTTP entirely. `channel =
    /// None` subscribes to every channel (`spec.md` §4.5 "local_subscribe").
    pub fn local_subscribe(&self, channel: Option<&str>, handler: LocalHandler) -> LocalSubscription {
        self.registry.subscribe_handler(channel, handler)
    }

    pub fn local_unsubscribe(&self, sub: &LocalSubscription) {
        self.registry.unsubscribe_handler(sub);
    }

    /// Long-poll core (`spec.md` §4.3 "wait_for_messages"): block the caller
    /// until a message past `cursors` arrives or `timeout` elapses, applying
    /// session visibility and client filters before returning.
    pub async fn wait_for_messages(
        &self,
        cursors: &HashMap<String, u64>,
        identity: Arc<Identity>,
        timeout: Duration,
    ) -> Vec<(Message, serde_json::Value)> {
        // `guard` unregisters the wait on drop, so a cancelled long-poll
        // (the client disconnecting while this future is suspended below)
        // cannot leak the registration.
        let guard = self.registry.register_wait_guard(cursors, identity);
        let messages = guard.wait(timeout).await;
        messages
            .into_iter()
            .map(|m| {
                let data = self.filters.apply_client(&m);
                (m, data)
            })
            .collect()
    }

    /// Feed one message past the filter chain into every registered waiter
    /// and local handler. Called by the reliable-pubsub loop (C9) for every
    /// message read from `Backend::global_subscribe`.
    pub fn dispatch(&self, message: &Message) {
        self.registry.dispatch(message);
    }

    /// Wake every session without needing to wait for a deadline; used by
    /// `Backend::after_fork` recovery and graceful shutdown so long-polling
    /// clients reconnect promptly instead of idling out the full timeout.
    pub async fn after_fork(&self) -> Result<(), BusError> {
        self.backend.after_fork().await
    }

    /// Release the backend cleanly (`spec.md` §4.1 "destroy").
    pub async fn shutdown(&self) -> Result<(), BusError> {
        self.backend.global_unsubscribe().await?;
        self.backend.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> BusEngine {
        BusEngine::new(Arc::new(MemoryBackend::new(Default::default())))
    }

    #[test]
    fn namespaced_channel_prefixes_with_site_id() {
        assert_eq!(namespaced_channel("/chat", Some("acme")), "/siteid/acme/chat");
        assert_eq!(namespaced_channel("/chat", None), "/chat");
        assert_eq!(namespaced_channel("/chat", Some("")), "/chat");
    }

    #[tokio::test]
    async fn publish_namespaces_channel_by_site_id() {
        let engine = engine();
        let opts = PublishOpts {
            site_id: Some("acme".to_string()),
            ..PublishOpts::default()
        };
        engine.publish("/chat", b"hi".to_vec(), opts).await.unwrap();
        assert_eq!(engine.backend().last_id("/siteid/acme/chat").await.unwrap(), 1);
        assert_eq!(engine.backend().last_id("/chat").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_with_no_messages() {
        let engine = engine();
        let mut cursors = HashMap::new();
        cursors.insert("/chat".to_string(), 0);

        let got = engine
            .wait_for_messages(&cursors, Arc::new(Identity::default()), Duration::from_millis(50))
            .await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn local_subscribe_receives_dispatch() {
        let engine = engine();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _sub = engine.local_subscribe(Some("/chat"), Arc::new(move |_: &Message| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        engine.publish("/chat", b"hi".to_vec(), PublishOpts::default()).await.unwrap();
        // local handlers are invoked synchronously from dispatch, which the
        // reliable-pubsub loop calls after reading the backend's broadcast;
        // exercise dispatch directly here.
        let msg = Message {
            global_id: 1,
            message_id: 1,
            channel: "/chat".to_string(),
            data: b"hi".to_vec(),
            user_ids: None,
            group_ids: None,
            client_ids: None,
            site_id: None,
        };
        engine.dispatch(&msg);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_filter_drops_before_backend_publish() {
        use crate::engine::filters::ServerFilter;

        struct DropAll;
        impl ServerFilter for DropAll {
            fn apply(&self, _m: Message) -> Option<Message> {
                None
            }
        }

        let mut filters = FilterChain::new();
        filters.register_server("/mod", Arc::new(DropAll));
        let engine = engine().with_filters(filters);

        let result = engine.publish("/mod/x", b"hi".to_vec(), PublishOpts::default()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(engine.backend().last_id("/mod/x").await.unwrap(), 0);
    }
}
