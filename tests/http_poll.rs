//! End-to-end HTTP long-poll tests over the in-memory backend, grounded on
//! the `iwismer-rusty-timer` receiver crate's `tower::ServiceExt::oneshot`
//! integration-test style (`services/receiver/tests/control_api.rs`).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use message_bus::backend::memory::MemoryBackend;
use message_bus::backend::{PublishOpts, TrimPolicy};
use message_bus::engine::BusEngine;
use message_bus::http::{router, HttpConfig};
use message_bus::pubsub_loop::PubsubLoop;
use serde_json::Value;
use tower::ServiceExt;

fn test_engine(policy: TrimPolicy) -> Arc<BusEngine> {
    Arc::new(BusEngine::new(Arc::new(MemoryBackend::new(policy))))
}

fn test_router(engine: Arc<BusEngine>) -> axum::Router {
    test_router_with_config(engine, Duration::from_millis(500), Duration::from_millis(200))
}

fn test_router_with_config(engine: Arc<BusEngine>, long_poll_timeout: Duration, keepalive: Duration) -> axum::Router {
    let config = HttpConfig { long_poll_timeout, keepalive };
    router(engine, config)
}

async fn poll_json(app: axum::Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

/// Scenario 1 (`spec.md` §8): basic publish/receive.
#[tokio::test]
async fn basic_publish_then_poll_returns_message() {
    let engine = test_engine(TrimPolicy::default());
    engine.publish("/chat", b"hi".to_vec(), PublishOpts::default()).await.unwrap();

    let (status, body) = poll_json(test_router(Arc::clone(&engine)), "/abc/poll?%2Fchat=0").await;
    assert_eq!(status, StatusCode::OK);
    let messages = body.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["channel"], "/chat");
    assert_eq!(messages[0]["message_id"], 1);
    assert_eq!(messages[0]["data"], "hi");
}

/// Scenario 2 (`spec.md` §8): cursor catch-up returns only what's past it.
#[tokio::test]
async fn cursor_catch_up_returns_messages_after_cursor() {
    let engine = test_engine(TrimPolicy::default());
    for i in 1..=3u8 {
        engine.publish("/x", vec![i], PublishOpts::default()).await.unwrap();
    }

    let (status, body) = poll_json(test_router(Arc::clone(&engine)), "/abc/poll?%2Fx=1").await;
    assert_eq!(status, StatusCode::OK);
    let messages = body.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["message_id"], 2);
    assert_eq!(messages[1]["message_id"], 3);
}

/// Scenario 3 (`spec.md` §8): a poll blocked on an up-to-date cursor wakes
/// within its timeout once a new message lands on the watched channel.
///
/// Delivery to a blocked session only happens via `Engine::dispatch`, which
/// the reliable-pubsub loop (C9) drives from `Backend::global_subscribe` —
/// so this test runs one, same as `CoreApp::run` does in production.
#[tokio::test]
async fn long_poll_wakes_on_new_publish() {
    let engine = test_engine(TrimPolicy::default());
    engine.publish("/x", b"seed".to_vec(), PublishOpts::default()).await.unwrap();
    let last = engine.backend().last_id("/x").await.unwrap();

    let pubsub_loop = PubsubLoop::spawn(Arc::clone(&engine));
    let app = test_router(Arc::clone(&engine));
    let publisher_engine = Arc::clone(&engine);
    let publish_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        publisher_engine.publish("/x", b"wake".to_vec(), PublishOpts::default()).await.unwrap();
    });

    let started = std::time::Instant::now();
    let (status, body) = poll_json(app, &format!("/abc/poll?%2Fx={last}")).await;
    publish_task.await.unwrap();
    pubsub_loop.shutdown().await.unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() < Duration::from_millis(500), "poll should wake promptly, not idle to its deadline");
    let messages = body.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["data"], "wake");
}

/// Scenario 4 (`spec.md` §8): cross-channel global ordering is preserved
/// even though per-channel IDs interleave independently.
#[tokio::test]
async fn cross_channel_publishes_get_independent_monotonic_ids() {
    let engine = test_engine(TrimPolicy::default());
    let a1 = engine.publish("/a", b"a1".to_vec(), PublishOpts::default()).await.unwrap().unwrap();
    let b1 = engine.publish("/b", b"b1".to_vec(), PublishOpts::default()).await.unwrap().unwrap();
    let a2 = engine.publish("/a", b"a2".to_vec(), PublishOpts::default()).await.unwrap().unwrap();

    assert_eq!(a1, 1);
    assert_eq!(b1, 1);
    assert_eq!(a2, 2);

    let global = engine.backend().global_backlog(0).await.unwrap();
    assert_eq!(global.len(), 3);
    assert_eq!(global[0].global_id, 1);
    assert_eq!(global[1].global_id, 2);
    assert_eq!(global[2].global_id, 3);
    assert_eq!(global[0].channel, "/a");
    assert_eq!(global[1].channel, "/b");
    assert_eq!(global[2].channel, "/a");
}

/// Scenario 5 (`spec.md` §8): trimming retains only the most recent
/// `max_backlog_size` messages per channel.
#[tokio::test]
async fn trim_retains_only_most_recent_messages() {
    let policy = TrimPolicy {
        max_backlog_size: 5,
        max_global_backlog_size: 2000,
        clear_every: 1,
        ..TrimPolicy::default()
    };
    let engine = test_engine(policy);
    for i in 0..10u8 {
        engine.publish("/c", vec![i], PublishOpts::default()).await.unwrap();
    }

    let backlog = engine.backend().backlog("/c", 0).await.unwrap();
    assert_eq!(backlog.len(), 5);
    let ids: Vec<u64> = backlog.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![6, 7, 8, 9, 10]);
}

/// A message scoped by `user_ids` must not be visible to a session with a
/// different (or absent) identity (`spec.md` §8 P6).
#[tokio::test]
async fn user_scoped_message_hidden_from_unmatched_identity() {
    let engine = test_engine(TrimPolicy::default());
    let mut user_ids = std::collections::HashSet::new();
    user_ids.insert("alice".to_string());
    engine
        .publish(
            "/dm",
            b"secret".to_vec(),
            PublishOpts { user_ids: Some(user_ids), ..PublishOpts::default() },
        )
        .await
        .unwrap();

    let (_, body) = poll_json(test_router(Arc::clone(&engine)), "/abc/poll?%2Fdm=0").await;
    assert!(body.as_array().unwrap().is_empty(), "caller has no matching identity, must not see the message");
}

/// An empty poll with no channel cursors returns immediately with no
/// messages rather than blocking to the deadline.
#[tokio::test]
async fn poll_with_no_cursors_returns_immediately() {
    let engine = test_engine(TrimPolicy::default());
    let started = std::time::Instant::now();
    let (status, body) = poll_json(test_router(engine), "/abc/poll").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
    assert!(started.elapsed() < Duration::from_millis(100));
}

/// A malformed (non-numeric) cursor is rejected with 400, not a panic.
#[tokio::test]
async fn malformed_cursor_is_rejected_with_client_error() {
    let engine = test_engine(TrimPolicy::default());
    let (status, body) = poll_json(test_router(engine), "/abc/poll?%2Fchat=nope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

/// The reserved `__seq` echo value round-trips onto the response header.
#[tokio::test]
async fn seq_echo_header_round_trips() {
    let engine = test_engine(TrimPolicy::default());
    let app = test_router(engine);
    let req = Request::builder().uri("/abc/poll?__seq=42").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-message-bus-seq").unwrap(), "42");
}

/// `/_diagnostics/*` is reserved and always 404s (`spec.md` §4.5).
#[tokio::test]
async fn diagnostics_path_is_reserved() {
    let engine = test_engine(TrimPolicy::default());
    let app = test_router(engine);
    let req = Request::builder().uri("/_diagnostics/anything").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

/// Streaming mode (`spec.md` §4.5) must hold the connection open across
/// several deliveries, not close after the first one: two publishes spaced
/// within the deadline must both show up as distinct chunks on the same
/// response, each carrying only the message that arrived since the last one
/// (proving the cursor advanced rather than re-sending the backlog).
#[tokio::test]
async fn streaming_poll_emits_a_chunk_per_batch_until_deadline() {
    let engine = test_engine(TrimPolicy::default());
    let pubsub_loop = PubsubLoop::spawn(Arc::clone(&engine));
    let app = test_router_with_config(Arc::clone(&engine), Duration::from_millis(350), Duration::from_millis(500));

    let publisher_engine = Arc::clone(&engine);
    let publish_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher_engine.publish("/x", b"first".to_vec(), PublishOpts::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher_engine.publish("/x", b"second".to_vec(), PublishOpts::default()).await.unwrap();
    });

    let req = Request::builder().uri("/abc/poll?%2Fx=0&__stream=1").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();

    publish_task.await.unwrap();
    pubsub_loop.shutdown().await.unwrap();

    let text = String::from_utf8(body.to_vec()).unwrap();
    let batches: Vec<Value> = text
        .split("\n--message-bus-boundary--\n")
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(s).unwrap())
        .collect();

    let non_empty: Vec<&Value> = batches.iter().filter(|b| !b.as_array().unwrap().is_empty()).collect();
    assert_eq!(non_empty.len(), 2, "each publish must land in its own chunk, not be merged or dropped: {batches:?}");
    assert_eq!(non_empty[0][0]["data"], "first");
    assert_eq!(non_empty[1][0]["data"], "second");
}
