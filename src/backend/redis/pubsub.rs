//! Redis Pub/Sub bridge: one dedicated connection per process, not per
//! subscriber, forwarding raw fan-out bytes into a local broadcast channel.
//!
//! Grounded on the teacher's `data/topics::pubsub::PubSubBridge` /
//! `run_bridge_task` (dedicated connection outside the command pool,
//! reconnect-with-backoff loop, `watch`-based stop signal).

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Sentinel payload published by `global_unsubscribe` to unblock a running
/// `global_subscribe` loop (`spec.md` §4.2 "on_message").
pub const UNSUB_SENTINEL: &[u8] = b"$$MESSAGE_BUS_UNSUBSCRIBE$$";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const BROADCAST_CAPACITY: usize = 8192;

pub struct PubSubBridge {
    sender: broadcast::Sender<Vec<u8>>,
    stop_tx: watch::Sender<bool>,
    reconnect_tx: watch::Sender<u64>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PubSubBridge {
    /// Start the bridge task for `channel`, connecting with a dedicated
    /// client (not a pooled connection — Redis blocks the connection that
    /// issues `SUBSCRIBE`).
    pub fn start(redis_url: String, channel: String) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (reconnect_tx, reconnect_rx) = watch::channel(0u64);

        let task_sender = sender.clone();
        let handle = tokio::spawn(Self::run(redis_url, channel, task_sender, stop_rx, reconnect_rx));

        Self {
            sender,
            stop_tx,
            reconnect_tx,
            task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }

    /// Force the bridge's Redis connection to drop and reconnect
    /// (`Backend::after_fork`).
    pub fn reconnect(&self) {
        self.reconnect_tx.send_modify(|n| *n += 1);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn run(
        redis_url: String,
        channel: String,
        sender: broadcast::Sender<Vec<u8>>,
        mut stop_rx: watch::Receiver<bool>,
        mut reconnect_rx: watch::Receiver<u64>,
    ) {
        loop {
            if *stop_rx.borrow() {
                return;
            }

            let client = match deadpool_redis::redis::Client::open(redis_url.as_str()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, %channel, "failed to open redis client for pub/sub, retrying");
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            let mut pubsub = match client.get_async_pubsub().await {
                Ok(ps) => ps,
                Err(e) => {
                    tracing::warn!(error = %e, %channel, "failed to get redis pub/sub connection, retrying");
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            if let Err(e) = pubsub.subscribe(&channel).await {
                tracing::warn!(error = %e, %channel, "failed to subscribe, retrying");
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }

            tracing::debug!(%channel, "redis pub/sub bridge connected");
            let mut stream = pubsub.on_message();

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return,
                    _ = reconnect_rx.changed() => break,
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => {
                                let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
                                let _ = sender.send(payload);
                            }
                            None => {
                                tracing::warn!(%channel, "redis pub/sub stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}
