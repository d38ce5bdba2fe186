//! Reliable-PubSub Loop (C9): bridges `Backend::global_subscribe` into
//! `BusEngine::dispatch`.
//!
//! Grounded on the teacher's `run_bridge_task` background-task shape
//! (spawn once, reconnect-with-backoff on error, `watch`-driven shutdown).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::BusEngine;

const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Owns the single background task that keeps the engine's subscriber
/// registry fed from the backend's authoritative `global_id`-ordered stream.
pub struct PubsubLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PubsubLoop {
    pub fn spawn(engine: Arc<BusEngine>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(engine, stop_rx));
        Self { stop_tx, task }
    }

    /// `spec.md` §4.7: `global_unsubscribe()` then join.
    pub async fn shutdown(self) -> Result<(), crate::backend::BusError> {
        let _ = self.stop_tx.send(true);
        self.task.abort();
        let _ = self.task.await;
        Ok(())
    }
}

async fn run(engine: Arc<BusEngine>, mut stop_rx: watch::Receiver<bool>) {
    let mut after_global_id: Option<u64> = None;

    loop {
        if *stop_rx.borrow() {
            return;
        }

        let mut subscription = match engine.backend().global_subscribe(after_global_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "reliable-pubsub: failed to open global_subscribe, retrying");
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(RETRY_BACKOFF) => continue,
                }
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return,
                message = subscription.receiver.recv() => {
                    match message {
                        Some(m) => {
                            after_global_id = Some(m.global_id);
                            engine.dispatch(&m);
                        }
                        None => {
                            tracing::warn!("reliable-pubsub: subscription stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(RETRY_BACKOFF) => {}
        }
    }
}
