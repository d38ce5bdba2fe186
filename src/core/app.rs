//! `CoreApp`: wires config → backend → engine → pubsub loop → HTTP server.
//!
//! Grounded on the teacher's `app.rs` top-level composition (`init_logging`,
//! construct services, install signal handlers, serve with graceful
//! shutdown).

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::backend::memory::MemoryBackend;
use crate::backend::redis::RedisBackend;
use crate::backend::Backend;
use crate::core::cli::Cli;
use crate::core::config::AppConfig;
use crate::core::shutdown::ShutdownService;
use crate::engine::BusEngine;
use crate::http::HttpConfig;
use crate::pubsub_loop::PubsubLoop;

pub struct CoreApp {
    config: AppConfig,
    engine: Arc<BusEngine>,
    shutdown: ShutdownService,
}

impl CoreApp {
    pub async fn init(cli: Cli) -> anyhow::Result<Self> {
        init_logging();

        let config = AppConfig::load(&cli)?;
        let backend: Arc<dyn Backend> = match &config.redis_url {
            Some(url) => {
                tracing::info!(redis_url = %url, "connecting to redis backend");
                Arc::new(RedisBackend::new(url, "0", config.trim_policy).await?)
            }
            None => {
                tracing::info!("no redis url configured, using in-memory backend");
                Arc::new(MemoryBackend::new(config.trim_policy))
            }
        };

        let engine = Arc::new(BusEngine::new(backend));
        let shutdown = ShutdownService::new();

        Ok(Self { config, engine, shutdown })
    }

    /// Bind, serve, and block until a shutdown signal arrives (`spec.md`
    /// §4.7: C9 runs for the lifetime of the process).
    pub async fn run(self) -> anyhow::Result<()> {
        self.shutdown.install_signal_handlers();

        let pubsub_loop = PubsubLoop::spawn(Arc::clone(&self.engine));

        let http_config = HttpConfig {
            long_poll_timeout: self.config.long_poll.timeout,
            keepalive: self.config.long_poll.keepalive,
        };
        let router = axum::Router::new()
            .nest(&self.config.server.base_path, crate::http::router(Arc::clone(&self.engine), http_config))
            .layer(tower_http::trace::TraceLayer::new_for_http());

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        tracing::info!(%addr, base_path = %self.config.server.base_path, "message bus listening");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(self.shutdown.wait())
            .await?;

        pubsub_loop.shutdown().await?;
        self.engine.shutdown().await?;
        self.shutdown.shutdown().await;
        Ok(())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
