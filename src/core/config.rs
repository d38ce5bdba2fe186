//! Typed `AppConfig`: CLI flags + env vars (via `clap`'s `env` attribute),
//! layered defaults → env → CLI, following the teacher's `AppConfig::load`
//! precedence shape (trimmed — this crate has no config-file layer).

use std::time::Duration;

use super::cli::Cli;
use super::constants::{DEFAULT_BASE_PATH, DEFAULT_HOST, DEFAULT_PORT};
use crate::backend::TrimPolicy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

#[derive(Debug, Clone)]
pub struct LongPollConfig {
    pub timeout: Duration,
    pub keepalive: Duration,
}

/// Final merged application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis_url: Option<String>,
    pub trim_policy: TrimPolicy,
    pub long_poll: LongPollConfig,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let defaults = TrimPolicy::default();

        let config = Self {
            server: ServerConfig {
                host: cli.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: cli.port.unwrap_or(DEFAULT_PORT),
                base_path: cli.base_path.clone().unwrap_or_else(|| DEFAULT_BASE_PATH.to_string()),
            },
            redis_url: cli.redis_url.clone(),
            trim_policy: TrimPolicy {
                max_backlog_size: cli.max_backlog_size.unwrap_or(defaults.max_backlog_size),
                max_global_backlog_size: cli
                    .max_global_backlog_size
                    .unwrap_or(defaults.max_global_backlog_size),
                clear_every: cli.clear_every.unwrap_or(defaults.clear_every),
                max_backlog_age_secs: cli.max_backlog_age_secs.unwrap_or(defaults.max_backlog_age_secs),
            },
            long_poll: LongPollConfig {
                timeout: Duration::from_secs(cli.long_poll_timeout_secs.unwrap_or(25)),
                keepalive: Duration::from_secs(cli.keepalive_secs.unwrap_or(20)),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("configuration error: server host must not be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("configuration error: server port must be greater than 0");
        }
        if !self.server.base_path.starts_with('/') {
            anyhow::bail!("configuration error: base_path must start with '/'");
        }
        if self.trim_policy.clear_every == 0 {
            anyhow::bail!("configuration error: clear_every must be greater than 0");
        }
        Ok(())
    }
}
