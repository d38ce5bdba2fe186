//! `clap`-derived CLI, env-var fallback per flag.

use clap::Parser;

use super::constants::{
    ENV_BASE_PATH, ENV_CLEAR_EVERY, ENV_HOST, ENV_KEEPALIVE_SECS, ENV_LONG_POLL_TIMEOUT_SECS,
    ENV_MAX_BACKLOG_AGE_SECS, ENV_MAX_BACKLOG_SIZE, ENV_MAX_GLOBAL_BACKLOG_SIZE, ENV_PORT,
    ENV_REDIS_URL,
};

#[derive(Parser, Debug)]
#[command(name = "message-bus")]
#[command(version, about = "Ordered, at-least-once pub/sub message bus", long_about = None)]
pub struct Cli {
    /// Server host address
    #[arg(long, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Redis connection URL; omit to run the in-memory backend
    #[arg(long, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,

    /// Base path the long-poll endpoint is mounted under
    #[arg(long, env = ENV_BASE_PATH)]
    pub base_path: Option<String>,

    /// Per-channel backlog size bound
    #[arg(long, env = ENV_MAX_BACKLOG_SIZE)]
    pub max_backlog_size: Option<u64>,

    /// Global backlog size bound
    #[arg(long, env = ENV_MAX_GLOBAL_BACKLOG_SIZE)]
    pub max_global_backlog_size: Option<u64>,

    /// Backlog age bound, in seconds
    #[arg(long, env = ENV_MAX_BACKLOG_AGE_SECS)]
    pub max_backlog_age_secs: Option<u64>,

    /// Trim every Nth publish
    #[arg(long, env = ENV_CLEAR_EVERY)]
    pub clear_every: Option<u64>,

    /// Long-poll deadline, in seconds
    #[arg(long, env = ENV_LONG_POLL_TIMEOUT_SECS)]
    pub long_poll_timeout_secs: Option<u64>,

    /// Streaming-mode keepalive interval, in seconds
    #[arg(long, env = ENV_KEEPALIVE_SECS)]
    pub keepalive_secs: Option<u64>,
}
