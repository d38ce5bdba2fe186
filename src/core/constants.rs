//! Named env-var keys and defaults (`spec.md` §6 "Environment").

pub const ENV_HOST: &str = "MESSAGE_BUS_HOST";
pub const ENV_PORT: &str = "MESSAGE_BUS_PORT";
pub const ENV_REDIS_URL: &str = "MESSAGE_BUS_REDIS_URL";
pub const ENV_BASE_PATH: &str = "MESSAGE_BUS_BASE_PATH";
pub const ENV_MAX_BACKLOG_SIZE: &str = "MESSAGE_BUS_MAX_BACKLOG_SIZE";
pub const ENV_MAX_GLOBAL_BACKLOG_SIZE: &str = "MESSAGE_BUS_MAX_GLOBAL_BACKLOG_SIZE";
pub const ENV_MAX_BACKLOG_AGE_SECS: &str = "MESSAGE_BUS_MAX_BACKLOG_AGE_SECS";
pub const ENV_CLEAR_EVERY: &str = "MESSAGE_BUS_CLEAR_EVERY";
pub const ENV_LONG_POLL_TIMEOUT_SECS: &str = "MESSAGE_BUS_LONG_POLL_TIMEOUT_SECS";
pub const ENV_KEEPALIVE_SECS: &str = "MESSAGE_BUS_KEEPALIVE_SECS";
/// Named verbatim in `spec.md` §6. Gates per-command debug tracing on the
/// Redis backend (see `backend::redis::RedisBackend::enable_client_logs`).
pub const ENV_ENABLE_LOGS: &str = "MESSAGE_BUS_ENABLE_LOGS";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BASE_PATH: &str = "/message-bus";
