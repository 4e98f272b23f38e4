//! Server configuration loaded from environment variables.
//!
//! Every knob has a default so the server starts with an empty environment.
//! Unparseable values fall back to the default rather than aborting startup.

use std::str::FromStr;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_BOARDS: &str = "a";
const DEFAULT_MAX_INVALID_THREADS: usize = 10;
const DEFAULT_FEED_CAPACITY: usize = 256;
const DEFAULT_PERSIST_FLUSH_MS: u64 = 500;
const DEFAULT_ABANDON_GRACE_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Postgres archive. `None` runs memory-only.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Boards anyone may sync to and post on.
    pub boards: Vec<String>,
    /// Boards restricted to staff identities.
    pub staff_boards: Vec<String>,
    /// Reject every mutating command.
    pub read_only: bool,
    /// Invalid threads tolerated in one sync request before it fails.
    pub max_invalid_threads: usize,
    /// Per-session feed channel capacity.
    pub feed_capacity: usize,
    /// Extra characters stripped from user text.
    pub excluded_chars: String,
    /// `from=to` pairs separated by `;`.
    pub word_filters: String,
    /// `user:role:token` triples separated by `,`.
    pub staff_sessions: String,
    pub persist_flush_ms: u64,
    /// Idle time after which an unclaimed open draft is finished.
    pub abandon_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            boards: split_list(DEFAULT_BOARDS),
            staff_boards: Vec::new(),
            read_only: false,
            max_invalid_threads: DEFAULT_MAX_INVALID_THREADS,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            excluded_chars: String::new(),
            word_filters: String::new(),
            staff_sessions: String::new(),
            persist_flush_ms: DEFAULT_PERSIST_FLUSH_MS,
            abandon_grace_secs: DEFAULT_ABANDON_GRACE_SECS,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            boards: split_list(&env_string("BOARDS", DEFAULT_BOARDS)),
            staff_boards: split_list(&env_string("STAFF_BOARDS", "")),
            read_only: env_parse("READ_ONLY", false),
            max_invalid_threads: env_parse("MAX_INVALID_THREADS", DEFAULT_MAX_INVALID_THREADS),
            feed_capacity: env_parse("FEED_CAPACITY", DEFAULT_FEED_CAPACITY).max(1),
            excluded_chars: env_string("EXCLUDED_CHARS", ""),
            word_filters: env_string("WORD_FILTERS", ""),
            staff_sessions: env_string("STAFF_SESSIONS", ""),
            persist_flush_ms: env_parse("PERSIST_FLUSH_MS", DEFAULT_PERSIST_FLUSH_MS),
            abandon_grace_secs: env_parse("ABANDON_GRACE_SECS", DEFAULT_ABANDON_GRACE_SECS),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Split a comma-separated list, dropping blanks.
pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
