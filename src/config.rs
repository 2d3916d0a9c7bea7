//! Service configuration.
//!
//! The environment is the sole config source; every variable has a default
//! suitable for local development.
//!
//! # Variables
//! - `ENV` -- `development` rewinds the firehose cursor 5 minutes on cold start
//! - `PORT` -- HTTP listen port
//! - `HOST` -- when set, requests with a different `Host` get a 301 to `https://{HOST}`
//! - `JETSTREAM_SUBSCRIBE` -- firehose websocket URL
//! - `DB_PATH` -- post cache file
//! - `LIKES_COUNT_URL` / `LIKES_COUNT_FORMAT` -- like aggregator endpoint and body shape
//! - `WORKERS` -- event worker count; `1` processes events strictly in arrival order

use std::env;
use std::path::PathBuf;

use crate::likes::LikesFormat;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream1.us-east.bsky.network/subscribe";
pub const DEFAULT_DB_PATH: &str = "./posts-cache.redb";
pub const DEFAULT_LIKES_URL: &str = "https://links.bsky.bad-example.com/links/count";
pub const DEFAULT_WORKERS: usize = 21;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid PORT {0:?}")]
    InvalidPort(String),
    #[error("invalid WORKERS {0:?} (must be a positive integer)")]
    InvalidWorkers(String),
    #[error("invalid LIKES_COUNT_FORMAT {0:?} (expected \"text\" or \"json\")")]
    InvalidLikesFormat(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `development` or anything else (treated as production).
    pub env: String,
    pub port: u16,
    /// Canonical public host; empty `HOST` disables the redirect.
    pub host: Option<String>,
    pub jetstream_url: String,
    pub db_path: PathBuf,
    pub likes_url: String,
    pub likes_format: LikesFormat,
    /// Event workers; events are sharded by author so per-key order holds.
    pub workers: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_name = env::var("ENV").unwrap_or_else(|_| "development".to_owned());

        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let host = env::var("HOST").ok().filter(|h| !h.is_empty());

        let jetstream_url = env::var("JETSTREAM_SUBSCRIBE")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_JETSTREAM_URL.to_owned());

        let db_path = env::var("DB_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from);

        let likes_url = env::var("LIKES_COUNT_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_LIKES_URL.to_owned());

        let likes_format = match env::var("LIKES_COUNT_FORMAT") {
            Ok(raw) => match raw.as_str() {
                "text" => LikesFormat::Text,
                "json" => LikesFormat::Json,
                _ => return Err(ConfigError::InvalidLikesFormat(raw)),
            },
            Err(_) => LikesFormat::Text,
        };

        let workers = match env::var("WORKERS") {
            Ok(raw) => match raw.parse() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidWorkers(raw)),
            },
            Err(_) => DEFAULT_WORKERS,
        };

        Ok(Config {
            env: env_name,
            port,
            host,
            jetstream_url,
            db_path,
            likes_url,
            likes_format,
            workers,
        })
    }

    pub fn is_development(&self) -> bool {
        self.env == "development"
    }
}
