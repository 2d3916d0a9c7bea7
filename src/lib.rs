//! final-words: watches the firehose for post deletions and shows the
//! deleted post to live websocket observers.
//!
//! # Pipeline
//! firehose -> consumer (redact, cache, detect deletes) -> broadcaster ->
//! websocket observers.  A side channel feeds the rolling language counter,
//! which publishes the "known languages" list offered on the index page.

pub mod broadcaster;
pub mod config;
pub mod consumer;
pub mod jetstream;
pub mod langs;
pub mod likes;
pub mod metrics;
pub mod redact;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tid;

/// The single record collection this service consumes.
pub const COLLECTION: &str = "app.bsky.feed.post";

pub use config::Config;
