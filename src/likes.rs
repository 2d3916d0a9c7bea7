//! Best-effort like counts for freshly deleted posts.
//!
//! The fetch sits on the delete hot path, so the whole request gets a hard
//! 240 ms budget and never retries.  Any failure (timeout, transport error,
//! bad status, unreadable or unparseable body) surfaces as "no count" and a
//! bumped failure counter; the caller is never failed.

use std::time::Duration;

use serde::Deserialize;

use crate::COLLECTION;
use crate::metrics::POST_LIKE_REQUEST_FAILS;
use crate::store::PersistedPost;

const LIKE_FETCH_TIMEOUT: Duration = Duration::from_millis(240);
const LIKE_COLLECTION: &str = "app.bsky.feed.like";

pub const USER_AGENT: &str = concat!(
    "final words (deletions.bsky.bad-example.com)/v",
    env!("CARGO_PKG_VERSION"),
);

/// Body shape served by the configured aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikesFormat {
    /// The count as a bare decimal body.
    Text,
    /// JSON `{"total_likes": <n>}`.
    Json,
}

#[derive(Debug, Deserialize)]
struct TotalLikes {
    total_likes: u32,
}

/// A cached post pulled back out of the cache by a delete, still carrying
/// the identifiers needed to look up its like count.
#[derive(Debug, Clone)]
pub struct UncoveredPost {
    pub did: String,
    pub rkey: String,
    pub post: PersistedPost,
}

/// What the deletion feed carries: the cached body plus the opportunistic
/// like count, if the aggregator answered in time.
#[derive(Debug, Clone)]
pub struct LikedPost {
    pub post: PersistedPost,
    pub likes: Option<u32>,
}

pub struct LikesClient {
    http: reqwest::Client,
    base_url: String,
    format: LikesFormat,
}

impl LikesClient {
    pub fn new(base_url: String, format: LikesFormat) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(LIKE_FETCH_TIMEOUT)
            .build()?;
        Ok(LikesClient {
            http,
            base_url,
            format,
        })
    }

    /// Attach a like count to an uncovered post, best-effort.
    pub async fn get_likes(&self, uncovered: UncoveredPost) -> LikedPost {
        let likes = self.fetch(&uncovered.did, &uncovered.rkey).await;
        LikedPost {
            post: uncovered.post,
            likes,
        }
    }

    async fn fetch(&self, did: &str, rkey: &str) -> Option<u32> {
        let target_uri = format!("at://{did}/{COLLECTION}/{rkey}");

        let response = match self
            .http
            .get(&self.base_url)
            .query(&[
                ("target", target_uri.as_str()),
                ("collection", LIKE_COLLECTION),
                ("path", ".subject.uri"),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                POST_LIKE_REQUEST_FAILS
                    .with_label_values(&["request timeout"])
                    .inc();
                return None;
            }
            Err(_) => {
                POST_LIKE_REQUEST_FAILS
                    .with_label_values(&["request error"])
                    .inc();
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            POST_LIKE_REQUEST_FAILS
                .with_label_values(&[format!("http {}", status.as_u16()).as_str()])
                .inc();
            return None;
        }

        let Ok(body) = response.bytes().await else {
            POST_LIKE_REQUEST_FAILS
                .with_label_values(&["body read"])
                .inc();
            return None;
        };

        match self.format {
            LikesFormat::Text => match std::str::from_utf8(&body)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                Some(count) => Some(count),
                None => {
                    POST_LIKE_REQUEST_FAILS
                        .with_label_values(&["int parse"])
                        .inc();
                    None
                }
            },
            LikesFormat::Json => match serde_json::from_slice::<TotalLikes>(&body) {
                Ok(parsed) => Some(parsed.total_likes),
                Err(_) => {
                    POST_LIKE_REQUEST_FAILS
                        .with_label_values(&["json parse"])
                        .inc();
                    None
                }
            },
        }
    }
}
