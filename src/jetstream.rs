//! Firehose websocket client.
//!
//! Connects to a jetstream endpoint subscribed to a single collection,
//! decodes commit events, and feeds them to the event router.  The
//! supervisor owns the reconnect policy: 3 s between attempts, and the
//! process aborts after 7 consecutive failures landing within 15 minutes of
//! the previous successful connect.  A clean end of stream exits gracefully.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::COLLECTION;
use crate::metrics::POSTS_SKIPPED;
use crate::scheduler::EventRouter;

const RECONNECT_SLEEP: Duration = Duration::from_secs(3);
const RECONNECT_WINDOW: Duration = Duration::from_secs(15 * 60);
const MAX_CONSECUTIVE_FAILURES: u32 = 7;

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub operation: CommitOperation,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

/// One firehose event.  Only commit events carry a `commit`; identity and
/// account events arrive with the field absent and are ignored downstream.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<Commit>,
}

/// The post record inside a create/update commit, reduced to the fields the
/// cache keeps.  Everything is defaulted: real-world records omit fields
/// freely and a partial parse beats dropping the event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPost {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub langs: Vec<String>,
    #[serde(default)]
    pub facets: Vec<crate::redact::Facet>,
    #[serde(default)]
    pub reply: Option<serde_json::Value>,
    #[serde(default)]
    pub embed: Option<Embed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Embed {
    #[serde(rename = "$type", default)]
    pub kind: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

impl FeedPost {
    /// A quote is an embedded record; a reply dominates when both are set.
    pub fn is_quote(&self) -> bool {
        self.embed
            .as_ref()
            .is_some_and(|e| e.kind == "app.bsky.embed.record" && e.record.is_some())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JetstreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("event router closed")]
    RouterClosed,
}

fn subscribe_url(base: &str, cursor: i64) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut url = format!("{base}{sep}wanted_collections={COLLECTION}");
    if cursor > 0 {
        url.push_str(&format!("&cursor={cursor}"));
    }
    url
}

/// Run one connected session: read events until the stream ends, the socket
/// errors, or we are cancelled.  `cursor` tracks the newest event time seen
/// so a reconnect resumes where this session stopped.
async fn run_session(
    url: &str,
    cursor: &mut i64,
    router: &EventRouter,
    cancel: &CancellationToken,
) -> Result<(), JetstreamError> {
    let request = subscribe_url(url, *cursor);
    let (mut ws, _response) = connect_async(&request)
        .await
        .map_err(|e| JetstreamError::Connect(e.to_string()))?;
    info!(url = %request, "firehose connected");

    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                None => return Ok(()),
                Some(Err(e)) => return Err(JetstreamError::Ws(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    let event: Event = match serde_json::from_str(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!(error = %e, "skipping undecodable event");
                            POSTS_SKIPPED.with_label_values(&["bad_event"]).inc();
                            continue;
                        }
                    };
                    *cursor = (*cursor).max(event.time_us);
                    router.dispatch(event).await.map_err(|_| JetstreamError::RouterClosed)?;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(_)) => {}
            },
            () = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
        }
    }
}

/// Supervise the read loop across reconnects until cancellation or a clean
/// end of stream.  Exhausting the failure budget aborts the process: at that
/// point the cache is only going stale.
pub async fn run_supervised(
    url: String,
    mut cursor: i64,
    router: EventRouter,
    cancel: CancellationToken,
) {
    let mut last_attempt: Option<Instant> = None;
    let mut failures: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let attempt_at = Instant::now();
        let result = run_session(&url, &mut cursor, &router, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => {
                info!("firehose stream ended cleanly");
                return;
            }
            Err(e) => {
                // Only failures within 15 min of the previous connect count
                // toward the abort budget; a long-lived session resets it.
                let within_window =
                    last_attempt.is_none_or(|at| at.elapsed() < RECONNECT_WINDOW);
                failures = if within_window { failures + 1 } else { 1 };
                last_attempt = Some(attempt_at);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(error = %e, failures, "firehose reconnect budget exhausted");
                    std::process::exit(1);
                }
                warn!(error = %e, failures, "firehose disconnected, reconnecting");
            }
        }
        tokio::select! {
            () = tokio::time::sleep(RECONNECT_SLEEP) => {}
            () = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_url_appends_collection_and_cursor() {
        assert_eq!(
            subscribe_url("wss://example.com/subscribe", 0),
            "wss://example.com/subscribe?wanted_collections=app.bsky.feed.post",
        );
        assert_eq!(
            subscribe_url("wss://example.com/subscribe", 42),
            "wss://example.com/subscribe?wanted_collections=app.bsky.feed.post&cursor=42",
        );
        assert_eq!(
            subscribe_url("wss://example.com/subscribe?compress=false", 42),
            "wss://example.com/subscribe?compress=false&wanted_collections=app.bsky.feed.post&cursor=42",
        );
    }

    #[test]
    fn event_decodes_commit() {
        let raw = r#"{
            "did": "did:plc:abc",
            "time_us": 1730000000000000,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": "3jzfcijpj2z2a",
                "record": {"text": "hi", "langs": ["en-CA"]}
            }
        }"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.did, "did:plc:abc");
        let commit = event.commit.unwrap();
        assert_eq!(commit.operation, CommitOperation::Create);
        let post: FeedPost = serde_json::from_value(commit.record.unwrap()).unwrap();
        assert_eq!(post.text, "hi");
        assert_eq!(post.langs, vec!["en-CA".to_owned()]);
        assert!(!post.is_quote());
    }

    #[test]
    fn event_without_commit_decodes() {
        let raw = r#"{"did":"did:plc:abc","time_us":1,"kind":"identity"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert!(event.commit.is_none());
    }

    #[test]
    fn record_embed_marks_quotes() {
        let record = serde_json::json!({
            "text": "look at this",
            "embed": {"$type": "app.bsky.embed.record", "record": {"uri": "at://x", "cid": "y"}}
        });
        let post: FeedPost = serde_json::from_value(record).unwrap();
        assert!(post.is_quote());

        let record = serde_json::json!({
            "text": "just pictures",
            "embed": {"$type": "app.bsky.embed.images", "images": []}
        });
        let post: FeedPost = serde_json::from_value(record).unwrap();
        assert!(!post.is_quote());
    }
}
