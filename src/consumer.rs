//! Firehose consumption and deletion detection, the core of the service.
//!
//! Create and update commits persist a redacted post body into the cache;
//! a delete commit takes the cached body back out and emits it, with an
//! opportunistic like count, on the deletions channel.  A periodic trim
//! drops everything older than the retention window; because keys start
//! with the rkey TID, that is a single lexicographic range delete.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::COLLECTION;
use crate::config::Config;
use crate::jetstream::{self, Commit, CommitOperation, Event, FeedPost};
use crate::langs::normalize_langs;
use crate::likes::{LikedPost, LikesClient, UncoveredPost};
use crate::metrics::{POST_CACHE_DEPTH, POST_DELETED_AGE, POST_DELETES, POSTS, POSTS_SKIPPED};
use crate::redact::redact;
use crate::scheduler::EventRouter;
use crate::store::{PersistedPost, PostStore, PostTarget, StoreError, post_key};
use crate::tid;

/// Admission: an rkey TID may drift at most this far from the event time.
const MAX_TID_DRIFT: Duration = Duration::from_secs(60 * 60);
/// Admission: ignore deep backfill; the firehose retains about a day.
const MAX_TID_AGE: Duration = Duration::from_secs(25 * 60 * 60);
/// How long a post stays in the cache waiting for its delete.
const MAX_POST_RETENTION: Duration = Duration::from_secs(48 * 60 * 60);
const TRIM_INTERVAL: Duration = Duration::from_secs(8);
/// Development-mode cursor rewind on cold start.
const DEV_CURSOR_REWIND: Duration = Duration::from_secs(5 * 60);

pub const DELETIONS_CAPACITY: usize = 120;
pub const LANGUAGES_CAPACITY: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to unmarshal post record: {0}")]
    BadRecord(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

pub struct PostHandler {
    store: Arc<PostStore>,
    deletions: mpsc::Sender<LikedPost>,
    languages: mpsc::Sender<Vec<String>>,
    likes: LikesClient,
}

impl PostHandler {
    pub fn new(
        store: Arc<PostStore>,
        deletions: mpsc::Sender<LikedPost>,
        languages: mpsc::Sender<Vec<String>>,
        likes: LikesClient,
    ) -> Self {
        PostHandler {
            store,
            deletions,
            languages,
            likes,
        }
    }

    pub async fn handle_event(&self, event: &Event) -> Result<(), HandleError> {
        let Some(commit) = &event.commit else {
            return Ok(());
        };
        if event.kind != "commit" || commit.collection != COLLECTION {
            return Ok(());
        }

        // Creates must pass the rkey sanity check; updates and deletes
        // operate on prior state and skip admission.
        if commit.operation == CommitOperation::Create && !admit(&commit.rkey, event.time_us) {
            return Ok(());
        }

        let key = post_key(&commit.rkey, &event.did);
        match commit.operation {
            CommitOperation::Create => self.persist(&key, commit, event.time_us).await,
            CommitOperation::Update => {
                let Some(prior) = self.store.take(&key)? else {
                    // Updates for posts we never cached are dropped.
                    return Ok(());
                };
                self.persist(&key, commit, prior.time_us).await
            }
            CommitOperation::Delete => self.handle_delete(&key, event, commit).await,
        }
    }

    /// Build the persistable body and write it at `key`.  `time_us` is the
    /// event time for creates and the inherited creation time for updates.
    async fn persist(&self, key: &[u8], commit: &Commit, time_us: i64) -> Result<(), HandleError> {
        let record = commit.record.clone().unwrap_or_default();
        let post: FeedPost = match serde_json::from_value(record) {
            Ok(post) => post,
            Err(e) => {
                POSTS_SKIPPED.with_label_values(&["bad_record"]).inc();
                return Err(HandleError::BadRecord(e));
            }
        };

        let text = redact(&post.text, &post.facets);
        let text = text.trim();
        if text.is_empty() {
            // Drop empty posts (and updates that become empty).
            POSTS_SKIPPED.with_label_values(&["empty_text"]).inc();
            return Ok(());
        }

        let langs = normalize_langs(&post.langs);
        // Best-effort: the popularity statistic tolerates dropped batches.
        let _ = self.languages.try_send(langs.clone());

        let target = if post.reply.is_some() {
            Some(PostTarget::Reply)
        } else if post.is_quote() {
            Some(PostTarget::Quote)
        } else {
            None
        };

        POSTS
            .with_label_values(&[
                langs.first().map_or("unknown", String::as_str),
                PostTarget::label(target),
            ])
            .inc();

        self.store.put(
            key,
            &PersistedPost {
                time_us,
                text: text.to_owned(),
                langs,
                target,
            },
        )?;
        Ok(())
    }

    async fn handle_delete(
        &self,
        key: &[u8],
        event: &Event,
        commit: &Commit,
    ) -> Result<(), HandleError> {
        let Some(post) = self.store.take(key)? else {
            POST_DELETES
                .with_label_values(&["none", "none", "miss"])
                .inc();
            return Ok(());
        };

        POST_DELETES
            .with_label_values(&[
                post.langs.first().map_or("unknown", String::as_str),
                PostTarget::label(post.target),
                "hit",
            ])
            .inc();
        let age_secs = (event.time_us - post.time_us) as f64 / 1e6;
        POST_DELETED_AGE
            .with_label_values(&[PostTarget::label(post.target)])
            .observe(age_secs);

        let uncovered = UncoveredPost {
            did: event.did.clone(),
            rkey: commit.rkey.clone(),
            post,
        };
        let liked = self.likes.get_likes(uncovered).await;

        // The cache's integrity matters more than delivery: if the
        // broadcaster is behind, the event is dropped.
        if let Err(mpsc::error::TrySendError::Full(_)) = self.deletions.try_send(liked) {
            warn!("dropping deleted post: deletions channel is full");
        }
        Ok(())
    }
}

/// Admission check for create commits: the rkey must be a TID, close to the
/// event time, and not deep backfill.
fn admit(rkey: &str, event_time_us: i64) -> bool {
    let tid_time_us = match tid::decode_time_us(rkey) {
        Ok(us) => us,
        Err(e) => {
            debug!(rkey, error = %e, "ignoring create with unparseable rkey");
            POSTS_SKIPPED.with_label_values(&["invalid_rkey"]).inc();
            return false;
        }
    };

    let drift_us = (tid_time_us - event_time_us).unsigned_abs();
    if drift_us > MAX_TID_DRIFT.as_micros() as u64 {
        POSTS_SKIPPED.with_label_values(&["clock_skew"]).inc();
        return false;
    }

    let age_us = (Utc::now().timestamp_micros() - tid_time_us).unsigned_abs();
    if age_us > MAX_TID_AGE.as_micros() as u64 {
        POSTS_SKIPPED.with_label_values(&["too_old"]).inc();
        return false;
    }

    true
}

// ---------------------------------------------------------------------------
// Retention trim
// ---------------------------------------------------------------------------

/// One trim pass: publish the cache-depth gauge, then range-delete every key
/// older than the retention window.
pub fn trim_posts(store: &PostStore) -> Result<u64, StoreError> {
    let now_us = Utc::now().timestamp_micros();
    if let Some((_, oldest)) = store.first()? {
        let depth_secs = (now_us - oldest.time_us) as f64 / 1e6;
        POST_CACHE_DEPTH.set(depth_secs);
    }

    let trim_until_us = now_us - MAX_POST_RETENTION.as_micros() as i64;
    let trim_key = tid::encode(trim_until_us, 0);
    let removed = store.delete_range(b"0", trim_key.as_bytes())?;

    if removed > 0 {
        match store.first()? {
            Some((_, oldest)) => {
                let age_secs = (now_us - oldest.time_us) / 1_000_000;
                debug!(removed, oldest_age_secs = age_secs, "trimmed expired posts");
            }
            None => debug!(removed, "trimmed expired posts, cache now empty"),
        }
    }
    Ok(removed)
}

async fn run_trim_loop(store: Arc<PostStore>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(TRIM_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = trim_posts(&store) {
                    warn!(error = %e, "failed to trim expired posts");
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Where the firehose resumes: the newest cached entry, or a short rewind in
/// development so a cold start still has posts to show.
pub fn initial_cursor(store: &PostStore, development: bool) -> Result<i64, StoreError> {
    let rewind = Utc::now().timestamp_micros() - DEV_CURSOR_REWIND.as_micros() as i64;
    let mut cursor = if development { rewind } else { 0 };
    match store.last()? {
        Some((_, newest)) => {
            info!(latest_time_us = newest.time_us, "resuming from cached posts");
            cursor = cursor.max(newest.time_us);
        }
        None => cursor = rewind,
    }
    Ok(cursor)
}

/// Open the cache and start the consumer: the firehose supervisor, the event
/// workers, and the trim loop.  Returns the deletions and languages
/// channels.
pub fn consume(
    cfg: &Config,
    cancel: CancellationToken,
) -> Result<(mpsc::Receiver<LikedPost>, mpsc::Receiver<Vec<String>>), ConsumeError> {
    let store = Arc::new(PostStore::open(&cfg.db_path)?);
    let cursor = initial_cursor(&store, cfg.is_development())?;

    let (deletions_tx, deletions_rx) = mpsc::channel(DELETIONS_CAPACITY);
    let (languages_tx, languages_rx) = mpsc::channel(LANGUAGES_CAPACITY);

    let likes = LikesClient::new(cfg.likes_url.clone(), cfg.likes_format)?;
    let handler = Arc::new(PostHandler::new(
        Arc::clone(&store),
        deletions_tx,
        languages_tx,
        likes,
    ));
    let router = EventRouter::spawn(handler, cfg.workers);

    tokio::spawn(run_trim_loop(Arc::clone(&store), cancel.clone()));
    tokio::spawn(jetstream::run_supervised(
        cfg.jetstream_url.clone(),
        cursor,
        router,
        cancel,
    ));

    Ok((deletions_rx, languages_rx))
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build like client: {0}")]
    Likes(#[from] reqwest::Error),
}
