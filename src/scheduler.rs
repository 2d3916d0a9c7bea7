//! Event dispatch: shards firehose events across a pool of workers.
//!
//! Create/update/delete for one `(did, collection)` must be processed in
//! arrival order or the take-on-delete invariant breaks, so events are
//! routed by author hash and each shard is a single worker draining its own
//! queue.  One worker gives the strictly sequential scheduler.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::COLLECTION;
use crate::consumer::PostHandler;
use crate::jetstream::Event;

/// Queue depth per worker; a full shard backpressures the read loop.
const SHARD_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
#[error("event workers have shut down")]
pub struct RouterClosed;

#[derive(Clone)]
pub struct EventRouter {
    shards: Vec<mpsc::Sender<Event>>,
}

impl EventRouter {
    /// Spawn `workers` shard tasks feeding the handler.
    pub fn spawn(handler: Arc<PostHandler>, workers: usize) -> Self {
        assert!(workers > 0, "at least one event worker is required");
        let mut shards = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Event>(SHARD_CAPACITY);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = handler.handle_event(&event).await {
                        warn!(worker, error = %e, "event handler failed");
                    }
                }
            });
            shards.push(tx);
        }
        EventRouter { shards }
    }

    /// Hand an event to its author's shard, waiting if the shard is full.
    pub async fn dispatch(&self, event: Event) -> Result<(), RouterClosed> {
        let shard = shard_index(&event.did, self.shards.len());
        self.shards[shard]
            .send(event)
            .await
            .map_err(|_| RouterClosed)
    }
}

fn shard_index(did: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    (did, COLLECTION).hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_author_maps_to_same_shard() {
        for shards in [1, 2, 21] {
            let a = shard_index("did:plc:someone", shards);
            let b = shard_index("did:plc:someone", shards);
            assert_eq!(a, b);
            assert!(a < shards);
        }
    }

    #[test]
    fn single_shard_takes_everything() {
        for did in ["did:plc:a", "did:plc:b", "did:plc:c"] {
            assert_eq!(shard_index(did, 1), 0);
        }
    }

    #[test]
    fn authors_spread_across_shards() {
        let shards = 21;
        let hits: std::collections::HashSet<usize> = (0..500)
            .map(|i| shard_index(&format!("did:plc:user{i}"), shards))
            .collect();
        assert!(hits.len() > shards / 2, "hashing should use most shards");
    }
}
