//! Deletion fan-out to websocket observers.
//!
//! A single task owns the observer set: no locks, no cross-task sharing.
//! Each observer is a bounded sender; fan-out sends never block, and an
//! observer whose buffer is full is evicted rather than allowed to stall
//! the pipeline.  A heartbeat publishes the observer count, reset whenever
//! membership changes so departures are announced promptly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::likes::LikedPost;
use crate::metrics::POST_DELETION_OBSERVERS;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7);

/// Buffered messages per observer before it is considered too slow.
pub const OBSERVER_BUFFER: usize = 2;

/// What the broadcaster pushes at each observer's writer task.
#[derive(Debug, Clone)]
pub enum ObserverUpdate {
    /// A deleted post; the writer applies its own language filter.
    Post(Arc<LikedPost>),
    /// Current observer count.
    Observers(usize),
}

pub type ObserverSender = mpsc::Sender<ObserverUpdate>;

/// The published known-languages list: written by the broadcaster, read by
/// the HTTP index handler.  Copy-on-write: an immutable list is swapped in
/// whole, never mutated.
pub type KnownLangs = Arc<RwLock<Arc<Vec<String>>>>;

pub fn known_langs() -> KnownLangs {
    Arc::new(RwLock::new(Arc::new(Vec::new())))
}

/// Run the broadcast loop until the deletion source closes or cancellation.
pub async fn run(
    mut deletions: mpsc::Receiver<LikedPost>,
    mut new_observers: mpsc::Receiver<ObserverSender>,
    mut top_langs: mpsc::Receiver<Vec<String>>,
    published_langs: KnownLangs,
    cancel: CancellationToken,
) {
    let mut observers: Vec<ObserverSender> = Vec::new();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            observer = new_observers.recv() => {
                let Some(observer) = observer else { break };
                observers.push(observer);
                debug!(observers = observers.len(), "observer joined");
                heartbeat.reset();
                emit_count(&mut observers);
            }
            deleted = deletions.recv() => {
                let Some(deleted) = deleted else {
                    info!("deletion source closed, broadcast loop ending");
                    break;
                };
                let before = observers.len();
                let update = ObserverUpdate::Post(Arc::new(deleted));
                observers.retain(|observer| observer.try_send(update.clone()).is_ok());
                if observers.len() != before {
                    debug!(evicted = before - observers.len(), "dropped slow observers");
                    heartbeat.reset();
                    emit_count(&mut observers);
                }
            }
            langs = top_langs.recv() => {
                let Some(langs) = langs else { break };
                *published_langs.write().await = Arc::new(langs);
            }
            _ = heartbeat.tick() => {
                emit_count(&mut observers);
            }
            () = cancel.cancelled() => break,
        }
    }
}

/// Push the observer count to everyone.  Observers with a full buffer just
/// miss this count; ones that are gone are removed.
fn emit_count(observers: &mut Vec<ObserverSender>) {
    let count = observers.len();
    observers.retain(|observer| {
        !matches!(
            observer.try_send(ObserverUpdate::Observers(count)),
            Err(mpsc::error::TrySendError::Closed(_)),
        )
    });
    POST_DELETION_OBSERVERS.set(observers.len() as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PersistedPost;

    fn deleted(text: &str, langs: &[&str]) -> LikedPost {
        LikedPost {
            post: PersistedPost {
                time_us: 1_000,
                text: text.to_owned(),
                langs: langs.iter().map(|&l| l.to_owned()).collect(),
                target: None,
            },
            likes: None,
        }
    }

    struct Harness {
        deletions: mpsc::Sender<LikedPost>,
        observers: mpsc::Sender<ObserverSender>,
        top_langs: mpsc::Sender<Vec<String>>,
        published: KnownLangs,
        cancel: CancellationToken,
    }

    fn spawn_broadcaster() -> Harness {
        let (deletions_tx, deletions_rx) = mpsc::channel(16);
        let (observers_tx, observers_rx) = mpsc::channel(16);
        let (langs_tx, langs_rx) = mpsc::channel(16);
        let published = known_langs();
        let cancel = CancellationToken::new();
        tokio::spawn(run(
            deletions_rx,
            observers_rx,
            langs_rx,
            Arc::clone(&published),
            cancel.clone(),
        ));
        Harness {
            deletions: deletions_tx,
            observers: observers_tx,
            top_langs: langs_tx,
            published,
            cancel,
        }
    }

    #[tokio::test]
    async fn new_observer_receives_count_immediately() {
        let harness = spawn_broadcaster();
        let (tx, mut rx) = mpsc::channel(OBSERVER_BUFFER);
        harness.observers.send(tx).await.unwrap();

        match rx.recv().await.unwrap() {
            ObserverUpdate::Observers(n) => assert_eq!(n, 1),
            other => panic!("expected observer count, got {other:?}"),
        }
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn posts_fan_out_to_every_observer() {
        let harness = spawn_broadcaster();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        // Wait for each join count so the post is sent after registration.
        harness.observers.send(tx_a).await.unwrap();
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ObserverUpdate::Observers(_),
        ));
        harness.observers.send(tx_b).await.unwrap();
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ObserverUpdate::Observers(_),
        ));

        harness.deletions.send(deleted("bye", &["en"])).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            loop {
                match rx.recv().await.unwrap() {
                    ObserverUpdate::Post(post) => {
                        assert_eq!(post.post.text, "bye");
                        break;
                    }
                    ObserverUpdate::Observers(_) => {}
                }
            }
        }
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn slow_observer_is_evicted_after_buffer_fills() {
        let harness = spawn_broadcaster();
        // An observer that never drains its 2-slot buffer.
        let (slow_tx, mut slow_rx) = mpsc::channel(OBSERVER_BUFFER);
        harness.observers.send(slow_tx).await.unwrap();
        // Wait for the join count so the burst starts after registration.
        match slow_rx.recv().await.unwrap() {
            ObserverUpdate::Observers(1) => {}
            other => panic!("expected join count, got {other:?}"),
        }

        for i in 0..10 {
            harness
                .deletions
                .send(deleted(&format!("post {i}"), &[]))
                .await
                .unwrap();
        }

        // Eviction drops the broadcaster's sender, closing the channel: the
        // slow observer drains what fit in its buffer, then sees the end.
        let mut received: usize = 0;
        while let Some(update) = slow_rx.recv().await {
            if matches!(update, ObserverUpdate::Post(_)) {
                received += 1;
            }
        }
        assert_eq!(received, OBSERVER_BUFFER);

        // A fresh observer proves the loop is still live and alone.
        let (live_tx, mut live_rx) = mpsc::channel(64);
        harness.observers.send(live_tx).await.unwrap();
        match live_rx.recv().await.unwrap() {
            ObserverUpdate::Observers(n) => assert_eq!(n, 1, "slow observer should be gone"),
            other => panic!("expected observer count, got {other:?}"),
        }
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn top_langs_update_published_list() {
        let harness = spawn_broadcaster();
        harness
            .top_langs
            .send(vec!["en".to_owned(), "pt".to_owned()])
            .await
            .unwrap();

        // The published list is swapped by the broadcast loop; poll briefly.
        for _ in 0..50 {
            if !harness.published.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let published = harness.published.read().await;
        assert_eq!(**published, vec!["en".to_owned(), "pt".to_owned()]);
        harness.cancel.cancel();
    }
}
