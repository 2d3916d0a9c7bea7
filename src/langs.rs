//! Language normalization, the rolling top-language counter, and the
//! per-observer language filter.
//!
//! The counter learns which tags are common enough to offer as filter
//! choices: every accepted post's tags bump a count, and on a fixed tick the
//! tags above one-thousandth of the running maximum are published, sorted by
//! count.  The statistic is smoothed over many seconds, so dropped batches
//! on the shallow feed channel are tolerable.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the known-languages list is re-published.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(4);

/// Lowercase each tag, drop everything after the first `-` (the region
/// suffix), and dedup preserving first occurrence.
pub fn normalize_langs(langs: &[String]) -> Vec<String> {
    let mut normalized = Vec::new();
    let mut seen = HashSet::new();
    for lang in langs {
        let base = lang.split('-').next().unwrap_or(lang);
        let key = base.to_lowercase();
        if seen.insert(key.clone()) {
            normalized.push(key);
        }
    }
    normalized
}

/// Tags with more than one-thousandth of the top count, most-seen first.
/// Ties are broken by tag so the list is stable within a tick.
fn top_langs(top_count: u64, seen: &HashMap<String, u64>) -> Vec<String> {
    let mut langs: Vec<String> = seen
        .iter()
        .filter(|&(_, &count)| count > top_count / 1000)
        .map(|(lang, _)| lang.clone())
        .collect();
    langs.sort_by(|a, b| seen[b].cmp(&seen[a]).then_with(|| a.cmp(b)));
    langs
}

/// Should an observer with this selection hear a post with these tags?
///
/// No selection means everything (or, with `wants_unknown`, only untagged
/// posts).  With a selection, untagged posts need `wants_unknown` and tagged
/// posts need any tag overlap.
pub fn listening_for(
    listener_langs: &HashSet<String>,
    wants_unknown: bool,
    post_langs: &[String],
) -> bool {
    if listener_langs.is_empty() {
        if wants_unknown {
            return post_langs.is_empty();
        }
        return true;
    }
    if post_langs.is_empty() {
        return wants_unknown;
    }
    post_langs.iter().any(|lang| listener_langs.contains(lang))
}

/// Spawn the counter task: consumes per-post tag batches, periodically
/// publishing the current top-language list on the returned channel.
pub fn count_langs(
    mut post_langs: mpsc::Receiver<Vec<String>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Vec<String>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut top_count: u64 = 0;
        let mut seen: HashMap<String, u64> = HashMap::new();
        let mut publish = tokio::time::interval(PUBLISH_INTERVAL);
        publish.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                batch = post_langs.recv() => {
                    let Some(batch) = batch else { break };
                    for lang in batch {
                        let count = seen.entry(lang).or_insert(0);
                        *count += 1;
                        top_count = top_count.max(*count);
                    }
                }
                _ = publish.tick() => {
                    // The consumer holds only the latest list; skipping a
                    // tick while the previous one is unread is fine.
                    match tx.try_send(top_langs(top_count, &seen)) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("language counter stopped");
    });

    rx
}
