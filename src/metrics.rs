//! Prometheus collectors, registered in the default registry.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, HistogramVec, IntCounterVec, IntGauge, TextEncoder, exponential_buckets,
    register_gauge, register_histogram_vec, register_int_counter_vec, register_int_gauge,
};

/// The number of seconds is always large, so rounding has minimal effect
/// while labels on graphs are nicer.
fn rounded(buckets: Vec<f64>) -> Vec<f64> {
    buckets.into_iter().map(f64::round).collect()
}

lazy_static! {
    pub static ref POST_CACHE_DEPTH: Gauge = register_gauge!(
        "post_cache_depth",
        "Seconds since the oldest cached post was created"
    )
    .unwrap();

    pub static ref POSTS: IntCounterVec = register_int_counter_vec!(
        "posts",
        "Count of new posts",
        &["lang", "target"]
    )
    .unwrap();

    pub static ref POSTS_SKIPPED: IntCounterVec = register_int_counter_vec!(
        "posts_skipped",
        "Count of new post events that are not persisted in the cache",
        &["reason"]
    )
    .unwrap();

    pub static ref POST_DELETES: IntCounterVec = register_int_counter_vec!(
        "post_deletes",
        "Count of deleted posts; lang and target only available for cache hits",
        &["lang", "target", "cache"]
    )
    .unwrap();

    pub static ref POST_DELETED_AGE: HistogramVec = register_histogram_vec!(
        "post_deleted_age",
        "Histogram of ages of deleted posts, cache misses excluded",
        &["target"],
        rounded(exponential_buckets(20.0, 1.48, 24).unwrap())
    )
    .unwrap();

    pub static ref POST_DELETION_OBSERVERS: IntGauge = register_int_gauge!(
        "post_deletion_observers",
        "Number of people observing the deleted posts"
    )
    .unwrap();

    pub static ref POST_LIKE_REQUEST_FAILS: IntCounterVec = register_int_counter_vec!(
        "post_like_request_fails",
        "Failures to fetch likes for a post from the link aggregator",
        &["reason"]
    )
    .unwrap();
}

/// Forces every collector above to register with the default registry,
/// so they appear in `render()` even before anything has updated them.
pub fn init() {
    lazy_static::initialize(&POST_CACHE_DEPTH);
    lazy_static::initialize(&POSTS);
    lazy_static::initialize(&POSTS_SKIPPED);
    lazy_static::initialize(&POST_DELETES);
    lazy_static::initialize(&POST_DELETED_AGE);
    lazy_static::initialize(&POST_DELETION_OBSERVERS);
    lazy_static::initialize(&POST_LIKE_REQUEST_FAILS);
}

/// Render every registered collector in the text exposition format.
pub fn render() -> Vec<u8> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let _ = encoder.encode(&prometheus::gather(), &mut buffer);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_age_buckets_are_rounded_exponentials() {
        let buckets = rounded(exponential_buckets(20.0, 1.48, 24).unwrap());
        assert_eq!(buckets.len(), 24);
        assert_eq!(buckets[0], 20.0);
        assert_eq!(buckets[1], 30.0);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        assert!(buckets.iter().all(|b| b.fract() == 0.0));
    }

    #[test]
    fn render_includes_registered_names() {
        POSTS.with_label_values(&["en", "none"]).inc();
        let page = String::from_utf8(render()).unwrap();
        assert!(page.contains("posts"));
    }
}
