use crate::stats::{DestinationStats, SuccessOptions};
use crate::store::Store;
use crate::types::{DestinationFailureInfo, DESTINATION_FAILURE_PREFIX};
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Per-destination failure accounting: in-process stats plus the
/// persistent failure document that survives restarts. The persistent
/// count drives the attempt throttle; any success deletes it.
#[derive(Default)]
pub struct FailureLedger {
    stats: DashMap<String, Arc<DestinationStats>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        FailureLedger::default()
    }

    pub fn stats_for(&self, url: &str) -> Arc<DestinationStats> {
        self.stats
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(DestinationStats::default()))
            .clone()
    }

    pub fn get(&self, url: &str) -> Option<Arc<DestinationStats>> {
        self.stats.get(url).map(|entry| entry.clone())
    }

    pub fn known_urls(&self) -> Vec<String> {
        self.stats.iter().map(|entry| entry.key().clone()).collect()
    }

    /// True while no failure has been counted for the URL; the first
    /// failure grants one immediate retry before it becomes visible in
    /// the accounting.
    pub fn is_first_failure(&self, url: &str) -> bool {
        self.get(url)
            .map(|stats| stats.failure_count.load(Ordering::SeqCst) == 0)
            .unwrap_or(true)
    }

    /// Attempt throttle: destinations that keep failing are tried less
    /// often, proportional to the persisted failure depth.
    pub fn is_not_failing<S: Store>(&self, store: &S, url: &str, attempt: u64) -> bool {
        let failure_count = match store.get(&Self::failure_doc_key(url)) {
            Ok(Some(doc)) => serde_json::from_value::<DestinationFailureInfo>(doc.data)
                .map(|info| info.failure_count)
                .unwrap_or(0),
            Ok(None) => return true,
            Err(error) => {
                tracing::warn!(url, %error, "failed to read failure document; assuming healthy");
                return true;
            }
        };
        should_attempt(failure_count, attempt)
    }

    pub fn record_failure<S: Store>(&self, store: &S, url: &str, last_error: Option<String>) {
        let stats = self.stats_for(url);
        let count = stats.note_failure(last_error);

        let key = Self::failure_doc_key(url);
        let persisted = match store.get(&key) {
            Ok(Some(doc)) => serde_json::from_value::<DestinationFailureInfo>(doc.data)
                .map(|info| info.failure_count)
                .unwrap_or(0),
            Ok(None) => 0,
            Err(error) => {
                tracing::warn!(url, %error, "failed to read failure document");
                0
            }
        };
        let info = DestinationFailureInfo {
            destination: url.to_string(),
            failure_count: persisted.saturating_add(1),
        };
        let data = match serde_json::to_value(&info) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(url, %error, "failed to serialize failure document");
                return;
            }
        };
        if let Err(error) = store.put(&key, None, data, json!({})) {
            tracing::warn!(url, %error, "failed to persist failure document");
        }
        tracing::debug!(url, failure_count = count, "recorded replication failure");
    }

    pub fn record_success<S: Store>(&self, store: &S, url: &str, opts: SuccessOptions) {
        self.stats_for(url).note_success(&opts);
        let key = Self::failure_doc_key(url);
        match store.delete(&key, None) {
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(url, %error, "failed to delete failure document");
            }
        }
    }

    pub fn failure_doc_key(url: &str) -> String {
        format!("{DESTINATION_FAILURE_PREFIX}{}", escape_destination_url(url))
    }
}

/// Whether attempt number `attempt` should actually replicate, given the
/// persisted failure depth.
fn should_attempt(failure_count: u64, attempt: u64) -> bool {
    match failure_count {
        0..=10 => true,
        11..=100 => attempt % 2 == 0,
        101..=1000 => attempt % 5 == 0,
        _ => attempt % 10 == 0,
    }
}

/// Destination URL as it appears in the failure document key: scheme
/// prefix stripped, path separators and colons removed, then
/// percent-encoded.
pub fn escape_destination_url(url: &str) -> String {
    let stripped = url
        .trim()
        .trim_start_matches("http://")
        .replace(['/', ':'], "");
    urlencoding::encode(&stripped).into_owned()
}
