use crate::etag::Etag;
use crate::types::now_unix;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// How many finished top-level scope records are retained per destination,
/// most recent first.
pub const MAX_KEPT_RECORDS: usize = 50;

/// One finished timing scope. Children may be plain JSON values, error
/// entries, or nested scopes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScopeRecord {
    pub name: String,
    pub execution_time_ms: u64,
    pub records: Vec<RecordEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RecordEntry {
    Error {
        #[serde(rename = "Type")]
        kind: String,
        #[serde(rename = "Message")]
        message: String,
    },
    Scope(ScopeRecord),
    Value(Value),
}

/// An open timing scope. Finish it explicitly to stamp the execution time;
/// attach finished children to build the nesting.
#[derive(Debug)]
pub struct StatsScope {
    name: String,
    started: Instant,
    records: Vec<RecordEntry>,
}

impl StatsScope {
    pub fn start(name: impl Into<String>) -> Self {
        StatsScope {
            name: name.into(),
            started: Instant::now(),
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, value: Value) {
        self.records.push(RecordEntry::Value(value));
    }

    pub fn record_error(&mut self, kind: &str, message: impl Into<String>) {
        self.records.push(RecordEntry::Error {
            kind: kind.to_string(),
            message: message.into(),
        });
    }

    pub fn attach(&mut self, child: ScopeRecord) {
        self.records.push(RecordEntry::Scope(child));
    }

    pub fn finish(self) -> ScopeRecord {
        ScopeRecord {
            name: self.name,
            execution_time_ms: self.started.elapsed().as_millis() as u64,
            records: self.records,
        }
    }
}

/// Mutable per-destination bookkeeping. `failure_count` is read and
/// updated atomically on hot paths; everything else sits behind a mutex
/// and is read as a snapshot.
#[derive(Debug, Default)]
pub struct DestinationStats {
    pub failure_count: AtomicU64,
    inner: Mutex<StatsInner>,
}

#[derive(Debug, Default, Clone)]
struct StatsInner {
    last_failure_at: Option<u64>,
    first_failure_in_cycle_at: Option<u64>,
    last_success_at: Option<u64>,
    last_replicated_etag: Option<Etag>,
    last_replicated_attachment_etag: Option<Etag>,
    last_etag_checked: Option<Etag>,
    last_replicated_last_modified: Option<u64>,
    last_heartbeat_received: Option<u64>,
    last_error: Option<String>,
    last_stats: VecDeque<ScopeRecord>,
}

/// Read-only copy of a destination's stats.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatsSnapshot {
    pub failure_count: u64,
    pub last_failure_at: Option<u64>,
    pub first_failure_in_cycle_at: Option<u64>,
    pub last_success_at: Option<u64>,
    pub last_replicated_etag: Option<Etag>,
    pub last_replicated_attachment_etag: Option<Etag>,
    pub last_etag_checked: Option<Etag>,
    pub last_replicated_last_modified: Option<u64>,
    pub last_heartbeat_received: Option<u64>,
    pub last_error: Option<String>,
    pub last_stats: Vec<ScopeRecord>,
}

/// Success-side updates; which cursor advances is chosen by
/// `for_documents`.
#[derive(Debug, Default, Clone)]
pub struct SuccessOptions {
    pub last_replicated: Option<Etag>,
    pub for_documents: bool,
    pub last_modified: Option<u64>,
    pub mark_heartbeat: bool,
    pub last_error: Option<String>,
}

impl DestinationStats {
    fn with_inner<R>(&self, f: impl FnOnce(&mut StatsInner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Increment the failure counter and stamp the failure timestamps.
    /// `first_failure_in_cycle_at` is only set on the healthy-to-failing
    /// transition and holds until the next success.
    pub fn note_failure(&self, last_error: Option<String>) -> u64 {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let now = now_unix();
        self.with_inner(|inner| {
            inner.last_failure_at = Some(now);
            if inner.first_failure_in_cycle_at.is_none() {
                inner.first_failure_in_cycle_at = Some(now);
            }
            if let Some(error) = last_error {
                if !error.is_empty() {
                    inner.last_error = Some(error);
                }
            }
        });
        count
    }

    /// Zero the failure counter and advance the replicated cursors.
    /// Cursors never move backwards.
    pub fn note_success(&self, opts: &SuccessOptions) {
        self.failure_count.swap(0, Ordering::SeqCst);
        let now = now_unix();
        self.with_inner(|inner| {
            inner.first_failure_in_cycle_at = None;
            inner.last_success_at = Some(now);
            if let Some(etag) = opts.last_replicated {
                if opts.for_documents {
                    inner.last_replicated_etag =
                        Some(inner.last_replicated_etag.map_or(etag, |old| old.max(etag)));
                } else {
                    inner.last_replicated_attachment_etag = Some(
                        inner
                            .last_replicated_attachment_etag
                            .map_or(etag, |old| old.max(etag)),
                    );
                }
            }
            if let Some(modified) = opts.last_modified {
                inner.last_replicated_last_modified = Some(modified);
            }
            if opts.mark_heartbeat {
                inner.last_heartbeat_received = Some(now);
            }
            if let Some(error) = &opts.last_error {
                inner.last_error = Some(error.clone());
            }
        });
    }

    /// Record how far the local cursor moved when nothing was worth
    /// sending and no etag bump went out.
    pub fn note_etag_checked(&self, etag: Etag) {
        self.with_inner(|inner| inner.last_etag_checked = Some(etag));
    }

    pub fn push_scope_record(&self, record: ScopeRecord) {
        self.with_inner(|inner| {
            inner.last_stats.push_front(record);
            inner.last_stats.truncate(MAX_KEPT_RECORDS);
        });
    }

    /// Test hook: pin the failure window to specific timestamps.
    #[cfg(test)]
    pub fn force_failure_window(&self, first: u64, last: u64) {
        self.with_inner(|inner| {
            inner.first_failure_in_cycle_at = Some(first);
            inner.last_failure_at = Some(last);
        });
    }

    pub fn snapshot(&self) -> DestinationStatsSnapshot {
        let failure_count = self.failure_count.load(Ordering::SeqCst);
        self.with_inner(|inner| DestinationStatsSnapshot {
            failure_count,
            last_failure_at: inner.last_failure_at,
            first_failure_in_cycle_at: inner.first_failure_in_cycle_at,
            last_success_at: inner.last_success_at,
            last_replicated_etag: inner.last_replicated_etag,
            last_replicated_attachment_etag: inner.last_replicated_attachment_etag,
            last_etag_checked: inner.last_etag_checked,
            last_replicated_last_modified: inner.last_replicated_last_modified,
            last_heartbeat_received: inner.last_heartbeat_received,
            last_error: inner.last_error.clone(),
            last_stats: inner.last_stats.iter().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_then_success_resets_cycle() {
        let stats = DestinationStats::default();
        stats.note_failure(Some("boom".to_string()));
        stats.note_failure(None);
        let snap = stats.snapshot();
        assert_eq!(snap.failure_count, 2);
        assert!(snap.first_failure_in_cycle_at.is_some());
        assert!(snap.first_failure_in_cycle_at <= snap.last_failure_at);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));

        stats.note_success(&SuccessOptions {
            last_replicated: Some(Etag::from_u128(9)),
            for_documents: true,
            ..Default::default()
        });
        let snap = stats.snapshot();
        assert_eq!(snap.failure_count, 0);
        assert!(snap.first_failure_in_cycle_at.is_none());
        assert_eq!(snap.last_replicated_etag, Some(Etag::from_u128(9)));
    }

    #[test]
    fn cursors_never_regress() {
        let stats = DestinationStats::default();
        for etag in [5u128, 3, 8, 7] {
            stats.note_success(&SuccessOptions {
                last_replicated: Some(Etag::from_u128(etag)),
                for_documents: true,
                ..Default::default()
            });
        }
        assert_eq!(
            stats.snapshot().last_replicated_etag,
            Some(Etag::from_u128(8))
        );
    }

    #[test]
    fn attachment_cursor_is_separate() {
        let stats = DestinationStats::default();
        stats.note_success(&SuccessOptions {
            last_replicated: Some(Etag::from_u128(4)),
            for_documents: false,
            ..Default::default()
        });
        let snap = stats.snapshot();
        assert_eq!(snap.last_replicated_etag, None);
        assert_eq!(
            snap.last_replicated_attachment_etag,
            Some(Etag::from_u128(4))
        );
    }

    #[test]
    fn scope_records_nest_and_stamp_time() {
        let mut top = StatsScope::start("replication to http://peer");
        let mut child = StatsScope::start("documents");
        child.record(json!({ "sent": 3 }));
        child.record_error("PeerError", "503 service unavailable");
        top.attach(child.finish());
        let record = top.finish();
        assert_eq!(record.records.len(), 1);
        match &record.records[0] {
            RecordEntry::Scope(scope) => {
                assert_eq!(scope.name, "documents");
                assert_eq!(scope.records.len(), 2);
            }
            other => panic!("expected nested scope, got {other:?}"),
        }
    }

    #[test]
    fn ring_keeps_the_most_recent_fifty() {
        let stats = DestinationStats::default();
        for i in 0..60 {
            stats.push_scope_record(StatsScope::start(format!("tick {i}")).finish());
        }
        let snap = stats.snapshot();
        assert_eq!(snap.last_stats.len(), MAX_KEPT_RECORDS);
        assert_eq!(snap.last_stats[0].name, "tick 59");
        assert_eq!(snap.last_stats.last().map(|r| r.name.as_str()), Some("tick 10"));
    }
}
