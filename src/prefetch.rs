use crate::etag::Etag;
use crate::store::Store;
use crate::types::StoredDocument;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MIN_BATCH: usize = 128;
pub const MAX_BATCH: usize = 4096;
pub const DEFAULT_BATCH: usize = 512;

/// Batch supplier for one destination. Long-lived per URL; the controller
/// disposes it when the URL disappears or keeps failing.
pub trait Prefetcher: Send + Sync {
    /// Next batch of documents with etag strictly greater than `after`,
    /// ascending.
    fn documents_batch_from(&self, after: Etag) -> Vec<StoredDocument>;

    /// Prefetcher-level filter, applied after the destination filter.
    fn filter_document(&self, doc: &StoredDocument) -> bool;

    /// Feed the auto-tuner with the outcome of one batch.
    fn update_auto_throttler(&self, loaded: &[StoredDocument], elapsed: Duration);

    /// A send blew up; halve the next batch target.
    fn out_of_memory_happened(&self);

    /// Everything up to `upto` has been replicated; cached state below it
    /// can go.
    fn cleanup_documents(&self, upto: Etag);

    fn dispose(&self);
}

/// Store-backed prefetcher with an adaptive batch target: fast full
/// batches grow it, slow batches and memory pressure shrink it, always
/// within [MIN_BATCH, MAX_BATCH].
pub struct StorePrefetcher<S> {
    store: Arc<S>,
    batch_target: AtomicUsize,
    cleaned_upto: Mutex<Etag>,
    disposed: AtomicBool,
}

const FAST_BATCH: Duration = Duration::from_secs(2);
const SLOW_BATCH: Duration = Duration::from_secs(10);

impl<S: Store> StorePrefetcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        StorePrefetcher {
            store,
            batch_target: AtomicUsize::new(DEFAULT_BATCH),
            cleaned_upto: Mutex::new(Etag::ZERO),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn batch_target(&self) -> usize {
        self.batch_target.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn cleaned_upto(&self) -> Etag {
        match self.cleaned_upto.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl<S: Store> Prefetcher for StorePrefetcher<S> {
    fn documents_batch_from(&self, after: Etag) -> Vec<StoredDocument> {
        if self.is_disposed() {
            return Vec::new();
        }
        let take = self.batch_target();
        match self.store.documents_after(after, take) {
            Ok(docs) => docs,
            Err(error) => {
                tracing::warn!(%error, "prefetch read failed; returning empty batch");
                Vec::new()
            }
        }
    }

    fn filter_document(&self, _doc: &StoredDocument) -> bool {
        true
    }

    fn update_auto_throttler(&self, loaded: &[StoredDocument], elapsed: Duration) {
        let target = self.batch_target();
        if loaded.len() >= target && elapsed <= FAST_BATCH {
            let grown = (target.saturating_add(target / 2)).min(MAX_BATCH);
            self.batch_target.store(grown, Ordering::SeqCst);
        } else if elapsed >= SLOW_BATCH {
            let shrunk = (target / 2).max(MIN_BATCH);
            self.batch_target.store(shrunk, Ordering::SeqCst);
        }
    }

    fn out_of_memory_happened(&self) {
        let target = self.batch_target();
        let shrunk = (target / 2).max(MIN_BATCH);
        self.batch_target.store(shrunk, Ordering::SeqCst);
        tracing::warn!(
            previous = target,
            next = shrunk,
            "memory pressure reported; shrinking batch target"
        );
    }

    fn cleanup_documents(&self, upto: Etag) {
        let mut guard = match self.cleaned_upto.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if upto > *guard {
            *guard = upto;
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
