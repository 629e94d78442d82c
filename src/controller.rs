use crate::alerts::AlertSink;
use crate::config::RelayConfig;
use crate::heartbeats::HeartbeatTable;
use crate::ledger::FailureLedger;
use crate::peer::PeerApi;
use crate::prefetch::{Prefetcher, StorePrefetcher};
use crate::resolver::DestinationResolver;
use crate::stats::DestinationStatsSnapshot;
use crate::store::Store;
use crate::types::{DestinationStrategy, SourceReplicationInformation, SOURCES_PREFIX};
use crate::work::WorkContext;
use crate::worker;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

const SOURCES_PAGE: usize = 128;
const SIBLING_CONCURRENCY: usize = 8;

/// Single-flight holder for one destination. Dropping the guard releases
/// the token whatever path the worker exits through.
struct TokenGuard {
    token: Arc<AtomicU8>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.token.store(0, Ordering::SeqCst);
    }
}

/// The top-level replication loop: resolves destinations every tick,
/// spawns at most one worker per destination, reconciles prefetchers,
/// and waits for work or a timer between ticks.
pub struct ReplicationController<S: Store, P: PeerApi> {
    store: Arc<S>,
    peer: Arc<P>,
    config: RelayConfig,
    work: Arc<WorkContext>,
    ledger: Arc<FailureLedger>,
    heartbeats: Arc<HeartbeatTable>,
    resolver: DestinationResolver,
    alerts: Arc<dyn AlertSink>,
    prefetchers: DashMap<String, Arc<StorePrefetcher<S>>>,
    active_tokens: DashMap<String, Arc<AtomicU8>>,
    attempts: AtomicU64,
    warned_no_destinations: AtomicBool,
}

impl<S: Store, P: PeerApi + 'static> ReplicationController<S, P> {
    pub fn new(
        store: Arc<S>,
        peer: Arc<P>,
        config: RelayConfig,
        work: Arc<WorkContext>,
        alerts: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        Arc::new(ReplicationController {
            store,
            peer,
            config,
            work,
            ledger: Arc::new(FailureLedger::new()),
            heartbeats: Arc::new(HeartbeatTable::new()),
            resolver: DestinationResolver::new(),
            alerts,
            prefetchers: DashMap::new(),
            active_tokens: DashMap::new(),
            attempts: AtomicU64::new(0),
            warned_no_destinations: AtomicBool::new(false),
        })
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn stats_snapshot(&self, url: &str) -> Option<DestinationStatsSnapshot> {
        self.ledger.get(url).map(|stats| stats.snapshot())
    }

    pub fn has_prefetcher(&self, url: &str) -> bool {
        self.prefetchers.contains_key(url)
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Inbound heartbeat entry point for the hosting server.
    pub fn handle_heartbeat(&self, src: &str) {
        self.heartbeats
            .handle_heartbeat(&self.ledger, &*self.store, &self.work, src);
    }

    pub fn is_heartbeat_available(&self, src: &str, since_unix: u64) -> bool {
        self.heartbeats.is_heartbeat_available(src, since_unix)
    }

    /// Blocks until shutdown. Siblings are notified once at startup;
    /// after that the loop wakes on work notifications, bounded by the
    /// work wait, with an unfiltered pass at least every full pass
    /// interval.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            local_url = %self.config.local_url,
            database_id = self.store.database_id(),
            once = self.config.once,
            "replication controller starting"
        );

        let siblings = {
            let this = self.clone();
            tokio::spawn(async move { this.notify_siblings().await })
        };

        let mut last_wake_was_work = false;
        let mut last_full_pass = Instant::now();
        while !self.work.is_cancelled() {
            let force_full = last_full_pass.elapsed() >= self.config.full_pass_interval;
            let filter_failing = last_wake_was_work && !force_full;
            if !filter_failing {
                last_full_pass = Instant::now();
            }
            self.run_tick(filter_failing).await;
            if self.config.once {
                break;
            }
            last_wake_was_work = self
                .work
                .wait_for_work(self.config.work_wait, "replication")
                .await;
        }

        let _ = siblings.await;
        for entry in self.prefetchers.iter() {
            entry.value().dispose();
        }
        self.prefetchers.clear();
        tracing::info!("replication controller stopped");
    }

    /// One replication pass. With `filter_failing` set (the wake came
    /// from local modifications) destinations throttled by the failure
    /// ledger are skipped.
    pub async fn run_tick(self: &Arc<Self>, filter_failing: bool) {
        let destinations = self.resolver.resolve(&*self.store, &*self.alerts);
        if destinations.is_empty() {
            if !self.warned_no_destinations.swap(true, Ordering::SeqCst) {
                tracing::warn!("no replication destinations configured");
            }
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let eligible: Vec<DestinationStrategy> = destinations
            .iter()
            .filter(|dest| {
                if !filter_failing || self.config.ignore_failure_throttle {
                    return true;
                }
                let allowed = self
                    .ledger
                    .is_not_failing(&*self.store, &dest.url, attempt);
                if !allowed {
                    tracing::debug!(url = %dest.url, attempt, "destination throttled by failure depth");
                }
                allowed
            })
            .cloned()
            .collect();

        self.reconcile_prefetchers(&destinations);

        let mut active: VecDeque<(String, JoinHandle<worker::WorkerReport>)> = VecDeque::new();
        for dest in eligible {
            let Some(guard) = self.try_acquire_token(&dest.url) else {
                tracing::debug!(url = %dest.url, "replication already in flight; skipping");
                continue;
            };
            let this = self.clone();
            let prefetcher = self.prefetcher_for(&dest.url);
            let url = dest.url.clone();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                worker::replicate_to_destination(
                    &*this.store,
                    &*this.peer,
                    &this.ledger,
                    &this.work,
                    &dest,
                    &*prefetcher,
                )
                .await
            });
            active.push_back((url, handle));

            // Keep the queue bounded: whatever already finished at the
            // head can go.
            while active
                .front()
                .map(|(_, handle)| handle.is_finished())
                .unwrap_or(false)
            {
                if let Some((_, handle)) = active.pop_front() {
                    let _ = handle.await;
                }
            }
        }

        // Post-worker steps for this tick: join everything, then prune
        // each prefetcher's cache up to what actually got replicated.
        let mut completed = Vec::with_capacity(active.len());
        while let Some((url, handle)) = active.pop_front() {
            match handle.await {
                Ok(report) => tracing::debug!(
                    url = %url,
                    documents = ?report.documents,
                    attachments = ?report.attachments,
                    "worker finished"
                ),
                Err(error) => tracing::warn!(url = %url, %error, "worker task failed"),
            }
            completed.push(url);
        }
        for url in completed {
            let Some(prefetcher) = self.prefetchers.get(&url).map(|entry| entry.clone()) else {
                continue;
            };
            if let Some(etag) = self
                .ledger
                .get(&url)
                .and_then(|stats| stats.snapshot().last_replicated_etag)
            {
                prefetcher.cleanup_documents(etag);
            }
        }
    }

    fn try_acquire_token(&self, url: &str) -> Option<TokenGuard> {
        let token = self
            .active_tokens
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(AtomicU8::new(0)))
            .clone();
        token
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TokenGuard { token })
    }

    fn prefetcher_for(&self, url: &str) -> Arc<StorePrefetcher<S>> {
        self.prefetchers
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(StorePrefetcher::new(self.store.clone())))
            .clone()
    }

    /// Prefetchers are long-lived per URL: dispose the ones whose URL
    /// vanished from the config, and the ones whose destination has been
    /// failing continuously past the GC threshold.
    fn reconcile_prefetchers(&self, destinations: &[DestinationStrategy]) {
        let live: HashSet<&str> = destinations.iter().map(|d| d.url.as_str()).collect();
        let threshold = self.config.failure_gc_threshold.as_secs();
        self.prefetchers.retain(|url, prefetcher| {
            if !live.contains(url.as_str()) {
                tracing::info!(url = %url, "destination gone from config; disposing prefetcher");
                prefetcher.dispose();
                return false;
            }
            if let Some(stats) = self.ledger.get(url) {
                let snap = stats.snapshot();
                if let (Some(first), Some(last)) =
                    (snap.first_failure_in_cycle_at, snap.last_failure_at)
                {
                    if last.saturating_sub(first) >= threshold {
                        tracing::info!(url = %url, "destination failing too long; disposing prefetcher");
                        prefetcher.dispose();
                        return false;
                    }
                }
            }
            true
        });
    }

    /// Startup hello: ping the configured destinations plus every peer
    /// recorded in the replication-sources documents. Failures are
    /// logged and never block startup.
    pub async fn notify_siblings(self: &Arc<Self>) {
        let mut urls: Vec<String> = self
            .resolver
            .resolve(&*self.store, &*self.alerts)
            .iter()
            .map(|dest| dest.url.clone())
            .collect();

        let mut skip = 0;
        loop {
            let page = match self
                .store
                .documents_with_prefix(SOURCES_PREFIX, skip, SOURCES_PAGE)
            {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!(%error, "failed to scan replication sources");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            for doc in page {
                let source = serde_json::from_value::<SourceReplicationInformation>(doc.data)
                    .ok()
                    .and_then(|info| info.source);
                match source {
                    Some(url) if !url.trim().is_empty() => urls.push(url),
                    _ => {
                        tracing::warn!(key = %doc.key, "source document without a url; skipping")
                    }
                }
            }
            if page_len < SOURCES_PAGE {
                break;
            }
            skip += SOURCES_PAGE;
        }

        urls.sort();
        urls.dedup();

        let this = self.clone();
        stream::iter(urls)
            .for_each_concurrent(SIBLING_CONCURRENCY, |url| {
                let this = this.clone();
                async move {
                    if this.work.is_cancelled() {
                        return;
                    }
                    if let Err(error) = this.peer.heartbeat(&url).await {
                        tracing::warn!(url = %url, %error, "sibling heartbeat failed");
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{PeerCall, ScriptedPeer};
    use crate::types::{
        now_unix, DestinationConfig, DestinationFailureInfo, ReplicationDocument, DESTINATIONS_DOC,
    };
    use serde_json::json;

    const URL: &str = "http://peer:8080";

    fn config(once: bool) -> RelayConfig {
        RelayConfig::from_cli(
            "http://self:8080".to_string(),
            1,
            300,
            180,
            5,
            once,
            false,
        )
        .unwrap()
    }

    fn controller(
        once: bool,
    ) -> (
        Arc<ReplicationController<MemoryStore, ScriptedPeer>>,
        Arc<MemoryStore>,
        Arc<ScriptedPeer>,
    ) {
        let store = Arc::new(MemoryStore::new("self"));
        let peer = Arc::new(ScriptedPeer::default());
        let work = Arc::new(WorkContext::new());
        let controller = ReplicationController::new(
            store.clone(),
            peer.clone(),
            config(once),
            work,
            Arc::new(crate::alerts::LogAlerts),
        );
        (controller, store, peer)
    }

    fn put_destinations(store: &MemoryStore, urls: &[&str]) {
        store
            .put(
                DESTINATIONS_DOC,
                None,
                serde_json::to_value(ReplicationDocument {
                    source: "self".to_string(),
                    destinations: urls
                        .iter()
                        .map(|url| DestinationConfig {
                            url: url.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                })
                .unwrap(),
                json!({}),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn tick_replicates_to_the_configured_destination() {
        let (controller, store, peer) = controller(false);
        put_destinations(&store, &[URL]);
        store.put("users/1", None, json!({}), json!({})).unwrap();

        controller.run_tick(false).await;

        let calls = peer.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, PeerCall::LastEtag { url, .. } if url == URL)));
        assert!(calls
            .iter()
            .any(|c| matches!(c, PeerCall::SendDocuments { count, .. } if *count >= 1)));
        assert!(controller.has_prefetcher(URL));
        assert_eq!(controller.attempts(), 1);
    }

    #[tokio::test]
    async fn empty_config_spawns_nothing() {
        let (controller, _store, peer) = controller(false);
        controller.run_tick(false).await;
        controller.run_tick(false).await;
        assert!(peer.calls().is_empty());
        assert_eq!(controller.attempts(), 0);
    }

    #[test]
    fn single_flight_token_admits_exactly_one_winner() {
        let (controller, _store, _peer) = controller(false);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = controller.clone();
            handles.push(std::thread::spawn(move || {
                controller.try_acquire_token(URL)
            }));
        }
        let guards: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(guards.iter().filter(|guard| guard.is_some()).count(), 1);
        assert!(controller.try_acquire_token(URL).is_none());

        // Dropping the winning guard releases the token.
        drop(guards);
        assert!(controller.try_acquire_token(URL).is_some());
    }

    #[tokio::test]
    async fn persistent_failures_throttle_modification_ticks() {
        let (controller, store, peer) = controller(false);
        put_destinations(&store, &[URL]);
        store
            .put(
                &FailureLedger::failure_doc_key(URL),
                None,
                serde_json::to_value(DestinationFailureInfo {
                    destination: URL.to_string(),
                    failure_count: 150,
                })
                .unwrap(),
                json!({}),
            )
            .unwrap();

        for _ in 0..10 {
            controller.run_tick(true).await;
        }

        // Band 101..=1000 replicates on every fifth attempt only.
        let negotiations = peer
            .calls()
            .iter()
            .filter(|c| matches!(c, PeerCall::LastEtag { .. }))
            .count();
        assert_eq!(negotiations, 2);
        assert_eq!(controller.attempts(), 10);
    }

    #[tokio::test]
    async fn timer_ticks_ignore_the_failure_throttle() {
        let (controller, store, peer) = controller(false);
        put_destinations(&store, &[URL]);
        store
            .put(
                &FailureLedger::failure_doc_key(URL),
                None,
                serde_json::to_value(DestinationFailureInfo {
                    destination: URL.to_string(),
                    failure_count: 5000,
                })
                .unwrap(),
                json!({}),
            )
            .unwrap();

        controller.run_tick(false).await;
        assert_eq!(
            peer.calls()
                .iter()
                .filter(|c| matches!(c, PeerCall::LastEtag { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn prefetcher_is_disposed_when_the_url_disappears() {
        let (controller, store, _peer) = controller(false);
        put_destinations(&store, &[URL]);
        controller.run_tick(false).await;
        assert!(controller.has_prefetcher(URL));

        put_destinations(&store, &["http://other:8080"]);
        controller.run_tick(false).await;
        assert!(!controller.has_prefetcher(URL));
        assert!(controller.has_prefetcher("http://other:8080"));
    }

    #[tokio::test]
    async fn prefetcher_is_disposed_after_sustained_failure() {
        let (controller, store, _peer) = controller(false);
        put_destinations(&store, &[URL]);
        controller.run_tick(false).await;
        assert!(controller.has_prefetcher(URL));

        // Still configured, but failing continuously past the threshold:
        // the reconcile step drops the prefetcher (a fresh one is built
        // on the next spawn).
        let now = now_unix();
        controller
            .ledger()
            .stats_for(URL)
            .force_failure_window(now.saturating_sub(400), now);
        let destinations = vec![DestinationStrategy::from_config(&DestinationConfig {
            url: URL.to_string(),
            ..Default::default()
        })];
        controller.reconcile_prefetchers(&destinations);
        assert!(!controller.has_prefetcher(URL));

        // Below the threshold the prefetcher survives.
        controller.run_tick(false).await;
        assert!(controller.has_prefetcher(URL));
        controller
            .ledger()
            .stats_for(URL)
            .force_failure_window(now.saturating_sub(10), now);
        controller.reconcile_prefetchers(&destinations);
        assert!(controller.has_prefetcher(URL));
    }

    #[tokio::test]
    async fn run_once_notifies_siblings_and_replicates() {
        let (controller, store, peer) = controller(true);
        put_destinations(&store, &[URL]);
        store.put("users/1", None, json!({}), json!({})).unwrap();
        store
            .put(
                "Raven/Replication/Sources/other",
                None,
                serde_json::to_value(SourceReplicationInformation {
                    source: Some("http://upstream:8080".to_string()),
                    ..Default::default()
                })
                .unwrap(),
                json!({}),
            )
            .unwrap();

        controller.clone().run().await;

        let calls = peer.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, PeerCall::Heartbeat { url } if url == URL)));
        assert!(calls
            .iter()
            .any(|c| matches!(c, PeerCall::Heartbeat { url } if url == "http://upstream:8080")));
        assert!(calls
            .iter()
            .any(|c| matches!(c, PeerCall::SendDocuments { .. })));
        // Prefetchers are disposed on shutdown.
        assert!(!controller.has_prefetcher(URL));
    }
}
