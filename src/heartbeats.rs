use crate::ledger::FailureLedger;
use crate::stats::SuccessOptions;
use crate::store::Store;
use crate::types::now_unix;
use crate::work::WorkContext;
use dashmap::DashMap;

/// Inbound heartbeat bookkeeping: when a peer says hello, it is alive,
/// whatever our failure accounting thought.
#[derive(Default)]
pub struct HeartbeatTable {
    heartbeats: DashMap<String, u64>,
}

impl HeartbeatTable {
    pub fn new() -> Self {
        HeartbeatTable::default()
    }

    /// Handle a heartbeat received from `src`: clear its failure state,
    /// stamp the heartbeat time, and wake the replication loop.
    pub fn handle_heartbeat<S: Store>(
        &self,
        ledger: &FailureLedger,
        store: &S,
        work: &WorkContext,
        src: &str,
    ) {
        tracing::debug!(src, "heartbeat received");
        ledger.record_success(
            store,
            src,
            SuccessOptions {
                mark_heartbeat: true,
                ..Default::default()
            },
        );
        self.heartbeats.insert(src.to_string(), now_unix());
        work.notify_about_work();
    }

    pub fn is_heartbeat_available(&self, src: &str, since_unix: u64) -> bool {
        self.heartbeats
            .get(src)
            .map(|at| *at >= since_unix)
            .unwrap_or(false)
    }

    pub fn last_heartbeat(&self, src: &str) -> Option<u64> {
        self.heartbeats.get(src).map(|at| *at)
    }
}
