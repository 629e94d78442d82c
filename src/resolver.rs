use crate::alerts::{Alert, AlertSink};
use crate::store::Store;
use crate::types::{DestinationStrategy, ReplicationDocument, DESTINATIONS_DOC};
use std::sync::atomic::{AtomicBool, Ordering};

/// Reads the destinations document and turns it into strategies. The
/// document is re-read every tick; strategies are ephemeral.
#[derive(Default)]
pub struct DestinationResolver {
    misconfiguration_alerted: AtomicBool,
}

impl DestinationResolver {
    pub fn new() -> Self {
        DestinationResolver::default()
    }

    pub fn resolve<S: Store>(&self, store: &S, alerts: &dyn AlertSink) -> Vec<DestinationStrategy> {
        let doc = match store.get(DESTINATIONS_DOC) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                tracing::debug!("no destinations document; nothing to replicate to");
                return Vec::new();
            }
            Err(error) => {
                tracing::warn!(%error, "failed to read destinations document");
                return Vec::new();
            }
        };

        let config: ReplicationDocument = match serde_json::from_value(doc.data) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(%error, "destinations document is malformed");
                return Vec::new();
            }
        };

        // A destinations document written for another database must not
        // drive replication here; it was copied or restored by mistake.
        // Alert once per occurrence, and re-arm once the config is fixed.
        if config.source != store.database_id() {
            if !self.misconfiguration_alerted.swap(true, Ordering::SeqCst) {
                alerts.add(Alert::new(
                    "Replication misconfiguration",
                    format!(
                        "destinations document source '{}' does not match local database id '{}'; replication is disabled until it is corrected",
                        config.source,
                        store.database_id()
                    ),
                    DESTINATIONS_DOC,
                ));
            }
            return Vec::new();
        }
        self.misconfiguration_alerted.store(false, Ordering::SeqCst);

        let mut strategies = Vec::with_capacity(config.destinations.len());
        for entry in &config.destinations {
            if entry.disabled {
                tracing::debug!(url = %entry.url, "destination disabled; skipping");
                continue;
            }
            if entry.url.trim().is_empty() {
                tracing::warn!("destination entry without url; skipping");
                continue;
            }
            strategies.push(DestinationStrategy::from_config(entry));
        }
        strategies
    }
}
