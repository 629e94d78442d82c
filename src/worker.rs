use crate::batch;
use crate::ledger::FailureLedger;
use crate::peer::{PeerApi, PeerError};
use crate::prefetch::Prefetcher;
use crate::stats::{StatsScope, SuccessOptions};
use crate::store::Store;
use crate::types::{DestinationStrategy, SourceReplicationInformation};
use crate::work::WorkContext;
use serde_json::json;
use std::future::Future;
use std::time::Instant;

/// Above this many filtered-out system or origin documents, an empty
/// batch still pushes a cursor bump so the peer does not fall behind.
const ETAG_BUMP_THRESHOLD: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Replicated,
    NoOp,
    Failed,
}

impl PhaseOutcome {
    pub fn is_failed(self) -> bool {
        self == PhaseOutcome::Failed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerReport {
    pub documents: PhaseOutcome,
    pub attachments: PhaseOutcome,
}

impl WorkerReport {
    fn failed() -> Self {
        WorkerReport {
            documents: PhaseOutcome::Failed,
            attachments: PhaseOutcome::NoOp,
        }
    }

    pub fn replicated_anything(&self) -> bool {
        self.documents == PhaseOutcome::Replicated || self.attachments == PhaseOutcome::Replicated
    }
}

/// One replication pass against one destination: negotiate the cursors,
/// ship documents, ship attachments, account the outcome. Entered only
/// under the destination's single-flight token; never propagates an
/// error to the controller.
pub async fn replicate_to_destination<S, P>(
    store: &S,
    peer: &P,
    ledger: &FailureLedger,
    work: &WorkContext,
    dest: &DestinationStrategy,
    prefetcher: &dyn Prefetcher,
) -> WorkerReport
where
    S: Store,
    P: PeerApi + ?Sized,
{
    let url = dest.url.as_str();
    let mut scope = StatsScope::start(format!("replication to {url}"));

    // Phase 1: negotiate. The peer tells us which cursors it has
    // acknowledged and who it is.
    let head = match store.batch(|acc| acc.most_recent_document_etag()) {
        Ok(etag) => etag,
        Err(error) => {
            tracing::warn!(url, %error, "failed to read local head etag");
            scope.record_error("Storage", error.to_string());
            ledger.stats_for(url).push_scope_record(scope.finish());
            return WorkerReport::failed();
        }
    };
    let info = match peer.last_etag(dest, head).await {
        Ok(info) => info,
        Err(PeerError::Cancelled) => return WorkerReport::failed(),
        Err(error @ PeerError::NotEnabled { .. }) => {
            tracing::info!(url, %error, "replication not enabled on peer");
            scope.record_error("PeerRejected", error.to_string());
            ledger.record_failure(store, url, Some(error.to_string()));
            ledger.stats_for(url).push_scope_record(scope.finish());
            return WorkerReport::failed();
        }
        Err(error) => {
            tracing::warn!(url, %error, "negotiation with peer failed");
            scope.record_error("Peer", error.to_string());
            ledger.record_failure(store, url, Some(error.to_string()));
            ledger.stats_for(url).push_scope_record(scope.finish());
            return WorkerReport::failed();
        }
    };

    let dest = dest
        .clone()
        .with_current_database_id(info.server_instance_id.clone());

    // Phase 2: documents.
    let documents =
        replicate_documents(store, peer, ledger, &dest, prefetcher, &info, &mut scope).await;
    if documents.is_failed() {
        ledger.stats_for(url).push_scope_record(scope.finish());
        return WorkerReport {
            documents,
            attachments: PhaseOutcome::NoOp,
        };
    }

    // Phase 3: attachments. A document no-op may still find work here.
    let attachments = replicate_attachments(store, peer, ledger, &dest, &info, &mut scope).await;

    let report = WorkerReport {
        documents,
        attachments,
    };
    if report.replicated_anything() {
        work.update_found_work();
    }
    ledger.stats_for(url).push_scope_record(scope.finish());
    report
}

enum SendOutcome {
    Sent,
    Cancelled,
    Failed(PeerError),
}

/// A single transient failure is common and cheap to paper over: the
/// transition from healthy to failing grants exactly one immediate retry
/// before the failure becomes visible in the accounting.
async fn send_with_first_failure_retry<F, Fut>(
    mut send: F,
    ledger: &FailureLedger,
    url: &str,
) -> SendOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PeerError>>,
{
    match send().await {
        Ok(()) => SendOutcome::Sent,
        Err(PeerError::Cancelled) => SendOutcome::Cancelled,
        Err(error) if error.is_transient() && ledger.is_first_failure(url) => {
            tracing::warn!(url, %error, "first failure for destination; retrying once");
            match send().await {
                Ok(()) => SendOutcome::Sent,
                Err(PeerError::Cancelled) => SendOutcome::Cancelled,
                Err(retry_error) => SendOutcome::Failed(retry_error),
            }
        }
        Err(error) => SendOutcome::Failed(error),
    }
}

async fn replicate_documents<S, P>(
    store: &S,
    peer: &P,
    ledger: &FailureLedger,
    dest: &DestinationStrategy,
    prefetcher: &dyn Prefetcher,
    info: &SourceReplicationInformation,
    scope: &mut StatsScope,
) -> PhaseOutcome
where
    S: Store,
    P: PeerApi + ?Sized,
{
    let url = dest.url.as_str();
    let mut phase = StatsScope::start("documents");
    let started = Instant::now();

    let batch = match batch::build_documents(store, dest, prefetcher, info) {
        Ok(batch) => batch,
        Err(error) => {
            tracing::warn!(url, %error, "document batch assembly failed");
            phase.record_error("BatchBuild", error.to_string());
            scope.attach(phase.finish());
            return PhaseOutcome::NoOp;
        }
    };

    let outcome = if batch.documents.is_empty() {
        if batch.last_etag > info.last_document_etag {
            // Everything between the cursors was filtered out. Tell the
            // peer the cursor moved unless the filtered run was a small
            // number of system or origin documents, which are not worth
            // a round trip.
            if batch.system_doc_count == 0
                || batch.system_doc_count > ETAG_BUMP_THRESHOLD
                || batch.from_destination_count > ETAG_BUMP_THRESHOLD
            {
                match peer.put_last_etag(dest, Some(batch.last_etag), None).await {
                    Ok(()) => {
                        tracing::debug!(url, last_etag = %batch.last_etag, "document cursor bump");
                        phase.record(json!({ "cursorBump": batch.last_etag.to_string() }));
                        ledger.record_success(
                            store,
                            url,
                            SuccessOptions {
                                last_replicated: Some(batch.last_etag),
                                for_documents: true,
                                last_modified: batch.last_modified,
                                ..Default::default()
                            },
                        );
                    }
                    Err(PeerError::Cancelled) => {}
                    Err(error) => {
                        tracing::warn!(url, %error, "document cursor bump failed");
                        phase.record_error("Peer", error.to_string());
                        ledger.record_failure(store, url, Some(error.to_string()));
                    }
                }
            } else {
                ledger.stats_for(url).note_etag_checked(batch.last_etag);
            }
        }
        PhaseOutcome::NoOp
    } else {
        let count = batch.documents.len();
        match send_with_first_failure_retry(
            || peer.send_documents(dest, &batch.documents),
            ledger,
            url,
        )
        .await
        {
            SendOutcome::Sent => {
                tracing::info!(url, count, last_etag = %batch.last_etag, "documents replicated");
                phase.record(json!({ "documentsSent": count }));
                ledger.record_success(
                    store,
                    url,
                    SuccessOptions {
                        last_replicated: Some(batch.last_etag),
                        for_documents: true,
                        last_modified: batch.last_modified,
                        ..Default::default()
                    },
                );
                PhaseOutcome::Replicated
            }
            SendOutcome::Cancelled => PhaseOutcome::Failed,
            SendOutcome::Failed(error) => {
                tracing::warn!(url, %error, "document replication failed");
                phase.record_error("Peer", error.to_string());
                prefetcher.out_of_memory_happened();
                ledger.record_failure(store, url, Some(error.to_string()));
                PhaseOutcome::Failed
            }
        }
    };

    if !batch.loaded_docs.is_empty() {
        prefetcher.update_auto_throttler(&batch.loaded_docs, started.elapsed());
    }
    scope.attach(phase.finish());
    outcome
}

async fn replicate_attachments<S, P>(
    store: &S,
    peer: &P,
    ledger: &FailureLedger,
    dest: &DestinationStrategy,
    info: &SourceReplicationInformation,
    scope: &mut StatsScope,
) -> PhaseOutcome
where
    S: Store,
    P: PeerApi + ?Sized,
{
    let url = dest.url.as_str();
    let mut phase = StatsScope::start("attachments");

    let batch = match batch::build_attachments(store, dest, info) {
        Ok(batch) => batch,
        Err(error) => {
            tracing::warn!(url, %error, "attachment batch assembly failed");
            phase.record_error("BatchBuild", error.to_string());
            scope.attach(phase.finish());
            return PhaseOutcome::NoOp;
        }
    };

    let outcome = if batch.attachments.is_empty() {
        if batch.last_etag > info.last_attachment_etag {
            match peer.put_last_etag(dest, None, Some(batch.last_etag)).await {
                Ok(()) => {
                    tracing::debug!(url, last_etag = %batch.last_etag, "attachment cursor bump");
                    phase.record(json!({ "cursorBump": batch.last_etag.to_string() }));
                    ledger.record_success(
                        store,
                        url,
                        SuccessOptions {
                            last_replicated: Some(batch.last_etag),
                            for_documents: false,
                            ..Default::default()
                        },
                    );
                }
                Err(PeerError::Cancelled) => {}
                Err(error) => {
                    tracing::warn!(url, %error, "attachment cursor bump failed");
                    phase.record_error("Peer", error.to_string());
                    ledger.record_failure(store, url, Some(error.to_string()));
                }
            }
        }
        PhaseOutcome::NoOp
    } else {
        let count = batch.attachments.len();
        match send_with_first_failure_retry(
            || peer.send_attachments(dest, &batch.attachments),
            ledger,
            url,
        )
        .await
        {
            SendOutcome::Sent => {
                tracing::info!(url, count, last_etag = %batch.last_etag, "attachments replicated");
                phase.record(json!({ "attachmentsSent": count }));
                ledger.record_success(
                    store,
                    url,
                    SuccessOptions {
                        last_replicated: Some(batch.last_etag),
                        for_documents: false,
                        ..Default::default()
                    },
                );
                PhaseOutcome::Replicated
            }
            SendOutcome::Cancelled => PhaseOutcome::Failed,
            SendOutcome::Failed(error) => {
                tracing::warn!(url, %error, "attachment replication failed");
                phase.record_error("Peer", error.to_string());
                ledger.record_failure(store, url, Some(error.to_string()));
                PhaseOutcome::Failed
            }
        }
    };

    scope.attach(phase.finish());
    outcome
}
