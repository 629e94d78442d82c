//! Test doubles shared across module tests.

use crate::alerts::{Alert, AlertSink};
use crate::etag::Etag;
use crate::peer::{PeerApi, PeerError};
use crate::types::{DestinationStrategy, OutgoingAttachment, SourceReplicationInformation};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum PeerCall {
    LastEtag {
        url: String,
        current: Etag,
    },
    PutLastEtag {
        url: String,
        doc: Option<Etag>,
        attachment: Option<Etag>,
    },
    SendDocuments {
        url: String,
        count: usize,
        documents: Vec<Value>,
    },
    SendAttachments {
        url: String,
        keys: Vec<String>,
    },
    Heartbeat {
        url: String,
    },
}

/// Scripted peer: records every call and plays back queued errors, one
/// per call, falling through to success when a queue is empty.
#[derive(Default)]
pub struct ScriptedPeer {
    calls: Mutex<Vec<PeerCall>>,
    info: Mutex<SourceReplicationInformation>,
    last_etag_errors: Mutex<VecDeque<PeerError>>,
    put_last_etag_errors: Mutex<VecDeque<PeerError>>,
    send_documents_errors: Mutex<VecDeque<PeerError>>,
    send_attachments_errors: Mutex<VecDeque<PeerError>>,
    heartbeat_errors: Mutex<VecDeque<PeerError>>,
}

impl ScriptedPeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_info(&self, info: SourceReplicationInformation) {
        *self.info.lock().unwrap() = info;
    }

    pub fn fail_last_etag(&self, error: PeerError) {
        self.last_etag_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_put_last_etag(&self, error: PeerError) {
        self.put_last_etag_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_send_documents(&self, error: PeerError) {
        self.send_documents_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_send_attachments(&self, error: PeerError) {
        self.send_attachments_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_heartbeat(&self, error: PeerError) {
        self.heartbeat_errors.lock().unwrap().push_back(error);
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_error(queue: &Mutex<VecDeque<PeerError>>) -> Option<PeerError> {
        queue.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl PeerApi for ScriptedPeer {
    async fn last_etag(
        &self,
        dest: &DestinationStrategy,
        current: Etag,
    ) -> Result<SourceReplicationInformation, PeerError> {
        self.record(PeerCall::LastEtag {
            url: dest.url.clone(),
            current,
        });
        match Self::next_error(&self.last_etag_errors) {
            Some(error) => Err(error),
            None => Ok(self.info.lock().unwrap().clone()),
        }
    }

    async fn put_last_etag(
        &self,
        dest: &DestinationStrategy,
        doc_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> Result<(), PeerError> {
        self.record(PeerCall::PutLastEtag {
            url: dest.url.clone(),
            doc: doc_etag,
            attachment: attachment_etag,
        });
        match Self::next_error(&self.put_last_etag_errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn send_documents(
        &self,
        dest: &DestinationStrategy,
        documents: &[Value],
    ) -> Result<(), PeerError> {
        self.record(PeerCall::SendDocuments {
            url: dest.url.clone(),
            count: documents.len(),
            documents: documents.to_vec(),
        });
        match Self::next_error(&self.send_documents_errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn send_attachments(
        &self,
        dest: &DestinationStrategy,
        attachments: &[OutgoingAttachment],
    ) -> Result<(), PeerError> {
        self.record(PeerCall::SendAttachments {
            url: dest.url.clone(),
            keys: attachments.iter().map(|a| a.key.clone()).collect(),
        });
        match Self::next_error(&self.send_attachments_errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn heartbeat(&self, url: &str) -> Result<(), PeerError> {
        self.record(PeerCall::Heartbeat {
            url: url.to_string(),
        });
        match Self::next_error(&self.heartbeat_errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Alert sink that remembers what it was given.
#[derive(Default)]
pub struct CapturingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl CapturingAlerts {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for CapturingAlerts {
    fn add(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}
