use crate::etag::Etag;
use crate::types::{DestinationStrategy, OutgoingAttachment, SourceReplicationInformation};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Typed outcome of talking to a peer. A 400/404 means the peer exists
/// but replication is not enabled there; everything else non-2xx, plus
/// transport errors, is transient.
#[derive(thiserror::Error, Debug, Clone)]
pub enum PeerError {
    #[error("replication not enabled on peer ({status}): {message}")]
    NotEnabled { status: u16, message: String },
    #[error("peer returned {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("failed to reach peer: {0}")]
    Unreachable(String),
    #[error("cancelled")]
    Cancelled,
}

impl PeerError {
    /// Transient errors are worth the first-failure retry; a "not
    /// enabled" verdict or cancellation is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, PeerError::Remote { .. } | PeerError::Unreachable(_))
    }
}

/// The four remote replication operations plus the outbound heartbeat.
#[async_trait]
pub trait PeerApi: Send + Sync {
    async fn last_etag(
        &self,
        dest: &DestinationStrategy,
        current: Etag,
    ) -> Result<SourceReplicationInformation, PeerError>;

    /// Zero-payload cursor bump: advances the peer's knowledge of our
    /// progress without shipping data.
    async fn put_last_etag(
        &self,
        dest: &DestinationStrategy,
        doc_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> Result<(), PeerError>;

    async fn send_documents(
        &self,
        dest: &DestinationStrategy,
        documents: &[Value],
    ) -> Result<(), PeerError>;

    async fn send_attachments(
        &self,
        dest: &DestinationStrategy,
        attachments: &[OutgoingAttachment],
    ) -> Result<(), PeerError>;

    async fn heartbeat(&self, url: &str) -> Result<(), PeerError>;
}

/// reqwest-backed peer client. Every call races against the controller's
/// cancellation token, so shutdown is observed at the next HTTP boundary.
pub struct PeerClient {
    http: reqwest::Client,
    local_url: String,
    database_id: String,
    cancel: CancellationToken,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "Error")]
    error: String,
}

impl PeerClient {
    pub fn new(
        local_url: impl Into<String>,
        database_id: impl Into<String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(PeerClient {
            http,
            local_url: local_url.into(),
            database_id: database_id.into(),
            cancel,
        })
    }

    fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
        dest: &DestinationStrategy,
    ) -> reqwest::RequestBuilder {
        let req = match &dest.api_key {
            Some(key) => req.header("Api-Key", key),
            None => req,
        };
        match (&dest.username, &dest.password) {
            (Some(user), password) => req.basic_auth(user, password.as_deref()),
            _ => req,
        }
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, PeerError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            result = req.send() => match result {
                Ok(response) => check_response(response).await,
                Err(error) => Err(PeerError::Unreachable(error.to_string())),
            }
        }
    }
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, PeerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.text().await {
        Ok(body) => parse_error_body(&body)
            .unwrap_or_else(|| truncated(&body, status.canonical_reason().unwrap_or("error"))),
        Err(_) => status.canonical_reason().unwrap_or("error").to_string(),
    };
    let code = status.as_u16();
    if code == 400 || code == 404 {
        Err(PeerError::NotEnabled {
            status: code,
            message,
        })
    } else {
        Err(PeerError::Remote {
            status: code,
            message,
        })
    }
}

/// Best-effort parse of a structured `{"Error": "..."}` body.
fn parse_error_body(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error)
}

fn truncated(body: &str, fallback: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    const MAX: usize = 240;
    let mut out: String = trimmed.chars().take(MAX).collect();
    if out.len() < trimmed.len() {
        out.push_str("...");
    }
    out
}

/// The attachment wire body: a BSON array, encoded (as BSON defines
/// arrays) as a document keyed by decimal indexes. Etags and payloads
/// travel as raw bytes.
pub fn attachments_to_bson(attachments: &[OutgoingAttachment]) -> eyre::Result<Vec<u8>> {
    use bson::spec::BinarySubtype;
    use bson::{Binary, Bson, Document};

    let mut root = Document::new();
    for (index, attachment) in attachments.iter().enumerate() {
        let mut doc = Document::new();
        doc.insert(
            "@metadata",
            bson::to_bson(&attachment.metadata)
                .map_err(|e| eyre::eyre!("failed to encode attachment metadata: {e}"))?,
        );
        doc.insert("@id", attachment.key.clone());
        doc.insert(
            "@etag",
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: attachment.etag.to_bytes().to_vec(),
            }),
        );
        doc.insert(
            "data",
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: attachment.data.clone(),
            }),
        );
        root.insert(index.to_string(), doc);
    }
    let mut buf = Vec::new();
    root.to_writer(&mut buf)
        .map_err(|e| eyre::eyre!("failed to encode attachment body: {e}"))?;
    Ok(buf)
}

#[async_trait]
impl PeerApi for PeerClient {
    async fn last_etag(
        &self,
        dest: &DestinationStrategy,
        current: Etag,
    ) -> Result<SourceReplicationInformation, PeerError> {
        let req = self
            .http
            .get(format!("{}/replication/lastEtag", dest.url))
            .query(&[
                ("from", self.local_url.clone()),
                ("currentEtag", current.to_string()),
                ("dbid", self.database_id.clone()),
            ]);
        let response = self.execute(self.apply_auth(req, dest)).await?;
        response
            .json::<SourceReplicationInformation>()
            .await
            .map_err(|e| PeerError::Unreachable(format!("invalid negotiation response: {e}")))
    }

    async fn put_last_etag(
        &self,
        dest: &DestinationStrategy,
        doc_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> Result<(), PeerError> {
        let mut query: Vec<(&str, String)> = vec![
            ("from", self.local_url.clone()),
            ("dbid", self.database_id.clone()),
        ];
        if let Some(etag) = doc_etag {
            query.push(("docEtag", etag.to_string()));
        }
        if let Some(etag) = attachment_etag {
            query.push(("attachmentEtag", etag.to_string()));
        }
        let req = self
            .http
            .put(format!("{}/replication/lastEtag", dest.url))
            .query(&query);
        self.execute(self.apply_auth(req, dest)).await?;
        Ok(())
    }

    async fn send_documents(
        &self,
        dest: &DestinationStrategy,
        documents: &[Value],
    ) -> Result<(), PeerError> {
        let req = self
            .http
            .post(format!("{}/replication/replicateDocs", dest.url))
            .query(&[
                ("from", self.local_url.clone()),
                ("dbid", self.database_id.clone()),
                ("count", documents.len().to_string()),
            ])
            .json(documents);
        self.execute(self.apply_auth(req, dest)).await?;
        Ok(())
    }

    async fn send_attachments(
        &self,
        dest: &DestinationStrategy,
        attachments: &[OutgoingAttachment],
    ) -> Result<(), PeerError> {
        let body = attachments_to_bson(attachments)
            .map_err(|e| PeerError::Unreachable(e.to_string()))?;
        let req = self
            .http
            .post(format!("{}/replication/replicateAttachments", dest.url))
            .query(&[
                ("from", self.local_url.clone()),
                ("dbid", self.database_id.clone()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/bson")
            .body(body);
        self.execute(self.apply_auth(req, dest)).await?;
        Ok(())
    }

    async fn heartbeat(&self, url: &str) -> Result<(), PeerError> {
        let base = url.trim_end_matches('/');
        let req = self
            .http
            .post(format!("{base}/replication/heartbeat"))
            .query(&[
                ("from", self.local_url.as_str()),
                ("dbid", self.database_id.as_str()),
            ]);
        self.execute(req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_error_body_is_preferred() {
        assert_eq!(
            parse_error_body(r#"{"Error":"replication disabled"}"#).as_deref(),
            Some("replication disabled")
        );
        assert_eq!(parse_error_body("<html>nope</html>"), None);
    }

    #[test]
    fn long_opaque_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let message = truncated(&body, "error");
        assert!(message.len() < body.len());
        assert!(message.ends_with("..."));
        assert_eq!(truncated("   ", "Service Unavailable"), "Service Unavailable");
    }

    #[test]
    fn transient_classification_drives_retries() {
        assert!(PeerError::Remote {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(PeerError::Unreachable("refused".into()).is_transient());
        assert!(!PeerError::NotEnabled {
            status: 404,
            message: "nope".into()
        }
        .is_transient());
        assert!(!PeerError::Cancelled.is_transient());
    }

    #[test]
    fn attachment_body_encodes_as_indexed_bson_documents() {
        let attachments = vec![
            OutgoingAttachment {
                key: "files/a".to_string(),
                etag: Etag::from_u128(1),
                metadata: json!({ "Content-Type": "text/plain" }),
                data: b"hello".to_vec(),
            },
            OutgoingAttachment {
                key: "files/empty".to_string(),
                etag: Etag::from_u128(2),
                metadata: json!({}),
                data: Vec::new(),
            },
        ];
        let bytes = attachments_to_bson(&attachments).unwrap();
        let decoded = bson::Document::from_reader(&mut bytes.as_slice()).unwrap();

        let first = decoded.get_document("0").unwrap();
        assert_eq!(first.get_str("@id").unwrap(), "files/a");
        assert_eq!(
            first.get_binary_generic("@etag").unwrap(),
            &Etag::from_u128(1).to_bytes().to_vec()
        );
        assert_eq!(first.get_binary_generic("data").unwrap(), &b"hello".to_vec());

        // Zero-size attachments carry an empty byte array, not a null.
        let second = decoded.get_document("1").unwrap();
        assert!(second.get_binary_generic("data").unwrap().is_empty());
    }
}
