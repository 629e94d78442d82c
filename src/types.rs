use crate::etag::Etag;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Well-known document keys in the local store.
pub const DESTINATIONS_DOC: &str = "Raven/Replication/Destinations";
pub const DESTINATION_FAILURE_PREFIX: &str = "Raven/Replication/Destinations/";
pub const SOURCES_PREFIX: &str = "Raven/Replication/Sources/";
pub const DOC_TOMBSTONES: &str = "Raven/Replication/Docs/Tombstones";
pub const ATTACHMENT_TOMBSTONES: &str = "Raven/Replication/Attachments/Tombstones";

/// Metadata keys on the document wire format.
pub const META_ID: &str = "@id";
pub const META_ETAG: &str = "@etag";
pub const META_LAST_MODIFIED: &str = "Last-Modified";
pub const META_DELETE_MARKER: &str = "Raven-Delete-Marker";
pub const META_REPLICATION_SOURCE: &str = "Raven-Replication-Source";

/// Keys under this prefix are configuration/bookkeeping and are never
/// replicated as user data.
pub const SYSTEM_DOC_PREFIX: &str = "Raven/";

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// Whether a destination forwards documents it received from third
/// parties, or only documents written locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransitiveBehavior {
    #[default]
    LocalOnly,
    Replicate,
}

/// The persisted destinations document (`Raven/Replication/Destinations`).
///
/// `Source` names the database id the document was written for; a mismatch
/// with the local database id means the config was copied from another
/// database and must not be acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationDocument {
    pub source: String,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

/// One entry of the destinations document. Kept loose: unknown fields are
/// ignored and everything except `Url` is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct DestinationConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub transitive_behavior: TransitiveBehavior,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub client_visible_url: Option<String>,
}

/// A resolved peer endpoint plus the filter rules that govern what is sent
/// there. Rebuilt from the destinations document on every controller tick.
#[derive(Debug, Clone)]
pub struct DestinationStrategy {
    /// Effective endpoint: the configured url, plus `/databases/<db>` when
    /// a database name was configured.
    pub url: String,
    /// Id of the database instance currently behind the destination,
    /// learned during negotiation. Used to avoid sending a document back
    /// to where it came from.
    pub current_database_id: Option<String>,
    pub transitive_behavior: TransitiveBehavior,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_visible_url: Option<String>,
}

impl DestinationStrategy {
    pub fn from_config(config: &DestinationConfig) -> Self {
        let base = config.url.trim().trim_end_matches('/');
        let url = match config.database.as_deref().map(str::trim) {
            Some(db) if !db.is_empty() => format!("{base}/databases/{db}"),
            _ => base.to_string(),
        };
        DestinationStrategy {
            url,
            current_database_id: None,
            transitive_behavior: config.transitive_behavior,
            api_key: config.api_key.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            client_visible_url: config.client_visible_url.clone(),
        }
    }

    pub fn with_current_database_id(mut self, id: Option<String>) -> Self {
        self.current_database_id = id;
        self
    }

    pub fn is_system_document(key: &str) -> bool {
        key.get(..SYSTEM_DOC_PREFIX.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(SYSTEM_DOC_PREFIX))
            .unwrap_or(false)
    }

    /// True when the metadata says the item was written by the database
    /// this strategy points at.
    pub fn origins_from_destination(&self, metadata: &Value) -> bool {
        match (
            self.current_database_id.as_deref(),
            metadata.get(META_REPLICATION_SOURCE).and_then(Value::as_str),
        ) {
            (Some(id), Some(source)) => id == source,
            _ => false,
        }
    }

    /// Destination-level document filter. System documents never
    /// replicate; documents are never sent back to their origin; with
    /// `LocalOnly` transitivity, third-party documents stay home.
    pub fn filter_document(&self, local_database_id: &str, key: &str, metadata: &Value) -> bool {
        if Self::is_system_document(key) {
            return false;
        }
        if self.origins_from_destination(metadata) {
            return false;
        }
        match self.transitive_behavior {
            TransitiveBehavior::Replicate => true,
            TransitiveBehavior::LocalOnly => {
                match metadata.get(META_REPLICATION_SOURCE).and_then(Value::as_str) {
                    None => true,
                    Some(source) => source == local_database_id,
                }
            }
        }
    }

    /// Attachment-level filter, same rules keyed off the attachment
    /// metadata.
    pub fn filter_attachment(&self, local_database_id: &str, key: &str, metadata: &Value) -> bool {
        self.filter_document(local_database_id, key, metadata)
    }
}

/// What the peer reports about us during negotiation: the cursors it has
/// acknowledged and its own identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct SourceReplicationInformation {
    #[serde(default)]
    pub last_document_etag: Etag,
    #[serde(default)]
    pub last_attachment_etag: Etag,
    #[serde(default)]
    pub server_instance_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Persisted per-destination failure counter
/// (`Raven/Replication/Destinations/<escaped url>`). Deleted on any
/// success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DestinationFailureInfo {
    pub destination: String,
    #[serde(default)]
    pub failure_count: u64,
}

/// A document as read from the local store. Tombstones are documents with
/// empty `data` and the delete marker in their metadata.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub key: String,
    pub etag: Etag,
    pub metadata: Value,
    pub data: Value,
    pub last_modified: u64,
}

impl StoredDocument {
    pub fn is_tombstone(&self) -> bool {
        self.metadata
            .get(META_DELETE_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Wire form: the data object with an `@metadata` field carrying the
    /// metadata, `@id`, `@etag` and `Last-Modified` ensured.
    pub fn to_wire(&self) -> Value {
        let mut metadata = match &self.metadata {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        metadata.insert(META_ID.to_string(), json!(self.key));
        metadata.insert(META_ETAG.to_string(), json!(self.etag.to_string()));
        metadata.insert(META_LAST_MODIFIED.to_string(), json!(self.last_modified));

        let mut body = match &self.data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.insert("@metadata".to_string(), Value::Object(metadata));
        Value::Object(body)
    }
}

/// Attachment descriptor; the payload bytes are fetched lazily by key at
/// send time.
#[derive(Debug, Clone)]
pub struct AttachmentInformation {
    pub key: String,
    pub etag: Etag,
    pub metadata: Value,
    pub size: u64,
}

/// An attachment ready for the wire, payload included. Zero-size
/// attachments and attachment tombstones carry an empty byte array.
#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub key: String,
    pub etag: Etag,
    pub metadata: Value,
    pub data: Vec<u8>,
}
