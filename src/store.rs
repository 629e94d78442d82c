use crate::etag::Etag;
use crate::types::{
    now_unix, AttachmentInformation, StoredDocument, ATTACHMENT_TOMBSTONES, DOC_TOMBSTONES,
    META_DELETE_MARKER,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::RwLock;

#[derive(thiserror::Error, Debug, Clone)]
pub enum StoreError {
    #[error("concurrency conflict on {key}: expected {expected}, actual {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: Etag,
        actual: Etag,
    },
    #[error("storage failure: {0}")]
    Internal(String),
}

/// One tombstone (or other bookkeeping) entry in a named list. List items
/// get store-allocated etags so cursors interleave with documents.
#[derive(Debug, Clone)]
pub struct ListItem {
    pub key: String,
    pub etag: Etag,
    pub data: Value,
    pub created_at: u64,
}

/// Read surface available inside one storage read transaction.
pub trait StoreAccessor {
    fn most_recent_document_etag(&self) -> Result<Etag, StoreError>;
    fn most_recent_attachment_etag(&self) -> Result<Etag, StoreError>;

    /// Attachments with etag strictly greater than `after`, ascending,
    /// bounded by item count and accumulated payload size (at least one
    /// item is returned when any exists).
    fn attachments_after(
        &self,
        after: Etag,
        take: usize,
        size_limit: u64,
    ) -> Result<Vec<AttachmentInformation>, StoreError>;

    fn attachment_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Items of list `name` with etag strictly greater than `from`,
    /// optionally bounded above (inclusive), ascending, at most `take`.
    fn read_list(
        &self,
        name: &str,
        from: Etag,
        to: Option<Etag>,
        take: usize,
    ) -> Result<Vec<ListItem>, StoreError>;

    /// Etag of the most recent touch of `key`, if one was tracked.
    fn recent_touch(&self, key: &str) -> Result<Option<Etag>, StoreError>;
}

/// Narrow contract over the local document/attachment store. The
/// production store lives outside this crate; `MemoryStore` below is the
/// reference implementation used by the binary and the tests.
pub trait Store: Send + Sync + 'static {
    fn database_id(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<StoredDocument>, StoreError>;

    fn put(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        data: Value,
        metadata: Value,
    ) -> Result<Etag, StoreError>;

    /// Returns whether a document was actually deleted. Deleting a
    /// document writes a tombstone into the documents tombstone list.
    fn delete(&self, key: &str, expected_etag: Option<Etag>) -> Result<bool, StoreError>;

    fn documents_with_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Documents with etag strictly greater than `after`, ascending.
    fn documents_after(&self, after: Etag, take: usize) -> Result<Vec<StoredDocument>, StoreError>;

    /// Etag of the most recent touch of `key`, if the store tracked one.
    fn recent_touches_for(&self, key: &str) -> Result<Option<Etag>, StoreError>;

    /// Runs `action` inside one read transaction.
    fn batch<R>(&self, action: impl FnOnce(&dyn StoreAccessor) -> R) -> R
    where
        Self: Sized;
}

#[derive(Default)]
struct MemoryInner {
    docs: HashMap<String, StoredDocument>,
    doc_order: BTreeMap<Etag, String>,
    attachments: HashMap<String, (AttachmentInformation, Vec<u8>)>,
    attachment_order: BTreeMap<Etag, String>,
    lists: HashMap<String, BTreeMap<Etag, ListItem>>,
    touches: HashMap<String, Etag>,
    last_etag: Etag,
}

impl MemoryInner {
    fn next_etag(&mut self) -> Etag {
        self.last_etag = self.last_etag.incremented();
        self.last_etag
    }

    fn append_list(&mut self, name: &str, key: String, data: Value) {
        let etag = self.next_etag();
        self.lists.entry(name.to_string()).or_default().insert(
            etag,
            ListItem {
                key,
                etag,
                data,
                created_at: now_unix(),
            },
        );
    }
}

type WriteHook = Box<dyn Fn() + Send + Sync>;

/// In-memory reference store. Writes allocate monotonically increasing
/// etags; document and attachment deletions produce tombstones in the
/// replication tombstone lists, the wiring the replication worker relies
/// on.
pub struct MemoryStore {
    database_id: String,
    inner: RwLock<MemoryInner>,
    on_write: RwLock<Option<WriteHook>>,
}

impl MemoryStore {
    pub fn new(database_id: impl Into<String>) -> Self {
        MemoryStore {
            database_id: database_id.into(),
            inner: RwLock::new(MemoryInner::default()),
            on_write: RwLock::new(None),
        }
    }

    /// Called after every successful write; the binary wires this to
    /// `WorkContext::notify_about_work`.
    pub fn set_write_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_write.write() {
            *slot = Some(Box::new(hook));
        }
    }

    fn notify_write(&self) {
        if let Ok(slot) = self.on_write.read() {
            if let Some(hook) = slot.as_ref() {
                hook();
            }
        }
    }

    /// Stores attachment bytes under `key`, allocating a fresh etag.
    pub fn put_attachment(
        &self,
        key: &str,
        metadata: Value,
        data: Vec<u8>,
    ) -> Result<Etag, StoreError> {
        let etag = {
            let mut inner = lock_write(&self.inner)?;
            if let Some((old, _)) = inner.attachments.remove(key) {
                inner.attachment_order.remove(&old.etag);
            }
            let etag = inner.next_etag();
            let info = AttachmentInformation {
                key: key.to_string(),
                etag,
                metadata,
                size: data.len() as u64,
            };
            inner.attachment_order.insert(etag, key.to_string());
            inner.attachments.insert(key.to_string(), (info, data));
            etag
        };
        self.notify_write();
        Ok(etag)
    }

    pub fn delete_attachment(&self, key: &str) -> Result<bool, StoreError> {
        let deleted = {
            let mut inner = lock_write(&self.inner)?;
            match inner.attachments.remove(key) {
                None => false,
                Some((old, _)) => {
                    inner.attachment_order.remove(&old.etag);
                    let mut marker = match old.metadata {
                        Value::Object(map) => map,
                        _ => serde_json::Map::new(),
                    };
                    marker.insert(META_DELETE_MARKER.to_string(), json!(true));
                    inner.append_list(ATTACHMENT_TOMBSTONES, key.to_string(), Value::Object(marker));
                    true
                }
            }
        };
        if deleted {
            self.notify_write();
        }
        Ok(deleted)
    }

    /// Re-etags a document in place and records the touch, without the
    /// write counting as new content. Touch-induced updates must not
    /// propagate to peers.
    pub fn touch(&self, key: &str) -> Result<Option<Etag>, StoreError> {
        let mut inner = lock_write(&self.inner)?;
        let Some(old_etag) = inner.docs.get(key).map(|d| d.etag) else {
            return Ok(None);
        };
        inner.doc_order.remove(&old_etag);
        let etag = inner.next_etag();
        inner.doc_order.insert(etag, key.to_string());
        if let Some(doc) = inner.docs.get_mut(key) {
            doc.etag = etag;
        }
        inner.touches.insert(key.to_string(), etag);
        Ok(Some(etag))
    }
}

fn lock_read(lock: &RwLock<MemoryInner>) -> Result<std::sync::RwLockReadGuard<'_, MemoryInner>, StoreError> {
    lock.read().map_err(|e| StoreError::Internal(e.to_string()))
}

fn lock_write(lock: &RwLock<MemoryInner>) -> Result<std::sync::RwLockWriteGuard<'_, MemoryInner>, StoreError> {
    lock.write().map_err(|e| StoreError::Internal(e.to_string()))
}

impl Store for MemoryStore {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    fn get(&self, key: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(lock_read(&self.inner)?.docs.get(key).cloned())
    }

    fn put(
        &self,
        key: &str,
        expected_etag: Option<Etag>,
        data: Value,
        metadata: Value,
    ) -> Result<Etag, StoreError> {
        let etag = {
            let mut inner = lock_write(&self.inner)?;
            let current = inner.docs.get(key).map(|d| d.etag);
            if let (Some(expected), Some(actual)) = (expected_etag, current) {
                if expected != actual {
                    return Err(StoreError::ConcurrencyConflict {
                        key: key.to_string(),
                        expected,
                        actual,
                    });
                }
            }
            if let Some(old) = current {
                inner.doc_order.remove(&old);
            }
            let etag = inner.next_etag();
            inner.doc_order.insert(etag, key.to_string());
            inner.docs.insert(
                key.to_string(),
                StoredDocument {
                    key: key.to_string(),
                    etag,
                    metadata,
                    data,
                    last_modified: now_unix(),
                },
            );
            etag
        };
        self.notify_write();
        Ok(etag)
    }

    fn delete(&self, key: &str, expected_etag: Option<Etag>) -> Result<bool, StoreError> {
        let deleted = {
            let mut inner = lock_write(&self.inner)?;
            let Some(current) = inner.docs.get(key).map(|d| d.etag) else {
                return Ok(false);
            };
            if let Some(expected) = expected_etag {
                if expected != current {
                    return Err(StoreError::ConcurrencyConflict {
                        key: key.to_string(),
                        expected,
                        actual: current,
                    });
                }
            }
            let Some(doc) = inner.docs.remove(key) else {
                return Ok(false);
            };
            inner.doc_order.remove(&current);
            let mut marker = match doc.metadata {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            marker.insert(META_DELETE_MARKER.to_string(), json!(true));
            inner.append_list(DOC_TOMBSTONES, key.to_string(), Value::Object(marker));
            true
        };
        if deleted {
            self.notify_write();
        }
        Ok(deleted)
    }

    fn documents_with_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let inner = lock_read(&self.inner)?;
        let mut keys: Vec<&String> = inner
            .docs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .skip(skip)
            .take(take)
            .filter_map(|k| inner.docs.get(k).cloned())
            .collect())
    }

    fn documents_after(&self, after: Etag, take: usize) -> Result<Vec<StoredDocument>, StoreError> {
        let inner = lock_read(&self.inner)?;
        Ok(inner
            .doc_order
            .range((Excluded(after), Unbounded))
            .take(take)
            .filter_map(|(_, key)| inner.docs.get(key).cloned())
            .collect())
    }

    fn recent_touches_for(&self, key: &str) -> Result<Option<Etag>, StoreError> {
        Ok(lock_read(&self.inner)?.touches.get(key).copied())
    }

    fn batch<R>(&self, action: impl FnOnce(&dyn StoreAccessor) -> R) -> R {
        // The accessor locks per read. Holding the read guard across the
        // whole closure would deadlock when the closure re-enters the
        // store (prefetchers do) while a writer queues behind it.
        action(&MemoryAccessor { store: self })
    }
}

struct MemoryAccessor<'a> {
    store: &'a MemoryStore,
}

impl StoreAccessor for MemoryAccessor<'_> {
    fn most_recent_document_etag(&self) -> Result<Etag, StoreError> {
        // Tombstones advance the head too; peers must be able to move
        // their cursor past a pure run of deletions.
        Ok(lock_read(&self.store.inner)?.last_etag)
    }

    fn most_recent_attachment_etag(&self) -> Result<Etag, StoreError> {
        Ok(lock_read(&self.store.inner)?.last_etag)
    }

    fn attachments_after(
        &self,
        after: Etag,
        take: usize,
        size_limit: u64,
    ) -> Result<Vec<AttachmentInformation>, StoreError> {
        let inner = lock_read(&self.store.inner)?;
        let mut out = Vec::new();
        let mut total: u64 = 0;
        for (_, key) in inner.attachment_order.range((Excluded(after), Unbounded)) {
            if out.len() >= take {
                break;
            }
            let Some((info, _)) = inner.attachments.get(key) else {
                continue;
            };
            if !out.is_empty() && total.saturating_add(info.size) > size_limit {
                break;
            }
            total = total.saturating_add(info.size);
            out.push(info.clone());
        }
        Ok(out)
    }

    fn attachment_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock_read(&self.store.inner)?
            .attachments
            .get(key)
            .map(|(_, data)| data.clone()))
    }

    fn read_list(
        &self,
        name: &str,
        from: Etag,
        to: Option<Etag>,
        take: usize,
    ) -> Result<Vec<ListItem>, StoreError> {
        let inner = lock_read(&self.store.inner)?;
        let Some(list) = inner.lists.get(name) else {
            return Ok(Vec::new());
        };
        Ok(list
            .range((Excluded(from), Unbounded))
            .map(|(_, item)| item)
            .filter(|item| to.map(|bound| item.etag <= bound).unwrap_or(true))
            .take(take)
            .cloned()
            .collect())
    }

    fn recent_touch(&self, key: &str) -> Result<Option<Etag>, StoreError> {
        Ok(lock_read(&self.store.inner)?.touches.get(key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_allocates_increasing_etags() {
        let store = MemoryStore::new("self");
        let a = store.put("users/1", None, json!({}), json!({})).unwrap();
        let b = store.put("users/2", None, json!({}), json!({})).unwrap();
        assert!(b > a);
        let docs = store.documents_after(Etag::ZERO, 10).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].etag < docs[1].etag);
    }

    #[test]
    fn expected_etag_mismatch_is_a_conflict() {
        let store = MemoryStore::new("self");
        let etag = store.put("users/1", None, json!({}), json!({})).unwrap();
        let stale = Etag::from_u128(etag.as_u128() + 100);
        let err = store
            .put("users/1", Some(stale), json!({}), json!({}))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }

    #[test]
    fn delete_writes_a_document_tombstone() {
        let store = MemoryStore::new("self");
        store
            .put("users/1", None, json!({}), json!({ "owner": "a" }))
            .unwrap();
        assert!(store.delete("users/1", None).unwrap());
        assert!(store.get("users/1").unwrap().is_none());

        let tombstones =
            store.batch(|acc| acc.read_list(DOC_TOMBSTONES, Etag::ZERO, None, 10).unwrap());
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].key, "users/1");
        assert_eq!(tombstones[0].data[META_DELETE_MARKER], json!(true));
    }

    #[test]
    fn attachment_read_respects_count_and_size_limits() {
        let store = MemoryStore::new("self");
        for i in 0..5 {
            store
                .put_attachment(&format!("files/{i}"), json!({}), vec![0u8; 100])
                .unwrap();
        }
        let by_count =
            store.batch(|acc| acc.attachments_after(Etag::ZERO, 3, u64::MAX).unwrap());
        assert_eq!(by_count.len(), 3);

        let by_size = store.batch(|acc| acc.attachments_after(Etag::ZERO, 10, 250).unwrap());
        assert_eq!(by_size.len(), 2);

        // The size limit never starves the batch entirely.
        let oversized = store.batch(|acc| acc.attachments_after(Etag::ZERO, 10, 1).unwrap());
        assert_eq!(oversized.len(), 1);
    }

    #[test]
    fn touch_re_etags_and_records() {
        let store = MemoryStore::new("self");
        let original = store.put("users/1", None, json!({}), json!({})).unwrap();
        let touched = store.touch("users/1").unwrap().unwrap();
        assert!(touched > original);
        assert_eq!(store.recent_touches_for("users/1").unwrap(), Some(touched));
        assert_eq!(store.get("users/1").unwrap().unwrap().etag, touched);
    }

    #[test]
    fn prefix_scan_pages_deterministically() {
        let store = MemoryStore::new("self");
        for i in 0..5 {
            store
                .put(&format!("Raven/Replication/Sources/{i}"), None, json!({}), json!({}))
                .unwrap();
        }
        store.put("users/1", None, json!({}), json!({})).unwrap();
        let first = store
            .documents_with_prefix("Raven/Replication/Sources/", 0, 3)
            .unwrap();
        let second = store
            .documents_with_prefix("Raven/Replication/Sources/", 3, 3)
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(first.iter().chain(&second).all(|d| d.key.starts_with("Raven/")));
    }
}
