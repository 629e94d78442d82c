use crate::etag::Etag;
use crate::prefetch::Prefetcher;
use crate::store::{ListItem, Store, StoreAccessor, StoreError};
use crate::types::{
    AttachmentInformation, DestinationStrategy, OutgoingAttachment, SourceReplicationInformation,
    StoredDocument, ATTACHMENT_TOMBSTONES, DOC_TOMBSTONES, META_DELETE_MARKER,
};
use serde_json::Value;

/// Tombstone reads are bounded by the document batch size, but never by
/// less than this floor.
const DOC_TOMBSTONE_FLOOR: usize = 1024;
const ATTACHMENT_TOMBSTONE_FLOOR: usize = 100;

/// Attachment batches close at whichever bound hits first.
const ATTACHMENT_BATCH_COUNT: usize = 100;
const ATTACHMENT_BATCH_BYTES: u64 = 10 * 1024 * 1024;

/// Outcome of one document assembly pass. `last_etag` is how far the
/// cursor moved over the pre-filter stream; `documents` holds only the
/// post-filter survivors, in wire form.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub start_etag: Etag,
    pub last_etag: Etag,
    pub last_modified: Option<u64>,
    pub documents: Vec<Value>,
    pub loaded_docs: Vec<StoredDocument>,
    pub system_doc_count: usize,
    pub from_destination_count: usize,
}

#[derive(Debug, Default)]
pub struct AttachmentBatch {
    pub start_etag: Etag,
    pub last_etag: Etag,
    pub attachments: Vec<OutgoingAttachment>,
}

/// Assemble the next document batch for `dest`, starting after the
/// cursor the peer acknowledged. Documents and tombstones interleave in
/// etag order; when an entire pass is filtered out the cursor advances
/// and assembly re-iterates, so an empty result always means there was
/// nothing left worth sending.
pub fn build_documents<S: Store>(
    store: &S,
    dest: &DestinationStrategy,
    prefetcher: &dyn Prefetcher,
    info: &SourceReplicationInformation,
) -> Result<BatchResult, StoreError> {
    let local_id = store.database_id().to_string();
    store.batch(|acc| {
        let start_etag = info.last_document_etag;
        let mut cursor = start_etag;
        let mut last_modified = None;
        let mut system_doc_count = 0;
        let mut from_destination_count = 0;
        let mut loaded_docs = Vec::new();
        let mut survivors: Vec<StoredDocument> = Vec::new();

        loop {
            let mut docs = prefetcher.documents_batch_from(cursor);
            let doc_last_etag = docs.last().map(|d| d.etag);

            let take = docs.len().max(DOC_TOMBSTONE_FLOOR) + 1;
            let tombstones = acc.read_list(DOC_TOMBSTONES, cursor, doc_last_etag, take)?;

            // When the tombstone read hits its cap there may be more
            // tombstones hiding between its last entry and the last
            // document; keeping documents beyond that point would skip
            // them. Trim the documents back to the tombstone boundary.
            if tombstones.len() >= take {
                if let Some(boundary) = tombstones.last().map(|t| t.etag) {
                    docs.retain(|d| d.etag <= boundary);
                }
            }

            let mut merged = docs;
            merged.extend(tombstones.into_iter().map(tombstone_to_document));
            merged.sort_by_key(|d| d.etag);

            if merged.is_empty() {
                break;
            }

            for doc in &merged {
                if DestinationStrategy::is_system_document(&doc.key) {
                    system_doc_count += 1;
                }
                if dest.origins_from_destination(&doc.metadata) {
                    from_destination_count += 1;
                }
            }

            let iteration_cursor = cursor;
            if let Some(last) = merged.last() {
                cursor = last.etag;
                last_modified = Some(last.last_modified);
            }

            let passed: Vec<StoredDocument> = merged
                .iter()
                .filter(|doc| !touched_after(acc, &doc.key, iteration_cursor))
                .filter(|doc| dest.filter_document(&local_id, &doc.key, &doc.metadata))
                .filter(|doc| prefetcher.filter_document(doc))
                .cloned()
                .collect();
            loaded_docs.extend(merged);

            if !passed.is_empty() {
                survivors = passed;
                break;
            }
            // Everything in this pass was filtered out; iterate from the
            // advanced cursor.
        }

        Ok(BatchResult {
            start_etag,
            last_etag: cursor,
            last_modified,
            documents: survivors.iter().map(StoredDocument::to_wire).collect(),
            loaded_docs,
            system_doc_count,
            from_destination_count,
        })
    })
}

fn touched_after(acc: &dyn StoreAccessor, key: &str, cursor: Etag) -> bool {
    match acc.recent_touch(key) {
        Ok(Some(touched)) => touched > cursor,
        _ => false,
    }
}

fn tombstone_to_document(item: ListItem) -> StoredDocument {
    StoredDocument {
        key: item.key,
        etag: item.etag,
        metadata: item.data,
        data: Value::Object(serde_json::Map::new()),
        last_modified: item.created_at,
    }
}

/// Assemble the next attachment batch. Same shape as documents: tombstone
/// interleaving, cap trimming, and the re-iterate-on-all-filtered loop.
/// Payload bytes are read inside the transaction at assembly time, so a
/// zero-size attachment carries an empty byte array.
pub fn build_attachments<S: Store>(
    store: &S,
    dest: &DestinationStrategy,
    info: &SourceReplicationInformation,
) -> Result<AttachmentBatch, StoreError> {
    let local_id = store.database_id().to_string();
    store.batch(|acc| {
        let start_etag = info.last_attachment_etag;
        let mut cursor = start_etag;
        let mut out = Vec::new();

        loop {
            let mut infos =
                acc.attachments_after(cursor, ATTACHMENT_BATCH_COUNT, ATTACHMENT_BATCH_BYTES)?;
            let last_live_etag = infos.last().map(|a| a.etag);

            let take = infos.len().max(ATTACHMENT_TOMBSTONE_FLOOR) + 1;
            let tombstones = acc.read_list(ATTACHMENT_TOMBSTONES, cursor, last_live_etag, take)?;
            if tombstones.len() >= take {
                if let Some(boundary) = tombstones.last().map(|t| t.etag) {
                    infos.retain(|a| a.etag <= boundary);
                }
            }

            let mut merged = infos;
            merged.extend(tombstones.into_iter().map(|item| AttachmentInformation {
                key: item.key,
                etag: item.etag,
                metadata: item.data,
                size: 0,
            }));
            merged.sort_by_key(|a| a.etag);

            if merged.is_empty() {
                break;
            }
            if let Some(last) = merged.last() {
                cursor = last.etag;
            }

            let passed: Vec<AttachmentInformation> = merged
                .into_iter()
                .filter(|a| dest.filter_attachment(&local_id, &a.key, &a.metadata))
                .collect();

            if passed.is_empty() {
                continue;
            }
            for attachment in passed {
                let is_tombstone = attachment
                    .metadata
                    .get(META_DELETE_MARKER)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let data = if is_tombstone {
                    Vec::new()
                } else {
                    acc.attachment_data(&attachment.key)?.unwrap_or_default()
                };
                out.push(OutgoingAttachment {
                    key: attachment.key,
                    etag: attachment.etag,
                    metadata: attachment.metadata,
                    data,
                });
            }
            break;
        }

        Ok(AttachmentBatch {
            start_etag,
            last_etag: cursor,
            attachments: out,
        })
    })
}
