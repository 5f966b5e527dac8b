//! Note assembly and disassembly.
//!
//! The write path chunks a payload into leaves and stores metadata that
//! references them; the read paths reassemble, tolerating tombstones,
//! legacy flat notes, and documents written by newer peers.

use std::sync::Arc;

use thiserror::Error;

use crate::db::{AllDocsQuery, BulkOutcome, DatabaseHandle, DbError, DocRevision, PutMode};
use crate::model::{DocId, EntryDoc, LEAF_ID_PREFIX, Note, NoteDoc, NoteForm};

use super::chunks::{is_plain_text, split_pieces};
use super::{Engine, now_ms};

const PREFIX_SCAN_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk was not found: {id}")]
    MissingChunk { id: DocId },
    #[error("leaf write rejected ({status}): {reason}")]
    LeafWriteRejected { status: u16, reason: String },
    #[error("document is not a note: {id}")]
    NotANote { id: DocId },
    #[error("local database is not ready")]
    NotReady,
    #[error("cannot reach the remote database: {0}")]
    RemoteUnavailable(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl Engine {
    /// Metadata-only read: empty body, children, timestamps, tombstone.
    pub fn get_db_entry_meta(
        &self,
        id: &DocId,
        include_deleted: bool,
    ) -> Result<Option<Note>, StoreError> {
        if !self.filter.is_target(id.as_str()) {
            return Ok(None);
        }
        let db = self.local()?;
        let doc = match db.get(id) {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(note) = meta_note(&doc) else {
            return Ok(None);
        };
        if note.deleted && !include_deleted {
            return Ok(None);
        }
        Ok(Some(note))
    }

    /// Full read: metadata plus the reassembled body. A child that cannot
    /// be resolved records the note as corrupted and surfaces
    /// [`StoreError::MissingChunk`].
    pub fn get_db_entry(
        &self,
        id: &DocId,
        include_deleted: bool,
        wait_for_leaves: bool,
    ) -> Result<Option<Note>, StoreError> {
        if !self.filter.is_target(id.as_str()) {
            return Ok(None);
        }
        let db = self.local()?;
        let doc = match db.get(id) {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(mut note) = meta_note(&doc) else {
            return Ok(None);
        };
        if note.deleted && !include_deleted {
            return Ok(None);
        }

        match doc {
            EntryDoc::Legacy(legacy) => {
                note.data = legacy.data;
            }
            EntryDoc::Note(meta) | EntryDoc::Plain(meta) => {
                note.data = match self.load_children(&db, &meta.children, wait_for_leaves) {
                    Ok(data) => data,
                    Err(StoreError::MissingChunk { id: missing }) => {
                        self.mark_corrupted(id, vec![missing.clone()]);
                        return Err(StoreError::MissingChunk { id: missing });
                    }
                    Err(err) => return Err(err),
                };
            }
            _ => return Ok(None),
        }
        Ok(Some(note))
    }

    /// Store a note: chunk the body, reserve and bulk-write new leaves,
    /// then swap the metadata document under the per-id write lock.
    /// Returns `None` when the filter excludes the id.
    pub fn put_db_entry(
        &self,
        note: &Note,
        save_as_big_chunk: bool,
    ) -> Result<Option<DocRevision>, StoreError> {
        if !self.filter.is_target(note.id.as_str()) {
            tracing::debug!(id = %note.id, "excluded by filter, not stored");
            return Ok(None);
        }
        let db = self.local()?;

        let plain = is_plain_text(note.id.as_str());
        let mut children = Vec::new();
        let mut new_leaves = Vec::new();
        for piece in split_pieces(
            &note.data,
            &self.policy,
            self.settings.custom_chunk_size,
            plain,
            save_as_big_chunk,
        ) {
            children.push(self.put_leaf(&db, piece, &mut new_leaves)?);
        }

        let reserved = new_leaves.len();
        if !new_leaves.is_empty() {
            for result in db.bulk_docs(&new_leaves, PutMode::Checked)? {
                match result.outcome {
                    BulkOutcome::Ok { .. } => {}
                    BulkOutcome::Conflict => {
                        // Another writer stored the same content first.
                        tracing::debug!(id = %result.id, "leaf already written elsewhere");
                    }
                    BulkOutcome::Error { status, reason } => {
                        return Err(StoreError::LeafWriteRejected { status, reason });
                    }
                }
            }
        }

        let _guard = self.shared.locks.lock(format!("file:{}", note.id));
        let prior_rev = match db.get(&note.id) {
            Ok(existing) if existing.is_note() => existing.rev().map(str::to_string),
            Ok(_) => None,
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        let meta = NoteDoc {
            id: note.id.clone(),
            rev: prior_rev,
            ctime: note.ctime,
            mtime: note.mtime,
            size: note.data.len() as u64,
            children,
            deleted: false,
        };
        let doc = if plain {
            EntryDoc::Plain(meta)
        } else {
            EntryDoc::Note(meta)
        };
        let revision = db.put(&doc, PutMode::Force)?;
        self.clear_corrupted(&note.id);
        tracing::info!(id = %note.id, new_leaves = reserved, "note stored");
        Ok(Some(revision))
    }

    /// Tombstone (or hard-delete) a note. Returns `false` when nothing
    /// was there to delete.
    pub fn delete_db_entry(&self, id: &DocId, rev: Option<&str>) -> Result<bool, StoreError> {
        if !self.filter.is_target(id.as_str()) {
            return Ok(false);
        }
        let db = self.local()?;
        let _guard = self.shared.locks.lock(format!("file:{id}"));

        let doc = match db.get(id) {
            Ok(doc) => doc,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let was_plain = matches!(doc, EntryDoc::Plain(_));
        match doc {
            EntryDoc::Leaf(_) => Err(StoreError::NotANote { id: id.clone() }),
            EntryDoc::Legacy(legacy) => {
                let Some(current) = legacy.rev.as_deref() else {
                    return Ok(false);
                };
                db.remove(id, current)?;
                tracing::info!(id = %id, "legacy note deleted");
                Ok(true)
            }
            EntryDoc::Note(meta) | EntryDoc::Plain(meta) => {
                let hard = self.settings.delete_metadata_of_deleted_files || rev.is_some();
                if hard {
                    let Some(target_rev) = rev.or(meta.rev.as_deref()) else {
                        return Ok(false);
                    };
                    db.remove(id, target_rev)?;
                    tracing::info!(id = %id, "note hard-deleted");
                } else {
                    let mut tombstoned = meta;
                    tombstoned.deleted = true;
                    tombstoned.mtime = now_ms();
                    let doc = if was_plain {
                        EntryDoc::Plain(tombstoned)
                    } else {
                        EntryDoc::Note(tombstoned)
                    };
                    db.put(&doc, PutMode::Checked)?;
                    tracing::info!(id = %id, "note tombstoned");
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete every note whose id starts with `prefix` (or `/` +
    /// `prefix`), paging through the id table. Missing documents are
    /// tolerated. Returns the number of notes deleted.
    pub fn delete_db_entry_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let db = self.local()?;
        let slashed = format!("/{prefix}");

        let mut targets = Vec::new();
        let mut start_after = None;
        loop {
            let page = db.all_docs(&AllDocsQuery {
                keys: None,
                start_after: start_after.clone(),
                limit: Some(PREFIX_SCAN_PAGE),
                include_docs: false,
            })?;
            if page.rows.is_empty() {
                break;
            }
            for row in &page.rows {
                let id = row.id.as_str();
                if id.starts_with(LEAF_ID_PREFIX) {
                    continue;
                }
                if id.starts_with(prefix) || id.starts_with(&slashed) {
                    targets.push(row.id.clone());
                }
            }
            start_after = page.rows.last().map(|row| row.id.clone());
            if page.rows.len() < PREFIX_SCAN_PAGE {
                break;
            }
        }

        let mut deleted = 0;
        for id in targets {
            if self.delete_db_entry(&id, None)? {
                deleted += 1;
            }
        }
        tracing::info!(prefix, deleted, "prefix deletion finished");
        Ok(deleted)
    }

    /// Verify that every child of a chunked note is present. A miss
    /// records the note as corrupted.
    pub fn san_check(&self, note: &Note) -> Result<bool, StoreError> {
        if note.children.is_empty() {
            return Ok(true);
        }
        let db = self.local()?;
        let page = db.all_docs(&AllDocsQuery {
            keys: Some(note.children.clone()),
            include_docs: false,
            ..AllDocsQuery::default()
        })?;
        let missing: Vec<DocId> = page
            .rows
            .iter()
            .filter(|row| row.error.is_some())
            .map(|row| row.id.clone())
            .collect();
        if missing.is_empty() {
            return Ok(true);
        }
        self.mark_corrupted(&note.id, missing);
        Ok(false)
    }

    fn load_children(
        &self,
        db: &Arc<dyn DatabaseHandle>,
        children: &[DocId],
        wait_for_leaves: bool,
    ) -> Result<String, StoreError> {
        let mut data = String::new();
        if self.settings.read_chunks_online {
            for (child, doc) in children.iter().zip(self.collect_chunks(children)?) {
                match doc {
                    EntryDoc::Leaf(leaf) => data.push_str(&leaf.data),
                    _ => return Err(StoreError::MissingChunk { id: child.clone() }),
                }
            }
        } else {
            for child in children {
                data.push_str(&self.read_leaf(db, child, wait_for_leaves)?);
            }
        }
        Ok(data)
    }
}

/// Project any readable document onto the logical note shape, body left
/// empty. Non-note documents (leaves, singletons, unknown variants) are
/// absent.
fn meta_note(doc: &EntryDoc) -> Option<Note> {
    match doc {
        EntryDoc::Legacy(legacy) => Some(Note {
            id: legacy.id.clone(),
            data: String::new(),
            ctime: legacy.ctime,
            mtime: legacy.mtime,
            size: legacy.size,
            children: Vec::new(),
            deleted: legacy.deleted,
            rev: legacy.rev.clone(),
            form: NoteForm::Plain,
        }),
        EntryDoc::Note(meta) | EntryDoc::Plain(meta) => Some(Note {
            id: meta.id.clone(),
            data: String::new(),
            ctime: meta.ctime,
            mtime: meta.mtime,
            size: meta.size,
            children: meta.children.clone(),
            deleted: meta.deleted,
            rev: meta.rev.clone(),
            form: if matches!(doc, EntryDoc::Plain(_)) {
                NoteForm::Plain
            } else {
                NoteForm::Binary
            },
        }),
        _ => None,
    }
}
