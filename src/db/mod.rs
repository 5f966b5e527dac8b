//! Abstract document-database handle and its event vocabulary.
//!
//! The engine never talks to a concrete database; it drives this trait.
//! Change feeds and replication streams are channel-backed subscriptions
//! with an explicit cancel path. The crate ships one reference backend
//! ([`memory::MemoryDatabase`]) used by the test suite.

pub mod memory;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::Receiver;
use thiserror::Error;

use crate::model::{DocId, EntryDoc};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("document not found: {id}")]
    NotFound { id: String },
    #[error("document update conflict: {id}")]
    Conflict { id: String },
    #[error("database rejected request ({status}): {reason}")]
    Status { status: u16, reason: String },
    #[error("database handle closed")]
    Closed,
    #[error("backend failure: {0}")]
    Backend(String),
}

impl DbError {
    pub fn not_found(id: impl Into<String>) -> Self {
        DbError::NotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict { .. })
    }
}

/// Options for opening a local database generation.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    pub revs_limit: Option<u32>,
    pub deterministic_revs: bool,
    pub auto_compaction: bool,
    /// Open only if the database already exists.
    pub skip_setup: bool,
}

/// Write admission policy for `put` and `bulk_docs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutMode {
    /// Reject when the supplied revision is not the current one.
    Checked,
    /// Overwrite whatever revision is current (replication semantics).
    Force,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocRevision {
    pub id: DocId,
    pub rev: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BulkOutcome {
    Ok { rev: String },
    Conflict,
    Error { status: u16, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkDocResult {
    pub id: DocId,
    pub outcome: BulkOutcome,
}

/// Query over the id-ordered document table. With `keys`, one row per
/// requested key is returned, carrying an error marker for misses.
#[derive(Clone, Debug, Default)]
pub struct AllDocsQuery {
    pub keys: Option<Vec<DocId>>,
    /// Resume a page scan after this id (exclusive).
    pub start_after: Option<DocId>,
    pub limit: Option<usize>,
    pub include_docs: bool,
}

#[derive(Clone, Debug)]
pub struct AllDocsRow {
    pub id: DocId,
    pub doc: Option<EntryDoc>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct AllDocsPage {
    pub rows: Vec<AllDocsRow>,
}

/// Where a changes read starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangesSince {
    Zero,
    Seq(u64),
    Now,
}

#[derive(Clone, Debug)]
pub struct ChangesOptions {
    pub live: bool,
    pub since: ChangesSince,
    pub include_docs: bool,
    /// Restrict the feed to content-addressed leaves.
    pub only_leaves: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            live: false,
            since: ChangesSince::Zero,
            include_docs: false,
            only_leaves: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub id: DocId,
    pub seq: u64,
    pub deleted: bool,
    pub doc: Option<EntryDoc>,
}

/// Cancellation token shared between a subscription and its producer.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A live or one-shot changes subscription.
pub struct ChangesFeed {
    pub events: Receiver<ChangeEvent>,
    cancel: CancelFlag,
}

impl ChangesFeed {
    pub fn new(events: Receiver<ChangeEvent>, cancel: CancelFlag) -> Self {
        Self { events, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

/// Direction of a replication stream, from the local replica's viewpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    Push,
    Pull,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Active,
    Change {
        direction: SyncDirection,
        docs: Vec<EntryDoc>,
    },
    Paused,
    Denied {
        reason: String,
    },
    Error {
        reason: String,
    },
    Complete {
        ok: bool,
    },
}

/// Which side owns the replication checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointSide {
    Source,
    Target,
}

#[derive(Clone, Debug)]
pub struct ReplicationOptions {
    pub live: bool,
    pub retry: bool,
    pub batch_size: usize,
    pub batches_limit: usize,
    pub heartbeat_ms: u64,
    pub checkpoint: CheckpointSide,
    /// Server-side filter name (`replicate/push`, `replicate/pull`).
    pub filter: Option<String>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            live: false,
            retry: false,
            batch_size: 250,
            batches_limit: 40,
            heartbeat_ms: 30_000,
            checkpoint: CheckpointSide::Target,
            filter: None,
        }
    }
}

/// A running replication stream.
pub struct ReplicationFeed {
    pub events: Receiver<SyncEvent>,
    cancel: CancelFlag,
}

impl ReplicationFeed {
    pub fn new(events: Receiver<SyncEvent>, cancel: CancelFlag) -> Self {
        Self { events, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: u64,
}

/// The primitive surface the engine consumes. Implementations must be
/// callable from multiple threads.
pub trait DatabaseHandle: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, id: &DocId) -> Result<EntryDoc, DbError>;

    fn put(&self, doc: &EntryDoc, mode: PutMode) -> Result<DocRevision, DbError>;

    /// Delete the revision `rev` of `id` (a "deleted revision" write).
    fn remove(&self, id: &DocId, rev: &str) -> Result<DocRevision, DbError>;

    fn bulk_docs(&self, docs: &[EntryDoc], mode: PutMode) -> Result<Vec<BulkDocResult>, DbError>;

    fn all_docs(&self, query: &AllDocsQuery) -> Result<AllDocsPage, DbError>;

    fn changes(&self, options: &ChangesOptions) -> Result<ChangesFeed, DbError>;

    /// Stream documents between this database and `remote` in one
    /// direction. Events are tagged with `direction`.
    fn replicate(
        &self,
        remote: &Arc<dyn DatabaseHandle>,
        direction: SyncDirection,
        options: &ReplicationOptions,
    ) -> Result<ReplicationFeed, DbError>;

    /// Bidirectional stream; events carry their own direction.
    fn sync_with(
        &self,
        remote: &Arc<dyn DatabaseHandle>,
        options: &ReplicationOptions,
    ) -> Result<ReplicationFeed, DbError>;

    fn info(&self) -> Result<DatabaseInfo, DbError>;

    fn destroy(&self) -> Result<(), DbError>;

    fn close(&self);
}
