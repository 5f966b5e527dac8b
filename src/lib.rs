#![forbid(unsafe_code)]

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod host;
pub mod locks;
pub mod model;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working surface at the crate root for convenience
pub use crate::config::Settings;
pub use crate::db::{
    AllDocsPage, AllDocsQuery, AllDocsRow, BulkDocResult, BulkOutcome, CancelFlag, ChangeEvent,
    ChangesFeed, ChangesOptions, ChangesSince, CheckpointSide, DatabaseHandle, DatabaseInfo,
    DbError, DocRevision, OpenOptions, PutMode, ReplicationFeed, ReplicationOptions, SyncDirection,
    SyncEvent, memory::MemoryDatabase,
};
pub use crate::engine::bootstrap::BootstrapError;
pub use crate::engine::chunks::{ChunkPolicy, MAX_CHUNK_SIZE, MAX_TEXT_CHUNK_SIZE};
pub use crate::engine::entries::StoreError;
pub use crate::engine::filter::{FileFilter, FilterError};
pub use crate::engine::leaves::{LeafHasher, fingerprint_hash};
pub use crate::engine::milestone::{
    FleetRange, MilestoneCheck, MilestoneError, NODE_VERSION_RANGE,
};
pub use crate::engine::replication::{
    ReplicationCallback, ReplicationError, ReplicationMode, ReplicationNotice, ReplicationStat,
    ReplicationStatus,
};
pub use crate::engine::waiter::LEAF_WAIT_TIMEOUT;
pub use crate::engine::{CorruptedEntry, Engine, EngineError};
pub use crate::host::{Host, REMOTE_SCHEMA_VERSION, RemoteConnection};
pub use crate::model::{
    ChunkVersionRange, DocId, EntryDoc, LEAF_ID_PREFIX, LeafDoc, LegacyNoteDoc, MILESTONE_DOC_ID,
    MilestoneDoc, NODE_INFO_DOC_ID, NodeInfoDoc, Note, NoteDoc, NoteForm,
};
