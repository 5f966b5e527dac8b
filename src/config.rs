//! Engine settings supplied by the host.

use serde::{Deserialize, Serialize};

/// Everything the host can tune about the engine. Plain data; validation
/// (pattern compilation, pacing sanity) happens at engine construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote endpoint.
    pub couch_db_uri: String,
    pub couch_db_dbname: String,
    pub couch_db_user: String,
    pub couch_db_password: String,

    /// Keep document history; disables auto-compaction of the local store.
    pub use_history: bool,

    /// Content encryption. The cipher itself is supplied by the host; the
    /// engine only folds the passphrase into leaf fingerprints.
    pub encrypt: bool,
    pub passphrase: String,

    /// Resolve children through one batched read (with remote fallback)
    /// instead of per-leaf gets. Also enables the replication filters.
    pub read_chunks_online: bool,

    /// Multiplier for the binary chunk size. Zero means "size to roughly a
    /// hundred pieces per payload".
    pub custom_chunk_size: usize,

    /// Hard-delete note metadata when a tombstone would be written.
    pub delete_metadata_of_deleted_files: bool,

    /// Path filters. Empty string means "not set".
    pub sync_only_regex: String,
    pub sync_ignore_regex: String,

    /// Replication pacing. Adaptively halved when the transport rejects a
    /// batch by size.
    pub batch_size: usize,
    pub batches_limit: usize,

    /// Force same-origin transport when connecting to the remote.
    pub disable_request_uri: bool,

    /// Skip the fleet chunk-version compatibility check.
    pub ignore_version_check: bool,

    /// When non-empty, a version notice is pending and replication is
    /// inhibited until the host clears it.
    pub version_up_flash: String,

    /// Bound on the in-memory leaf cache, in entries.
    pub hash_cache_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            couch_db_uri: String::new(),
            couch_db_dbname: String::new(),
            couch_db_user: String::new(),
            couch_db_password: String::new(),
            use_history: false,
            encrypt: false,
            passphrase: String::new(),
            read_chunks_online: false,
            custom_chunk_size: 0,
            delete_metadata_of_deleted_files: false,
            sync_only_regex: String::new(),
            sync_ignore_regex: String::new(),
            batch_size: 250,
            batches_limit: 40,
            disable_request_uri: false,
            ignore_version_check: false,
            version_up_flash: String::new(),
            hash_cache_size: 300,
        }
    }
}

impl Settings {
    pub fn encryption_passphrase(&self) -> Option<&str> {
        if self.encrypt && !self.passphrase.is_empty() {
            Some(&self.passphrase)
        } else {
            None
        }
    }
}
