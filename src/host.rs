//! Capabilities supplied by the embedding application.
//!
//! The engine stays portable by pushing every environment concern through
//! this trait: database construction, remote connectivity, schema
//! deployment, the path↔id mapping, and the transport-layer signal that
//! drives adaptive batch pacing.

use std::sync::Arc;

use crate::config::Settings;
use crate::db::{DatabaseHandle, DatabaseInfo, DbError, OpenOptions};
use crate::model::DocId;

/// Schema version the remote must satisfy before replication starts.
pub const REMOTE_SCHEMA_VERSION: u32 = 10;

/// An established connection to the remote replica.
pub struct RemoteConnection {
    pub db: Arc<dyn DatabaseHandle>,
    pub info: DatabaseInfo,
}

pub trait Host: Send + Sync {
    /// Open (or create) a local database generation. With
    /// `options.skip_setup`, return `None` when the database does not
    /// already exist.
    fn create_local_database(
        &self,
        name: &str,
        options: &OpenOptions,
    ) -> Result<Option<Arc<dyn DatabaseHandle>>, DbError>;

    /// Connect to the remote endpoint described by the settings, creating
    /// the remote database when it is missing. The error is a
    /// human-readable diagnostic from the transport.
    fn connect_remote(&self, settings: &Settings) -> Result<RemoteConnection, String>;

    /// Attach the host's encryption transform to an existing handle.
    fn enable_encryption(
        &self,
        _db: &Arc<dyn DatabaseHandle>,
        _passphrase: &str,
        _legacy: bool,
    ) -> Result<(), DbError> {
        Ok(())
    }

    /// Validate (and migrate, when the host supports it) the remote
    /// schema. `false` means the remote cannot be used.
    fn check_remote_version(
        &self,
        _db: &Arc<dyn DatabaseHandle>,
        _expected: u32,
    ) -> Result<bool, DbError> {
        Ok(true)
    }

    /// Publish design documents to a freshly opened database.
    fn put_design_documents(&self, _db: &Arc<dyn DatabaseHandle>) -> Result<(), DbError> {
        Ok(())
    }

    fn path_to_id(&self, path: &str) -> DocId {
        DocId::from(path)
    }

    fn id_to_path(&self, id: &DocId) -> String {
        id.as_str().to_string()
    }

    /// Whether the most recent transport failure was a size rejection.
    /// Consulted by the replication coordinator before downgrading its
    /// batch pacing.
    fn last_post_failed_by_size(&self) -> bool {
        false
    }
}
