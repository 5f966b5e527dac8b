//! Database generations: open, migrate, identify, subscribe.
//!
//! Init opens the current-generation database, copies a non-empty old
//! generation into it (destroying the old one on success), ensures the
//! node identity document, publishes design documents, and wires the
//! leaf-arrival listener. Only then is the engine ready.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use rand::Rng;
use thiserror::Error;

use crate::db::{
    ChangesOptions, ChangesSince, DatabaseHandle, DbError, OpenOptions, PutMode,
    ReplicationOptions, SyncDirection, SyncEvent,
};
use crate::model::{DocId, EntryDoc, NODE_INFO_DOC_ID, NodeInfoDoc};

use super::{Engine, LeafListener, lock};

const CURRENT_GENERATION_SUFFIX: &str = "-livesync-v2";
const OLD_GENERATION_SUFFIX: &str = "-livesync";

const MIGRATION_BATCH_SIZE: usize = 25;
const MIGRATION_BATCHES_LIMIT: usize = 10;

const NODE_ID_LENGTH: usize = 10;
const NODE_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

const LISTENER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("old generation copy failed; drop the old database manually: {reason}")]
    MigrationFailed { reason: String },
    #[error("host refused to open database {name:?}")]
    Unavailable { name: String },
    #[error(transparent)]
    Db(#[from] DbError),
}

impl Engine {
    /// Open the local store and bring the engine to ready.
    pub fn initialize_database(&self) -> Result<(), BootstrapError> {
        self.teardown_handles();
        self.shared.ready.store(false, Ordering::Release);

        let name = format!("{}{}", self.base_name, CURRENT_GENERATION_SUFFIX);
        let local = self
            .host
            .create_local_database(
                &name,
                &OpenOptions {
                    revs_limit: Some(100),
                    deterministic_revs: true,
                    auto_compaction: !self.settings.use_history,
                    skip_setup: false,
                },
            )?
            .ok_or(BootstrapError::Unavailable { name: name.clone() })?;
        *lock(&self.shared.local) = Some(Arc::clone(&local));

        self.migrate_old_generation(&local)?;
        self.ensure_node_info(&local)?;
        self.host.put_design_documents(&local)?;
        self.subscribe_leaf_arrivals(&local)?;

        self.shared.ready.store(true, Ordering::Release);
        tracing::info!(db = %name, node = self.node_id().as_deref().unwrap_or(""), "local database ready");
        Ok(())
    }

    /// Destroy the local store and rebuild it from scratch. The replica
    /// gets a fresh node identity.
    pub fn reset_database(&self) -> Result<(), BootstrapError> {
        self.teardown_handles();
        self.shared.ready.store(false, Ordering::Release);
        if let Some(local) = lock(&self.shared.local).take() {
            local.destroy()?;
        }
        *lock(&self.shared.node_id) = None;
        *lock(&self.shared.milestone) = None;
        lock(&self.shared.cache).clear();
        lock(&self.shared.corrupted).clear();
        self.shared.need_scanning.store(false, Ordering::Release);
        tracing::info!(db = %self.base_name, "local database reset");
        self.initialize_database()
    }

    /// Destroy only the old generation, leaving the current one alone.
    pub fn reset_local_old_database(&self) -> Result<(), BootstrapError> {
        if let Some(old) = self.open_old_generation()? {
            old.destroy()?;
            tracing::info!(db = %self.base_name, "old generation dropped");
        }
        Ok(())
    }

    fn open_old_generation(&self) -> Result<Option<Arc<dyn DatabaseHandle>>, DbError> {
        let name = format!("{}{}", self.base_name, OLD_GENERATION_SUFFIX);
        self.host.create_local_database(
            &name,
            &OpenOptions {
                skip_setup: true,
                ..OpenOptions::default()
            },
        )
    }

    fn migrate_old_generation(
        &self,
        local: &Arc<dyn DatabaseHandle>,
    ) -> Result<(), BootstrapError> {
        let Some(old) = self.open_old_generation()? else {
            return Ok(());
        };
        let info = old.info()?;
        if info.doc_count == 0 {
            tracing::info!("old generation is empty; skipping migration");
            return Ok(());
        }

        if let Some(passphrase) = self.settings.encryption_passphrase() {
            self.host.enable_encryption(&old, passphrase, true)?;
        }

        tracing::info!(docs = info.doc_count, "copying the old generation");
        let feed = local
            .replicate(
                &old,
                SyncDirection::Pull,
                &ReplicationOptions {
                    batch_size: MIGRATION_BATCH_SIZE,
                    batches_limit: MIGRATION_BATCHES_LIMIT,
                    ..ReplicationOptions::default()
                },
            )
            .map_err(|err| BootstrapError::MigrationFailed {
                reason: err.to_string(),
            })?;

        let mut copied = 0u64;
        loop {
            match feed.events.recv() {
                Ok(SyncEvent::Change { docs, .. }) => {
                    copied += docs.len() as u64;
                    tracing::info!(copied, total = info.doc_count, "migration progress");
                }
                Ok(SyncEvent::Error { reason }) => {
                    return Err(BootstrapError::MigrationFailed { reason });
                }
                Ok(SyncEvent::Complete { ok: true }) => break,
                Ok(SyncEvent::Complete { ok: false }) => {
                    return Err(BootstrapError::MigrationFailed {
                        reason: "copy ended incomplete".to_string(),
                    });
                }
                Ok(_) => {}
                Err(_) => {
                    return Err(BootstrapError::MigrationFailed {
                        reason: "copy stream ended unexpectedly".to_string(),
                    });
                }
            }
        }

        old.destroy()?;
        tracing::info!(docs = copied, "old generation migrated and dropped");
        Ok(())
    }

    fn ensure_node_info(&self, local: &Arc<dyn DatabaseHandle>) -> Result<(), BootstrapError> {
        let id = DocId::from(NODE_INFO_DOC_ID);
        match local.get(&id) {
            Ok(EntryDoc::NodeInfo(info)) => {
                *lock(&self.shared.node_id) = Some(info.nodeid);
                Ok(())
            }
            Ok(_) | Err(DbError::NotFound { .. }) => {
                let nodeid = random_node_id();
                local.put(
                    &EntryDoc::NodeInfo(NodeInfoDoc {
                        id,
                        rev: None,
                        nodeid: nodeid.clone(),
                        v20220607: true,
                    }),
                    PutMode::Force,
                )?;
                tracing::info!(node = %nodeid, "node identity created");
                *lock(&self.shared.node_id) = Some(nodeid);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn subscribe_leaf_arrivals(
        &self,
        local: &Arc<dyn DatabaseHandle>,
    ) -> Result<(), BootstrapError> {
        let feed = local.changes(&ChangesOptions {
            live: true,
            since: ChangesSince::Now,
            include_docs: false,
            only_leaves: true,
        })?;

        let shared = Arc::clone(&self.shared);
        let events = feed.events.clone();
        let cancel = feed.cancel_flag();
        let join = thread::spawn(move || {
            loop {
                match events.recv_timeout(LISTENER_POLL) {
                    Ok(event) => {
                        if !event.deleted {
                            shared.waiter.arrived(&event.id);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        *lock(&self.shared.leaf_listener) = Some(LeafListener { feed, join });
        Ok(())
    }
}

fn random_node_id() -> String {
    let mut rng = rand::thread_rng();
    (0..NODE_ID_LENGTH)
        .map(|_| NODE_ID_ALPHABET[rng.gen_range(0..NODE_ID_ALPHABET.len())] as char)
        .collect()
}
