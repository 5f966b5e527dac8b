//! Replication coordinator.
//!
//! One stream at a time: a singleton session slot with try-acquire
//! semantics. Every connection re-negotiates the milestone, and a
//! transport-level size rejection halves the batch pacing and retries
//! until a floor, after which the run gives up. Healthy throughput
//! restores the original pacing.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use thiserror::Error;

use crate::config::Settings;
use crate::db::{
    AllDocsQuery, CancelFlag, CheckpointSide, DatabaseHandle, DbError, ReplicationFeed,
    ReplicationOptions, SyncDirection, SyncEvent,
};
use crate::host::{Host, REMOTE_SCHEMA_VERSION, RemoteConnection};
use crate::model::{DocId, EntryDoc};

use super::entries::StoreError;
use super::milestone::MilestoneError;
use super::{Engine, EngineShared, lock};

pub const REPLICATION_HEARTBEAT_MS: u64 = 30_000;

/// Below this, pacing cannot be halved any further.
const PACING_FLOOR: usize = 5;

const EVENT_POLL: Duration = Duration::from_millis(100);

pub const PULL_FILTER: &str = "replicate/pull";
pub const PUSH_FILTER: &str = "replicate/push";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationStatus {
    NotConnected,
    Started,
    Connected,
    Paused,
    Completed,
    Errored,
    Closed,
}

impl ReplicationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicationStatus::NotConnected => "NOT_CONNECTED",
            ReplicationStatus::Started => "STARTED",
            ReplicationStatus::Connected => "CONNECTED",
            ReplicationStatus::Paused => "PAUSED",
            ReplicationStatus::Completed => "COMPLETED",
            ReplicationStatus::Errored => "ERRORED",
            ReplicationStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    Sync,
    PullOnly,
    PushOnly,
}

/// What the coordinator reports back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplicationNotice {
    /// Documents that arrived on the pull direction.
    Documents(Vec<EntryDoc>),
    /// Terminal result of the run.
    Finished(bool),
}

pub type ReplicationCallback = Arc<dyn Fn(ReplicationNotice) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationStat {
    pub status: ReplicationStatus,
    pub docs_sent: u64,
    pub docs_arrived: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("another replication is already running")]
    Busy,
    #[error("a version notice is pending; replication is inhibited")]
    Inhibited,
    #[error("cannot connect to the remote database: {0}")]
    Connect(String),
    #[error("remote database schema is incompatible")]
    RemoteSchema,
    #[error("local database is not ready")]
    NotReady,
    #[error(transparent)]
    Milestone(#[from] MilestoneError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Batch pacing, adaptively adjusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pacing {
    pub batch_size: usize,
    pub batches_limit: usize,
}

impl Pacing {
    fn halved(self) -> Pacing {
        Pacing {
            batch_size: self.batch_size.div_ceil(2) + 2,
            batches_limit: self.batches_limit.div_ceil(2) + 2,
        }
    }

    fn at_floor(self) -> bool {
        self.batch_size <= PACING_FLOOR && self.batches_limit <= PACING_FLOOR
    }
}

pub(crate) struct PacingState {
    pub current: Pacing,
    pub original: Pacing,
    pub downgraded: bool,
}

impl PacingState {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let pacing = Pacing {
            batch_size: settings.batch_size,
            batches_limit: settings.batches_limit,
        };
        Self {
            current: pacing,
            original: pacing,
            downgraded: false,
        }
    }
}

pub(crate) struct SyncSession {
    pub(crate) cancel: CancelFlag,
    pub(crate) feed_cancel: Arc<Mutex<Option<CancelFlag>>>,
    pub(crate) join: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start replication: a one-shot bidirectional pass, or with
    /// `keep_alive` a catch-up pull followed by a live retrying sync.
    /// Rejected while another stream runs.
    pub fn open_replication(
        &self,
        keep_alive: bool,
        show_result: bool,
        callback: ReplicationCallback,
    ) -> Result<(), ReplicationError> {
        self.start_replication(ReplicationMode::Sync, keep_alive, show_result, callback)
    }

    /// One-shot push of everything local to the remote.
    pub fn replicate_all_to_server(
        &self,
        show_result: bool,
        callback: ReplicationCallback,
    ) -> Result<(), ReplicationError> {
        self.start_replication(ReplicationMode::PushOnly, false, show_result, callback)
    }

    /// Cancel the running stream, if any, and wait for the coordinator to
    /// wind down.
    pub fn close_replication(&self) {
        let session = lock(&self.shared.session).take();
        let Some(mut session) = session else {
            return;
        };
        session.cancel.cancel();
        if let Some(feed_cancel) = lock(&session.feed_cancel).clone() {
            feed_cancel.cancel();
        }
        if let Some(join) = session.join.take() {
            let _ = join.join();
        }
        *lock(&self.shared.status) = ReplicationStatus::Closed;
        tracing::debug!("replication closed");
    }

    /// Connect to the remote, which creates the database when missing.
    pub fn try_create_remote_database(&self) -> Result<(), ReplicationError> {
        let conn = self
            .host
            .connect_remote(&self.settings)
            .map_err(ReplicationError::Connect)?;
        tracing::info!(name = %conn.info.db_name, "remote database is reachable");
        Ok(())
    }

    /// Destroy and recreate the remote database.
    pub fn try_reset_remote_database(&self) -> Result<(), ReplicationError> {
        self.close_replication();
        let conn = self
            .host
            .connect_remote(&self.settings)
            .map_err(ReplicationError::Connect)?;
        conn.db.destroy()?;
        let recreated = self
            .host
            .connect_remote(&self.settings)
            .map_err(ReplicationError::Connect)?;
        tracing::info!(name = %recreated.info.db_name, "remote database reset");
        Ok(())
    }

    /// Resolve `ids` in one batched local read, falling back to the
    /// remote for rows the local store cannot serve. Result order matches
    /// the caller's order.
    pub fn collect_chunks(&self, ids: &[DocId]) -> Result<Vec<EntryDoc>, StoreError> {
        let db = self.local()?;
        let page = db.all_docs(&AllDocsQuery {
            keys: Some(ids.to_vec()),
            include_docs: true,
            ..AllDocsQuery::default()
        })?;

        let mut resolved: Vec<Option<EntryDoc>> = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for row in page.rows {
            if row.error.is_none() && row.doc.is_some() {
                resolved.push(row.doc);
            } else {
                missing.push(row.id.clone());
                resolved.push(None);
            }
        }
        if missing.is_empty() {
            return Ok(resolved.into_iter().flatten().collect());
        }

        tracing::debug!(missing = missing.len(), "fetching missing chunks from the remote");
        let remote = self
            .connect_remote_db()
            .map_err(StoreError::RemoteUnavailable)?;
        let remote_page = remote.all_docs(&AllDocsQuery {
            keys: Some(missing),
            include_docs: true,
            ..AllDocsQuery::default()
        })?;
        for row in &remote_page.rows {
            if row.error.is_some() || row.doc.is_none() {
                return Err(StoreError::MissingChunk {
                    id: row.id.clone(),
                });
            }
        }

        // Merge in caller order. The remote rows are searched with a
        // rotating offset: consecutive misses are usually consecutive in
        // the remote result, so each lookup starts where the last ended.
        let remote_rows = remote_page.rows;
        let mut offset = 0usize;
        let mut merged = Vec::with_capacity(ids.len());
        for (id, slot) in ids.iter().zip(resolved) {
            if let Some(doc) = slot {
                merged.push(doc);
                continue;
            }
            let len = remote_rows.len();
            let mut found = None;
            for step in 0..len {
                let probe = (offset + step) % len;
                if remote_rows[probe].id == *id {
                    found = Some(probe);
                    break;
                }
            }
            let Some(probe) = found else {
                return Err(StoreError::MissingChunk { id: id.clone() });
            };
            offset = probe + 1;
            match remote_rows[probe].doc.clone() {
                Some(doc) => merged.push(doc),
                None => return Err(StoreError::MissingChunk { id: id.clone() }),
            }
        }
        Ok(merged)
    }

    pub(crate) fn connect_remote_db(&self) -> Result<Arc<dyn DatabaseHandle>, String> {
        self.host
            .connect_remote(&self.settings)
            .map(|conn| conn.db)
    }

    fn connect_checked(&self) -> Result<RemoteConnection, ReplicationError> {
        let conn = self
            .host
            .connect_remote(&self.settings)
            .map_err(ReplicationError::Connect)?;
        if !self.host.check_remote_version(&conn.db, REMOTE_SCHEMA_VERSION)? {
            return Err(ReplicationError::RemoteSchema);
        }
        self.negotiate_milestone(&conn.db)?;
        Ok(conn)
    }

    fn start_replication(
        &self,
        mode: ReplicationMode,
        live: bool,
        show_result: bool,
        callback: ReplicationCallback,
    ) -> Result<(), ReplicationError> {
        if !self.is_ready() {
            return Err(ReplicationError::NotReady);
        }
        if !self.settings.version_up_flash.is_empty() {
            tracing::warn!("version notice pending; replication inhibited");
            return Err(ReplicationError::Inhibited);
        }

        let mut slot = lock(&self.shared.session);
        if slot.is_some() {
            tracing::warn!("replication requested while another stream is running");
            return Err(ReplicationError::Busy);
        }

        let conn = self.connect_checked()?;
        let local = self.local().map_err(|_| ReplicationError::NotReady)?;

        *lock(&self.shared.status) = ReplicationStatus::Started;
        *lock(&self.shared.last_error) = None;

        let cancel = CancelFlag::new();
        let feed_cancel = Arc::new(Mutex::new(None));
        let worker = SyncWorker {
            shared: Arc::clone(&self.shared),
            host: Arc::clone(&self.host),
            local,
            remote: conn.db,
            mode,
            live,
            show_result,
            read_chunks_online: self.settings.read_chunks_online,
            callback,
            cancel: cancel.clone(),
            feed_cancel: Arc::clone(&feed_cancel),
        };
        // Seed the slot before spawning; a fast worker clears it under
        // the same lock we still hold.
        *slot = Some(SyncSession {
            cancel,
            feed_cancel,
            join: None,
        });
        let join = thread::spawn(move || worker.run());
        if let Some(session) = slot.as_mut() {
            session.join = Some(join);
        }
        Ok(())
    }
}

enum Outcome {
    Completed,
    Cancelled,
    SizeRetry,
    Failed(String),
}

struct SyncWorker {
    shared: Arc<EngineShared>,
    host: Arc<dyn Host>,
    local: Arc<dyn DatabaseHandle>,
    remote: Arc<dyn DatabaseHandle>,
    mode: ReplicationMode,
    live: bool,
    show_result: bool,
    read_chunks_online: bool,
    callback: ReplicationCallback,
    cancel: CancelFlag,
    feed_cancel: Arc<Mutex<Option<CancelFlag>>>,
}

impl SyncWorker {
    fn run(self) {
        loop {
            let pacing = lock(&self.shared.pacing).current;
            match self.run_once(pacing) {
                Outcome::Completed => {
                    self.finish(ReplicationStatus::Completed, None, Some(true));
                    break;
                }
                Outcome::Cancelled => {
                    self.finish(ReplicationStatus::Closed, None, None);
                    break;
                }
                Outcome::Failed(reason) => {
                    self.finish(ReplicationStatus::Errored, Some(reason), Some(false));
                    break;
                }
                Outcome::SizeRetry => {
                    let halved = {
                        let mut pacing = lock(&self.shared.pacing);
                        let halved = pacing.current.halved();
                        if !halved.at_floor() {
                            pacing.current = halved;
                            pacing.downgraded = true;
                        }
                        halved
                    };
                    if halved.at_floor() {
                        tracing::error!(
                            batch_size = halved.batch_size,
                            "batch rejected by size and cannot replicate lower"
                        );
                        self.finish(
                            ReplicationStatus::Errored,
                            Some("batch size floor reached".to_string()),
                            Some(false),
                        );
                        break;
                    }
                    tracing::warn!(
                        batch_size = halved.batch_size,
                        batches_limit = halved.batches_limit,
                        "batch rejected by size, retrying with smaller pacing"
                    );
                }
            }
        }
    }

    /// Terminal path: record the outcome, release the session slot, and
    /// only then notify the caller, so a follow-up open is not rejected
    /// as busy.
    fn finish(&self, status: ReplicationStatus, error: Option<String>, result: Option<bool>) {
        if let Some(reason) = error {
            tracing::warn!(%reason, "replication failed");
            *lock(&self.shared.last_error) = Some(reason);
        }
        self.set_status(status);
        lock(&self.shared.session).take();
        if let Some(ok) = result {
            (self.callback)(ReplicationNotice::Finished(ok));
        }
    }

    fn run_once(&self, pacing: Pacing) -> Outcome {
        let base = ReplicationOptions {
            live: false,
            retry: false,
            batch_size: pacing.batch_size,
            batches_limit: pacing.batches_limit,
            heartbeat_ms: REPLICATION_HEARTBEAT_MS,
            checkpoint: CheckpointSide::Target,
            filter: None,
        };

        if self.live {
            // Catch up with a one-shot pull before going live.
            let catchup = ReplicationOptions {
                filter: self.pull_filter(),
                ..base.clone()
            };
            match self.local.replicate(&self.remote, SyncDirection::Pull, &catchup) {
                Ok(feed) => match self.drive(feed) {
                    Outcome::Completed => {}
                    other => return other,
                },
                Err(err) => return Outcome::Failed(err.to_string()),
            }

            let live_options = ReplicationOptions {
                live: true,
                retry: true,
                ..base
            };
            match self.local.sync_with(&self.remote, &live_options) {
                Ok(feed) => self.drive(feed),
                Err(err) => Outcome::Failed(err.to_string()),
            }
        } else {
            let feed = match self.mode {
                ReplicationMode::Sync => self.local.sync_with(&self.remote, &base),
                ReplicationMode::PullOnly => {
                    let options = ReplicationOptions {
                        filter: self.pull_filter(),
                        ..base
                    };
                    self.local
                        .replicate(&self.remote, SyncDirection::Pull, &options)
                }
                ReplicationMode::PushOnly => {
                    let options = ReplicationOptions {
                        filter: self.push_filter(),
                        ..base
                    };
                    self.local
                        .replicate(&self.remote, SyncDirection::Push, &options)
                }
            };
            match feed {
                Ok(feed) => self.drive(feed),
                Err(err) => Outcome::Failed(err.to_string()),
            }
        }
    }

    fn drive(&self, feed: ReplicationFeed) -> Outcome {
        *lock(&self.feed_cancel) = Some(feed.cancel_flag());
        let mut transferred = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                feed.cancel();
                return Outcome::Cancelled;
            }
            match feed.events.recv_timeout(EVENT_POLL) {
                Ok(SyncEvent::Active) => self.set_status(ReplicationStatus::Connected),
                Ok(SyncEvent::Change { direction, docs }) => {
                    let count = docs.len() as u64;
                    match direction {
                        SyncDirection::Pull => {
                            self.shared.docs_arrived.fetch_add(count, Ordering::Relaxed);
                            (self.callback)(ReplicationNotice::Documents(docs));
                        }
                        SyncDirection::Push => {
                            self.shared.docs_sent.fetch_add(count, Ordering::Relaxed);
                        }
                    }
                    transferred += count;
                    self.maybe_restore_pacing(transferred);
                    self.set_status(ReplicationStatus::Connected);
                    if self.show_result {
                        tracing::info!(count, direction = ?direction, "documents replicated");
                    } else {
                        tracing::debug!(count, direction = ?direction, "documents replicated");
                    }
                }
                Ok(SyncEvent::Paused) => self.set_status(ReplicationStatus::Paused),
                Ok(SyncEvent::Denied { reason }) => {
                    return Outcome::Failed(format!("replication denied: {reason}"));
                }
                Ok(SyncEvent::Error { reason }) => {
                    if self.host.last_post_failed_by_size() {
                        return Outcome::SizeRetry;
                    }
                    return Outcome::Failed(reason);
                }
                Ok(SyncEvent::Complete { ok }) => {
                    return if ok {
                        Outcome::Completed
                    } else {
                        Outcome::Failed("replication ended incomplete".to_string())
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return if self.cancel.is_cancelled() {
                        Outcome::Cancelled
                    } else {
                        Outcome::Failed("replication stream ended unexpectedly".to_string())
                    };
                }
            }
        }
    }

    fn pull_filter(&self) -> Option<String> {
        self.read_chunks_online.then(|| PULL_FILTER.to_string())
    }

    fn push_filter(&self) -> Option<String> {
        self.read_chunks_online.then(|| PUSH_FILTER.to_string())
    }

    fn set_status(&self, status: ReplicationStatus) {
        *lock(&self.shared.status) = status;
        tracing::trace!(status = status.as_str(), "replication status");
    }

    fn maybe_restore_pacing(&self, transferred: u64) {
        let mut pacing = lock(&self.shared.pacing);
        if pacing.downgraded && transferred > (pacing.original.batch_size as u64) * 2 {
            pacing.current = pacing.original;
            pacing.downgraded = false;
            tracing::info!("throughput recovered, restoring original replication pacing");
        }
    }
}
