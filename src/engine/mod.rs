//! The storage/replication engine.
//!
//! One engine instance owns one local database generation plus the
//! process-wide state around it: the leaf cache, the corrupted-entry map,
//! the leaf-arrival waiter, per-id write locks, and the replication
//! counters. The crate refuses to open two engines over the same local
//! database name.

pub mod bootstrap;
pub mod cache;
pub mod chunks;
pub mod entries;
pub mod filter;
pub mod leaves;
pub mod milestone;
pub mod replication;
pub mod waiter;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::Settings;
use crate::db::{ChangesFeed, DatabaseHandle, DatabaseInfo};
use crate::host::Host;
use crate::locks::KeyedLocks;
use crate::model::{DocId, MilestoneDoc};

use self::cache::HashCache;
use self::chunks::ChunkPolicy;
use self::entries::StoreError;
use self::filter::{FileFilter, FilterError};
use self::leaves::{LeafHasher, fingerprint_hash};
use self::replication::{PacingState, ReplicationStat, ReplicationStatus, SyncSession};
use self::waiter::LeafWaiter;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("an engine is already open for database {name:?}")]
    AlreadyOpen { name: String },
    #[error("replication pacing must be positive")]
    InvalidPacing,
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// A note whose children could not be fully resolved during a read or a
/// sanity check. Consumers drain these via
/// [`Engine::take_corrupted_entries`] and rescan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptedEntry {
    pub id: DocId,
    pub missing: Vec<DocId>,
}

pub(crate) struct LeafListener {
    pub(crate) feed: ChangesFeed,
    pub(crate) join: std::thread::JoinHandle<()>,
}

pub(crate) struct EngineShared {
    pub(crate) local: Mutex<Option<Arc<dyn DatabaseHandle>>>,
    pub(crate) cache: Mutex<HashCache>,
    pub(crate) corrupted: Mutex<BTreeMap<String, CorruptedEntry>>,
    pub(crate) need_scanning: AtomicBool,
    pub(crate) waiter: LeafWaiter,
    pub(crate) locks: KeyedLocks,
    pub(crate) node_id: Mutex<Option<String>>,
    pub(crate) ready: AtomicBool,
    pub(crate) status: Mutex<ReplicationStatus>,
    pub(crate) docs_sent: AtomicU64,
    pub(crate) docs_arrived: AtomicU64,
    pub(crate) last_error: Mutex<Option<String>>,
    pub(crate) session: Mutex<Option<SyncSession>>,
    pub(crate) leaf_listener: Mutex<Option<LeafListener>>,
    pub(crate) pacing: Mutex<PacingState>,
    pub(crate) milestone: Mutex<Option<MilestoneDoc>>,
    pub(crate) remote_locked: AtomicBool,
    pub(crate) remote_locked_and_not_accepted: AtomicBool,
}

pub struct Engine {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) settings: Settings,
    pub(crate) base_name: String,
    pub(crate) filter: FileFilter,
    pub(crate) policy: ChunkPolicy,
    pub(crate) hasher: LeafHasher,
    pub(crate) shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("base_name", &self.base_name)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        host: Arc<dyn Host>,
        base_name: impl Into<String>,
        settings: Settings,
    ) -> Result<Self, EngineError> {
        if settings.batch_size == 0 || settings.batches_limit == 0 {
            return Err(EngineError::InvalidPacing);
        }
        let base_name = base_name.into();
        let filter = FileFilter::from_settings(&settings)?;
        register_engine(&base_name)?;

        let pacing = PacingState::from_settings(&settings);
        let shared = Arc::new(EngineShared {
            local: Mutex::new(None),
            cache: Mutex::new(HashCache::new(settings.hash_cache_size)),
            corrupted: Mutex::new(BTreeMap::new()),
            need_scanning: AtomicBool::new(false),
            waiter: LeafWaiter::new(),
            locks: KeyedLocks::new(),
            node_id: Mutex::new(None),
            ready: AtomicBool::new(false),
            status: Mutex::new(ReplicationStatus::NotConnected),
            docs_sent: AtomicU64::new(0),
            docs_arrived: AtomicU64::new(0),
            last_error: Mutex::new(None),
            session: Mutex::new(None),
            leaf_listener: Mutex::new(None),
            pacing: Mutex::new(pacing),
            milestone: Mutex::new(None),
            remote_locked: AtomicBool::new(false),
            remote_locked_and_not_accepted: AtomicBool::new(false),
        });

        Ok(Self {
            host,
            settings,
            base_name,
            filter,
            policy: ChunkPolicy::default(),
            hasher: fingerprint_hash,
            shared,
        })
    }

    /// Override the chunk-size ceilings. Test and tuning hook.
    pub fn with_chunk_policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Swap the 32-bit content fingerprint. Test hook for exercising
    /// collision suffixes.
    pub fn with_leaf_hasher(mut self, hasher: LeafHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> Option<String> {
        lock(&self.shared.node_id).clone()
    }

    pub fn is_target_file(&self, path: &str) -> bool {
        self.filter.is_target(path)
    }

    pub fn need_scanning(&self) -> bool {
        self.shared.need_scanning.load(Ordering::Acquire)
    }

    /// Whether the last connection check found the remote locked against
    /// this replica.
    pub fn remote_locked_and_not_accepted(&self) -> bool {
        self.shared
            .remote_locked_and_not_accepted
            .load(Ordering::Acquire)
    }

    /// Drain the corrupted-entry map and clear the rescan flag.
    pub fn take_corrupted_entries(&self) -> BTreeMap<String, CorruptedEntry> {
        let drained = std::mem::take(&mut *lock(&self.shared.corrupted));
        self.shared.need_scanning.store(false, Ordering::Release);
        drained
    }

    pub fn replication_stat(&self) -> ReplicationStat {
        ReplicationStat {
            status: *lock(&self.shared.status),
            docs_sent: self.shared.docs_sent.load(Ordering::Relaxed),
            docs_arrived: self.shared.docs_arrived.load(Ordering::Relaxed),
            last_error: lock(&self.shared.last_error).clone(),
        }
    }

    pub fn local_database_info(&self) -> Result<DatabaseInfo, StoreError> {
        Ok(self.local()?.info()?)
    }

    /// Cancel both long-lived handles and close the local database.
    pub fn close(&self) {
        self.teardown_handles();
        self.shared.ready.store(false, Ordering::Release);
        if let Some(local) = lock(&self.shared.local).take() {
            local.close();
        }
        tracing::debug!(db = %self.base_name, "engine closed");
    }

    /// Host shutdown path; identical to [`Engine::close`].
    pub fn onunload(&self) {
        self.close();
    }

    pub(crate) fn local(&self) -> Result<Arc<dyn DatabaseHandle>, StoreError> {
        lock(&self.shared.local)
            .clone()
            .ok_or(StoreError::NotReady)
    }

    pub(crate) fn teardown_handles(&self) {
        self.close_replication();
        if let Some(listener) = lock(&self.shared.leaf_listener).take() {
            listener.feed.cancel();
            let _ = listener.join.join();
        }
    }

    pub(crate) fn mark_corrupted(&self, id: &DocId, missing: Vec<DocId>) {
        tracing::warn!(id = %id, missing = missing.len(), "note references unresolved chunks");
        lock(&self.shared.corrupted).insert(
            id.to_string(),
            CorruptedEntry {
                id: id.clone(),
                missing,
            },
        );
        self.shared.need_scanning.store(true, Ordering::Release);
    }

    pub(crate) fn clear_corrupted(&self, id: &DocId) {
        lock(&self.shared.corrupted).remove(id.as_str());
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
        release_engine(&self.base_name);
    }
}

/// Poison-tolerant lock helper; the guarded state stays consistent across
/// panics in unrelated holders.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn open_engines() -> &'static Mutex<BTreeSet<String>> {
    static OPEN: OnceLock<Mutex<BTreeSet<String>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(BTreeSet::new()))
}

fn register_engine(name: &str) -> Result<(), EngineError> {
    let mut open = lock(open_engines());
    if !open.insert(name.to_string()) {
        return Err(EngineError::AlreadyOpen {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn release_engine(name: &str) {
    lock(open_engines()).remove(name);
}
