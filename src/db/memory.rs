//! In-memory reference backend.
//!
//! Implements the full [`DatabaseHandle`] surface over one mutex-guarded
//! document table: sequence-numbered writes, live change feeds, and a
//! checkpointed batch replicator speaking the coordinator's event
//! vocabulary. The test suite runs entirely on this backend; external
//! backends are expected to match its observable semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender, unbounded};

use super::{
    AllDocsPage, AllDocsQuery, AllDocsRow, BulkDocResult, BulkOutcome, CancelFlag, ChangeEvent,
    ChangesFeed, ChangesOptions, ChangesSince, DatabaseHandle, DatabaseInfo, DbError, DocRevision,
    PutMode, ReplicationFeed, ReplicationOptions, SyncDirection, SyncEvent,
};
use crate::model::{DocId, EntryDoc};

const LIVE_POLL: Duration = Duration::from_millis(25);

#[derive(Clone)]
pub struct MemoryDatabase {
    name: String,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<String, VersionedDoc>,
    update_seq: u64,
    subscribers: Vec<Subscriber>,
    checkpoints: HashMap<String, u64>,
    injected_failures: u32,
    destroyed: bool,
}

struct VersionedDoc {
    doc: EntryDoc,
    rev: String,
    seq: u64,
    deleted: bool,
}

struct Subscriber {
    sender: Sender<ChangeEvent>,
    include_docs: bool,
    only_leaves: bool,
    cancel: CancelFlag,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.destroyed)
            .unwrap_or(true)
    }

    /// Make the next `count` replication runs fail with a transport-style
    /// "too large" rejection. Test hook.
    pub fn inject_replication_error(&self, count: u32) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.injected_failures = count;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, DbError> {
        self.shared
            .state
            .lock()
            .map_err(|_| DbError::Backend("state lock poisoned".to_string()))
    }

    fn live_state(&self) -> Result<MutexGuard<'_, State>, DbError> {
        let state = self.state()?;
        if state.destroyed {
            return Err(DbError::Closed);
        }
        Ok(state)
    }

    fn take_injected_failure(&self) -> bool {
        match self.shared.state.lock() {
            Ok(mut state) if state.injected_failures > 0 => {
                state.injected_failures -= 1;
                true
            }
            _ => false,
        }
    }

    fn checkpoint(&self, key: &str) -> u64 {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|state| state.checkpoints.get(key).copied())
            .unwrap_or(0)
    }

    fn set_checkpoint(&self, key: &str, seq: u64) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.checkpoints.insert(key.to_string(), seq);
        }
    }

    fn put_locked(
        state: &mut State,
        doc: &EntryDoc,
        mode: PutMode,
    ) -> Result<DocRevision, DbError> {
        let id = doc
            .id()
            .ok_or_else(|| DbError::Backend("document without id".to_string()))?
            .clone();
        let current = state.docs.get(id.as_str());

        if mode == PutMode::Checked {
            let expected = current.filter(|v| !v.deleted).map(|v| v.rev.as_str());
            if doc.rev() != expected {
                return Err(DbError::Conflict { id: id.to_string() });
            }
        }

        let rev = next_rev(current.map(|v| v.rev.as_str()));
        state.update_seq += 1;
        let seq = state.update_seq;

        let mut stored = doc.clone();
        stored.set_rev(Some(rev.clone()));
        state.docs.insert(
            id.to_string(),
            VersionedDoc {
                doc: stored.clone(),
                rev: rev.clone(),
                seq,
                deleted: false,
            },
        );
        Self::emit_locked(
            state,
            ChangeEvent {
                id: id.clone(),
                seq,
                deleted: false,
                doc: Some(stored),
            },
        );

        Ok(DocRevision { id, rev })
    }

    fn emit_locked(state: &mut State, event: ChangeEvent) {
        if event.id.is_internal() {
            return;
        }
        state.subscribers.retain(|subscriber| {
            if subscriber.cancel.is_cancelled() {
                return false;
            }
            if subscriber.only_leaves && !event.id.is_leaf() {
                return true;
            }
            let mut delivered = event.clone();
            if !subscriber.include_docs {
                delivered.doc = None;
            }
            subscriber.sender.send(delivered).is_ok()
        });
    }

    fn backlog_locked(state: &State, since: u64, options: &ChangesOptions) -> Vec<ChangeEvent> {
        let mut events: Vec<ChangeEvent> = state
            .docs
            .iter()
            .filter(|(id, versioned)| {
                versioned.seq > since
                    && !id.starts_with("_local/")
                    && (!options.only_leaves || id.starts_with("h:"))
            })
            .map(|(id, versioned)| ChangeEvent {
                id: DocId::from(id.as_str()),
                seq: versioned.seq,
                deleted: versioned.deleted,
                doc: (options.include_docs && !versioned.deleted)
                    .then(|| versioned.doc.clone()),
            })
            .collect();
        events.sort_by_key(|event| event.seq);
        events
    }

    fn as_handle(&self) -> Arc<dyn DatabaseHandle> {
        Arc::new(self.clone())
    }
}

impl DatabaseHandle for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &DocId) -> Result<EntryDoc, DbError> {
        let state = self.live_state()?;
        match state.docs.get(id.as_str()) {
            Some(versioned) if !versioned.deleted => Ok(versioned.doc.clone()),
            _ => Err(DbError::not_found(id.as_str())),
        }
    }

    fn put(&self, doc: &EntryDoc, mode: PutMode) -> Result<DocRevision, DbError> {
        let mut state = self.live_state()?;
        Self::put_locked(&mut state, doc, mode)
    }

    fn remove(&self, id: &DocId, rev: &str) -> Result<DocRevision, DbError> {
        let mut state = self.live_state()?;
        let current_rev = match state.docs.get(id.as_str()) {
            Some(versioned) if !versioned.deleted => versioned.rev.clone(),
            _ => return Err(DbError::not_found(id.as_str())),
        };
        if current_rev != rev {
            return Err(DbError::Conflict { id: id.to_string() });
        }

        let next = next_rev(Some(rev));
        state.update_seq += 1;
        let seq = state.update_seq;
        if let Some(versioned) = state.docs.get_mut(id.as_str()) {
            versioned.rev = next.clone();
            versioned.seq = seq;
            versioned.deleted = true;
        }
        Self::emit_locked(
            &mut state,
            ChangeEvent {
                id: id.clone(),
                seq,
                deleted: true,
                doc: None,
            },
        );
        Ok(DocRevision {
            id: id.clone(),
            rev: next,
        })
    }

    fn bulk_docs(&self, docs: &[EntryDoc], mode: PutMode) -> Result<Vec<BulkDocResult>, DbError> {
        let mut state = self.live_state()?;
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc
                .id()
                .cloned()
                .ok_or_else(|| DbError::Backend("document without id".to_string()))?;
            let outcome = match Self::put_locked(&mut state, doc, mode) {
                Ok(revision) => BulkOutcome::Ok { rev: revision.rev },
                Err(DbError::Conflict { .. }) => BulkOutcome::Conflict,
                Err(DbError::Status { status, reason }) => BulkOutcome::Error { status, reason },
                Err(err) => return Err(err),
            };
            results.push(BulkDocResult { id, outcome });
        }
        Ok(results)
    }

    fn all_docs(&self, query: &AllDocsQuery) -> Result<AllDocsPage, DbError> {
        let state = self.live_state()?;
        let mut rows = Vec::new();

        if let Some(keys) = &query.keys {
            for key in keys {
                match state.docs.get(key.as_str()).filter(|v| !v.deleted) {
                    Some(versioned) => rows.push(AllDocsRow {
                        id: key.clone(),
                        doc: query.include_docs.then(|| versioned.doc.clone()),
                        error: None,
                    }),
                    None => rows.push(AllDocsRow {
                        id: key.clone(),
                        doc: None,
                        error: Some("not_found".to_string()),
                    }),
                }
            }
            return Ok(AllDocsPage { rows });
        }

        let start = query
            .start_after
            .as_ref()
            .map(|id| id.as_str().to_string());
        for (id, versioned) in &state.docs {
            if versioned.deleted || id.starts_with("_local/") {
                continue;
            }
            if let Some(start) = &start
                && id <= start
            {
                continue;
            }
            rows.push(AllDocsRow {
                id: DocId::from(id.as_str()),
                doc: query.include_docs.then(|| versioned.doc.clone()),
                error: None,
            });
            if let Some(limit) = query.limit
                && rows.len() >= limit
            {
                break;
            }
        }
        Ok(AllDocsPage { rows })
    }

    fn changes(&self, options: &ChangesOptions) -> Result<ChangesFeed, DbError> {
        let mut state = self.live_state()?;
        let (sender, receiver) = unbounded();
        let cancel = CancelFlag::new();

        let since = match options.since {
            ChangesSince::Zero => 0,
            ChangesSince::Seq(seq) => seq,
            ChangesSince::Now => state.update_seq,
        };
        for event in Self::backlog_locked(&state, since, options) {
            let _ = sender.send(event);
        }

        if options.live {
            state.subscribers.push(Subscriber {
                sender,
                include_docs: options.include_docs,
                only_leaves: options.only_leaves,
                cancel: cancel.clone(),
            });
        }
        Ok(ChangesFeed::new(receiver, cancel))
    }

    fn replicate(
        &self,
        remote: &Arc<dyn DatabaseHandle>,
        direction: SyncDirection,
        options: &ReplicationOptions,
    ) -> Result<ReplicationFeed, DbError> {
        self.live_state()?;
        let (sender, receiver) = unbounded();
        let cancel = CancelFlag::new();

        let owner = self.clone();
        let local = self.as_handle();
        let remote = Arc::clone(remote);
        let options = options.clone();
        let thread_cancel = cancel.clone();
        thread::spawn(move || {
            let _ = sender.send(SyncEvent::Active);
            let ok = pump(
                &owner,
                &local,
                &remote,
                direction,
                &options,
                &sender,
                &thread_cancel,
            );
            if !options.live && ok {
                let _ = sender.send(SyncEvent::Complete { ok: true });
            }
        });
        Ok(ReplicationFeed::new(receiver, cancel))
    }

    fn sync_with(
        &self,
        remote: &Arc<dyn DatabaseHandle>,
        options: &ReplicationOptions,
    ) -> Result<ReplicationFeed, DbError> {
        self.live_state()?;
        let (sender, receiver) = unbounded();
        let cancel = CancelFlag::new();

        let owner = self.clone();
        let local = self.as_handle();
        let remote = Arc::clone(remote);
        let options = options.clone();
        let thread_cancel = cancel.clone();
        thread::spawn(move || {
            let _ = sender.send(SyncEvent::Active);
            if options.live {
                let mut joins = Vec::new();
                for direction in [SyncDirection::Pull, SyncDirection::Push] {
                    let owner = owner.clone();
                    let local = Arc::clone(&local);
                    let remote = Arc::clone(&remote);
                    let options = options.clone();
                    let sender = sender.clone();
                    let cancel = thread_cancel.clone();
                    joins.push(thread::spawn(move || {
                        pump(&owner, &local, &remote, direction, &options, &sender, &cancel);
                    }));
                }
                for join in joins {
                    let _ = join.join();
                }
            } else {
                let pulled = pump(
                    &owner,
                    &local,
                    &remote,
                    SyncDirection::Pull,
                    &options,
                    &sender,
                    &thread_cancel,
                );
                let pushed = pulled
                    && pump(
                        &owner,
                        &local,
                        &remote,
                        SyncDirection::Push,
                        &options,
                        &sender,
                        &thread_cancel,
                    );
                let _ = sender.send(SyncEvent::Complete { ok: pulled && pushed });
            }
        });
        Ok(ReplicationFeed::new(receiver, cancel))
    }

    fn info(&self) -> Result<DatabaseInfo, DbError> {
        let state = self.live_state()?;
        let doc_count = state
            .docs
            .iter()
            .filter(|(id, versioned)| !versioned.deleted && !id.starts_with("_local/"))
            .count() as u64;
        Ok(DatabaseInfo {
            db_name: self.name.clone(),
            doc_count,
            update_seq: state.update_seq,
        })
    }

    fn destroy(&self) -> Result<(), DbError> {
        let mut state = self.state()?;
        state.docs.clear();
        state.checkpoints.clear();
        state.subscribers.clear();
        state.destroyed = true;
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.subscribers.clear();
        }
    }
}

/// Drive one direction of replication until the source drains (one-shot)
/// or the stream is cancelled (live). Returns false on error or cancel.
fn pump(
    owner: &MemoryDatabase,
    local: &Arc<dyn DatabaseHandle>,
    remote: &Arc<dyn DatabaseHandle>,
    direction: SyncDirection,
    options: &ReplicationOptions,
    events: &Sender<SyncEvent>,
    cancel: &CancelFlag,
) -> bool {
    if owner.take_injected_failure() {
        let _ = events.send(SyncEvent::Error {
            reason: "request entity too large".to_string(),
        });
        return false;
    }

    let (source, target) = match direction {
        SyncDirection::Pull => (remote, local),
        SyncDirection::Push => (local, remote),
    };
    let checkpoint_key = match direction {
        SyncDirection::Pull => format!("pull:{}", remote.name()),
        SyncDirection::Push => format!("push:{}", remote.name()),
    };

    let mut since = owner.checkpoint(&checkpoint_key);
    let feed = match source.changes(&ChangesOptions {
        live: options.live,
        since: ChangesSince::Seq(since),
        include_docs: true,
        only_leaves: false,
    }) {
        Ok(feed) => feed,
        Err(err) => {
            let _ = events.send(SyncEvent::Error {
                reason: err.to_string(),
            });
            return false;
        }
    };

    let mut dirty = false;
    loop {
        if cancel.is_cancelled() {
            feed.cancel();
            return false;
        }

        let first = match feed.events.recv_timeout(LIVE_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if options.live {
                    if dirty {
                        dirty = false;
                        let _ = events.send(SyncEvent::Paused);
                    }
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut batch = vec![first];
        while batch.len() < options.batch_size.max(1) {
            match feed.events.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        since = batch.iter().map(|event| event.seq).max().unwrap_or(since);
        match apply_batch(target, &batch) {
            Ok(written) => {
                owner.set_checkpoint(&checkpoint_key, since);
                dirty = true;
                if !written.is_empty() {
                    let _ = events.send(SyncEvent::Change {
                        direction,
                        docs: written,
                    });
                }
            }
            Err(err) => {
                feed.cancel();
                let _ = events.send(SyncEvent::Error {
                    reason: err.to_string(),
                });
                return false;
            }
        }
    }

    true
}

/// Write one batch of change events into `target`, suppressing echoes:
/// a document whose content already matches is not rewritten.
fn apply_batch(
    target: &Arc<dyn DatabaseHandle>,
    batch: &[ChangeEvent],
) -> Result<Vec<EntryDoc>, DbError> {
    let mut puts = Vec::new();
    for event in batch {
        if event.deleted {
            match target.get(&event.id) {
                Ok(existing) => {
                    if let Some(rev) = existing.rev() {
                        let _ = target.remove(&event.id, rev);
                    }
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            continue;
        }
        let Some(doc) = &event.doc else {
            continue;
        };
        match target.get(&event.id) {
            Ok(existing) => {
                if !same_content(&existing, doc) {
                    puts.push(doc.clone());
                }
            }
            Err(err) if err.is_not_found() => puts.push(doc.clone()),
            Err(err) => return Err(err),
        }
    }

    if puts.is_empty() {
        return Ok(Vec::new());
    }
    let results = target.bulk_docs(&puts, PutMode::Force)?;
    let written = puts
        .into_iter()
        .zip(results)
        .filter(|(_, result)| matches!(result.outcome, BulkOutcome::Ok { .. }))
        .map(|(doc, _)| doc)
        .collect();
    Ok(written)
}

fn same_content(a: &EntryDoc, b: &EntryDoc) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_rev(None);
    b.set_rev(None);
    a == b
}

fn next_rev(prev: Option<&str>) -> String {
    let generation = prev
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(generation, _)| generation.parse::<u64>().ok())
        .unwrap_or(0);
    let suffix: u64 = rand::random();
    format!("{}-{:016x}", generation + 1, suffix)
}
