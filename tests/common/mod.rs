//! Shared fixtures: a capability host over in-memory databases.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, unbounded};
use frond::{
    DatabaseHandle, DbError, Engine, Host, MemoryDatabase, OpenOptions, RemoteConnection,
    ReplicationCallback, ReplicationNotice, Settings,
};

pub struct TestHost {
    databases: Mutex<HashMap<String, MemoryDatabase>>,
    remote: Mutex<MemoryDatabase>,
    post_failed_by_size: AtomicBool,
    remote_version_ok: AtomicBool,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            databases: Mutex::new(HashMap::new()),
            remote: Mutex::new(MemoryDatabase::new("remote")),
            post_failed_by_size: AtomicBool::new(false),
            remote_version_ok: AtomicBool::new(true),
        })
    }

    /// Handle on the remote database backing `connect_remote`.
    pub fn remote(&self) -> MemoryDatabase {
        self.remote.lock().unwrap().clone()
    }

    /// Handle on a local database by full generation name.
    pub fn local(&self, name: &str) -> Option<MemoryDatabase> {
        self.databases.lock().unwrap().get(name).cloned()
    }

    /// Pre-create a local database, e.g. an old generation fixture.
    pub fn seed_local(&self, name: &str) -> MemoryDatabase {
        let db = MemoryDatabase::new(name);
        self.databases
            .lock()
            .unwrap()
            .insert(name.to_string(), db.clone());
        db
    }

    pub fn set_post_failed_by_size(&self, flag: bool) {
        self.post_failed_by_size.store(flag, Ordering::SeqCst);
    }

    pub fn set_remote_version_ok(&self, flag: bool) {
        self.remote_version_ok.store(flag, Ordering::SeqCst);
    }
}

impl Host for TestHost {
    fn create_local_database(
        &self,
        name: &str,
        options: &OpenOptions,
    ) -> Result<Option<Arc<dyn DatabaseHandle>>, DbError> {
        let mut databases = self.databases.lock().unwrap();
        if let Some(db) = databases.get(name)
            && !db.is_destroyed()
        {
            return Ok(Some(Arc::new(db.clone())));
        }
        if options.skip_setup {
            return Ok(None);
        }
        let db = MemoryDatabase::new(name);
        databases.insert(name.to_string(), db.clone());
        Ok(Some(Arc::new(db)))
    }

    fn connect_remote(&self, _settings: &Settings) -> Result<RemoteConnection, String> {
        let mut remote = self.remote.lock().unwrap();
        if remote.is_destroyed() {
            *remote = MemoryDatabase::new("remote");
        }
        let db: Arc<dyn DatabaseHandle> = Arc::new(remote.clone());
        let info = db.info().map_err(|err| err.to_string())?;
        Ok(RemoteConnection { db, info })
    }

    fn check_remote_version(
        &self,
        _db: &Arc<dyn DatabaseHandle>,
        _expected: u32,
    ) -> Result<bool, DbError> {
        Ok(self.remote_version_ok.load(Ordering::SeqCst))
    }

    fn last_post_failed_by_size(&self) -> bool {
        self.post_failed_by_size.load(Ordering::SeqCst)
    }
}

/// A ready engine over a fresh host. Names must be unique per test
/// because the crate refuses duplicate engines per database name.
pub fn ready_engine(name: &str, settings: Settings) -> (Arc<TestHost>, Engine) {
    let host = TestHost::new();
    let engine = Engine::new(Arc::clone(&host) as Arc<dyn Host>, name, settings).unwrap();
    engine.initialize_database().unwrap();
    (host, engine)
}

/// Callback that forwards every notice into a channel.
pub fn notice_channel() -> (ReplicationCallback, Receiver<ReplicationNotice>) {
    let (sender, receiver) = unbounded();
    let callback: ReplicationCallback = Arc::new(move |notice| {
        let _ = sender.send(notice);
    });
    (callback, receiver)
}

/// Block until a terminal notice arrives; returns its success flag.
pub fn wait_finished(receiver: &Receiver<ReplicationNotice>) -> bool {
    let deadline = std::time::Duration::from_secs(5);
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        match receiver.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(ReplicationNotice::Finished(ok)) => return ok,
            Ok(_) => {}
            Err(_) => {}
        }
    }
    panic!("replication did not finish in time");
}

/// Count the content-addressed leaves in a database.
pub fn leaf_count(db: &MemoryDatabase) -> usize {
    db.all_docs(&frond::AllDocsQuery::default())
        .unwrap()
        .rows
        .iter()
        .filter(|row| row.id.as_str().starts_with("h:"))
        .count()
}

/// The current-generation database of an engine with base name `name`.
pub fn current_db(host: &TestHost, name: &str) -> MemoryDatabase {
    host.local(&format!("{name}-livesync-v2")).unwrap()
}
