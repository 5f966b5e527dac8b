//! Content-addressed leaf storage.
//!
//! Leaf ids are `h:` + a 32-bit content fingerprint in hex + a decimal
//! collision suffix. Under encryption the fingerprint is XOR-folded with
//! the passphrase fingerprint and prefixed `+`, so identical plaintext
//! under different passphrases lands on different ids.

use std::sync::Arc;

use crate::db::DatabaseHandle;
use crate::model::{DocId, EntryDoc, LeafDoc};

use super::entries::StoreError;
use super::waiter::LEAF_WAIT_TIMEOUT;
use super::{Engine, lock};

/// Swappable 32-bit content fingerprint.
pub type LeafHasher = fn(&[u8]) -> u32;

pub fn fingerprint_hash(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

impl Engine {
    pub(crate) fn leaf_fingerprint(&self, piece: &str) -> String {
        let hash = (self.hasher)(piece.as_bytes());
        match self.settings.encryption_passphrase() {
            Some(passphrase) => {
                format!("+{:x}", hash ^ (self.hasher)(passphrase.as_bytes()))
            }
            None => format!("{hash:x}"),
        }
    }

    /// Resolve `piece` to a leaf id, reserving a new leaf in `new_leaves`
    /// when no existing leaf carries this payload. Reserved leaves are
    /// written later in one bulk call.
    pub(crate) fn put_leaf(
        &self,
        db: &Arc<dyn DatabaseHandle>,
        piece: &str,
        new_leaves: &mut Vec<EntryDoc>,
    ) -> Result<DocId, StoreError> {
        if let Some(id) = lock(&self.shared.cache).get(piece) {
            return Ok(id);
        }

        let base = self.leaf_fingerprint(piece);
        let mut suffix = 0usize;
        loop {
            let candidate = DocId::new(format!("h:{base}{suffix}"));
            match db.get(&candidate) {
                Err(err) if err.is_not_found() => {
                    // A batch-mate may already have reserved this id for a
                    // colliding payload the cache has since evicted.
                    if let Some(EntryDoc::Leaf(pending)) =
                        new_leaves.iter().find(|doc| doc.id() == Some(&candidate))
                    {
                        if pending.data == piece {
                            lock(&self.shared.cache).set(piece, candidate.clone());
                            return Ok(candidate);
                        }
                        suffix += 1;
                        continue;
                    }
                    new_leaves.push(EntryDoc::Leaf(LeafDoc {
                        id: candidate.clone(),
                        rev: None,
                        data: piece.to_string(),
                    }));
                    lock(&self.shared.cache).set(piece, candidate.clone());
                    return Ok(candidate);
                }
                Ok(EntryDoc::Leaf(existing)) => {
                    if existing.data == piece {
                        lock(&self.shared.cache).set(piece, candidate.clone());
                        return Ok(candidate);
                    }
                    tracing::debug!(id = %candidate, "fingerprint collision, probing next suffix");
                    suffix += 1;
                }
                Ok(_) => {
                    // Something that is not a leaf squats on the id.
                    suffix += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Fetch a leaf payload, optionally parking until a replicating leaf
    /// arrives.
    pub(crate) fn read_leaf(
        &self,
        db: &Arc<dyn DatabaseHandle>,
        id: &DocId,
        wait: bool,
    ) -> Result<String, StoreError> {
        if let Some(data) = lock(&self.shared.cache).rev_get(id) {
            return Ok(data);
        }
        match db.get(id) {
            Ok(EntryDoc::Leaf(leaf)) => {
                lock(&self.shared.cache).set(leaf.data.clone(), id.clone());
                Ok(leaf.data)
            }
            Ok(other) => {
                tracing::warn!(id = %id, kind = other.type_name(), "expected a leaf");
                Err(StoreError::MissingChunk { id: id.clone() })
            }
            Err(err) if err.is_not_found() => {
                if !wait {
                    return Err(StoreError::MissingChunk { id: id.clone() });
                }
                // Register before re-checking: the leaf may land between
                // the failed get and the wait.
                let arrival = self.shared.waiter.register(id);
                let ready = match db.get(id) {
                    Ok(EntryDoc::Leaf(leaf)) => {
                        lock(&self.shared.cache).set(leaf.data.clone(), id.clone());
                        return Ok(leaf.data);
                    }
                    Err(err) if err.is_not_found() => {
                        arrival.recv_timeout(LEAF_WAIT_TIMEOUT).is_ok()
                    }
                    _ => false,
                };
                if ready {
                    match db.get(id) {
                        Ok(EntryDoc::Leaf(leaf)) => {
                            lock(&self.shared.cache).set(leaf.data.clone(), id.clone());
                            return Ok(leaf.data);
                        }
                        _ => return Err(StoreError::MissingChunk { id: id.clone() }),
                    }
                }
                Err(StoreError::MissingChunk { id: id.clone() })
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::memory::MemoryDatabase;
    use crate::db::{DbError, OpenOptions, PutMode};
    use crate::host::{Host, RemoteConnection};

    struct BareHost;

    impl Host for BareHost {
        fn create_local_database(
            &self,
            name: &str,
            _options: &OpenOptions,
        ) -> Result<Option<Arc<dyn DatabaseHandle>>, DbError> {
            Ok(Some(Arc::new(MemoryDatabase::new(name))))
        }

        fn connect_remote(&self, _settings: &Settings) -> Result<RemoteConnection, String> {
            Err("no remote in this test".to_string())
        }
    }

    fn engine(name: &str, settings: Settings) -> Engine {
        Engine::new(Arc::new(BareHost), name, settings).unwrap()
    }

    fn db() -> Arc<dyn DatabaseHandle> {
        Arc::new(MemoryDatabase::new("leaves"))
    }

    #[test]
    fn identical_pieces_share_one_leaf() {
        let engine = engine("leaves-dedup", Settings::default());
        let db = db();
        let mut new_leaves = Vec::new();

        let first = engine.put_leaf(&db, "hello", &mut new_leaves).unwrap();
        let second = engine.put_leaf(&db, "hello", &mut new_leaves).unwrap();
        assert_eq!(first, second);
        assert_eq!(new_leaves.len(), 1);
    }

    #[test]
    fn encryption_changes_the_fingerprint() {
        let open = engine("leaves-fp-open", Settings::default());
        let sealed = engine(
            "leaves-fp-sealed",
            Settings {
                encrypt: true,
                passphrase: "secret".to_string(),
                ..Settings::default()
            },
        );
        let plain = open.leaf_fingerprint("piece");
        let folded = sealed.leaf_fingerprint("piece");
        assert_ne!(plain, folded);
        assert!(folded.starts_with('+'));
    }

    #[test]
    fn collisions_probe_increasing_suffixes() {
        fn constant(_bytes: &[u8]) -> u32 {
            0xdead
        }
        let engine =
            engine("leaves-collide", Settings::default()).with_leaf_hasher(constant as LeafHasher);
        let db = db();

        let mut new_leaves = Vec::new();
        let a = engine.put_leaf(&db, "aaa", &mut new_leaves).unwrap();
        db.bulk_docs(&new_leaves, PutMode::Checked).unwrap();

        let mut new_leaves = Vec::new();
        let b = engine.put_leaf(&db, "bbb", &mut new_leaves).unwrap();
        db.bulk_docs(&new_leaves, PutMode::Checked).unwrap();

        let mut new_leaves = Vec::new();
        let c = engine.put_leaf(&db, "ccc", &mut new_leaves).unwrap();

        assert_eq!(a.as_str(), "h:dead0");
        assert_eq!(b.as_str(), "h:dead1");
        assert_eq!(c.as_str(), "h:dead2");
    }

    #[test]
    fn existing_leaf_with_same_payload_is_reused() {
        let engine = engine("leaves-reuse", Settings::default());
        let db = db();

        let mut first_batch = Vec::new();
        let id = engine.put_leaf(&db, "shared", &mut first_batch).unwrap();
        db.bulk_docs(&first_batch, PutMode::Checked).unwrap();

        // Fresh engine state: cold cache, same database.
        let other = self::engine("leaves-reuse-2", Settings::default());
        let mut second_batch = Vec::new();
        let again = other.put_leaf(&db, "shared", &mut second_batch).unwrap();
        assert_eq!(id, again);
        assert!(second_batch.is_empty());
    }

    #[test]
    fn read_leaf_caches_the_payload() {
        let engine = engine("leaves-read", Settings::default());
        let db = db();
        let mut new_leaves = Vec::new();
        let id = engine.put_leaf(&db, "cached", &mut new_leaves).unwrap();
        db.bulk_docs(&new_leaves, PutMode::Checked).unwrap();

        assert_eq!(engine.read_leaf(&db, &id, false).unwrap(), "cached");
        // Second read is served from the cache even if the doc vanishes.
        let stored = db.get(&id).unwrap();
        db.remove(&id, stored.rev().unwrap()).unwrap();
        assert_eq!(engine.read_leaf(&db, &id, false).unwrap(), "cached");
    }

    #[test]
    fn missing_leaf_without_wait_is_a_missing_chunk() {
        let engine = engine("leaves-missing", Settings::default());
        let db = db();
        let err = engine
            .read_leaf(&db, &DocId::from("h:feed0"), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingChunk { .. }));
    }
}
