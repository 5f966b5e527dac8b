//! Bounded bidirectional cache between leaf payloads and leaf ids.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::model::DocId;

/// Hot map in both directions: payload → id for the write path (skip the
/// probe entirely on a hit) and id → payload for the read path.
pub struct HashCache {
    by_data: LruCache<String, DocId>,
    by_id: LruCache<DocId, String>,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            by_data: LruCache::new(capacity),
            by_id: LruCache::new(capacity),
        }
    }

    pub fn set(&mut self, data: impl Into<String>, id: DocId) {
        let data = data.into();
        self.by_data.put(data.clone(), id.clone());
        self.by_id.put(id, data);
    }

    pub fn get(&mut self, data: &str) -> Option<DocId> {
        self.by_data.get(data).cloned()
    }

    pub fn rev_get(&mut self, id: &DocId) -> Option<String> {
        self.by_id.get(id).cloned()
    }

    pub fn clear(&mut self) {
        self.by_data.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_both_directions() {
        let mut cache = HashCache::new(4);
        cache.set("hello", DocId::from("h:aa0"));
        assert_eq!(cache.get("hello"), Some(DocId::from("h:aa0")));
        assert_eq!(
            cache.rev_get(&DocId::from("h:aa0")),
            Some("hello".to_string())
        );
        assert_eq!(cache.get("other"), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = HashCache::new(2);
        cache.set("a", DocId::from("h:a0"));
        cache.set("b", DocId::from("h:b0"));
        // Touch "a" so "b" is the eviction candidate.
        cache.get("a");
        cache.set("c", DocId::from("h:c0"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }
}
