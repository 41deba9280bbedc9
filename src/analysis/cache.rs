//! In-process parse cache.
//!
//! Keeps the most recent parse per file so downstream consumers (and repeat
//! runs over unchanged files) skip re-parsing. Entries are keyed by
//! workspace-relative path and stamped with the content hash that produced
//! them; a lookup with a different hash misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use crate::analysis::ParsedSource;

struct CacheEntry {
    content_hash: String,
    parsed: Arc<ParsedSource>,
    last_access: Instant,
}

pub struct ParseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
}

impl ParseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, file_path: &str, content_hash: &str) -> Option<Arc<ParsedSource>> {
        let mut entries = self.entries.lock().expect("parse cache poisoned");
        let entry = entries.get_mut(file_path)?;
        if entry.content_hash != content_hash {
            return None;
        }
        entry.last_access = Instant::now();
        Some(entry.parsed.clone())
    }

    pub fn put(&self, file_path: &str, content_hash: &str, parsed: Arc<ParsedSource>) {
        let mut entries = self.entries.lock().expect("parse cache poisoned");
        while entries.len() >= self.capacity && !entries.contains_key(file_path) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
        entries.insert(
            file_path.to_string(),
            CacheEntry {
                content_hash: content_hash.to_string(),
                parsed,
                last_access: Instant::now(),
            },
        );
    }

    pub fn remove(&self, file_path: &str) {
        let mut entries = self.entries.lock().expect("parse cache poisoned");
        entries.remove(file_path);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("parse cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(path: &str) -> Arc<ParsedSource> {
        Arc::new(ParsedSource {
            file_path: path.to_string(),
            tree: Arc::new(()),
            errors: Vec::new(),
            source_text: Arc::from(""),
        })
    }

    #[test]
    fn hit_requires_matching_hash() {
        let cache = ParseCache::new(10);
        cache.put("src/a.ts", "hash-1", parsed("src/a.ts"));

        assert!(cache.get("src/a.ts", "hash-1").is_some());
        assert!(cache.get("src/a.ts", "hash-2").is_none());
        assert!(cache.get("src/b.ts", "hash-1").is_none());
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = ParseCache::new(2);
        cache.put("a", "h", parsed("a"));
        cache.put("b", "h", parsed("b"));
        // Touch `a` so `b` becomes the eviction candidate.
        cache.get("a", "h");
        cache.put("c", "h", parsed("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", "h").is_some());
        assert!(cache.get("b", "h").is_none());
        assert!(cache.get("c", "h").is_some());
    }

    #[test]
    fn reinsert_replaces_without_evicting_self() {
        let cache = ParseCache::new(1);
        cache.put("a", "h1", parsed("a"));
        cache.put("a", "h2", parsed("a"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a", "h2").is_some());
    }

    #[test]
    fn remove_drops_entry() {
        let cache = ParseCache::new(4);
        cache.put("a", "h", parsed("a"));
        cache.remove("a");
        assert!(cache.is_empty());
    }
}
