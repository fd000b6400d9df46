//! LRU cache of server-side prepared statements.
//!
//! Keyed by SQL text. Inserting beyond capacity evicts the least recently
//! used entry and hands it back so the connection can close it on the
//! server. Statement ids are only meaningful on the connection that
//! created them, so the cache belongs to one physical connection.

use std::collections::HashMap;
use std::sync::Arc;

use crate::statement::ServerStatement;

#[derive(Debug)]
struct CacheEntry {
    statement: Arc<ServerStatement>,
    last_used: u64,
}

#[derive(Debug)]
pub struct StatementCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    tick: u64,
}

impl StatementCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(256)),
            capacity,
            tick: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Look up a live statement and mark it most recently used.
    pub fn get(&mut self, sql: &str) -> Option<Arc<ServerStatement>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(sql)?;
        if entry.statement.is_released() {
            self.entries.remove(sql);
            return None;
        }
        entry.last_used = tick;
        Some(Arc::clone(&entry.statement))
    }

    /// Cache `statement`. Returns the evicted entry, if any.
    #[must_use = "evicted statements must be closed on the server"]
    pub fn insert(&mut self, statement: Arc<ServerStatement>) -> Option<Arc<ServerStatement>> {
        if !self.is_enabled() {
            return None;
        }
        self.tick += 1;
        let evicted = if !self.entries.contains_key(&statement.sql)
            && self.entries.len() >= self.capacity
        {
            self.evict_lru()
        } else {
            None
        };
        let replaced = self.entries.insert(
            statement.sql.clone(),
            CacheEntry {
                statement,
                last_used: self.tick,
            },
        );
        evicted.or(replaced.map(|entry| entry.statement))
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql)
    }

    /// Whether this exact statement object is the cached one.
    pub fn holds(&self, statement: &Arc<ServerStatement>) -> bool {
        self.entries
            .get(&statement.sql)
            .is_some_and(|entry| Arc::ptr_eq(&entry.statement, statement))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, returning them for closing.
    pub fn drain(&mut self) -> Vec<Arc<ServerStatement>> {
        self.entries.drain().map(|(_, entry)| entry.statement).collect()
    }

    fn evict_lru(&mut self) -> Option<Arc<ServerStatement>> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        let entry = self.entries.remove(&key)?;
        tracing::debug!(
            statement_id = entry.statement.statement_id,
            sql = %key,
            "evicting prepared statement"
        );
        Some(entry.statement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(id: u32, sql: &str) -> Arc<ServerStatement> {
        Arc::new(ServerStatement::new(id, sql.to_string(), Vec::new(), Vec::new()))
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = StatementCache::new(2);
        assert!(cache.insert(stmt(1, "a")).is_none());
        assert!(cache.insert(stmt(2, "b")).is_none());
        assert!(cache.get("a").is_some());

        let evicted = cache.insert(stmt(3, "c")).unwrap();
        assert_eq!(evicted.statement_id, 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn disabled_cache_keeps_nothing() {
        let mut cache = StatementCache::new(0);
        assert!(cache.insert(stmt(1, "a")).is_none());
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn released_entries_are_dropped_on_lookup() {
        let mut cache = StatementCache::new(4);
        let s = stmt(1, "a");
        let _ = cache.insert(Arc::clone(&s));
        s.release();
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn drain_returns_everything() {
        let mut cache = StatementCache::new(4);
        let _ = cache.insert(stmt(1, "a"));
        let _ = cache.insert(stmt(2, "b"));
        let mut ids: Vec<u32> = cache.drain().iter().map(|s| s.statement_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);
        assert!(cache.is_empty());
    }
}
