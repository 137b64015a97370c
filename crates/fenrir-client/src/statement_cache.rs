//! Prepared statement tracking with LRU eviction.
//!
//! Named statements live on the server until closed or until the session
//! ends. The cache bounds how many a connection keeps open:
//!
//! 1. `prepare` registers the statement; when the cache is full, the least
//!    recently used entry is evicted and closed on the server in the same
//!    round-trip as the new `Parse`
//! 2. `execute_prepared` looks the name up (refreshing its LRU position);
//!    an unknown name fails before any I/O
//! 3. `reset` clears the cache, since a new session has no statements

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

/// Default maximum number of prepared statements per connection.
pub const DEFAULT_MAX_STATEMENTS: usize = 256;

/// A prepared statement known to the server.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    name: String,
    sql: String,
    created_at: Instant,
}

impl PreparedStatement {
    /// Create a new prepared statement record.
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            created_at: Instant::now(),
        }
    }

    /// Get the statement name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get the age of this statement.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// LRU cache of prepared statements keyed by name.
pub struct StatementCache {
    cache: LruCache<String, PreparedStatement>,
    hits: u64,
    misses: u64,
}

impl StatementCache {
    /// Create a cache holding at most `max_size` statements (at least one).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a statement by name, updating LRU order.
    pub fn get(&mut self, name: &str) -> Option<&PreparedStatement> {
        match self.cache.get(name) {
            Some(stmt) => {
                self.hits += 1;
                tracing::trace!(statement = name, "statement cache hit");
                Some(stmt)
            }
            None => {
                self.misses += 1;
                tracing::trace!(statement = name, "statement cache miss");
                None
            }
        }
    }

    /// Check for a statement without updating LRU order.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.cache.contains(name)
    }

    /// The statement that the next insertion of `name` would evict, if any.
    ///
    /// Re-preparing an existing name replaces it in place and evicts nothing.
    #[must_use]
    pub fn eviction_candidate(&self, name: &str) -> Option<&str> {
        if self.cache.contains(name) || self.cache.len() < self.cache.cap().get() {
            return None;
        }
        self.cache.peek_lru().map(|(key, _)| key.as_str())
    }

    /// Insert a statement; returns the evicted statement, if one was removed.
    pub fn insert(&mut self, stmt: PreparedStatement) -> Option<PreparedStatement> {
        tracing::debug!(statement = stmt.name(), "caching prepared statement");
        let name = stmt.name.clone();
        match self.cache.push(name.clone(), stmt) {
            Some((key, evicted)) if key != name => Some(evicted),
            // Same key: the old entry was replaced, nothing was evicted.
            _ => None,
        }
    }

    /// Remove a statement.
    pub fn remove(&mut self, name: &str) -> Option<PreparedStatement> {
        self.cache.pop(name)
    }

    /// Forget every statement.
    pub fn clear(&mut self) {
        let count = self.cache.len();
        self.cache.clear();
        tracing::debug!(count, "cleared statement cache");
    }

    /// Get the number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Get the maximum cache size.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.cache.cap().get()
    }

    /// Get the number of cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Get the number of cache misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATEMENTS)
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.cache.len())
            .field("max_size", &self.max_size())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_cache_new() {
        let cache = StatementCache::new(10);
        assert_eq!(cache.max_size(), 10);
        assert!(cache.is_empty());
        assert_eq!(StatementCache::new(0).max_size(), 1);
    }

    #[test]
    fn test_statement_cache_insert_and_get() {
        let mut cache = StatementCache::new(10);
        cache.insert(PreparedStatement::new("by_id", "SELECT * FROM users WHERE id = $1"));

        assert_eq!(cache.get("by_id").unwrap().sql(), "SELECT * FROM users WHERE id = $1");
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_statement_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);
        cache.insert(PreparedStatement::new("s1", "SELECT 1"));
        cache.insert(PreparedStatement::new("s2", "SELECT 2"));

        // Touch s1 so s2 becomes least recently used.
        cache.get("s1");
        assert_eq!(cache.eviction_candidate("s3"), Some("s2"));

        let evicted = cache.insert(PreparedStatement::new("s3", "SELECT 3"));
        assert_eq!(evicted.unwrap().name(), "s2");
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("s1"));
        assert!(cache.contains("s3"));
    }

    #[test]
    fn test_reprepare_replaces_without_eviction() {
        let mut cache = StatementCache::new(2);
        cache.insert(PreparedStatement::new("s1", "SELECT 1"));
        cache.insert(PreparedStatement::new("s2", "SELECT 2"));

        assert_eq!(cache.eviction_candidate("s1"), None);
        assert!(cache.insert(PreparedStatement::new("s1", "SELECT 10")).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("s1").unwrap().sql(), "SELECT 10");
    }

    #[test]
    fn test_statement_cache_clear_and_remove() {
        let mut cache = StatementCache::new(10);
        cache.insert(PreparedStatement::new("s1", "SELECT 1"));
        cache.insert(PreparedStatement::new("s2", "SELECT 2"));

        assert_eq!(cache.remove("s1").unwrap().name(), "s1");
        cache.clear();
        assert!(cache.is_empty());
    }
}
