use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::statement::{is_stale, PgStatement};

/// Cache key: statement text plus the client-declared parameter type OIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub sql: String,
    pub param_oids: Vec<i32>,
}

impl StatementKey {
    pub fn new(sql: &str, param_oids: &[i32]) -> Self {
        Self {
            sql: sql.trim().to_string(),
            param_oids: param_oids.to_vec(),
        }
    }
}

/// Thread-safe LRU cache of generated statements.
///
/// Entries compiled against an older schema generation are dropped on
/// lookup and count as misses.
pub struct StatementCache {
    inner: Mutex<CacheInner>,
}

struct CacheEntry {
    statement: Arc<dyn PgStatement>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<StatementKey, CacheEntry>,
    capacity: usize,
    /// Logical clock for LRU ordering.
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Snapshot of statement cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_pct: f64,
}

impl StatementCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                capacity,
                tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn get(&self, key: &StatementKey, current_generation: u64) -> Option<Arc<dyn PgStatement>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        let stale = match inner.entries.get_mut(key) {
            None => {
                inner.misses += 1;
                heron_observability::record_statement_cache_lookup("miss");
                return None;
            }
            Some(entry) if is_stale(entry.statement.as_ref(), current_generation) => true,
            Some(entry) => {
                entry.last_used = tick;
                let statement = entry.statement.clone();
                inner.hits += 1;
                heron_observability::record_statement_cache_lookup("hit");
                return Some(statement);
            }
        };

        if stale {
            tracing::debug!("statement cache: dropping stale entry for {:?}", key.sql);
            inner.entries.remove(key);
            inner.misses += 1;
            heron_observability::record_statement_cache_lookup("stale");
            heron_observability::record_statement_cache_size(inner.entries.len());
        }
        None
    }

    /// Insert a statement. Statements that opt out of caching are ignored.
    pub fn insert(&self, key: StatementKey, statement: Arc<dyn PgStatement>) {
        if !statement.put_in_cache() {
            return;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.capacity == 0 {
            return;
        }

        if inner.entries.len() >= inner.capacity && !inner.entries.contains_key(&key) {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
                inner.evictions += 1;
            }
        }

        inner.tick += 1;
        let last_used = inner.tick;
        inner.entries.insert(
            key,
            CacheEntry {
                statement,
                last_used,
            },
        );
        heron_observability::record_statement_cache_size(inner.entries.len());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        heron_observability::record_statement_cache_size(0);
    }

    pub fn stats(&self) -> StatementCacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        StatementCacheStats {
            entries: inner.entries.len(),
            capacity: inner.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate_pct: if total > 0 {
                (inner.hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}
