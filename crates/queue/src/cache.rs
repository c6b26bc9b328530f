//! Result cache with LRU eviction, lazy TTL expiry and a deduplication
//! window keyed by request fingerprint.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sluice_core::{CacheSection, Request};
use tracing::debug;

/// A cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub ttl: Duration,
    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl CacheEntry {
    fn new(key: String, value: Value, ttl: Duration, now: Instant) -> Self {
        Self {
            key,
            value,
            ttl,
            created_at: now,
            created_wall: Utc::now(),
            access_count: 0,
            last_accessed: now,
        }
    }

    /// Expired once `ttl` has fully elapsed.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    fn remaining_at(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.saturating_duration_since(self.created_at))
    }
}

/// Serializable form of a live entry, with TTL relative to export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub value: Value,
    pub remaining_ttl: Duration,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ── Fingerprint ───────────────────────────────────────────────

/// SHA-256 over `type \0 canonical-json(payload)`, hex encoded.
pub fn fingerprint(request_type: &str, payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(request_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// JSON with object keys sorted, independent of map ordering features.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Cache key for a request: its explicit key, or the content fingerprint.
pub fn cache_key(request: &Request) -> String {
    request
        .cache
        .key
        .clone()
        .unwrap_or_else(|| fingerprint(&request.request_type, &request.payload))
}

// ── Cache ─────────────────────────────────────────────────────

pub struct RequestCache {
    entries: LruCache<String, CacheEntry>,
    default_ttl: Duration,
    dedup_window: Duration,
    stats: CacheStats,
}

impl RequestCache {
    pub fn new(config: &CacheSection) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            default_ttl: config.default_ttl(),
            dedup_window: config.dedup_window(),
            stats: CacheStats {
                capacity: capacity.get(),
                ..CacheStats::default()
            },
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// True if a live entry for the request's key was created within the
    /// deduplication window.
    pub fn is_duplicate(&self, request: &Request) -> bool {
        self.is_duplicate_key_at(&cache_key(request), Instant::now())
    }

    pub fn is_duplicate_key_at(&self, key: &str, now: Instant) -> bool {
        self.entries.peek(key).is_some_and(|e| {
            !e.is_expired_at(now) && now.saturating_duration_since(e.created_at) < self.dedup_window
        })
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Look up and promote; an expired entry is dropped and counts as a miss.
    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<Value> {
        let expired = match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.access_count += 1;
                entry.last_accessed = now;
                self.stats.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
            self.stats.expirations += 1;
        }
        self.stats.misses += 1;
        None
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.set_at(key, value, ttl, Instant::now());
    }

    /// Insert, evicting the least-recently-used entry when full.
    pub fn set_at(&mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>, now: Instant) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry::new(key.clone(), value, ttl, now);
        if let Some((evicted, _)) = self.entries.push(key.clone(), entry) {
            if evicted != key {
                self.stats.evictions += 1;
                debug!(key = %evicted, "cache eviction");
            }
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.stats.expirations += expired.len() as u64;
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats.clone()
        }
    }

    // ── Persistence handoff ───────────────────────────────────

    /// Live entries, least recently used first.
    pub fn export_at(&self, now: Instant) -> Vec<CacheRecord> {
        self.entries
            .iter()
            .rev()
            .filter(|(_, e)| !e.is_expired_at(now))
            .map(|(key, e)| CacheRecord {
                key: key.clone(),
                value: e.value.clone(),
                remaining_ttl: e.remaining_at(now),
                created_at: e.created_wall,
                access_count: e.access_count,
            })
            .collect()
    }

    /// Restore records; those with no TTL left are skipped. Returns the
    /// number imported.
    pub fn import_at(&mut self, records: Vec<CacheRecord>, now: Instant) -> usize {
        let mut imported = 0;
        for record in records {
            if record.remaining_ttl.is_zero() {
                continue;
            }
            let mut entry = CacheEntry::new(record.key.clone(), record.value, record.remaining_ttl, now);
            entry.created_wall = record.created_at;
            entry.access_count = record.access_count;
            if let Some((evicted, _)) = self.entries.push(record.key.clone(), entry) {
                if evicted != record.key {
                    self.stats.evictions += 1;
                }
            }
            imported += 1;
        }
        imported
    }
}
