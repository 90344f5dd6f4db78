//! The in-memory response cache.
//!
//! Entries live in a `DashMap` keyed by the SHA-256 identity hash, with
//! secondary indices from tag and route to key sets so invalidation never
//! scans the whole store. Expired entries are rejected on read and removed
//! by a periodic sweep, so memory is reclaimed even for keys nobody asks
//! for again.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use relay_config::CacheSettings;
use relay_core::{ProxyResponse, RouteId};
use relay_resilience::{Clock, SystemClock};

use crate::error::CacheError;

/// The cacheable part of an upstream response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Upstream status.
    pub status: StatusCode,
    /// Response headers as stored.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl CachedResponse {
    /// Replays the stored response as a cache hit.
    #[must_use]
    pub fn to_proxy_response(&self) -> ProxyResponse {
        ProxyResponse::cached(self.status, self.headers.clone(), self.body.clone())
    }
}

#[derive(Debug)]
struct CacheEntry {
    response: CachedResponse,
    /// Request path the entry was stored under, matched by pattern
    /// invalidation. Keys themselves are opaque hashes.
    path: String,
    route: RouteId,
    tags: Vec<String>,
    /// Hex SHA-256 of the body. A rewrite with an unchanged hash is a
    /// refresh rather than a replacement.
    content_hash: String,
    created_at: Instant,
    last_access: Instant,
    expires_at: Instant,
    hits: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counter snapshot served by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live entries, including not-yet-swept expired ones.
    pub entries: usize,
    /// Lookups answered from the store.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries dropped to stay under the capacity ceiling.
    pub evictions: u64,
    /// Entries removed because their TTL had passed.
    pub expired: u64,
    /// Entries removed by invalidation of any scope.
    pub invalidated: u64,
}

/// TTL-bound response store with tag and route indices.
#[derive(Debug)]
pub struct ResponseCache {
    clock: Arc<dyn Clock>,
    entries: DashMap<String, CacheEntry>,
    tag_index: DashMap<String, HashSet<String>>,
    route_index: DashMap<RouteId, HashSet<String>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
}

impl ResponseCache {
    /// Creates a cache on the system clock.
    #[must_use]
    pub fn new(settings: &CacheSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Creates a cache reading time from `clock`.
    #[must_use]
    pub fn with_clock(settings: &CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
            tag_index: DashMap::new(),
            route_index: DashMap::new(),
            max_entries: settings.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    /// Returns the stored response for `key`, or `None` for absent and
    /// expired entries. Expired entries are removed on the spot.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let now = self.clock.now();

        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if !entry.is_expired(now) {
                    entry.hits += 1;
                    entry.last_access = now;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.response.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.remove_entry(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores a response under `key`. Writing an existing key replaces the
    /// entry wholesale and restarts its TTL; the old entry's tags are
    /// dropped from the indices first. When the body is byte-identical to
    /// the old entry the hit history and creation time carry over.
    pub fn store(
        &self,
        key: impl Into<String>,
        route: &RouteId,
        path: impl Into<String>,
        response: CachedResponse,
        ttl: Duration,
        tags: &[String],
    ) {
        let key = key.into();
        let now = self.clock.now();
        let content_hash = body_digest(&response.body);

        // Replace-in-place keeps the write idempotent.
        let previous = self.take_entry(&key);
        self.evict_for_capacity();

        let (created_at, hits) = match previous {
            Some(old) if old.content_hash == content_hash => (old.created_at, old.hits),
            _ => (now, 0),
        };

        let entry = CacheEntry {
            response,
            path: path.into(),
            route: route.clone(),
            tags: tags.to_vec(),
            content_hash,
            created_at,
            last_access: now,
            expires_at: now + ttl,
            hits,
        };

        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.route_index
            .entry(route.clone())
            .or_default()
            .insert(key.clone());
        self.entries.insert(key, entry);
    }

    /// Removes one key. Returns how many entries were dropped (0 or 1).
    pub fn invalidate_key(&self, key: &str) -> usize {
        let removed = usize::from(self.remove_entry(key));
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Removes every entry whose request path matches the glob `pattern`
    /// (`*` spans any run of characters).
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let regex = compile_glob(pattern)?;
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| regex.is_match(&entry.path))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(self.remove_all(&matching))
    }

    /// Removes every entry carrying `tag`.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let Some((_, keys)) = self.tag_index.remove(tag) else {
            return 0;
        };
        let keys: Vec<String> = keys.into_iter().collect();
        self.remove_all(&keys)
    }

    /// Removes every entry stored for `route`.
    pub fn invalidate_route(&self, route: &RouteId) -> usize {
        let Some((_, keys)) = self.route_index.remove(route) else {
            return 0;
        };
        let keys: Vec<String> = keys.into_iter().collect();
        self.remove_all(&keys)
    }

    /// Drops everything.
    pub fn invalidate_all(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.tag_index.clear();
        self.route_index.clear();
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, "cache flushed");
        removed
    }

    /// Removes up to `batch` expired entries. Returns how many went.
    pub fn sweep(&self, batch: usize) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .take(batch.max(1))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in &expired {
            if self.remove_entry(key) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Periodic sweep driver, spawned once at startup.
    pub async fn sweep_loop(self: Arc<Self>, interval: Duration, batch: usize) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep(batch);
        }
    }

    /// Live entry count, including not-yet-swept expired entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }

    fn remove_all(&self, keys: &[String]) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.remove_entry(key) {
                removed += 1;
            }
        }
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn remove_entry(&self, key: &str) -> bool {
        self.take_entry(key).is_some()
    }

    /// Removes an entry and de-indexes it. The entry lock is released
    /// before the index maps are touched.
    fn take_entry(&self, key: &str) -> Option<CacheEntry> {
        let (key, entry) = self.entries.remove(key)?;
        for tag in &entry.tags {
            let emptied = self.tag_index.get_mut(tag).is_some_and(|mut keys| {
                keys.remove(&key);
                keys.is_empty()
            });
            if emptied {
                self.tag_index.remove_if(tag, |_, set| set.is_empty());
            }
        }
        let emptied = self.route_index.get_mut(&entry.route).is_some_and(|mut keys| {
            keys.remove(&key);
            keys.is_empty()
        });
        if emptied {
            self.route_index.remove_if(&entry.route, |_, set| set.is_empty());
        }
        Some(entry)
    }

    /// Makes room for one insertion by dropping the least recently used
    /// entries once the ceiling is reached; among equally stale entries
    /// the ones closest to expiry go first.
    fn evict_for_capacity(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let overshoot = self.entries.len() - self.max_entries + 1;
        let mut victims: Vec<(String, (Instant, Instant))> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), (entry.last_access, entry.expires_at)))
            .collect();
        victims.sort_by_key(|(_, order)| *order);

        let mut evicted = 0;
        for (key, _) in victims.into_iter().take(overshoot) {
            if self.remove_entry(&key) {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, "evicted cache entries at capacity");
    }
}

/// Hex SHA-256 of a stored body.
fn body_digest(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut hash = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hash, "{byte:02x}");
    }
    hash
}

/// Compiles a glob into an anchored regex; `*` spans any run of characters.
fn compile_glob(pattern: &str) -> Result<regex::Regex, CacheError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            expr.push_str(".*");
        }
        expr.push_str(&regex::escape(part));
    }
    expr.push('$');
    regex::Regex::new(&expr).map_err(|source| CacheError::invalid_pattern(pattern, source))
}
