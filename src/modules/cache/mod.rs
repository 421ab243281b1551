//! Response cache and stage bookkeeping.
//!
//! Stores fetched payloads with a TTL and, independently of freshness, the
//! set of pipeline stages that have already handled each key. The store is
//! in-memory with optional write-through persistence to a redb file, so stage
//! markers survive restarts.

pub mod keys;
mod persist;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

use persist::CacheBackend;

/// Default lifetime of a placeholder created only to carry stage markers.
const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] redb::Error),
    #[error("cache entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("cache directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// `None` for placeholders that only track stages.
    pub payload: Option<Value>,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
    /// Stage name mapped to the time it was marked.
    pub processed_stages: BTreeMap<String, DateTime<Utc>>,
}

impl CacheEntry {
    fn new(key: &str, payload: Option<Value>, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            payload,
            stored_at: Utc::now(),
            ttl,
            processed_stages: BTreeMap::new(),
        }
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now - self.stored_at < chrono_duration(self.ttl)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn is_processed(&self, stage: &str) -> bool {
        self.processed_stages.contains_key(stage)
    }
}

/// Result of [`CacheStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit { payload: Value, fresh: bool },
    Miss,
}

impl CacheLookup {
    /// Payload only when it is still fresh.
    pub fn fresh(self) -> Option<Value> {
        match self {
            CacheLookup::Hit {
                payload,
                fresh: true,
            } => Some(payload),
            _ => None,
        }
    }
}

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Entries removed entirely.
    pub removed: usize,
    /// Stale entries whose payload was dropped but whose stage markers are
    /// still within the marker TTL.
    pub demoted: usize,
}

/// Thread-safe cache store. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct CacheStore {
    entries: Arc<RwLock<BTreeMap<String, CacheEntry>>>,
    backend: Option<Arc<CacheBackend>>,
    marker_ttl: Duration,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("persistent", &self.backend.is_some())
            .field("marker_ttl", &self.marker_ttl)
            .finish()
    }
}

impl CacheStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            backend: None,
            marker_ttl: DEFAULT_MARKER_TTL,
        }
    }

    /// Store backed by a redb file; existing entries are loaded eagerly.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let backend = CacheBackend::open(path.as_ref())?;
        let entries = backend.load()?;
        log::debug!(
            "loaded {} cache entries from {}",
            entries.len(),
            path.as_ref().display()
        );
        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            backend: Some(Arc::new(backend)),
            marker_ttl: DEFAULT_MARKER_TTL,
        })
    }

    pub fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entry: &CacheEntry) {
        if let Some(backend) = &self.backend
            && let Err(err) = backend.save(entry)
        {
            log::warn!("failed to persist cache entry {}: {}", entry.key, err);
        }
    }

    fn forget(&self, key: &str) {
        if let Some(backend) = &self.backend
            && let Err(err) = backend.remove(key)
        {
            log::warn!("failed to remove cache entry {}: {}", key, err);
        }
    }

    /// Mutate (or create) the entry for `key` under the write lock and
    /// persist the result before releasing it.
    fn update<F>(&self, key: &str, create: impl FnOnce() -> CacheEntry, f: F)
    where
        F: FnOnce(&mut CacheEntry),
    {
        let mut guard = self.write();
        let entry = guard.entry(key.to_string()).or_insert_with(create);
        f(entry);
        self.persist(entry);
    }

    pub fn get(&self, key: &str) -> CacheLookup {
        let now = Utc::now();
        self.read()
            .get(key)
            .and_then(|entry| {
                entry.payload.clone().map(|payload| CacheLookup::Hit {
                    payload,
                    fresh: entry.is_fresh_at(now),
                })
            })
            .unwrap_or(CacheLookup::Miss)
    }

    /// Snapshot of the full entry, placeholders included.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.read().get(key).cloned()
    }

    /// Store `payload` under `key`, resetting `stored_at`. Stage markers of an
    /// existing entry are kept.
    pub fn put(&self, key: &str, payload: Value, ttl: Duration) {
        self.update(
            key,
            || CacheEntry::new(key, None, ttl),
            move |entry| {
                entry.payload = Some(payload);
                entry.stored_at = Utc::now();
                entry.ttl = ttl;
            },
        );
    }

    pub fn mark_processed(&self, key: &str, stage: &str) {
        let marker_ttl = self.marker_ttl;
        self.update(
            key,
            || CacheEntry::new(key, None, marker_ttl),
            |entry| {
                entry
                    .processed_stages
                    .entry(stage.to_string())
                    .or_insert_with(Utc::now);
            },
        );
    }

    pub fn is_processed(&self, key: &str, stage: &str) -> bool {
        self.read()
            .get(key)
            .map(|entry| entry.is_processed(stage))
            .unwrap_or(false)
    }

    /// Clear a single stage marker. Returns whether it was present.
    pub fn reset_processed(&self, key: &str, stage: &str) -> bool {
        let mut guard = self.write();
        let Some(entry) = guard.get_mut(key) else {
            return false;
        };
        let removed = entry.processed_stages.remove(stage).is_some();
        if removed {
            self.persist(entry);
        }
        removed
    }

    pub fn processed_stages(&self, key: &str) -> Vec<String> {
        self.read()
            .get(key)
            .map(|entry| entry.processed_stages.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Lazy, ordered cursor over keys lacking `stage`.
    pub fn list_unprocessed(&self, stage: impl Into<String>) -> UnprocessedKeys {
        UnprocessedKeys {
            store: self.clone(),
            stage: stage.into(),
            cursor: None,
        }
    }

    pub fn prune_expired(&self) -> PruneReport {
        self.prune_expired_at(Utc::now())
    }

    /// Drop entries whose TTL elapsed before `now`. Stale entries that still
    /// carry live stage markers lose their payload but keep the markers.
    pub fn prune_expired_at(&self, now: DateTime<Utc>) -> PruneReport {
        let marker_ttl = chrono_duration(self.marker_ttl);
        let mut report = PruneReport::default();
        let mut guard = self.write();
        let mut removed = Vec::new();

        for (key, entry) in guard.iter_mut() {
            if entry.is_fresh_at(now) {
                continue;
            }
            let markers_live = entry
                .processed_stages
                .values()
                .any(|marked| now - *marked < marker_ttl);
            if !markers_live {
                removed.push(key.clone());
            } else if entry.payload.take().is_some() {
                report.demoted += 1;
                self.persist(entry);
            }
        }

        for key in removed {
            guard.remove(&key);
            self.forget(&key);
            report.removed += 1;
        }

        if report.removed + report.demoted > 0 {
            log::info!(
                "cache prune removed {} entries, demoted {}",
                report.removed,
                report.demoted
            );
        }
        report
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor returned by [`CacheStore::list_unprocessed`].
///
/// Each step consults the live store, so keys inserted past the cursor while
/// iterating are still yielded and keys marked in the meantime are skipped.
#[derive(Debug, Clone)]
pub struct UnprocessedKeys {
    store: CacheStore,
    stage: String,
    cursor: Option<String>,
}

impl UnprocessedKeys {
    /// Rewind to the first key.
    pub fn restart(&mut self) {
        self.cursor = None;
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }
}

impl Iterator for UnprocessedKeys {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let found = {
            let entries = self.store.read();
            let lower = match self.cursor.as_deref() {
                Some(cursor) => Bound::Excluded(cursor),
                None => Bound::Unbounded,
            };
            entries
                .range::<str, _>((lower, Bound::Unbounded))
                .find(|(_, entry)| !entry.is_processed(&self.stage))
                .map(|(key, _)| key.clone())
        };
        if let Some(key) = &found {
            self.cursor = Some(key.clone());
        }
        found
    }
}
