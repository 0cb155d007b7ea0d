//! Layered cache: an in-memory namespaced map with per-entry TTL and
//! persistence levels, typed API-response caches, and the content-addressed
//! summarization memo. Persistence goes through the storage router's
//! `cache_storage` / `api_cache` / `summaries` tables.
//!
//! Failure model: storage I/O errors degrade to a miss on reads and a
//! warning on writes; the in-memory layer keeps serving either way.

pub mod summary;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use govorun_storage::types::CacheRow;
use govorun_storage::StorageRouter;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown persistence level: {0}")]
    UnknownPersistence(String),
}

/// When (if ever) an entry is written to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceLevel {
    /// Never persisted; the cache is the authority for this entry.
    MemoryOnly,
    /// Written through synchronously on every set.
    OnChange,
    /// Marked dirty on set, flushed by the periodic worker.
    Periodic,
    /// Marked dirty on set, flushed on graceful stop only.
    OnShutdown,
}

impl PersistenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceLevel::MemoryOnly => "memory-only",
            PersistenceLevel::OnChange => "on-change",
            PersistenceLevel::Periodic => "periodic",
            PersistenceLevel::OnShutdown => "on-shutdown",
        }
    }
}

impl std::str::FromStr for PersistenceLevel {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory-only" => Ok(PersistenceLevel::MemoryOnly),
            "on-change" => Ok(PersistenceLevel::OnChange),
            "periodic" => Ok(PersistenceLevel::Periodic),
            "on-shutdown" => Ok(PersistenceLevel::OnShutdown),
            other => Err(CacheError::UnknownPersistence(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Unix seconds.
    created_at: i64,
    ttl: Option<Duration>,
    access_count: u64,
    dirty: bool,
    persistence: PersistenceLevel,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => now - self.created_at >= ttl.as_secs() as i64,
            None => false,
        }
    }
}

/// Metadata returned alongside a cached value.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub created_at: i64,
    pub access_count: u64,
    pub persistence: PersistenceLevel,
}

type Namespace = Arc<Mutex<HashMap<String, Entry>>>;

pub struct Cache {
    namespaces: DashMap<String, Namespace>,
    router: Arc<StorageRouter>,
}

impl Cache {
    pub fn new(router: Arc<StorageRouter>) -> Self {
        Self {
            namespaces: DashMap::new(),
            router,
        }
    }

    /// Load persisted entries into memory. Entries start clean — a key left
    /// dirty by a crashed session is authoritative in the store already.
    /// Expired rows are skipped and lazily deleted on next access.
    pub fn load_from_store(&self) {
        let rows = match self.router.cache_dump() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "cache preload failed; starting empty");
                return;
            }
        };
        let now = now_unix();
        let mut loaded = 0usize;
        for row in rows {
            let Ok(persistence) = row.persistence.parse::<PersistenceLevel>() else {
                warn!(namespace = %row.namespace, key = %row.key, "skipping row with bad persistence level");
                continue;
            };
            let entry = Entry {
                value: row.value,
                created_at: row.created_at,
                ttl: row.ttl_secs.map(|s| Duration::from_secs(s.max(0) as u64)),
                access_count: 0,
                dirty: false,
                persistence,
            };
            if entry.is_expired(now) {
                continue;
            }
            self.namespace(&row.namespace)
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(row.key, entry);
            loaded += 1;
        }
        info!(entries = loaded, "cache preloaded from store");
    }

    /// Read a value. An expired entry counts as a miss and is removed,
    /// from the backing store too when it was ever persisted.
    pub fn get(&self, namespace: &str, key: &str) -> Option<(String, EntryMeta)> {
        let ns = self.namespace(namespace);
        let mut map = ns.lock().unwrap_or_else(|p| p.into_inner());
        let now = now_unix();

        let expired = match map.get_mut(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.access_count += 1;
                return Some((
                    entry.value.clone(),
                    EntryMeta {
                        created_at: entry.created_at,
                        access_count: entry.access_count,
                        persistence: entry.persistence,
                    },
                ));
            }
            None => false,
        };

        if expired {
            let entry = map.remove(key);
            drop(map);
            if entry.is_some_and(|e| e.persistence != PersistenceLevel::MemoryOnly) {
                if let Err(e) = self.router.cache_delete(namespace, key, None) {
                    warn!(namespace, key, error = %e, "failed to delete expired cache row");
                }
            }
        }
        None
    }

    /// Store a value. `OnChange` entries are written through before returning.
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
        persistence: PersistenceLevel,
    ) {
        let value = value.into();
        let created_at = now_unix();
        let entry = Entry {
            value: value.clone(),
            created_at,
            ttl,
            access_count: 0,
            dirty: persistence != PersistenceLevel::MemoryOnly
                && persistence != PersistenceLevel::OnChange,
            persistence,
        };
        self.namespace(namespace)
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), entry);

        if persistence == PersistenceLevel::OnChange {
            let row = CacheRow {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value,
                created_at,
                ttl_secs: ttl.map(|t| t.as_secs() as i64),
                persistence: persistence.as_str().to_string(),
            };
            if let Err(e) = self.router.cache_upsert(&row, None) {
                warn!(namespace, key, error = %e, "write-through cache persist failed");
            }
        }
    }

    pub fn delete(&self, namespace: &str, key: &str) {
        let removed = self
            .namespace(namespace)
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        if removed.is_some_and(|e| e.persistence != PersistenceLevel::MemoryOnly) {
            if let Err(e) = self.router.cache_delete(namespace, key, None) {
                warn!(namespace, key, error = %e, "cache row delete failed");
            }
        }
    }

    pub fn clear(&self, namespace: &str) {
        if let Some(ns) = self.namespaces.get(namespace) {
            ns.lock().unwrap_or_else(|p| p.into_inner()).clear();
        }
        if let Err(e) = self.router.cache_clear(namespace, None) {
            warn!(namespace, error = %e, "cache namespace clear failed");
        }
    }

    /// Flush dirty entries at the given levels. Takes a snapshot under each
    /// namespace lock, releases it before I/O, and clears the dirty flag only
    /// when the entry was not overwritten meanwhile.
    pub fn flush(&self, levels: &[PersistenceLevel]) {
        for ns_ref in self.namespaces.iter() {
            let namespace = ns_ref.key().clone();
            let snapshot: Vec<(String, Entry)> = {
                let map = ns_ref.value().lock().unwrap_or_else(|p| p.into_inner());
                map.iter()
                    .filter(|(_, e)| e.dirty && levels.contains(&e.persistence))
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect()
            };
            if snapshot.is_empty() {
                continue;
            }
            debug!(namespace = %namespace, entries = snapshot.len(), "flushing cache namespace");
            for (key, entry) in snapshot {
                let row = CacheRow {
                    namespace: namespace.clone(),
                    key: key.clone(),
                    value: entry.value.clone(),
                    created_at: entry.created_at,
                    ttl_secs: entry.ttl.map(|t| t.as_secs() as i64),
                    persistence: entry.persistence.as_str().to_string(),
                };
                if let Err(e) = self.router.cache_upsert(&row, None) {
                    warn!(namespace = %namespace, key = %key, error = %e, "cache flush write failed");
                    continue;
                }
                let map = ns_ref.value();
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(current) = map.get_mut(&key) {
                    if current.value == entry.value && current.created_at == entry.created_at {
                        current.dirty = false;
                    }
                }
            }
        }
    }

    /// Periodic flush loop. Runs until `shutdown` broadcasts `true`, then
    /// performs the final on-shutdown flush.
    pub async fn run_flush_worker(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(period_secs = period.as_secs(), "cache flush worker started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; skip it so the
        // first real flush happens one period in.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.flush(&[PersistenceLevel::Periodic]);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cache flush worker shutting down");
                        self.flush(&[PersistenceLevel::Periodic, PersistenceLevel::OnShutdown]);
                        break;
                    }
                }
            }
        }
    }

    // --- typed API-response caches ------------------------------------------

    /// Raw upstream JSON for `(domain, key)` plus its stored-at timestamp.
    /// First hit across sources wins; TTL policy belongs to the caller.
    pub fn api_get(&self, domain: &str, key: &str) -> Option<(serde_json::Value, i64)> {
        match self.router.api_cache_get(domain, key) {
            Ok(Some(row)) => Some((row.value, row.stored_at)),
            Ok(None) => None,
            Err(e) => {
                warn!(domain, key, error = %e, "typed cache read failed; treating as miss");
                None
            }
        }
    }

    pub fn api_set(&self, domain: &str, key: &str, value: &serde_json::Value) {
        if let Err(e) = self.router.api_cache_set(domain, key, value, now_unix(), None) {
            warn!(domain, key, error = %e, "typed cache write failed");
        }
    }

    fn namespace(&self, name: &str) -> Namespace {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
