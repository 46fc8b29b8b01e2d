//! Three-tier result cache keyed by request similarity.
//!
//! Lookup order is durable, then fast, then semantic. The durable tier is a
//! shared SQLite store of completed runs matched by token overlap. The fast
//! tier is a per-process LRU matched at a stricter threshold. The semantic
//! tier matches on embedding cosine similarity and is skipped entirely when
//! no embedding gateway is configured or the provider errors.
//!
//! Writes are fire-and-forget: the fast tier updates synchronously, durable
//! and semantic writes run on detached tasks so a slow disk or provider never
//! delays returning results to the caller.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::gateway::{Attribution, ChatGateway, EmbedModel, EmbedRequest};
use crate::similarity::{cosine, jaccard, tokenize};

/// One completed run, as stored and returned by every tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub request_text: String,
    pub summary: String,
    pub artifacts: BTreeMap<String, String>,
    pub completed_at: i64,
}

impl CacheEntry {
    pub fn new(
        request_text: impl Into<String>,
        summary: impl Into<String>,
        artifacts: BTreeMap<String, String>,
    ) -> Self {
        let request_text = request_text.into();
        Self {
            fingerprint: fingerprint(&request_text),
            request_text,
            summary: summary.into(),
            artifacts,
            completed_at: now_epoch(),
        }
    }
}

/// Blake3 fingerprint of the raw request text.
pub fn fingerprint(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Durable,
    Fast,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub tier: CacheTier,
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

// =============================================================================
// Durable tier
// =============================================================================

#[async_trait]
pub trait DurableResultStore: Send + Sync {
    /// Most recent entries newer than `max_age`, newest first.
    async fn recent(&self, limit: usize, max_age: Duration) -> Result<Vec<CacheEntry>, CacheError>;
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

#[derive(Clone)]
pub struct SqliteResultStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             CREATE TABLE IF NOT EXISTS run_cache (
               fingerprint TEXT PRIMARY KEY,
               request_text TEXT NOT NULL,
               summary TEXT NOT NULL,
               artifacts_json TEXT NOT NULL,
               completed_at INTEGER NOT NULL,
               hit_count INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_run_cache_completed
               ON run_cache(completed_at);",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TASKWEAVE_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".taskweave_run_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive advisory lock next to the database file, held for the life
    /// of the returned guard. Used by maintenance commands so two prunes
    /// cannot interleave.
    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    /// Delete entries older than `max_age_days`, then trim the table to
    /// `max_rows` keeping the newest.
    pub async fn prune(
        &self,
        max_age_days: i64,
        max_rows: usize,
    ) -> Result<CachePruneStats, CacheError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let cutoff = now_epoch() - max_age_days * 86_400;
                let by_age =
                    conn.execute("DELETE FROM run_cache WHERE completed_at < ?1", params![cutoff])?;
                let by_count = conn.execute(
                    "DELETE FROM run_cache WHERE fingerprint NOT IN (
                        SELECT fingerprint FROM run_cache
                        ORDER BY completed_at DESC LIMIT ?1
                     )",
                    params![max_rows as i64],
                )?;
                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM run_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted: by_age + by_count,
                    remaining: remaining as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[async_trait]
impl DurableResultStore for SqliteResultStore {
    async fn recent(&self, limit: usize, max_age: Duration) -> Result<Vec<CacheEntry>, CacheError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let cutoff = now_epoch() - max_age.as_secs() as i64;
                let mut stmt = conn.prepare(
                    "SELECT fingerprint, request_text, summary, artifacts_json, completed_at
                     FROM run_cache WHERE completed_at >= ?1
                     ORDER BY completed_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![cutoff, limit as i64])?;
                let mut entries = Vec::new();
                while let Some(row) = rows.next()? {
                    let artifacts_json: String = row.get(3)?;
                    let artifacts: BTreeMap<String, String> =
                        serde_json::from_str(&artifacts_json)
                            .map_err(|e| CacheError::Serde(e.to_string()))?;
                    entries.push(CacheEntry {
                        fingerprint: row.get(0)?,
                        request_text: row.get(1)?,
                        summary: row.get(2)?,
                        artifacts,
                        completed_at: row.get(4)?,
                    });
                }
                Ok(entries)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let store = self.clone();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let artifacts_json = serde_json::to_string(&entry.artifacts)
                    .map_err(|e| CacheError::Serde(e.to_string()))?;
                conn.execute(
                    "INSERT INTO run_cache (
                        fingerprint, request_text, summary, artifacts_json, completed_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(fingerprint) DO UPDATE SET
                        summary = excluded.summary,
                        artifacts_json = excluded.artifacts_json,
                        completed_at = excluded.completed_at",
                    params![
                        entry.fingerprint,
                        entry.request_text,
                        entry.summary,
                        artifacts_json,
                        entry.completed_at,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        use fs2::FileExt;

        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

// =============================================================================
// Fast tier
// =============================================================================

/// Per-process LRU over recent runs. Hits move to the front.
#[derive(Debug)]
pub struct FastResponseIndex {
    entries: Mutex<VecDeque<CacheEntry>>,
    capacity: usize,
}

impl FastResponseIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn find(&self, query_tokens: &HashSet<String>, threshold: f64) -> Option<(CacheEntry, f64)> {
        let mut entries = self.entries.lock().ok()?;
        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in entries.iter().enumerate() {
            let score = jaccard(query_tokens, &tokenize(&entry.request_text));
            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        let (i, score) = best?;
        let entry = entries.remove(i)?;
        entries.push_front(entry.clone());
        Some((entry, score))
    }

    pub fn insert(&self, entry: CacheEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|e| e.fingerprint != entry.fingerprint);
            entries.push_front(entry);
            entries.truncate(self.capacity);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Semantic tier
// =============================================================================

/// In-process embedding index. Entries carry the embedding of their request
/// text; lookups compare by cosine similarity.
#[derive(Clone, Default)]
pub struct SemanticIndex {
    entries: Arc<Mutex<VecDeque<(Vec<f32>, CacheEntry)>>>,
    capacity: usize,
}

impl SemanticIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    pub fn find(&self, query: &[f32], threshold: f64) -> Option<(CacheEntry, f64)> {
        let entries = self.entries.lock().ok()?;
        let mut best: Option<(&CacheEntry, f64)> = None;
        for (embedding, entry) in entries.iter() {
            let score = cosine(query, embedding);
            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((entry, score));
            }
        }
        best.map(|(entry, score)| (entry.clone(), score))
    }

    pub fn insert(&self, embedding: Vec<f32>, entry: CacheEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|(_, e)| e.fingerprint != entry.fingerprint);
            entries.push_front((embedding, entry));
            entries.truncate(self.capacity);
        }
    }
}

// =============================================================================
// Tiered cache
// =============================================================================

#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    pub durable_threshold: f64,
    pub fast_threshold: f64,
    pub semantic_threshold: f64,
    pub durable_scan_limit: usize,
    pub durable_max_age: Duration,
    pub fast_capacity: usize,
    pub semantic_capacity: usize,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            durable_threshold: 0.70,
            fast_threshold: 0.80,
            semantic_threshold: 0.85,
            durable_scan_limit: 50,
            durable_max_age: Duration::from_secs(72 * 3600),
            fast_capacity: 128,
            semantic_capacity: 256,
        }
    }
}

pub struct TieredCache {
    durable: Arc<dyn DurableResultStore>,
    fast: FastResponseIndex,
    semantic: SemanticIndex,
    gateway: Option<Arc<dyn ChatGateway>>,
    config: TieredCacheConfig,
}

impl TieredCache {
    pub fn new(
        durable: Arc<dyn DurableResultStore>,
        gateway: Option<Arc<dyn ChatGateway>>,
        config: TieredCacheConfig,
    ) -> Self {
        Self {
            durable,
            fast: FastResponseIndex::new(config.fast_capacity),
            semantic: SemanticIndex::new(config.semantic_capacity),
            gateway,
            config,
        }
    }

    /// Check all tiers in order. Tier errors are logged and that tier is
    /// skipped; a degraded cache is never fatal.
    pub async fn find(&self, request_text: &str) -> Option<CacheHit> {
        let query_tokens = tokenize(request_text);

        match self
            .durable
            .recent(self.config.durable_scan_limit, self.config.durable_max_age)
            .await
        {
            Ok(entries) => {
                let mut best: Option<(CacheEntry, f64)> = None;
                for entry in entries {
                    let score = jaccard(&query_tokens, &tokenize(&entry.request_text));
                    if score >= self.config.durable_threshold
                        && best.as_ref().map_or(true, |(_, s)| score > *s)
                    {
                        best = Some((entry, score));
                    }
                }
                if let Some((entry, score)) = best {
                    return Some(CacheHit {
                        entry,
                        tier: CacheTier::Durable,
                        score,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "durable cache tier unavailable, skipping");
            }
        }

        if let Some((entry, score)) = self.fast.find(&query_tokens, self.config.fast_threshold) {
            return Some(CacheHit {
                entry,
                tier: CacheTier::Fast,
                score,
            });
        }

        let gateway = self.gateway.as_ref()?;
        let req = EmbedRequest::single(
            EmbedModel::Small3,
            request_text.to_string(),
            Attribution::new("cache_semantic"),
        );
        match gateway.embed(req).await {
            Ok(resp) => {
                let query = resp.embeddings.into_iter().next()?;
                let (entry, score) = self.semantic.find(&query, self.config.semantic_threshold)?;
                Some(CacheHit {
                    entry,
                    tier: CacheTier::Semantic,
                    score,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding provider unavailable, skipping semantic tier");
                None
            }
        }
    }

    /// Record a completed run in all tiers. The fast tier updates before this
    /// returns; durable and semantic writes are detached and their failures
    /// only logged.
    pub fn store(&self, entry: CacheEntry) {
        self.fast.insert(entry.clone());

        let durable = self.durable.clone();
        let durable_entry = entry.clone();
        tokio::spawn(async move {
            if let Err(e) = durable.put(&durable_entry).await {
                tracing::warn!(error = %e, "durable cache write failed");
            }
        });

        if let Some(gateway) = self.gateway.clone() {
            let semantic = self.semantic.clone();
            tokio::spawn(async move {
                let req = EmbedRequest::single(
                    EmbedModel::Small3,
                    entry.request_text.clone(),
                    Attribution::new("cache_semantic"),
                );
                match gateway.embed(req).await {
                    Ok(resp) => {
                        if let Some(embedding) = resp.embeddings.into_iter().next() {
                            semantic.insert(embedding, entry);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "semantic cache write failed");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(request: &str, summary: &str) -> CacheEntry {
        CacheEntry::new(request, summary, BTreeMap::new())
    }

    #[test]
    fn fast_index_matches_above_threshold() {
        let index = FastResponseIndex::new(8);
        index.insert(entry(
            "build a todo application with authentication support",
            "done",
        ));

        let query = tokenize("build a todo application with authentication support");
        let (hit, score) = index.find(&query, 0.80).unwrap();
        assert_eq!(hit.summary, "done");
        assert!(score > 0.99);

        let unrelated = tokenize("train a convolutional neural network classifier");
        assert!(index.find(&unrelated, 0.80).is_none());
    }

    #[test]
    fn fast_index_evicts_oldest_beyond_capacity() {
        let index = FastResponseIndex::new(2);
        index.insert(entry("first distinctive request wording here", "a"));
        index.insert(entry("second distinctive request wording here", "b"));
        index.insert(entry("third distinctive request wording here", "c"));
        assert_eq!(index.len(), 2);
        let query = tokenize("first distinctive request wording here");
        assert!(index.find(&query, 0.95).is_none());
    }

    #[test]
    fn semantic_index_ranks_by_cosine() {
        let index = SemanticIndex::new(8);
        index.insert(vec![1.0, 0.0, 0.0], entry("alpha", "alpha summary"));
        index.insert(vec![0.0, 1.0, 0.0], entry("beta", "beta summary"));

        let (hit, score) = index.find(&[0.99, 0.1, 0.0], 0.85).unwrap();
        assert_eq!(hit.summary, "alpha summary");
        assert!(score > 0.9);
        assert!(index.find(&[0.0, 0.0, 1.0], 0.85).is_none());
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_and_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteResultStore::new(dir.path().join("cache.sqlite")).unwrap();

        let mut older = entry("an older request", "older");
        older.completed_at -= 100;
        store.put(&older).await.unwrap();
        store.put(&entry("a newer request", "newer")).await.unwrap();

        let entries = store.recent(10, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].summary, "newer");
        assert_eq!(entries[1].summary, "older");
    }

    #[tokio::test]
    async fn sqlite_store_recent_excludes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteResultStore::new(dir.path().join("cache.sqlite")).unwrap();

        let mut stale = entry("a stale request", "stale");
        stale.completed_at -= 73 * 3600;
        store.put(&stale).await.unwrap();
        store.put(&entry("a fresh request", "fresh")).await.unwrap();

        let entries = store
            .recent(10, Duration::from_secs(72 * 3600))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].summary, "fresh");
    }

    #[tokio::test]
    async fn prune_trims_by_age_and_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteResultStore::new(dir.path().join("cache.sqlite")).unwrap();

        let mut ancient = entry("ancient request", "ancient");
        ancient.completed_at -= 40 * 86_400;
        store.put(&ancient).await.unwrap();
        for i in 0..5 {
            store
                .put(&entry(&format!("recent request number {i}"), "recent"))
                .await
                .unwrap();
        }

        let stats = store.prune(30, 3).await.unwrap();
        assert_eq!(stats.remaining, 3);
        assert!(stats.deleted >= 3);
    }

    #[tokio::test]
    async fn tiered_find_prefers_durable_over_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SqliteResultStore::new(dir.path().join("cache.sqlite")).unwrap());
        let cache = TieredCache::new(store.clone(), None, TieredCacheConfig::default());

        let request = "scaffold a rest api with postgres persistence layer";
        store
            .put(&entry(request, "durable summary"))
            .await
            .unwrap();
        cache.fast.insert(entry(request, "fast summary"));

        let hit = cache.find(request).await.unwrap();
        assert_eq!(hit.tier, CacheTier::Durable);
        assert_eq!(hit.entry.summary, "durable summary");
    }

    #[tokio::test]
    async fn tiered_find_misses_without_similar_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SqliteResultStore::new(dir.path().join("cache.sqlite")).unwrap());
        let cache = TieredCache::new(store.clone(), None, TieredCacheConfig::default());

        store
            .put(&entry("write a compiler frontend for a toy language", "x"))
            .await
            .unwrap();
        assert!(cache
            .find("design a marketing landing page with animations")
            .await
            .is_none());
    }
}
