//! Distributed rate limiter / admission controller.
//!
//! Each named provider gets a sliding window bounding requests-per-window and
//! concurrently-in-flight calls. Counters live in a shared
//! [`CoordinationStore`] so stateless worker processes on the same host (or
//! pointed at the same store) share one budget. Every store operation is a
//! single atomic round trip; there is no read-modify-write across calls.
//!
//! When the store is unreachable the limiter degrades to a per-process
//! approximation with budgets divided by the estimated instance count, so an
//! outage fails toward fewer requests rather than no limiting at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::gateway::{
    ChatGateway, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, ProviderError,
};

/// Short retry hint returned when the concurrency gate is full.
const CONCURRENCY_RETRY: Duration = Duration::from_secs(1);

/// Cap on a single poll backoff inside `wait_for_slot`.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sliding window length.
    pub window: Duration,
    /// Maximum admitted requests per window.
    pub max_rpm: u32,
    /// Maximum concurrently in-flight calls.
    pub max_concurrent: u32,
    /// Safety TTL on in-flight slots. Set to the maximum expected task
    /// duration so a crashed caller's slot self-heals.
    pub inflight_ttl: Duration,
    /// Estimated number of worker processes sharing the budget. Used only
    /// for the degraded local approximation.
    pub instance_estimate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_rpm: 60,
            max_concurrent: 8,
            inflight_ttl: Duration::from_secs(120),
            instance_estimate: 2,
        }
    }
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("timed out waiting for a {provider} slot after {waited:?}")]
    Timeout { provider: String, waited: Duration },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
}

/// Outcome of one atomic admission attempt against the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Allowed,
    /// Request budget exhausted; window resets after this long.
    DeniedWindow { reset: Duration },
    /// Concurrency gate full.
    DeniedConcurrency,
}

/// Shared counter store. Key space per provider:
/// `ratelimit:{provider}:{count|window|concurrent}`.
///
/// Implementations must make each method a single atomic operation; callers
/// never compose two calls into one logical mutation.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically attempt one admission: expire stale in-flight slots, roll
    /// the window if elapsed, then check and bump both counters.
    async fn try_admit(
        &self,
        provider: &str,
        now_ms: i64,
        window_ms: i64,
        max_rpm: u32,
        max_concurrent: u32,
        inflight_ttl_ms: i64,
    ) -> Result<AdmitDecision, StoreError>;

    /// Release one in-flight slot. Releasing with no slots held is a no-op;
    /// the counter never goes negative.
    async fn release(&self, provider: &str, now_ms: i64) -> Result<(), StoreError>;
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// =============================================================================
// SQLite-backed coordination store
// =============================================================================

/// Coordination store on a shared SQLite file. WAL mode lets multiple worker
/// processes on one host share the budget; each admission is one transaction.
#[derive(Clone)]
pub struct SqliteCoordinationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCoordinationStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             CREATE TABLE IF NOT EXISTS ratelimit_window (
               provider TEXT PRIMARY KEY,
               window_start_ms INTEGER NOT NULL,
               request_count INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS ratelimit_inflight (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               provider TEXT NOT NULL,
               expires_at_ms INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_inflight_provider
               ON ratelimit_inflight(provider, expires_at_ms);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TASKWEAVE_RATELIMIT_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".taskweave_ratelimit.sqlite")
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    async fn try_admit(
        &self,
        provider: &str,
        now_ms: i64,
        window_ms: i64,
        max_rpm: u32,
        max_concurrent: u32,
        inflight_ttl_ms: i64,
    ) -> Result<AdmitDecision, StoreError> {
        let store = self.clone();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute_batch("BEGIN IMMEDIATE;")?;
                let result = admit_tx(
                    conn,
                    &provider,
                    now_ms,
                    window_ms,
                    max_rpm,
                    max_concurrent,
                    inflight_ttl_ms,
                );
                match &result {
                    Ok(_) => conn.execute_batch("COMMIT;")?,
                    Err(_) => {
                        let _ = conn.execute_batch("ROLLBACK;");
                    }
                }
                result
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn release(&self, provider: &str, now_ms: i64) -> Result<(), StoreError> {
        let store = self.clone();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                // Drop expired slots, then the oldest live one. Never negative:
                // deleting from an empty table is a no-op.
                conn.execute(
                    "DELETE FROM ratelimit_inflight WHERE provider = ?1 AND expires_at_ms <= ?2",
                    params![provider, now_ms],
                )?;
                conn.execute(
                    "DELETE FROM ratelimit_inflight WHERE id = (
                        SELECT id FROM ratelimit_inflight WHERE provider = ?1
                        ORDER BY expires_at_ms ASC LIMIT 1
                     )",
                    params![provider],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn admit_tx(
    conn: &Connection,
    provider: &str,
    now_ms: i64,
    window_ms: i64,
    max_rpm: u32,
    max_concurrent: u32,
    inflight_ttl_ms: i64,
) -> Result<AdmitDecision, StoreError> {
    // Self-heal: slots whose TTL elapsed no longer count.
    conn.execute(
        "DELETE FROM ratelimit_inflight WHERE provider = ?1 AND expires_at_ms <= ?2",
        params![provider, now_ms],
    )?;

    let window: Option<(i64, i64)> = conn
        .query_row(
            "SELECT window_start_ms, request_count FROM ratelimit_window WHERE provider = ?1",
            params![provider],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let fresh_window = match window {
        None => true,
        Some((start, _)) => now_ms - start >= window_ms,
    };

    if fresh_window {
        conn.execute(
            "INSERT INTO ratelimit_window (provider, window_start_ms, request_count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(provider) DO UPDATE SET window_start_ms = ?2, request_count = 1",
            params![provider, now_ms],
        )?;
        conn.execute(
            "INSERT INTO ratelimit_inflight (provider, expires_at_ms) VALUES (?1, ?2)",
            params![provider, now_ms + inflight_ttl_ms],
        )?;
        return Ok(AdmitDecision::Allowed);
    }

    let (start, count) = window.unwrap_or((now_ms, 0));

    if count >= max_rpm as i64 {
        let reset_ms = (window_ms - (now_ms - start)).max(0) as u64;
        return Ok(AdmitDecision::DeniedWindow {
            reset: Duration::from_millis(reset_ms),
        });
    }

    let concurrent: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ratelimit_inflight WHERE provider = ?1",
        params![provider],
        |row| row.get(0),
    )?;
    if concurrent >= max_concurrent as i64 {
        return Ok(AdmitDecision::DeniedConcurrency);
    }

    conn.execute(
        "UPDATE ratelimit_window SET request_count = request_count + 1 WHERE provider = ?1",
        params![provider],
    )?;
    conn.execute(
        "INSERT INTO ratelimit_inflight (provider, expires_at_ms) VALUES (?1, ?2)",
        params![provider, now_ms + inflight_ttl_ms],
    )?;
    Ok(AdmitDecision::Allowed)
}

// =============================================================================
// In-memory coordination store
// =============================================================================

#[derive(Debug, Default)]
struct MemProviderState {
    window_start_ms: Option<i64>,
    request_count: i64,
    inflight_expiries: Vec<i64>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    providers: Mutex<HashMap<String, MemProviderState>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn try_admit(
        &self,
        provider: &str,
        now_ms: i64,
        window_ms: i64,
        max_rpm: u32,
        max_concurrent: u32,
        inflight_ttl_ms: i64,
    ) -> Result<AdmitDecision, StoreError> {
        let mut providers = self.providers.lock().map_err(|_| StoreError::Poisoned)?;
        let state = providers.entry(provider.to_string()).or_default();

        state.inflight_expiries.retain(|&e| e > now_ms);

        let fresh_window = match state.window_start_ms {
            None => true,
            Some(start) => now_ms - start >= window_ms,
        };

        if fresh_window {
            state.window_start_ms = Some(now_ms);
            state.request_count = 1;
            state.inflight_expiries.push(now_ms + inflight_ttl_ms);
            return Ok(AdmitDecision::Allowed);
        }

        let start = state.window_start_ms.unwrap_or(now_ms);
        if state.request_count >= max_rpm as i64 {
            let reset_ms = (window_ms - (now_ms - start)).max(0) as u64;
            return Ok(AdmitDecision::DeniedWindow {
                reset: Duration::from_millis(reset_ms),
            });
        }
        if state.inflight_expiries.len() >= max_concurrent as usize {
            return Ok(AdmitDecision::DeniedConcurrency);
        }

        state.request_count += 1;
        state.inflight_expiries.push(now_ms + inflight_ttl_ms);
        Ok(AdmitDecision::Allowed)
    }

    async fn release(&self, provider: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut providers = self.providers.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(state) = providers.get_mut(provider) {
            state.inflight_expiries.retain(|&e| e > now_ms);
            if !state.inflight_expiries.is_empty() {
                state.inflight_expiries.remove(0);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Rate limiter
// =============================================================================

#[derive(Debug)]
struct LocalWindow {
    started: Instant,
    request_count: u32,
    inflight_expiries: Vec<Instant>,
}

/// Admission controller shared by all tasks in a process.
///
/// Construct one per process at startup and inject it; there is no global
/// instance.
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    config: RateLimitConfig,
    local: Mutex<HashMap<String, LocalWindow>>,
    released: tokio::sync::Notify,
    degraded_logged: AtomicBool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            local: Mutex::new(HashMap::new()),
            released: tokio::sync::Notify::new(),
            degraded_logged: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// One admission check. Never fails: store errors degrade to the local
    /// approximation.
    pub async fn check_limit(&self, provider: &str) -> Admission {
        let cfg = &self.config;
        let decision = self
            .store
            .try_admit(
                provider,
                now_epoch_ms(),
                cfg.window.as_millis() as i64,
                cfg.max_rpm,
                cfg.max_concurrent,
                cfg.inflight_ttl.as_millis() as i64,
            )
            .await;

        match decision {
            Ok(AdmitDecision::Allowed) => Admission::Allowed,
            Ok(AdmitDecision::DeniedWindow { reset }) => Admission::Denied { retry_after: reset },
            Ok(AdmitDecision::DeniedConcurrency) => Admission::Denied {
                retry_after: CONCURRENCY_RETRY,
            },
            Err(e) => {
                if !self.degraded_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        provider,
                        error = %e,
                        "coordination store unreachable, degrading to local budgets"
                    );
                }
                self.local_admit(provider)
            }
        }
    }

    /// Release one in-flight slot and wake queued waiters.
    pub async fn release_slot(&self, provider: &str) {
        if let Err(e) = self.store.release(provider, now_epoch_ms()).await {
            tracing::warn!(provider, error = %e, "release via store failed, releasing locally");
            self.local_release(provider);
        }
        self.released.notify_waiters();
    }

    /// Poll `check_limit` with capped backoff until admitted or `timeout`
    /// elapses.
    pub async fn wait_for_slot(
        &self,
        provider: &str,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.check_limit(provider).await {
                Admission::Allowed => return Ok(()),
                Admission::Denied { retry_after } => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RateLimitError::Timeout {
                            provider: provider.to_string(),
                            waited: timeout,
                        });
                    }
                    let remaining = deadline - now;
                    let backoff = retry_after.min(MAX_POLL_BACKOFF).min(remaining);
                    // A release may free a slot before the backoff elapses.
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.released.notified() => {}
                    }
                    if Instant::now() >= deadline {
                        return Err(RateLimitError::Timeout {
                            provider: provider.to_string(),
                            waited: timeout,
                        });
                    }
                }
            }
        }
    }

    /// Degraded path: per-process window with budgets divided by the
    /// estimated instance count, failing toward fewer requests.
    fn local_admit(&self, provider: &str) -> Admission {
        let instances = self.config.instance_estimate.max(1);
        let max_rpm = (self.config.max_rpm / instances).max(1);
        let max_concurrent = (self.config.max_concurrent / instances).max(1);

        let mut local = match self.local.lock() {
            Ok(guard) => guard,
            // Poisoned local state: deny briefly rather than over-admit.
            Err(_) => {
                return Admission::Denied {
                    retry_after: CONCURRENCY_RETRY,
                }
            }
        };
        let now = Instant::now();
        let state = local.entry(provider.to_string()).or_insert_with(|| LocalWindow {
            started: now,
            request_count: 0,
            inflight_expiries: Vec::new(),
        });

        state.inflight_expiries.retain(|&e| e > now);

        if now.duration_since(state.started) >= self.config.window {
            state.started = now;
            state.request_count = 1;
            state.inflight_expiries.push(now + self.config.inflight_ttl);
            return Admission::Allowed;
        }

        if state.request_count >= max_rpm {
            let elapsed = now.duration_since(state.started);
            let reset = self.config.window.saturating_sub(elapsed);
            return Admission::Denied { retry_after: reset };
        }
        if state.inflight_expiries.len() >= max_concurrent as usize {
            return Admission::Denied {
                retry_after: CONCURRENCY_RETRY,
            };
        }

        state.request_count += 1;
        state.inflight_expiries.push(now + self.config.inflight_ttl);
        Admission::Allowed
    }

    fn local_release(&self, provider: &str) {
        if let Ok(mut local) = self.local.lock() {
            if let Some(state) = local.get_mut(provider) {
                let now = Instant::now();
                state.inflight_expiries.retain(|&e| e > now);
                if !state.inflight_expiries.is_empty() {
                    state.inflight_expiries.remove(0);
                }
            }
        }
    }
}

// =============================================================================
// Admission-gated gateway
// =============================================================================

/// [`ChatGateway`] wrapper that holds a limiter slot for the duration of every
/// chat call. One-shot calls (decomposition, review, merge) go through this;
/// the task executor manages its slots directly because it must release them
/// when a task deadline fires mid-call.
pub struct AdmittedGateway {
    inner: Arc<dyn ChatGateway>,
    limiter: Arc<RateLimiter>,
    admission_timeout: Duration,
}

impl AdmittedGateway {
    pub fn new(
        inner: Arc<dyn ChatGateway>,
        limiter: Arc<RateLimiter>,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            limiter,
            admission_timeout,
        }
    }
}

#[async_trait]
impl ChatGateway for AdmittedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let provider = req.model.route().to_string();
        if let Err(e) = self
            .limiter
            .wait_for_slot(&provider, self.admission_timeout)
            .await
        {
            tracing::warn!(provider = %provider, error = %e, "admission wait timed out");
            return Err(ProviderError::rate_limited_local(CONCURRENCY_RETRY));
        }
        let result = self.inner.chat(req).await;
        self.limiter.release_slot(&provider).await;
        result
    }

    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        // Embeddings share one pool across providers and are not routed.
        self.inner.embed(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_rpm: u32, max_concurrent: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCoordinationStore::new()),
            RateLimitConfig {
                window,
                max_rpm,
                max_concurrent,
                inflight_ttl: Duration::from_secs(60),
                instance_estimate: 2,
            },
        )
    }

    #[tokio::test]
    async fn admits_up_to_max_rpm_then_denies() {
        let rl = limiter(3, 10, Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(rl.check_limit("anthropic").await, Admission::Allowed);
            rl.release_slot("anthropic").await;
        }
        match rl.check_limit("anthropic").await {
            Admission::Denied { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_expires_and_readmits() {
        let rl = limiter(1, 10, Duration::from_millis(30));
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        rl.release_slot("p").await;
        assert!(matches!(rl.check_limit("p").await, Admission::Denied { .. }));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
    }

    #[tokio::test]
    async fn concurrency_gate_denies_until_release() {
        let rl = limiter(100, 2, Duration::from_secs(60));
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        assert_eq!(
            rl.check_limit("p").await,
            Admission::Denied {
                retry_after: CONCURRENCY_RETRY
            }
        );
        rl.release_slot("p").await;
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
    }

    #[tokio::test]
    async fn release_without_admission_never_goes_negative() {
        let rl = limiter(100, 1, Duration::from_secs(60));
        rl.release_slot("p").await;
        rl.release_slot("p").await;
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        // Only one slot exists; the spurious releases must not have created capacity.
        assert!(matches!(rl.check_limit("p").await, Admission::Denied { .. }));
    }

    #[tokio::test]
    async fn inflight_ttl_self_heals_crashed_caller() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let rl = RateLimiter::new(
            store,
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_rpm: 100,
                max_concurrent: 1,
                inflight_ttl: Duration::from_millis(20),
                instance_estimate: 1,
            },
        );
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        // Never released: TTL must reclaim the slot.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
    }

    #[tokio::test]
    async fn wait_for_slot_times_out() {
        let rl = limiter(100, 1, Duration::from_secs(60));
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        let err = rl
            .wait_for_slot("p", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
    }

    #[tokio::test]
    async fn wait_for_slot_wakes_on_release() {
        let rl = Arc::new(limiter(100, 1, Duration::from_secs(60)));
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);

        let waiter = {
            let rl = rl.clone();
            tokio::spawn(async move { rl.wait_for_slot("p", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rl.release_slot("p").await;
        waiter.await.unwrap().unwrap();
    }

    struct FailingStore;

    #[async_trait]
    impl CoordinationStore for FailingStore {
        async fn try_admit(
            &self,
            _provider: &str,
            _now_ms: i64,
            _window_ms: i64,
            _max_rpm: u32,
            _max_concurrent: u32,
            _inflight_ttl_ms: i64,
        ) -> Result<AdmitDecision, StoreError> {
            Err(StoreError::Join("store down".into()))
        }

        async fn release(&self, _provider: &str, _now_ms: i64) -> Result<(), StoreError> {
            Err(StoreError::Join("store down".into()))
        }
    }

    #[tokio::test]
    async fn degrades_to_divided_local_budgets() {
        // max_rpm 4 across an estimated 2 instances: this process gets 2.
        let rl = RateLimiter::new(
            Arc::new(FailingStore),
            RateLimitConfig {
                window: Duration::from_secs(60),
                max_rpm: 4,
                max_concurrent: 8,
                inflight_ttl: Duration::from_secs(60),
                instance_estimate: 2,
            },
        );
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        rl.release_slot("p").await;
        assert_eq!(rl.check_limit("p").await, Admission::Allowed);
        rl.release_slot("p").await;
        assert!(matches!(rl.check_limit("p").await, Admission::Denied { .. }));
    }

    #[tokio::test]
    async fn sqlite_store_shared_across_limiters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rl.sqlite");
        let config = RateLimitConfig {
            window: Duration::from_secs(60),
            max_rpm: 2,
            max_concurrent: 10,
            inflight_ttl: Duration::from_secs(60),
            instance_estimate: 1,
        };
        let a = RateLimiter::new(
            Arc::new(SqliteCoordinationStore::new(&path).unwrap()),
            config.clone(),
        );
        let b = RateLimiter::new(
            Arc::new(SqliteCoordinationStore::new(&path).unwrap()),
            config,
        );

        // Two limiter instances share one budget of 2.
        assert_eq!(a.check_limit("p").await, Admission::Allowed);
        assert_eq!(b.check_limit("p").await, Admission::Allowed);
        assert!(matches!(a.check_limit("p").await, Admission::Denied { .. }));
        assert!(matches!(b.check_limit("p").await, Admission::Denied { .. }));
    }

    use crate::gateway::{Attribution, ChatModel, FinishReason, Message};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatGateway for CountingGateway {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: "ok".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                cost_nanodollars: 1,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            })
        }

        async fn embed(&self, _req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
            Err(ProviderError::provider("openai", "no embeddings", false))
        }
    }

    fn chat_request() -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter("anthropic/claude-sonnet"),
            vec![Message::user("hello")],
            Attribution::new("ratelimit_test"),
        )
    }

    #[tokio::test]
    async fn admitted_gateway_releases_slot_between_calls() {
        let rl = Arc::new(limiter(100, 1, Duration::from_secs(60)));
        let inner = Arc::new(CountingGateway::default());
        let gated = AdmittedGateway::new(inner.clone(), rl, Duration::from_millis(200));

        // max_concurrent is 1; both calls succeed only if the slot comes back
        // after the first.
        gated.chat(chat_request()).await.unwrap();
        gated.chat(chat_request()).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn admitted_gateway_times_out_without_calling_provider() {
        let rl = Arc::new(limiter(100, 1, Duration::from_secs(60)));
        // Occupy the only slot so admission cannot succeed.
        assert_eq!(rl.check_limit("anthropic").await, Admission::Allowed);
        let inner = Arc::new(CountingGateway::default());
        let gated = AdmittedGateway::new(inner.clone(), rl, Duration::from_millis(30));

        let err = gated.chat(chat_request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }
}
