//! Connection lifecycle manager for relational sources.
//!
//! Pools are cached under `{source_id}_{updated_at ?? created_at}`, so an
//! edit to a source's descriptor naturally routes the next `acquire` to a
//! fresh pool. Once the newer pool is cached, older pools for the same
//! source are retired: they leave the cache at once and close after their
//! last in-flight user drops them.
//!
//! ```text
//!  acquire(source)
//!      │
//!      ├── cached? ──────────────────────────────▶ handle
//!      ├── build in flight? ── wait on watch ────▶ same handle / same error
//!      └── cold ── spawn build ── ping ─── cache ─▶ handle
//!                                   │
//!                                   └─ fail: close, cache nothing
//! ```
//!
//! Builds are single-flight per key and run on their own task, so a caller
//! that is cancelled mid-build never affects the others waiting on it.
//! A build for a snapshot older than what is already cached is handed to
//! its callers but never cached.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::engines::{MySqlDriver, PostgresDriver};
use crate::error::{ReportError, Result};
use crate::models::{ConnectionDescriptor, DataSource, RelationalDescriptor, TabularResult};

// ═══════════════════════════════════════════════════════════════════════
// Engine traits
// ═══════════════════════════════════════════════════════════════════════

/// A pooled client bound to one relational engine instance.
///
/// Shared by every report execution against the same source version.
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Engine name this client was built by (e.g. `"postgres"`).
    fn engine(&self) -> &str;

    /// Run a trivial statement to prove the pool can reach the server.
    async fn ping(&self) -> Result<()>;

    /// Execute a literal SQL statement and normalize the result set.
    async fn query(&self, sql: &str) -> Result<TabularResult>;

    /// Dispose the underlying pool.
    async fn close(&self) -> Result<()>;
}

pub type ConnectionHandle = Arc<dyn RelationalClient>;

/// Builds clients for one engine kind.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Construct an unchecked client. Must not block on network I/O longer
    /// than pool construction requires; the manager pings afterwards.
    async fn build(
        &self,
        descriptor: &RelationalDescriptor,
        pool: &PoolConfig,
    ) -> Result<ConnectionHandle>;
}

/// Registry of engine drivers, resolved by `descriptor.engine`.
pub struct EngineRegistry {
    drivers: Vec<Box<dyn EngineDriver>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    /// Registry pre-loaded with the `postgres` and `mysql` drivers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PostgresDriver));
        registry.register(Box::new(MySqlDriver));
        registry
    }

    /// Register a driver. A later driver with the same name shadows earlier ones.
    pub fn register(&mut self, driver: Box<dyn EngineDriver>) {
        self.drivers.push(driver);
    }

    pub fn find(&self, name: &str) -> Option<&dyn EngineDriver> {
        self.drivers
            .iter()
            .rev()
            .find(|d| d.name().eq_ignore_ascii_case(name))
            .map(|d| d.as_ref())
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════

type BuildOutcome = Result<ConnectionHandle>;

/// How often a retired pool checks whether its last user has let go.
const RETIRE_POLL: Duration = Duration::from_millis(25);

struct CachedHandle {
    source_id: String,
    modified: i64,
    handle: ConnectionHandle,
}

#[derive(Default)]
struct CacheState {
    handles: HashMap<String, CachedHandle>,
    building: HashMap<String, watch::Receiver<Option<BuildOutcome>>>,
}

/// What a spawned build is for.
struct BuildTarget {
    key: String,
    source_id: String,
    modified: i64,
    descriptor: RelationalDescriptor,
}

struct Inner {
    engines: EngineRegistry,
    pool: PoolConfig,
    state: Mutex<CacheState>,
}

/// Caches and single-flights pooled relational handles.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Clears the in-flight marker if a build task dies before publishing.
struct BuildGuard {
    inner: Arc<Inner>,
    key: String,
    armed: bool,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().building.remove(&self.key);
        }
    }
}

impl ConnectionManager {
    pub fn new(engines: EngineRegistry, pool: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                engines,
                pool,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Manager with the built-in engines and the given pool bounds.
    pub fn with_builtins(pool: PoolConfig) -> Self {
        Self::new(EngineRegistry::with_builtins(), pool)
    }

    /// Return the pooled handle for `source`, building and probing it on
    /// first use.
    pub async fn acquire(&self, source: &DataSource) -> Result<ConnectionHandle> {
        let descriptor = match &source.descriptor {
            ConnectionDescriptor::Relational(d) => d,
            _ => {
                return Err(ReportError::DescriptorMismatch {
                    kind: source.kind.to_string(),
                })
            }
        };
        let key = source.cache_key();

        let mut rx = {
            let mut state = self.inner.state.lock();
            if let Some(cached) = state.handles.get(&key) {
                return Ok(cached.handle.clone());
            }
            match state.building.get(&key) {
                Some(rx) => {
                    tracing::debug!(key = %key, "waiting on in-flight connection build");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.building.insert(key.clone(), rx.clone());
                    let target = BuildTarget {
                        key: key.clone(),
                        source_id: source.id.clone(),
                        modified: source.last_modified(),
                        descriptor: descriptor.clone(),
                    };
                    tokio::spawn(self.inner.clone().build_and_publish(target, tx));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(published) => published.clone().unwrap_or_else(|| Err(abandoned(&key))),
            Err(_) => Err(abandoned(&key)),
        };
        outcome
    }

    /// Dispose the pool cached under `key`. Returns `false` if nothing was cached.
    pub async fn release(&self, key: &str) -> bool {
        let removed = self.inner.state.lock().handles.remove(key);
        match removed {
            Some(cached) => {
                if let Err(e) = cached.handle.close().await {
                    tracing::warn!(key = %key, error = %e, "failed to close connection pool");
                }
                tracing::info!(key = %key, "released connection pool");
                true
            }
            None => false,
        }
    }

    /// Dispose every cached pool, continuing past individual failures.
    ///
    /// Returns how many pools closed cleanly.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<(String, CachedHandle)> =
            self.inner.state.lock().handles.drain().collect();
        let mut closed = 0;
        for (key, cached) in drained {
            match cached.handle.close().await {
                Ok(()) => closed += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to close connection pool")
                }
            }
        }
        tracing::info!(closed, "released all connection pools");
        closed
    }

    /// Keys with a cached handle, sorted.
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.state.lock().handles.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Inner {
    async fn build_and_publish(
        self: Arc<Self>,
        target: BuildTarget,
        tx: watch::Sender<Option<BuildOutcome>>,
    ) {
        let mut guard = BuildGuard {
            inner: self.clone(),
            key: target.key.clone(),
            armed: true,
        };
        let outcome = self.build(&target.descriptor, &target.key).await;

        let retired = {
            let mut state = self.state.lock();
            state.building.remove(&target.key);
            guard.armed = false;
            match &outcome {
                Ok(handle) => install(&mut state.handles, &target, handle),
                Err(_) => Vec::new(),
            }
        };
        let _ = tx.send(Some(outcome));

        let grace = self.pool.idle_timeout();
        for (old_key, handle) in retired {
            tokio::spawn(retire(old_key, handle, grace));
        }
    }

    async fn build(&self, descriptor: &RelationalDescriptor, key: &str) -> BuildOutcome {
        let driver = self
            .engines
            .find(&descriptor.engine)
            .ok_or_else(|| ReportError::UnsupportedSourceKind(descriptor.engine.clone()))?;

        tracing::info!(
            key = %key,
            engine = driver.name(),
            host = %descriptor.host,
            database = %descriptor.database,
            max_connections = self.pool.max_connections,
            "building connection pool"
        );

        let handle = driver
            .build(descriptor, &self.pool)
            .await
            .map_err(|e| connection_error(key, e))?;

        if let Err(e) = handle.ping().await {
            tracing::warn!(key = %key, error = %e, "connection ping failed");
            if let Err(close_err) = handle.close().await {
                tracing::warn!(key = %key, error = %close_err, "failed to close unreachable pool");
            }
            return Err(connection_error(key, e));
        }

        Ok(handle)
    }
}

/// Cache a freshly built handle unless a newer one for the same source is
/// already cached. Returns the pools to retire: older pools for the source,
/// or the new handle itself when it lost to a newer one.
fn install(
    handles: &mut HashMap<String, CachedHandle>,
    target: &BuildTarget,
    handle: &ConnectionHandle,
) -> Vec<(String, ConnectionHandle)> {
    let superseded = handles
        .values()
        .any(|cached| cached.source_id == target.source_id && cached.modified > target.modified);
    if superseded {
        tracing::debug!(key = %target.key, "newer pool already cached, not caching");
        return vec![(target.key.clone(), handle.clone())];
    }

    let stale_keys: Vec<String> = handles
        .iter()
        .filter(|(_, cached)| {
            cached.source_id == target.source_id && cached.modified < target.modified
        })
        .map(|(key, _)| key.clone())
        .collect();
    let stale = stale_keys
        .into_iter()
        .filter_map(|key| handles.remove(&key).map(|cached| (key, cached.handle)))
        .collect();

    handles.insert(
        target.key.clone(),
        CachedHandle {
            source_id: target.source_id.clone(),
            modified: target.modified,
            handle: handle.clone(),
        },
    );
    stale
}

/// Close a pool once nobody else holds it, or after `grace` at the latest.
async fn retire(key: String, handle: ConnectionHandle, grace: Duration) {
    let deadline = Instant::now() + grace;
    while Arc::strong_count(&handle) > 1 && Instant::now() < deadline {
        tokio::time::sleep(RETIRE_POLL).await;
    }
    match handle.close().await {
        Ok(()) => tracing::info!(key = %key, "released superseded connection pool"),
        Err(e) => tracing::warn!(key = %key, error = %e, "failed to close superseded pool"),
    }
}

fn connection_error(key: &str, err: ReportError) -> ReportError {
    match err {
        ReportError::Connection { .. } | ReportError::UnsupportedSourceKind(_) => err,
        other => ReportError::Connection {
            key: key.to_string(),
            message: other.to_string(),
        },
    }
}

fn abandoned(key: &str) -> ReportError {
    ReportError::Connection {
        key: key.to_string(),
        message: "connection build task ended without a result".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeClient {
        ping_ok: bool,
        close_ok: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RelationalClient for FakeClient {
        fn engine(&self) -> &str {
            "fake"
        }

        async fn ping(&self) -> Result<()> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(ReportError::Retrieval("connection refused".to_string()))
            }
        }

        async fn query(&self, _sql: &str) -> Result<TabularResult> {
            Ok(TabularResult::default())
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.close_ok {
                Ok(())
            } else {
                Err(ReportError::Retrieval("close failed".to_string()))
            }
        }
    }

    struct FakeDriver {
        builds: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        ping_ok: Arc<AtomicBool>,
        close_ok: bool,
    }

    impl FakeDriver {
        fn new() -> Self {
            Self {
                builds: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
                ping_ok: Arc::new(AtomicBool::new(true)),
                close_ok: true,
            }
        }
    }

    #[async_trait]
    impl EngineDriver for FakeDriver {
        fn name(&self) -> &str {
            "fake"
        }

        async fn build(
            &self,
            _descriptor: &RelationalDescriptor,
            _pool: &PoolConfig,
        ) -> Result<ConnectionHandle> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Arc::new(FakeClient {
                ping_ok: self.ping_ok.load(Ordering::SeqCst),
                close_ok: self.close_ok,
                closed: self.closed.clone(),
            }))
        }
    }

    fn source(id: &str, engine: &str, updated_at: Option<i64>) -> DataSource {
        DataSource {
            id: id.to_string(),
            name: id.to_string(),
            kind: SourceKind::RelationalQuery,
            descriptor: ConnectionDescriptor::Relational(RelationalDescriptor {
                engine: engine.to_string(),
                host: "localhost".to_string(),
                port: 5432,
                user: "report".to_string(),
                password: String::new(),
                database: "analytics".to_string(),
                ssl: false,
            }),
            status: "active".to_string(),
            created_at: 1,
            updated_at,
        }
    }

    fn manager_with(driver: FakeDriver) -> ConnectionManager {
        let mut engines = EngineRegistry::new();
        engines.register(Box::new(driver));
        ConnectionManager::new(engines, PoolConfig::default())
    }

    fn same_handle(a: &ConnectionHandle, b: &ConnectionHandle) -> bool {
        Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
    }

    #[tokio::test]
    async fn test_same_key_returns_same_handle() {
        let driver = FakeDriver::new();
        let builds = driver.builds.clone();
        let manager = manager_with(driver);

        let a = manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        let b = manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        assert!(same_handle(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cached_keys(), vec!["ds1_1"]);
    }

    #[tokio::test]
    async fn test_edit_builds_new_handle_and_retires_old() {
        let driver = FakeDriver::new();
        let builds = driver.builds.clone();
        let closed = driver.closed.clone();
        let manager = manager_with(driver);

        let a = manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        let b = manager
            .acquire(&source("ds1", "fake", Some(99)))
            .await
            .unwrap();
        assert!(!same_handle(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.cached_keys(), vec!["ds1_99"]);

        // still in use, so not closed yet
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        a.query("SELECT 1").await.unwrap();

        drop(a);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_evict_newer_pool() {
        let driver = FakeDriver::new();
        let builds = driver.builds.clone();
        let closed = driver.closed.clone();
        let manager = manager_with(driver);

        let current = manager
            .acquire(&source("ds1", "fake", Some(99)))
            .await
            .unwrap();
        let stale = manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        assert!(!same_handle(&current, &stale));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.cached_keys(), vec!["ds1_99"]);

        let again = manager
            .acquire(&source("ds1", "fake", Some(99)))
            .await
            .unwrap();
        assert!(same_handle(&current, &again));

        // the uncached stale pool closes once its user is done with it
        drop(stale);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cached_keys(), vec!["ds1_99"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_builder_does_not_fail_waiters() {
        let driver = FakeDriver::new();
        let builds = driver.builds.clone();
        let manager = Arc::new(manager_with(driver));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&source("ds1", "fake", None)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&source("ds1", "fake", None)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        first.abort();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cached_keys(), vec!["ds1_1"]);

        let cached = manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        assert!(same_handle(&handle, &cached));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_acquires_build_once() {
        let driver = FakeDriver::new();
        let builds = driver.builds.clone();
        let manager = Arc::new(manager_with(driver));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.acquire(&source("ds1", "fake", None)).await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| same_handle(h, &handles[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ping_failure_is_shared_and_not_cached() {
        let driver = FakeDriver::new();
        driver.ping_ok.store(false, Ordering::SeqCst);
        let builds = driver.builds.clone();
        let ping_ok = driver.ping_ok.clone();
        let manager = Arc::new(manager_with(driver));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.acquire(&source("ds1", "fake", None)).await
            }));
        }
        let mut errors = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => panic!("ping failure must not yield a handle"),
                Err(e) => errors.push(e),
            }
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert!(matches!(errors[0], ReportError::Connection { .. }));
        assert!(manager.cached_keys().is_empty());

        // next call retries cleanly
        ping_ok.store(true, Ordering::SeqCst);
        manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_engine_is_unsupported() {
        let manager = manager_with(FakeDriver::new());
        let err = manager
            .acquire(&source("ds1", "oracle", None))
            .await
            .err()
            .unwrap();
        assert_eq!(err, ReportError::UnsupportedSourceKind("oracle".to_string()));
    }

    #[tokio::test]
    async fn test_file_descriptor_is_rejected() {
        let manager = manager_with(FakeDriver::new());
        let mut ds = source("ds1", "fake", None);
        ds.descriptor = ConnectionDescriptor::None;
        let err = manager.acquire(&ds).await.err().unwrap();
        assert!(matches!(err, ReportError::DescriptorMismatch { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let driver = FakeDriver::new();
        let closed = driver.closed.clone();
        let manager = manager_with(driver);

        manager.acquire(&source("ds1", "fake", None)).await.unwrap();
        assert!(manager.release("ds1_1").await);
        assert!(!manager.release("ds1_1").await);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_all_tolerates_close_failures() {
        let mut driver = FakeDriver::new();
        driver.close_ok = false;
        let closed = driver.closed.clone();
        let manager = manager_with(driver);

        for id in ["a", "b", "c"] {
            manager.acquire(&source(id, "fake", None)).await.unwrap();
        }
        assert_eq!(manager.release_all().await, 0);
        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert!(manager.cached_keys().is_empty());
    }

    #[test]
    fn test_builtin_engines_registered() {
        let engines = EngineRegistry::with_builtins();
        assert_eq!(engines.find("Postgres").map(|d| d.name()), Some("postgres"));
        assert_eq!(engines.find("MYSQL").map(|d| d.name()), Some("mysql"));
        assert!(engines.find("mssql").is_none());
    }
}
