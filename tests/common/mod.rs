//! Shared test utilities for Tandem integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use tandem::clock::{Clock, ManualClock, SharedClock};
use tandem::config::TandemConfig;
use tandem::migration::{
    CutoverStateMachine, MemorySchemaStore, SchemaMigration, StaticRouter,
};
use tandem::replication::{
    ChangeBatch, Database, DatabaseError, MemoryDatabase, PendingChanges, Position, PrimaryKey,
    RowVersion, SharedDatabase, Side, SyncEngine, SyncPosition, VersionStamp, WriteOutcome,
};

// ============================================================================
// Clocks
// ============================================================================

/// Wall clock that follows tokio's (possibly paused) timer.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    base: DateTime<Utc>,
}

#[allow(dead_code)]
impl TokioClock {
    /// Must be created inside the runtime whose time it follows.
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base: Utc::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| ChronoDuration::zero());
        self.base + elapsed
    }
}

// ============================================================================
// Database wrappers
// ============================================================================

/// Wraps a [`MemoryDatabase`] with injectable faults: a delay before every
/// replicated write, and a write fence that refuses to lift.
#[derive(Debug)]
pub struct FaultyDatabase {
    inner: Arc<MemoryDatabase>,
    apply_delay: Duration,
    stuck_fence: AtomicBool,
}

#[allow(dead_code)]
impl FaultyDatabase {
    pub fn new(inner: Arc<MemoryDatabase>) -> Self {
        Self {
            inner,
            apply_delay: Duration::ZERO,
            stuck_fence: AtomicBool::new(false),
        }
    }

    pub fn with_apply_delay(mut self, apply_delay: Duration) -> Self {
        self.apply_delay = apply_delay;
        self
    }

    /// Make `set_writes_frozen(false)` fail while `stuck` is set.
    pub fn set_fence_stuck(&self, stuck: bool) {
        self.stuck_fence.store(stuck, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for FaultyDatabase {
    fn side(&self) -> Side {
        self.inner.side()
    }

    async fn changes_since(
        &self,
        table: &str,
        since: Position,
        limit: usize,
    ) -> Result<ChangeBatch, DatabaseError> {
        self.inner.changes_since(table, since, limit).await
    }

    async fn pending_changes(
        &self,
        table: &str,
        since: Position,
        origin: Side,
    ) -> Result<PendingChanges, DatabaseError> {
        self.inner.pending_changes(table, since, origin).await
    }

    async fn head_position(&self) -> Result<Position, DatabaseError> {
        self.inner.head_position().await
    }

    async fn read_version(
        &self,
        table: &str,
        key: &PrimaryKey,
    ) -> Result<Option<RowVersion>, DatabaseError> {
        self.inner.read_version(table, key).await
    }

    async fn write_version(
        &self,
        table: &str,
        key: &PrimaryKey,
        expected: Option<VersionStamp>,
        version: RowVersion,
        checkpoint: &SyncPosition,
    ) -> Result<WriteOutcome, DatabaseError> {
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        self.inner
            .write_version(table, key, expected, version, checkpoint)
            .await
    }

    async fn store_checkpoint(&self, checkpoint: &SyncPosition) -> Result<(), DatabaseError> {
        self.inner.store_checkpoint(checkpoint).await
    }

    async fn load_checkpoint(
        &self,
        source: Side,
        table: &str,
    ) -> Result<Option<Position>, DatabaseError> {
        self.inner.load_checkpoint(source, table).await
    }

    async fn scan_versions(
        &self,
        table: &str,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<(PrimaryKey, RowVersion)>, DatabaseError> {
        self.inner.scan_versions(table, after, limit).await
    }

    async fn set_writes_frozen(&self, frozen: bool) -> Result<(), DatabaseError> {
        if !frozen && self.stuck_fence.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable {
                side: self.inner.side(),
                reason: "write fence is stuck".to_string(),
            });
        }
        self.inner.set_writes_frozen(frozen).await
    }

    async fn writes_frozen(&self) -> Result<bool, DatabaseError> {
        self.inner.writes_frozen().await
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Test config for the `users` table with fast polling.
#[allow(dead_code)]
pub fn test_config() -> TandemConfig {
    let mut config = TandemConfig::default();
    config.tables = vec!["users".to_string()];
    config.sync.poll_interval_ms = 5;
    config.sync.backoff_base_ms = 5;
    config.sync.backoff_max_ms = 50;
    config.cutover.grace_period_ms = 1_000;
    config.cutover.drain_timeout_ms = 2_000;
    config.cutover.tick_interval_ms = 100;
    config.verify.retry_budget = 1;
    config
}

/// Two in-memory databases and an engine between them.
#[allow(dead_code)]
pub struct Pair {
    pub clock: ManualClock,
    pub blue: Arc<MemoryDatabase>,
    pub green: Arc<MemoryDatabase>,
    pub engine: Arc<SyncEngine>,
}

#[allow(dead_code)]
pub fn new_pair(config: &TandemConfig) -> Pair {
    let clock = ManualClock::starting_now();
    let shared: SharedClock = Arc::new(clock.clone());
    let blue = Arc::new(MemoryDatabase::new(Side::Blue, shared.clone()));
    let green = Arc::new(MemoryDatabase::new(Side::Green, shared.clone()));
    let engine = Arc::new(SyncEngine::new(
        blue.clone(),
        green.clone(),
        &config.sync,
        shared,
    ));
    Pair {
        clock,
        blue,
        green,
        engine,
    }
}

/// Build an engine over arbitrary database handles.
#[allow(dead_code)]
pub fn engine_between(
    blue: SharedDatabase,
    green: SharedDatabase,
    config: &TandemConfig,
    clock: SharedClock,
) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(blue, green, &config.sync, clock))
}

/// A cutover machine for `engine` with one schema migration for `users`.
#[allow(dead_code)]
pub fn new_machine(
    id: &str,
    config: &TandemConfig,
    engine: Arc<SyncEngine>,
    router: Arc<StaticRouter>,
    clock: SharedClock,
) -> CutoverStateMachine {
    CutoverStateMachine::new(
        id,
        config,
        engine,
        Arc::new(MemorySchemaStore::new()),
        router,
        clock,
    )
    .with_migrations(vec![SchemaMigration::new(
        1,
        "create users",
        "CREATE TABLE users (id BIGINT PRIMARY KEY, name TEXT, email TEXT)",
        "DROP TABLE users",
    )])
}

/// Let background pipelines run for a while of (paused) tokio time.
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
