//! In-memory [`Database`] backend.
//!
//! Models the parts of a relational database the engine relies on: a
//! per-database change log with monotonically increasing positions, commit
//! stamps, row versions with tombstones, a checkpoint table written in the
//! same atomic step as replicated rows, and a write fence. It also exposes
//! the application-side write API and a few fault-injection hooks.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::change::{
    ChangeRecord, Operation, Position, PrimaryKey, Row, RowVersion, Side, SyncPosition,
    VersionStamp,
};
use super::database::{
    ChangeBatch, Database, DatabaseError, PendingChanges, Result, WriteOutcome,
};
use crate::clock::SharedClock;

type Table = BTreeMap<PrimaryKey, RowVersion>;

struct Inner {
    tables: HashMap<String, Table>,
    log: VecDeque<ChangeRecord>,
    /// Positions at or below the horizon have been purged.
    horizon: Position,
    head: Position,
    checkpoints: HashMap<(Side, String), Position>,
    last_stamp: Option<DateTime<Utc>>,
    frozen: bool,
    available: bool,
}

impl Inner {
    fn next_commit_time(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match self.last_stamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(at);
        at
    }

    fn observe_stamp(&mut self, at: DateTime<Utc>) {
        if self.last_stamp.map_or(true, |last| at > last) {
            self.last_stamp = Some(at);
        }
    }

    fn append(
        &mut self,
        table: &str,
        key: &PrimaryKey,
        before: Option<Row>,
        version: &RowVersion,
    ) -> Position {
        self.head += 1;
        let operation = match (&before, &version.values) {
            (_, None) => Operation::Delete,
            (None, Some(_)) => Operation::Insert,
            (Some(_), Some(_)) => Operation::Update,
        };
        self.log.push_back(ChangeRecord {
            table: table.to_string(),
            operation,
            key: key.clone(),
            before,
            after: version.values.clone(),
            position: self.head,
            stamp: version.stamp,
        });
        self.head
    }

    fn advance_checkpoint(&mut self, checkpoint: &SyncPosition) {
        let slot = self
            .checkpoints
            .entry((checkpoint.source, checkpoint.table.clone()))
            .or_insert(0);
        if checkpoint.position > *slot {
            *slot = checkpoint.position;
        }
    }
}

/// An in-memory database participating in a migration.
pub struct MemoryDatabase {
    side: Side,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryDatabase")
            .field("side", &self.side)
            .field("head", &inner.head)
            .field("horizon", &inner.horizon)
            .field("frozen", &inner.frozen)
            .field("available", &inner.available)
            .finish()
    }
}

impl MemoryDatabase {
    #[cfg(test)]
    fn advance_checkpoint_for_test(&self, source: Side, table: &str, position: Position) {
        self.inner.lock().advance_checkpoint(&SyncPosition {
            source,
            table: table.to_string(),
            position,
        });
    }

    /// Create an empty database for `side`.
    pub fn new(side: Side, clock: SharedClock) -> Self {
        Self {
            side,
            clock,
            inner: Mutex::new(Inner {
                tables: HashMap::new(),
                log: VecDeque::new(),
                horizon: 0,
                head: 0,
                checkpoints: HashMap::new(),
                last_stamp: None,
                frozen: false,
                available: true,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Application writes
    // ------------------------------------------------------------------

    /// Insert a new row. Fails if a live row already has this key.
    pub fn insert(&self, table: &str, key: impl Into<PrimaryKey>, values: Row) -> Result<Position> {
        let key = key.into();
        let mut inner = self.lock_for_local_write()?;
        let live = current_values(&inner, table, &key);
        if live.is_some() {
            return Err(DatabaseError::Constraint {
                table: table.to_string(),
                key,
                reason: "duplicate primary key".to_string(),
            });
        }
        Ok(self.local_write(&mut inner, table, key, Some(values)))
    }

    /// Replace the columns of an existing row. Fails if the row is missing.
    pub fn update(&self, table: &str, key: impl Into<PrimaryKey>, values: Row) -> Result<Position> {
        let key = key.into();
        let mut inner = self.lock_for_local_write()?;
        if current_values(&inner, table, &key).is_none() {
            return Err(DatabaseError::Constraint {
                table: table.to_string(),
                key,
                reason: "row does not exist".to_string(),
            });
        }
        Ok(self.local_write(&mut inner, table, key, Some(values)))
    }

    /// Insert or replace a row.
    pub fn upsert(&self, table: &str, key: impl Into<PrimaryKey>, values: Row) -> Result<Position> {
        let key = key.into();
        let mut inner = self.lock_for_local_write()?;
        Ok(self.local_write(&mut inner, table, key, Some(values)))
    }

    /// Delete a row. Returns `None` if there was nothing to delete.
    pub fn delete(&self, table: &str, key: impl Into<PrimaryKey>) -> Result<Option<Position>> {
        let key = key.into();
        let mut inner = self.lock_for_local_write()?;
        if current_values(&inner, table, &key).is_none() {
            return Ok(None);
        }
        Ok(Some(self.local_write(&mut inner, table, key, None)))
    }

    /// Live column values of a row.
    pub fn get(&self, table: &str, key: impl Into<PrimaryKey>) -> Option<Row> {
        let key = key.into();
        let inner = self.inner.lock();
        current_values(&inner, table, &key)
    }

    /// Full version (values or tombstone plus stamp) of a key.
    pub fn version(&self, table: &str, key: impl Into<PrimaryKey>) -> Option<RowVersion> {
        let key = key.into();
        let inner = self.inner.lock();
        inner.tables.get(table).and_then(|t| t.get(&key)).cloned()
    }

    /// Number of live rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .tables
            .get(table)
            .map(|t| t.values().filter(|v| !v.is_tombstone()).count())
            .unwrap_or(0)
    }

    /// Current head of the change log.
    pub fn head(&self) -> Position {
        self.inner.lock().head
    }

    /// Checkpoint stored for `(source, table)`, if any.
    pub fn checkpoint(&self, source: Side, table: &str) -> Option<Position> {
        let inner = self.inner.lock();
        inner.checkpoints.get(&(source, table.to_string())).copied()
    }

    // ------------------------------------------------------------------
    // Fault injection and maintenance
    // ------------------------------------------------------------------

    /// Make every call fail with [`DatabaseError::Unavailable`] (or recover).
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
        debug!(side = %self.side, available, "database availability changed");
    }

    /// Discard change history at or below `up_to`.
    pub fn purge_history(&self, up_to: Position) {
        let mut inner = self.inner.lock();
        let up_to = up_to.min(inner.head);
        while inner.log.front().map_or(false, |c| c.position <= up_to) {
            inner.log.pop_front();
        }
        if up_to > inner.horizon {
            inner.horizon = up_to;
        }
        debug!(side = %self.side, horizon = inner.horizon, "purged change history");
    }

    /// Purge history every peer pipeline has already consumed.
    ///
    /// The horizon moves to the lowest checkpoint `peer` holds for this
    /// side across `tables`. A table with no checkpoint yet pins the log.
    /// Returns the resulting horizon.
    pub fn compact_history(&self, peer: &MemoryDatabase, tables: &[String]) -> Position {
        let consumed = tables
            .iter()
            .map(|table| peer.checkpoint(self.side, table))
            .try_fold(Position::MAX, |low, cp| cp.map(|cp| low.min(cp)));
        if let Some(up_to) = consumed.filter(|_| !tables.is_empty()) {
            self.purge_history(up_to);
        }
        self.inner.lock().horizon
    }

    /// Number of change records still held in the log.
    pub fn log_len(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Overwrite a row without emitting a change record, keeping its stamp.
    ///
    /// Models drift introduced outside the replicated write path.
    pub fn write_untracked(&self, table: &str, key: impl Into<PrimaryKey>, values: Option<Row>) {
        let key = key.into();
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let stamp = inner
            .tables
            .get(table)
            .and_then(|t| t.get(&key))
            .map(|v| v.stamp)
            .unwrap_or_else(|| VersionStamp::new(now, self.side));
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key, RowVersion { values, stamp });
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn lock_for_local_write(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(self.unavailable());
        }
        if inner.frozen {
            return Err(DatabaseError::WritesFrozen(self.side));
        }
        Ok(inner)
    }

    fn lock_available(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(self.unavailable());
        }
        Ok(inner)
    }

    fn unavailable(&self) -> DatabaseError {
        DatabaseError::Unavailable {
            side: self.side,
            reason: "connection refused".to_string(),
        }
    }

    fn local_write(
        &self,
        inner: &mut Inner,
        table: &str,
        key: PrimaryKey,
        values: Option<Row>,
    ) -> Position {
        let committed_at = inner.next_commit_time(self.clock.now());
        let version = RowVersion {
            values,
            stamp: VersionStamp::new(committed_at, self.side),
        };
        let before = current_values(inner, table, &key);
        let position = inner.append(table, &key, before, &version);
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key, version);
        position
    }
}

fn current_values(inner: &Inner, table: &str, key: &PrimaryKey) -> Option<Row> {
    inner
        .tables
        .get(table)
        .and_then(|t| t.get(key))
        .and_then(|v| v.values.clone())
}

#[async_trait]
impl Database for MemoryDatabase {
    fn side(&self) -> Side {
        self.side
    }

    async fn changes_since(&self, table: &str, since: Position, limit: usize) -> Result<ChangeBatch> {
        let inner = self.lock_available()?;
        if since < inner.horizon {
            return Err(DatabaseError::PositionPurged {
                side: self.side,
                table: table.to_string(),
                requested: since,
                horizon: inner.horizon,
            });
        }

        let mut changes = Vec::new();
        for change in inner.log.iter().filter(|c| c.position > since) {
            if change.table != table {
                continue;
            }
            if changes.len() == limit {
                let scanned_through = changes
                    .last()
                    .map(|c: &ChangeRecord| c.position)
                    .unwrap_or(since);
                return Ok(ChangeBatch {
                    changes,
                    scanned_through,
                });
            }
            changes.push(change.clone());
        }

        Ok(ChangeBatch {
            changes,
            scanned_through: inner.head.max(since),
        })
    }

    async fn pending_changes(
        &self,
        table: &str,
        since: Position,
        origin: Side,
    ) -> Result<PendingChanges> {
        let inner = self.lock_available()?;
        let mut pending = PendingChanges::default();
        for change in inner
            .log
            .iter()
            .filter(|c| c.position > since && c.table == table && c.origin() == origin)
        {
            if pending.oldest_commit.is_none() {
                pending.oldest_commit = Some(change.committed_at());
            }
            pending.count += 1;
        }
        Ok(pending)
    }

    async fn head_position(&self) -> Result<Position> {
        Ok(self.lock_available()?.head)
    }

    async fn read_version(&self, table: &str, key: &PrimaryKey) -> Result<Option<RowVersion>> {
        let inner = self.lock_available()?;
        Ok(inner.tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn write_version(
        &self,
        table: &str,
        key: &PrimaryKey,
        expected: Option<VersionStamp>,
        version: RowVersion,
        checkpoint: &SyncPosition,
    ) -> Result<WriteOutcome> {
        let mut inner = self.lock_available()?;
        let current = inner.tables.get(table).and_then(|t| t.get(key)).cloned();
        if current.as_ref().map(|v| v.stamp) != expected {
            return Ok(WriteOutcome::StampMismatch);
        }

        let before = current.and_then(|v| v.values);
        inner.observe_stamp(version.stamp.committed_at);
        inner.append(table, key, before, &version);
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.clone(), version);
        inner.advance_checkpoint(checkpoint);
        Ok(WriteOutcome::Written)
    }

    async fn store_checkpoint(&self, checkpoint: &SyncPosition) -> Result<()> {
        let mut inner = self.lock_available()?;
        inner.advance_checkpoint(checkpoint);
        Ok(())
    }

    async fn load_checkpoint(&self, source: Side, table: &str) -> Result<Option<Position>> {
        let inner = self.lock_available()?;
        Ok(inner.checkpoints.get(&(source, table.to_string())).copied())
    }

    async fn scan_versions(
        &self,
        table: &str,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<(PrimaryKey, RowVersion)>> {
        use std::ops::Bound;

        let inner = self.lock_available()?;
        let Some(rows) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_writes_frozen(&self, frozen: bool) -> Result<()> {
        let mut inner = self.lock_available()?;
        inner.frozen = frozen;
        debug!(side = %self.side, frozen, "write fence changed");
        Ok(())
    }

    async fn writes_frozen(&self) -> Result<bool> {
        Ok(self.lock_available()?.frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::replication::change::{row, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn db(side: Side) -> (MemoryDatabase, ManualClock) {
        let clock = ManualClock::starting_now();
        (MemoryDatabase::new(side, Arc::new(clock.clone())), clock)
    }

    fn user(name: &str) -> Row {
        row([("name", Value::from(name))])
    }

    #[tokio::test]
    async fn test_compaction_stops_at_slowest_peer_checkpoint() {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let blue = MemoryDatabase::new(Side::Blue, shared.clone());
        let green = MemoryDatabase::new(Side::Green, shared);
        let tables = vec!["users".to_string(), "orders".to_string()];
        for id in 1..=4 {
            blue.insert("users", id, user("ada")).unwrap();
        }
        blue.insert("orders", 1, row([("total", 5i64)])).unwrap();

        // Nothing consumed from orders yet, so the log stays whole.
        green.advance_checkpoint_for_test(Side::Blue, "users", 4);
        assert_eq!(blue.compact_history(&green, &tables), 0);
        assert_eq!(blue.log_len(), 5);

        green.advance_checkpoint_for_test(Side::Blue, "orders", 2);
        assert_eq!(blue.compact_history(&green, &tables), 2);
        assert_eq!(blue.log_len(), 3);
        let err = blue.changes_since("users", 1, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::PositionPurged { horizon: 2, .. }));
        let rest = blue.changes_since("users", 2, 10).await.unwrap();
        assert_eq!(rest.changes.len(), 2);

        green.advance_checkpoint_for_test(Side::Blue, "orders", 5);
        assert_eq!(blue.compact_history(&green, &tables), 4);
        assert_eq!(blue.log_len(), 1);
    }

    #[tokio::test]
    async fn test_local_writes_are_logged_in_order() {
        let (db, _) = db(Side::Blue);
        assert_eq!(db.insert("users", 1, user("ada")).unwrap(), 1);
        assert_eq!(db.update("users", 1, user("grace")).unwrap(), 2);
        assert_eq!(db.delete("users", 1).unwrap(), Some(3));
        assert_eq!(db.delete("users", 1).unwrap(), None);

        let batch = db.changes_since("users", 0, 10).await.unwrap();
        let ops: Vec<_> = batch.changes.iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Delete]);
        assert_eq!(batch.changes[1].before, Some(user("ada")));
        assert_eq!(batch.scanned_through, 3);
    }

    #[tokio::test]
    async fn test_commit_times_strictly_increase() {
        let (db, _) = db(Side::Blue);
        db.insert("users", 1, user("a")).unwrap();
        db.insert("users", 2, user("b")).unwrap();
        let a = db.version("users", 1).unwrap().stamp.committed_at;
        let b = db.version("users", 2).unwrap().stamp.committed_at;
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_changes_since_respects_limit_and_table() {
        let (db, _) = db(Side::Blue);
        db.insert("users", 1, user("a")).unwrap();
        db.insert("orders", 1, row([("total", 10i64)])).unwrap();
        db.insert("users", 2, user("b")).unwrap();

        let batch = db.changes_since("users", 0, 1).await.unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.scanned_through, 1);

        let batch = db.changes_since("users", batch.scanned_through, 10).await.unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].position, 3);
        assert_eq!(batch.scanned_through, 3);
    }

    #[tokio::test]
    async fn test_purged_position_is_rejected() {
        let (db, _) = db(Side::Blue);
        for i in 0..5 {
            db.insert("users", i, user("x")).unwrap();
        }
        db.purge_history(3);
        let err = db.changes_since("users", 1, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::PositionPurged { horizon: 3, .. }));
        let batch = db.changes_since("users", 3, 10).await.unwrap();
        assert_eq!(batch.changes.len(), 2);
    }

    #[tokio::test]
    async fn test_write_fence_blocks_local_writes_only() {
        let (db, clock) = db(Side::Blue);
        db.set_writes_frozen(true).await.unwrap();
        assert!(matches!(
            db.insert("users", 1, user("a")),
            Err(DatabaseError::WritesFrozen(Side::Blue))
        ));

        let version = RowVersion {
            values: Some(user("a")),
            stamp: VersionStamp::new(clock.now(), Side::Green),
        };
        let checkpoint = SyncPosition::new(Side::Green, "users", 1);
        let outcome = db
            .write_version("users", &PrimaryKey::single(1), None, version, &checkpoint)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(db.checkpoint(Side::Green, "users"), Some(1));
    }

    #[tokio::test]
    async fn test_write_version_compare_and_set() {
        let (db, clock) = db(Side::Green);
        db.insert("users", 1, user("local")).unwrap();
        let version = RowVersion {
            values: Some(user("remote")),
            stamp: VersionStamp::new(clock.now(), Side::Blue),
        };
        let checkpoint = SyncPosition::new(Side::Blue, "users", 4);
        let outcome = db
            .write_version("users", &PrimaryKey::single(1), None, version, &checkpoint)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::StampMismatch);
        assert_eq!(db.get("users", 1), Some(user("local")));
        assert_eq!(db.checkpoint(Side::Blue, "users"), None);
    }

    #[tokio::test]
    async fn test_checkpoints_never_regress() {
        let (db, _) = db(Side::Green);
        db.store_checkpoint(&SyncPosition::new(Side::Blue, "users", 10))
            .await
            .unwrap();
        db.store_checkpoint(&SyncPosition::new(Side::Blue, "users", 4))
            .await
            .unwrap();
        assert_eq!(db.load_checkpoint(Side::Blue, "users").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_replicated_stamp_raises_local_commit_time() {
        let (db, clock) = db(Side::Green);
        let future = clock.now() + ChronoDuration::seconds(30);
        let version = RowVersion {
            values: Some(user("remote")),
            stamp: VersionStamp::new(future, Side::Blue),
        };
        db.write_version(
            "users",
            &PrimaryKey::single(1),
            None,
            version,
            &SyncPosition::new(Side::Blue, "users", 1),
        )
        .await
        .unwrap();

        clock.advance(Duration::from_secs(1));
        db.update("users", 1, user("local")).unwrap();
        assert!(db.version("users", 1).unwrap().stamp.committed_at > future);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let (db, _) = db(Side::Blue);
        db.set_available(false);
        assert!(matches!(
            db.head_position().await,
            Err(DatabaseError::Unavailable { .. })
        ));
        db.set_available(true);
        assert_eq!(db.head_position().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scan_versions_pages_in_key_order() {
        let (db, _) = db(Side::Blue);
        for i in [3, 1, 2] {
            db.insert("users", i, user("x")).unwrap();
        }
        db.delete("users", 2).unwrap();

        let page = db.scan_versions("users", None, 2).await.unwrap();
        assert_eq!(page[0].0, PrimaryKey::single(1));
        assert!(page[1].1.is_tombstone());
        let rest = db.scan_versions("users", Some(&page[1].0), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, PrimaryKey::single(3));
        assert_eq!(db.row_count("users"), 2);
    }

    #[tokio::test]
    async fn test_pending_changes_filters_origin() {
        let (db, clock) = db(Side::Green);
        db.insert("users", 1, user("local")).unwrap();
        let version = RowVersion {
            values: Some(user("remote")),
            stamp: VersionStamp::new(clock.now(), Side::Blue),
        };
        db.write_version(
            "users",
            &PrimaryKey::single(2),
            None,
            version,
            &SyncPosition::new(Side::Blue, "users", 1),
        )
        .await
        .unwrap();

        let pending = db.pending_changes("users", 0, Side::Green).await.unwrap();
        assert_eq!(pending.count, 1);
        let none = db.pending_changes("users", 2, Side::Green).await.unwrap();
        assert!(none.is_empty());
    }
}
