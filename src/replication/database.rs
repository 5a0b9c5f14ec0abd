//! The capability the engine needs from each participating database.
//!
//! A [`Database`] can stream its committed row changes since a position,
//! execute a compare-and-set row write that is committed together with a
//! replication checkpoint, and run ordered reads for fingerprinting.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::{
    ChangeRecord, Position, PrimaryKey, RowVersion, Side, SyncPosition, VersionStamp,
};

/// Errors returned by a database connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    /// The database could not be reached.
    #[error("{side} database unavailable: {reason}")]
    Unavailable {
        /// Database that failed.
        side: Side,
        /// Underlying cause.
        reason: String,
    },
    /// The requested position is behind the retained change history.
    #[error("position {requested} for table {table} on {side} is behind the retained history (horizon {horizon})")]
    PositionPurged {
        /// Database that was read.
        side: Side,
        /// Table that was read.
        table: String,
        /// Position the caller asked for.
        requested: Position,
        /// Oldest position still readable.
        horizon: Position,
    },
    /// Local writes are fenced on this database.
    #[error("writes are frozen on {0} database")]
    WritesFrozen(Side),
    /// A local write violated a row constraint.
    #[error("constraint violation on {table}{key}: {reason}")]
    Constraint {
        /// Table written.
        table: String,
        /// Key written.
        key: PrimaryKey,
        /// What went wrong.
        reason: String,
    },
}

/// Result alias for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Changes committed on a database but not yet applied to its peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChanges {
    /// Number of pending changes.
    pub count: u64,
    /// Commit time of the oldest pending change.
    pub oldest_commit: Option<DateTime<Utc>>,
}

impl PendingChanges {
    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A bounded read of a database's change log for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Changes in commit order.
    pub changes: Vec<ChangeRecord>,
    /// Every change to the table at or before this position is in `changes`
    /// or was committed before the read started. Resuming from it skips
    /// nothing.
    pub scanned_through: Position,
}

/// Result of a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row version and checkpoint were committed together.
    Written,
    /// The row changed since it was read; nothing was written.
    StampMismatch,
}

/// A participating database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Which side of the migration this database is.
    fn side(&self) -> Side;

    /// Committed changes to `table` with position greater than `since`, in
    /// commit order, at most `limit` of them.
    ///
    /// Fails with [`DatabaseError::PositionPurged`] if `since` is older than
    /// the retained history.
    async fn changes_since(&self, table: &str, since: Position, limit: usize)
        -> Result<ChangeBatch>;

    /// Changes to `table` after `since` that originated on `origin`.
    async fn pending_changes(&self, table: &str, since: Position, origin: Side)
        -> Result<PendingChanges>;

    /// Position of the newest committed change.
    async fn head_position(&self) -> Result<Position>;

    /// Current version of a key, including tombstones.
    async fn read_version(&self, table: &str, key: &PrimaryKey) -> Result<Option<RowVersion>>;

    /// Write `version` if the key's current stamp equals `expected`
    /// (`None` meaning the key was never written), committing `checkpoint`
    /// in the same atomic step.
    async fn write_version(
        &self,
        table: &str,
        key: &PrimaryKey,
        expected: Option<VersionStamp>,
        version: RowVersion,
        checkpoint: &SyncPosition,
    ) -> Result<WriteOutcome>;

    /// Persist a checkpoint on its own. Checkpoints never move backwards;
    /// an older position is ignored.
    async fn store_checkpoint(&self, checkpoint: &SyncPosition) -> Result<()>;

    /// Last checkpoint stored for changes from `source` on `table`.
    async fn load_checkpoint(&self, source: Side, table: &str) -> Result<Option<Position>>;

    /// Versions of `table` ordered by primary key, starting after `after`,
    /// at most `limit` of them. Tombstones are included.
    async fn scan_versions(
        &self,
        table: &str,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<(PrimaryKey, RowVersion)>>;

    /// Fence or unfence local (application) writes. Replicated writes are
    /// never fenced.
    async fn set_writes_frozen(&self, frozen: bool) -> Result<()>;

    /// Whether local writes are currently fenced.
    async fn writes_frozen(&self) -> Result<bool>;
}

/// Shared database handle.
pub type SharedDatabase = Arc<dyn Database>;
