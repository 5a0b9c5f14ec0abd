//! Change applier: idempotent, conflict-aware writes to the opposite side.
//!
//! A change is applied with a compare-and-set against the target's current
//! version of the key. The write and the replication checkpoint commit
//! together, so a crash can never leave a change applied but unrecorded.
//!
//! Two writers touching the same key on different sides produce a conflict.
//! Conflicts are resolved by a [`ConflictResolver`] (last-writer-wins by
//! default), logged, and kept in the [`ConflictLog`] for audit.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::change::{
    ChangeRecord, Direction, PrimaryKey, RowVersion, Side, SyncPosition, VersionStamp,
};
use super::database::{Database, WriteOutcome};
use super::error::{Result, SyncError};
use crate::clock::SharedClock;

/// Compare-and-set attempts before giving up on a key.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Decides which version survives when both sides modified a key.
pub trait ConflictResolver: Send + Sync + fmt::Debug {
    /// Short policy name for logs.
    fn name(&self) -> &'static str;

    /// Whether `incoming` should replace `current` on the target.
    ///
    /// Must be a total order over distinct stamps so that both directions
    /// agree on the winner.
    fn prefer_incoming(&self, current: &VersionStamp, incoming: &VersionStamp) -> bool;
}

/// Last-writer-wins by commit time. Equal commit times go to `tie_break`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastWriterWins {
    /// Side that wins when commit times are equal.
    pub tie_break: Side,
}

impl Default for LastWriterWins {
    fn default() -> Self {
        Self {
            tie_break: Side::Blue,
        }
    }
}

impl ConflictResolver for LastWriterWins {
    fn name(&self) -> &'static str {
        "last_writer_wins"
    }

    fn prefer_incoming(&self, current: &VersionStamp, incoming: &VersionStamp) -> bool {
        match incoming.committed_at.cmp(&current.committed_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                incoming.origin == self.tie_break && current.origin != self.tie_break
            }
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The target's version was kept; the incoming change was discarded.
    KeptTarget,
    /// The incoming change overwrote the target's version.
    AppliedIncoming,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeptTarget => write!(f, "kept_target"),
            Self::AppliedIncoming => write!(f, "applied_incoming"),
        }
    }
}

/// Audit entry for one detected conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Table of the key.
    pub table: String,
    /// Conflicting key.
    pub key: PrimaryKey,
    /// Pipeline that detected the conflict.
    pub direction: Direction,
    /// Source position of the incoming change.
    pub position: u64,
    /// Stamp of the incoming change.
    pub incoming: VersionStamp,
    /// Stamp of the target's version, `None` if the key was absent.
    pub current: Option<VersionStamp>,
    /// Outcome.
    pub resolution: Resolution,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    /// Stamp of the version that survived.
    pub fn winner(&self) -> Option<VersionStamp> {
        match self.resolution {
            Resolution::AppliedIncoming => Some(self.incoming),
            Resolution::KeptTarget => self.current,
        }
    }
}

/// Append-only store of conflict records.
#[derive(Debug, Default)]
pub struct ConflictLog {
    records: Mutex<Vec<ConflictRecord>>,
}

impl ConflictLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn record(&self, record: ConflictRecord) {
        self.records.lock().push(record);
    }

    /// Every record, oldest first.
    pub fn all(&self) -> Vec<ConflictRecord> {
        self.records.lock().clone()
    }

    /// Records for one key.
    pub fn for_key(&self, table: &str, key: &PrimaryKey) -> Vec<ConflictRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.table == table && &r.key == key)
            .cloned()
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no conflict was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Result of applying one change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was written.
    Applied,
    /// The target already reflects this change (or a later one from the
    /// same source); only the checkpoint moved.
    AlreadyApplied,
    /// Both sides modified the key; the record says who won.
    Conflict(ConflictRecord),
}

impl ApplyOutcome {
    /// Whether the outcome is a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Applies captured changes to one target database.
#[derive(Debug, Clone)]
pub struct ChangeApplier {
    resolver: Arc<dyn ConflictResolver>,
    conflicts: Arc<ConflictLog>,
    clock: SharedClock,
}

impl ChangeApplier {
    /// Create an applier with the given policy and audit log.
    pub fn new(
        resolver: Arc<dyn ConflictResolver>,
        conflicts: Arc<ConflictLog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            resolver,
            conflicts,
            clock,
        }
    }

    /// The audit log conflicts are written to.
    pub fn conflicts(&self) -> &Arc<ConflictLog> {
        &self.conflicts
    }

    /// Apply `change`, captured by `direction`, to `target`.
    ///
    /// Applying the same change more than once leaves the target as if it
    /// had been applied once.
    pub async fn apply(
        &self,
        target: &dyn Database,
        direction: Direction,
        change: &ChangeRecord,
    ) -> Result<ApplyOutcome> {
        let source = direction.source();
        let checkpoint = SyncPosition::new(source, change.table.as_str(), change.position);
        let incoming = change.stamp;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = target.read_version(&change.table, &change.key).await?;

            if let Some(cur) = &current {
                let replayed = cur.stamp == incoming
                    || (cur.stamp.origin == source
                        && cur.stamp.committed_at > incoming.committed_at);
                if replayed {
                    target.store_checkpoint(&checkpoint).await?;
                    debug!(
                        %direction,
                        table = %change.table,
                        key = %change.key,
                        position = change.position,
                        "change already applied"
                    );
                    return Ok(ApplyOutcome::AlreadyApplied);
                }
            }

            let conflict = match &current {
                Some(cur) => {
                    cur.values != change.before
                        || cur.stamp.committed_at > incoming.committed_at
                }
                None => change.before.is_some(),
            };
            let take_incoming = match &current {
                Some(cur) if conflict => self.resolver.prefer_incoming(&cur.stamp, &incoming),
                _ => true,
            };

            if !take_incoming {
                target.store_checkpoint(&checkpoint).await?;
                let record = self.conflict_record(
                    direction,
                    change,
                    current.as_ref(),
                    Resolution::KeptTarget,
                );
                return Ok(ApplyOutcome::Conflict(record));
            }

            let expected = current.as_ref().map(|v| v.stamp);
            match target
                .write_version(
                    &change.table,
                    &change.key,
                    expected,
                    change.to_version(),
                    &checkpoint,
                )
                .await?
            {
                WriteOutcome::Written if conflict => {
                    let record = self.conflict_record(
                        direction,
                        change,
                        current.as_ref(),
                        Resolution::AppliedIncoming,
                    );
                    return Ok(ApplyOutcome::Conflict(record));
                }
                WriteOutcome::Written => return Ok(ApplyOutcome::Applied),
                WriteOutcome::StampMismatch => {
                    debug!(
                        %direction,
                        table = %change.table,
                        key = %change.key,
                        "row changed during apply, retrying"
                    );
                }
            }
        }

        Err(SyncError::ApplyContention {
            table: change.table.clone(),
            key: change.key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Reconcile `target` with a full source version of a key, without a
    /// before image. Used by table resync: the incoming version is written
    /// only if the resolver orders it after the target's version.
    ///
    /// `checkpoint` is committed with the write and must not move past
    /// changes that are still unapplied.
    pub async fn apply_version(
        &self,
        target: &dyn Database,
        table: &str,
        key: &PrimaryKey,
        version: &RowVersion,
        checkpoint: &SyncPosition,
    ) -> Result<ApplyOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = target.read_version(table, key).await?;
            let take = match &current {
                None => !version.is_tombstone(),
                Some(cur) if cur.stamp == version.stamp => false,
                Some(cur) => self.resolver.prefer_incoming(&cur.stamp, &version.stamp),
            };
            if !take {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let expected = current.as_ref().map(|v| v.stamp);
            match target
                .write_version(table, key, expected, version.clone(), checkpoint)
                .await?
            {
                WriteOutcome::Written => return Ok(ApplyOutcome::Applied),
                WriteOutcome::StampMismatch => continue,
            }
        }
        Err(SyncError::ApplyContention {
            table: table.to_string(),
            key: key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    fn conflict_record(
        &self,
        direction: Direction,
        change: &ChangeRecord,
        current: Option<&RowVersion>,
        resolution: Resolution,
    ) -> ConflictRecord {
        let record = ConflictRecord {
            table: change.table.clone(),
            key: change.key.clone(),
            direction,
            position: change.position,
            incoming: change.stamp,
            current: current.map(|v| v.stamp),
            resolution,
            detected_at: self.clock.now(),
        };
        warn!(
            %direction,
            table = %record.table,
            key = %record.key,
            position = record.position,
            incoming_at = %record.incoming.committed_at,
            current_at = ?record.current.map(|s| s.committed_at),
            policy = self.resolver.name(),
            %resolution,
            "write conflict"
        );
        tandem_core::metrics::record_conflict(direction.as_str(), &record.table);
        self.conflicts.record(record.clone());
        record
    }
}
