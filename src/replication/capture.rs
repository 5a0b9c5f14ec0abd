//! Change capture: bounded, restartable reads of a database's change log.

#![forbid(unsafe_code)]

use tracing::trace;

use super::change::{ChangeRecord, Direction, Position};
use super::database::Database;
use super::error::{Result, SyncError};

/// One bounded read of changes for a single table.
///
/// Iterating yields changes in source commit order. Pass
/// [`CaptureBatch::last_position`] as the next `since` to continue without
/// gaps, even when the batch is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureBatch {
    records: Vec<ChangeRecord>,
    since: Position,
    last_position: Position,
}

impl CaptureBatch {
    /// Position the read started after.
    pub fn since(&self) -> Position {
        self.since
    }

    /// Position to resume from.
    pub fn last_position(&self) -> Position {
        self.last_position
    }

    /// Captured changes.
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Number of captured changes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the read moved past `since`.
    pub fn advanced(&self) -> bool {
        self.last_position > self.since
    }
}

impl IntoIterator for CaptureBatch {
    type Item = ChangeRecord;
    type IntoIter = std::vec::IntoIter<ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Reads committed changes that originated on a database.
#[derive(Debug, Clone, Copy)]
pub struct ChangeCapture {
    batch_size: usize,
}

impl ChangeCapture {
    /// Capture at most `batch_size` log entries per call.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Changes to `table` on `source` after `since`.
    ///
    /// Changes that were themselves replicated from the peer are skipped so
    /// they are never sent back, but the returned position still moves past
    /// them.
    pub async fn capture(
        &self,
        source: &dyn Database,
        table: &str,
        since: Position,
    ) -> Result<CaptureBatch> {
        let side = source.side();
        let direction = Direction::from_source(side);
        let batch = source
            .changes_since(table, since, self.batch_size)
            .await
            .map_err(|e| SyncError::from_source(e, direction, table, since))?;

        let scanned = batch.changes.len();
        let records: Vec<ChangeRecord> = batch
            .changes
            .into_iter()
            .filter(|c| c.origin() == side)
            .collect();
        trace!(
            %direction,
            table,
            since,
            scanned,
            captured = records.len(),
            through = batch.scanned_through,
            "captured changes"
        );

        Ok(CaptureBatch {
            records,
            since,
            last_position: batch.scanned_through.max(since),
        })
    }
}
