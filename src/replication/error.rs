//! Errors raised by capture, apply and the sync engine.

#![forbid(unsafe_code)]

use super::change::{Direction, Position, PrimaryKey, Side};
use super::database::DatabaseError;

/// Errors from the replication pipelines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The source database could not be read. Retried with backoff.
    #[error("source {side} unavailable while capturing {table}: {reason}")]
    SourceUnavailable {
        /// Source database.
        side: Side,
        /// Table being captured.
        table: String,
        /// Underlying cause.
        reason: String,
    },

    /// The source no longer retains history at the stored position. The
    /// table needs a full resync before the pipeline can continue.
    #[error("position {last_good} for {table} ({direction}) was purged; history starts after {horizon}")]
    PositionInvalidated {
        /// Table whose history was lost.
        table: String,
        /// Direction of the halted pipeline.
        direction: Direction,
        /// Last position confirmed applied.
        last_good: Position,
        /// Oldest position still available on the source.
        horizon: Position,
    },

    /// A compare-and-set write kept losing races against local writes.
    #[error("gave up applying {table}{key} after {attempts} concurrent modifications")]
    ApplyContention {
        /// Table written.
        table: String,
        /// Key written.
        key: PrimaryKey,
        /// Attempts made.
        attempts: u32,
    },

    /// A pipeline already runs for the table.
    #[error("sync is already running for table {0}")]
    AlreadyRunning(String),

    /// No pipeline runs for the table.
    #[error("sync is not running for table {0}")]
    NotRunning(String),

    /// The operation needs the pipeline to be stopped.
    #[error("pipeline {direction} for {table} is active")]
    PipelineActive {
        /// Table of the pipeline.
        table: String,
        /// Direction of the pipeline.
        direction: Direction,
    },

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable { .. } | Self::ApplyContention { .. } => true,
            Self::Database(DatabaseError::Unavailable { .. }) => true,
            _ => false,
        }
    }

    /// Map a source-side read failure for `direction` and `table`.
    pub(crate) fn from_source(
        err: DatabaseError,
        direction: Direction,
        table: &str,
        since: Position,
    ) -> Self {
        match err {
            DatabaseError::Unavailable { side, reason } => Self::SourceUnavailable {
                side,
                table: table.to_string(),
                reason,
            },
            DatabaseError::PositionPurged { horizon, .. } => Self::PositionInvalidated {
                table: table.to_string(),
                direction,
                last_good: since,
                horizon,
            },
            other => Self::Database(other),
        }
    }
}

/// Result alias for replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let transient = SyncError::from_source(
            DatabaseError::Unavailable {
                side: Side::Blue,
                reason: "timeout".into(),
            },
            Direction::BlueToGreen,
            "users",
            4,
        );
        assert!(transient.is_retryable());

        let purged = SyncError::from_source(
            DatabaseError::PositionPurged {
                side: Side::Blue,
                table: "users".into(),
                requested: 4,
                horizon: 9,
            },
            Direction::BlueToGreen,
            "users",
            4,
        );
        assert!(!purged.is_retryable());
        assert_eq!(
            purged,
            SyncError::PositionInvalidated {
                table: "users".into(),
                direction: Direction::BlueToGreen,
                last_good: 4,
                horizon: 9,
            }
        );
        assert!(!SyncError::AlreadyRunning("users".into()).is_retryable());
    }
}
