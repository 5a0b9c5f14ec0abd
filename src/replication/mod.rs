//! Bidirectional row-level replication between the blue and green
//! databases.
//!
//! # Architecture
//!
//! ```text
//!  blue ──capture──► pipeline (blue_to_green) ──apply──► green
//!  blue ◄──apply──── pipeline (green_to_blue) ◄─capture── green
//! ```
//!
//! Each pipeline resumes from the checkpoint stored on its target, which
//! is written in the same atomic step as the data it covers. Changes carry
//! their origin so a replicated write is never captured again on the other
//! side.

pub mod applier;
pub mod capture;
pub mod change;
pub mod database;
pub mod engine;
pub mod error;
pub mod memory;
pub mod pipeline;

pub use applier::{
    ApplyOutcome, ChangeApplier, ConflictLog, ConflictRecord, ConflictResolver, LastWriterWins,
    Resolution,
};
pub use capture::{CaptureBatch, ChangeCapture};
pub use change::{
    row, ChangeRecord, Direction, Operation, Position, PrimaryKey, Row, RowVersion, Side,
    SyncPosition, Value, VersionStamp,
};
pub use database::{
    ChangeBatch, Database, DatabaseError, PendingChanges, SharedDatabase, WriteOutcome,
};
pub use engine::{LagMeasurement, LagScope, PipelineHealth, ResyncReport, SyncEngine};
pub use error::SyncError;
pub use memory::MemoryDatabase;
pub use pipeline::{
    backoff_delay, CycleReport, DirectionalPipeline, PipelineStatsSnapshot, PipelineStatus,
};
