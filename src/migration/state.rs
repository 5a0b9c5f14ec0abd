//! Cutover state and the persisted record of a cutover attempt.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::verifier::MismatchSample;
use crate::replication::Side;

/// Phase of a cutover attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverState {
    /// Green is being provisioned and its schema applied.
    Preparing,
    /// Both directions replicate; waiting for lag to settle.
    Syncing,
    /// Comparing both sides row by row.
    Verifying,
    /// Blue writes are fenced while the last changes drain.
    Freezing,
    /// Traffic moved to green. Irreversible.
    Switched,
    /// The attempt was aborted and traffic returned to blue.
    RolledBack,
    /// Verification kept failing.
    Failed,
}

impl CutoverState {
    /// Numeric code for metrics.
    pub fn code(self) -> u8 {
        match self {
            Self::Preparing => 0,
            Self::Syncing => 1,
            Self::Verifying => 2,
            Self::Freezing => 3,
            Self::Switched => 4,
            Self::RolledBack => 5,
            Self::Failed => 6,
        }
    }

    /// Whether the attempt is over. `Switched` still accepts a decommission
    /// confirmation but nothing else.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Switched | Self::RolledBack | Self::Failed)
    }

    /// Whether an operator abort is accepted.
    pub fn can_abort(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: CutoverState) -> bool {
        use CutoverState::*;
        match (self, next) {
            (Preparing, Syncing) => true,
            (Syncing, Verifying) => true,
            (Verifying, Freezing) | (Verifying, Failed) => true,
            (Freezing, Switched) | (Freezing, Syncing) => true,
            (from, RolledBack) => from.can_abort(),
            _ => false,
        }
    }

    /// The side application writes go to while in this state.
    pub fn serving_side(self) -> Side {
        match self {
            Self::Switched => Side::Green,
            _ => Side::Blue,
        }
    }
}

impl std::fmt::Display for CutoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Syncing => write!(f, "syncing"),
            Self::Verifying => write!(f, "verifying"),
            Self::Freezing => write!(f, "freezing"),
            Self::Switched => write!(f, "switched"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Previous state.
    pub from: CutoverState,
    /// New state.
    pub to: CutoverState,
    /// Why it happened.
    pub reason: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Outcome of the last verification of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVerification {
    /// Mismatched keys found.
    pub mismatches: u64,
    /// A few of them.
    pub sample: Vec<MismatchSample>,
}

/// Durable record of one cutover attempt. The only authoritative copy of
/// its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoverRecord {
    /// Attempt identifier.
    pub id: String,
    /// Current state.
    pub state: CutoverState,
    /// Tables being migrated.
    pub tables: Vec<String>,
    /// Every transition so far, oldest first.
    pub history: Vec<Transition>,
    /// Schema version green was brought to.
    pub schema_version: Option<u64>,
    /// Whether the operator asked to cut over.
    pub cutover_requested: bool,
    /// Verification runs in the current Verifying phase that found
    /// mismatches.
    pub verification_attempts: u32,
    /// Consecutive clean verification runs.
    pub clean_streak: u32,
    /// When the last fully clean verification finished.
    pub last_clean_at: Option<DateTime<Utc>>,
    /// Last verification outcome per table.
    pub last_verification: BTreeMap<String, TableVerification>,
    /// Since when lag has stayed under the threshold.
    pub lag_ok_since: Option<DateTime<Utc>>,
    /// When blue writes were fenced.
    pub frozen_at: Option<DateTime<Utc>>,
    /// Total time blue writes stayed fenced.
    pub frozen_ms_total: u64,
    /// Last failure surfaced to the operator.
    pub last_error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the old side was confirmed decommissioned.
    pub decommissioned_at: Option<DateTime<Utc>>,
}

impl CutoverRecord {
    /// New record in `Preparing`.
    pub fn new(id: impl Into<String>, tables: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state: CutoverState::Preparing,
            tables,
            history: Vec::new(),
            schema_version: None,
            cutover_requested: false,
            verification_attempts: 0,
            clean_streak: 0,
            last_clean_at: None,
            last_verification: BTreeMap::new(),
            lag_ok_since: None,
            frozen_at: None,
            frozen_ms_total: 0,
            last_error: None,
            created_at: now,
            decommissioned_at: None,
        }
    }

    /// Time the state was last entered.
    pub fn entered_at(&self) -> DateTime<Utc> {
        self.history
            .last()
            .map(|t| t.at)
            .unwrap_or(self.created_at)
    }
}

/// Read-only summary of a cutover attempt for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoverSnapshot {
    /// Attempt identifier.
    pub id: String,
    /// Current state.
    pub state: CutoverState,
    /// Side application writes go to.
    pub serving: Side,
    /// Transition history.
    pub history: Vec<Transition>,
    /// Failed verification runs in the current Verifying phase.
    pub verification_attempts: u32,
    /// Consecutive clean runs.
    pub clean_streak: u32,
    /// Last verification outcome per table.
    pub last_verification: BTreeMap<String, TableVerification>,
    /// Last surfaced failure.
    pub last_error: Option<String>,
    /// How long blue writes were fenced, including an ongoing freeze.
    pub write_pause_ms: u64,
    /// Decommission confirmation time.
    pub decommissioned_at: Option<DateTime<Utc>>,
}

impl CutoverSnapshot {
    /// Build from a record as of `now`.
    pub fn from_record(record: &CutoverRecord, now: DateTime<Utc>) -> Self {
        let ongoing = record
            .frozen_at
            .map(|at| crate::clock::elapsed_between(at, now).as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: record.id.clone(),
            state: record.state,
            serving: record.state.serving_side(),
            history: record.history.clone(),
            verification_attempts: record.verification_attempts,
            clean_streak: record.clean_streak,
            last_verification: record.last_verification.clone(),
            last_error: record.last_error.clone(),
            write_pause_ms: record.frozen_ms_total + ongoing,
            decommissioned_at: record.decommissioned_at,
        }
    }
}
