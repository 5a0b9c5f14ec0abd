//! One directional Capture to Apply pipeline for one table.
//!
//! The pipeline reads its starting position from the checkpoint stored on
//! the target, captures a bounded batch from the source, applies it change by
//! change, and checkpoints the end of the batch. The background loop repeats
//! that cycle, idles on an empty log, backs off on transient errors and halts
//! on a purged position.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::applier::{ApplyOutcome, ChangeApplier};
use super::capture::ChangeCapture;
use super::change::{Direction, Position, SyncPosition};
use super::database::SharedDatabase;
use super::error::{Result, SyncError};

/// Command sent from the engine to a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineControl {
    /// Capture and apply.
    Run,
    /// Stop after the in-flight change and wait.
    Pause,
    /// Exit the loop.
    Stop,
}

/// Health of a pipeline as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Applying a batch.
    Running,
    /// Caught up, polling for new changes.
    Idle,
    /// Paused by the engine.
    Paused,
    /// Waiting to retry after a transient error.
    Backoff,
    /// Stopped by a non-retryable error; needs a resync.
    Halted,
    /// Loop exited.
    Stopped,
}

impl PipelineStatus {
    /// Whether the pipeline is not applying and will not apply until told to.
    pub fn is_quiescent(self) -> bool {
        matches!(self, Self::Paused | Self::Halted | Self::Stopped)
    }

    /// Whether the pipeline is in an error state.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Halted)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Paused => write!(f, "paused"),
            Self::Backoff => write!(f, "backoff"),
            Self::Halted => write!(f, "halted"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Running counters of a pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    captured: AtomicU64,
    applied: AtomicU64,
    already_applied: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
    position: AtomicU64,
}

impl PipelineStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            already_applied: self.already_applied.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            position: self.position.load(Ordering::Relaxed),
        }
    }

    fn advance_position(&self, position: Position) {
        self.position.fetch_max(position, Ordering::Relaxed);
    }
}

/// Copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    /// Changes captured from the source.
    pub captured: u64,
    /// Changes written to the target (conflicts won by the incoming side
    /// included).
    pub applied: u64,
    /// Changes found already applied.
    pub already_applied: u64,
    /// Conflicts detected.
    pub conflicts: u64,
    /// Transient errors retried.
    pub retries: u64,
    /// Last checkpointed source position.
    pub position: Position,
}

/// What one capture and apply cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Checkpoint the cycle started from.
    pub since: Position,
    /// Checkpoint after the cycle.
    pub position: Position,
    /// Changes captured.
    pub captured: usize,
    /// Changes written.
    pub applied: usize,
    /// Conflicts detected.
    pub conflicts: usize,
    /// The cycle stopped early because the pipeline was paused.
    pub interrupted: bool,
}

impl CycleReport {
    /// Whether the cycle moved the checkpoint.
    pub fn advanced(&self) -> bool {
        self.position > self.since
    }
}

/// Exponential backoff with ±25% jitter for the given consecutive failure.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(base_ms);
    if attempt == 0 {
        return base;
    }
    // 2^(attempt-1) * base, capped at max
    let shift = attempt.min(20) - 1;
    let exp = base_ms.saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
    let capped = exp.min(max_ms);
    let jitter = (capped / 4) as i64;
    let offset = if jitter > 0 {
        (rand::random::<u64>() % (jitter as u64 * 2)) as i64 - jitter
    } else {
        0
    };
    Duration::from_millis((capped as i64 + offset).max(1) as u64)
}

/// Timing knobs of the background loop.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTiming {
    /// Sleep between polls when caught up.
    pub poll_interval: Duration,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Retry delay cap.
    pub backoff_max: Duration,
}

impl From<&tandem_core::config::SyncConfig> for PipelineTiming {
    fn from(config: &tandem_core::config::SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// A Capture to Apply pipeline for one direction and table.
#[derive(Clone)]
pub struct DirectionalPipeline {
    direction: Direction,
    table: String,
    source: SharedDatabase,
    target: SharedDatabase,
    capture: ChangeCapture,
    applier: ChangeApplier,
    timing: PipelineTiming,
    stats: Arc<PipelineStats>,
    last_error: Arc<Mutex<Option<SyncError>>>,
}

impl fmt::Debug for DirectionalPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionalPipeline")
            .field("direction", &self.direction)
            .field("table", &self.table)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl DirectionalPipeline {
    /// Build a pipeline. `source` and `target` must be the sides named by
    /// `direction`.
    pub fn new(
        direction: Direction,
        table: impl Into<String>,
        source: SharedDatabase,
        target: SharedDatabase,
        capture: ChangeCapture,
        applier: ChangeApplier,
        timing: PipelineTiming,
    ) -> Self {
        debug_assert_eq!(source.side(), direction.source());
        debug_assert_eq!(target.side(), direction.target());
        Self {
            direction,
            table: table.into(),
            source,
            target,
            capture,
            applier,
            timing,
            stats: Arc::new(PipelineStats::default()),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Direction of the pipeline.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Table of the pipeline.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Last error seen by the loop, cleared by a successful cycle.
    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().clone()
    }

    /// Last position confirmed applied, read from the target.
    pub async fn checkpoint(&self) -> Result<Position> {
        Ok(self
            .target
            .load_checkpoint(self.direction.source(), &self.table)
            .await?
            .unwrap_or(0))
    }

    /// Run one capture and apply cycle to completion.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.cycle(|| true).await
    }

    async fn cycle(&self, keep_going: impl Fn() -> bool) -> Result<CycleReport> {
        let since = self.checkpoint().await?;
        let batch = self
            .capture
            .capture(self.source.as_ref(), &self.table, since)
            .await?;
        let last = batch.last_position();
        let advanced = batch.advanced();

        let mut report = CycleReport {
            since,
            position: since,
            captured: batch.len(),
            ..CycleReport::default()
        };
        self.stats
            .captured
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        for change in batch {
            if !keep_going() {
                report.interrupted = true;
                break;
            }
            let outcome = self
                .applier
                .apply(self.target.as_ref(), self.direction, &change)
                .await?;
            match outcome {
                ApplyOutcome::Applied => {
                    report.applied += 1;
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                }
                ApplyOutcome::AlreadyApplied => {
                    self.stats.already_applied.fetch_add(1, Ordering::Relaxed);
                }
                ApplyOutcome::Conflict(record) => {
                    report.conflicts += 1;
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    if record.resolution == super::applier::Resolution::AppliedIncoming {
                        report.applied += 1;
                        self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            report.position = change.position;
            self.stats.advance_position(change.position);
        }

        if advanced && !report.interrupted {
            self.target
                .store_checkpoint(&SyncPosition::new(
                    self.direction.source(),
                    self.table.as_str(),
                    last,
                ))
                .await?;
            report.position = last;
            self.stats.advance_position(last);
        }

        if report.applied > 0 {
            tandem_core::metrics::record_changes_applied(
                self.direction.as_str(),
                &self.table,
                report.applied as u64,
            );
        }
        Ok(report)
    }

    /// Background loop driven by `control`, publishing its health on
    /// `status`. Returns when told to stop or when every control sender is
    /// gone.
    pub async fn run(
        self,
        mut control: watch::Receiver<PipelineControl>,
        status: watch::Sender<PipelineStatus>,
    ) {
        let direction = self.direction;
        let table = self.table.clone();
        info!(%direction, table = %table, "pipeline started");
        let mut failures: u32 = 0;

        loop {
            let command = *control.borrow_and_update();
            match command {
                PipelineControl::Stop => break,
                PipelineControl::Pause => {
                    set_status(&status, PipelineStatus::Paused);
                    if control.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                PipelineControl::Run => set_status(&status, PipelineStatus::Running),
            }

            let outcome = {
                let control = &control;
                self.cycle(|| *control.borrow() == PipelineControl::Run)
                    .await
            };

            match outcome {
                Ok(report) => {
                    failures = 0;
                    self.last_error.lock().take();
                    if report.interrupted {
                        continue;
                    }
                    if report.captured > 0 {
                        debug!(
                            %direction,
                            table = %table,
                            captured = report.captured,
                            applied = report.applied,
                            conflicts = report.conflicts,
                            position = report.position,
                            "applied batch"
                        );
                    }
                    if report.advanced() {
                        continue;
                    }
                    set_status(&status, PipelineStatus::Idle);
                    if !wait_or_command(&mut control, self.timing.poll_interval).await {
                        break;
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tandem_core::metrics::record_pipeline_retry(direction.as_str(), &table);
                    let delay =
                        backoff_delay(self.timing.backoff_base, self.timing.backoff_max, failures);
                    warn!(
                        %direction,
                        table = %table,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "transient pipeline error, backing off"
                    );
                    *self.last_error.lock() = Some(e);
                    set_status(&status, PipelineStatus::Backoff);
                    if !wait_or_command(&mut control, delay).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        %direction,
                        table = %table,
                        error = %e,
                        "pipeline halted"
                    );
                    tandem_core::metrics::record_pipeline_halted(direction.as_str(), &table);
                    *self.last_error.lock() = Some(e);
                    set_status(&status, PipelineStatus::Halted);
                    while control.changed().await.is_ok() {
                        if *control.borrow() == PipelineControl::Stop {
                            break;
                        }
                    }
                    break;
                }
            }
        }

        set_status(&status, PipelineStatus::Stopped);
        info!(%direction, table = %table, "pipeline stopped");
    }
}

fn set_status(status: &watch::Sender<PipelineStatus>, next: PipelineStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Sleep for `delay` unless a new command arrives first. Returns `false` if
/// the control channel closed.
async fn wait_or_command(control: &mut watch::Receiver<PipelineControl>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = control.changed() => changed.is_ok(),
    }
}
