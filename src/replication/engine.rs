//! Bidirectional sync engine.
//!
//! Owns one [`DirectionalPipeline`] task per (direction, table) and exposes
//! the controls the cutover state machine needs: start, pause and resume
//! per direction, lag measurement, pending-change counts and full table
//! resync.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::applier::{ChangeApplier, ConflictLog, ConflictResolver, LastWriterWins};
use super::capture::ChangeCapture;
use super::change::{Direction, Position, Side, SyncPosition};
use super::database::{PendingChanges, SharedDatabase};
use super::error::{Result, SyncError};
use super::pipeline::{
    CycleReport, DirectionalPipeline, PipelineControl, PipelineStatsSnapshot, PipelineStatus,
    PipelineTiming,
};
use crate::clock::{elapsed_between, SharedClock};
use tandem_core::config::SyncConfig;

/// What a lag figure covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagScope {
    /// One table.
    Table(String),
    /// The worst table of a set.
    Global,
}

/// Delay between a change committing on one side and being applied on the
/// other. Derived on demand; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagMeasurement {
    /// Table or global.
    pub scope: LagScope,
    /// Seconds since the oldest pending change committed; zero when both
    /// directions are drained.
    pub seconds: f64,
    /// Changes still pending across both directions.
    pub pending: u64,
    /// When the measurement was taken.
    pub measured_at: DateTime<Utc>,
}

impl LagMeasurement {
    /// Whether both directions are fully drained.
    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }

    /// Lag as a duration.
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.seconds.max(0.0))
    }
}

/// Externally visible state of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineHealth {
    /// Pipeline direction.
    pub direction: Direction,
    /// Pipeline table.
    pub table: String,
    /// Current status.
    pub status: PipelineStatus,
    /// Counters.
    pub stats: PipelineStatsSnapshot,
    /// Last error, if the pipeline is backing off or halted.
    pub last_error: Option<String>,
}

/// Outcome of a full table resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncReport {
    /// Table resynced.
    pub table: String,
    /// Direction resynced.
    pub direction: Direction,
    /// Source versions examined.
    pub scanned: u64,
    /// Versions written to the target.
    pub written: u64,
    /// New checkpoint.
    pub position: Position,
}

struct PipelineHandle {
    pipeline: DirectionalPipeline,
    control: Arc<watch::Sender<PipelineControl>>,
    status: watch::Receiver<PipelineStatus>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    fn is_active(&self) -> bool {
        *self.status.borrow() != PipelineStatus::Stopped && !self.task.is_finished()
    }
}

type PipelineKey = (String, Direction);
type ControlHandle = Arc<watch::Sender<PipelineControl>>;

/// Runs both directional pipelines for every table under sync.
pub struct SyncEngine {
    blue: SharedDatabase,
    green: SharedDatabase,
    capture: ChangeCapture,
    applier: ChangeApplier,
    timing: PipelineTiming,
    clock: SharedClock,
    conflicts: Arc<ConflictLog>,
    pipelines: Mutex<BTreeMap<PipelineKey, PipelineHandle>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pipelines: Vec<_> = self.pipelines.lock().keys().cloned().collect();
        f.debug_struct("SyncEngine")
            .field("capture", &self.capture)
            .field("timing", &self.timing)
            .field("pipelines", &pipelines)
            .finish()
    }
}

impl SyncEngine {
    /// Create an engine between `blue` and `green` using last-writer-wins
    /// with the configured tie-break.
    pub fn new(
        blue: SharedDatabase,
        green: SharedDatabase,
        config: &SyncConfig,
        clock: SharedClock,
    ) -> Self {
        let resolver = Arc::new(LastWriterWins {
            tie_break: Side::from(config.conflict_tie_break),
        });
        Self::with_resolver(blue, green, config, clock, resolver)
    }

    /// Create an engine with a custom conflict policy.
    pub fn with_resolver(
        blue: SharedDatabase,
        green: SharedDatabase,
        config: &SyncConfig,
        clock: SharedClock,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        let conflicts = Arc::new(ConflictLog::new());
        Self {
            blue,
            green,
            capture: ChangeCapture::new(config.batch_size),
            applier: ChangeApplier::new(resolver, conflicts.clone(), clock.clone()),
            timing: PipelineTiming::from(config),
            clock,
            conflicts,
            pipelines: Mutex::new(BTreeMap::new()),
        }
    }

    /// The database on `side`.
    pub fn database(&self, side: Side) -> &SharedDatabase {
        match side {
            Side::Blue => &self.blue,
            Side::Green => &self.green,
        }
    }

    /// Conflict audit log shared by every pipeline.
    pub fn conflicts(&self) -> &Arc<ConflictLog> {
        &self.conflicts
    }

    fn pipeline(&self, direction: Direction, table: &str) -> DirectionalPipeline {
        DirectionalPipeline::new(
            direction,
            table,
            self.database(direction.source()).clone(),
            self.database(direction.target()).clone(),
            self.capture,
            self.applier.clone(),
            self.timing,
        )
    }

    fn spawn(&self, direction: Direction, table: &str, initial: PipelineControl) -> PipelineHandle {
        let pipeline = self.pipeline(direction, table);
        let (control, control_rx) = watch::channel(initial);
        let (status_tx, status) = watch::channel(PipelineStatus::Running);
        let task = tokio::spawn(pipeline.clone().run(control_rx, status_tx));
        PipelineHandle {
            pipeline,
            control: Arc::new(control),
            status,
            task,
        }
    }

    /// Start both directional pipelines for each table.
    ///
    /// Fails with [`SyncError::AlreadyRunning`] and starts nothing if any of
    /// the tables already syncs.
    pub async fn start_sync<S: AsRef<str>>(&self, tables: &[S]) -> Result<()> {
        let mut pipelines = self.pipelines.lock();
        pipelines.retain(|_, h| h.is_active());
        for table in tables {
            let table = table.as_ref();
            if Direction::BOTH
                .iter()
                .any(|d| pipelines.contains_key(&(table.to_string(), *d)))
            {
                return Err(SyncError::AlreadyRunning(table.to_string()));
            }
        }
        for table in tables {
            let table = table.as_ref();
            for direction in Direction::BOTH {
                let handle = self.spawn(direction, table, PipelineControl::Run);
                pipelines.insert((table.to_string(), direction), handle);
            }
            info!(table, "sync started");
        }
        Ok(())
    }

    fn select(
        &self,
        tables: &[&str],
        direction: Option<Direction>,
    ) -> Result<Vec<(PipelineKey, ControlHandle, watch::Receiver<PipelineStatus>)>> {
        let pipelines = self.pipelines.lock();
        let mut selected = Vec::new();
        for table in tables {
            let mut found = false;
            for d in Direction::BOTH {
                if direction.map_or(false, |wanted| wanted != d) {
                    continue;
                }
                let key = (table.to_string(), d);
                if let Some(handle) = pipelines.get(&key) {
                    found = true;
                    selected.push((key, handle.control.clone(), handle.status.clone()));
                }
            }
            if !found {
                return Err(SyncError::NotRunning(table.to_string()));
            }
        }
        Ok(selected)
    }

    fn all_tables(&self) -> Vec<String> {
        let pipelines = self.pipelines.lock();
        let mut tables: Vec<String> = pipelines.keys().map(|(t, _)| t.clone()).collect();
        tables.dedup();
        tables
    }

    /// Pause the pipelines of `tables` in `direction` (both if `None`).
    ///
    /// Returns once every selected pipeline finished its in-flight apply and
    /// reports itself paused (or halted).
    pub async fn pause_sync<S: AsRef<str>>(
        &self,
        tables: &[S],
        direction: Option<Direction>,
    ) -> Result<()> {
        let names: Vec<&str> = tables.iter().map(|t| t.as_ref()).collect();
        let selected = self.select(&names, direction)?;
        for (_, control, _) in &selected {
            control.send_replace(PipelineControl::Pause);
        }
        for ((table, d), _, mut status) in selected {
            // A closed channel means the task already exited.
            let _ = status.wait_for(|s| s.is_quiescent()).await;
            info!(table = %table, direction = %d, "sync paused");
        }
        Ok(())
    }

    /// Resume the pipelines of `tables` in `direction` (both if `None`).
    pub async fn resume_sync<S: AsRef<str>>(
        &self,
        tables: &[S],
        direction: Option<Direction>,
    ) -> Result<()> {
        let names: Vec<&str> = tables.iter().map(|t| t.as_ref()).collect();
        for ((table, d), control, _) in self.select(&names, direction)? {
            control.send_replace(PipelineControl::Run);
            info!(table = %table, direction = %d, "sync resumed");
        }
        Ok(())
    }

    /// Pause every pipeline and wait for all of them.
    pub async fn pause_all(&self) -> Result<()> {
        let tables = self.all_tables();
        if tables.is_empty() {
            return Ok(());
        }
        self.pause_sync(&tables, None).await
    }

    /// Resume every pipeline.
    pub async fn resume_all(&self) -> Result<()> {
        let tables = self.all_tables();
        if tables.is_empty() {
            return Ok(());
        }
        self.resume_sync(&tables, None).await
    }

    /// Stop every pipeline and wait for the tasks to exit.
    pub async fn stop_all(&self) {
        let handles: Vec<PipelineHandle> = {
            let mut pipelines = self.pipelines.lock();
            std::mem::take(&mut *pipelines).into_values().collect()
        };
        for handle in handles {
            handle.control.send_replace(PipelineControl::Stop);
            if let Err(e) = handle.task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        info!("sync stopped");
    }

    /// Tables with pipelines (running, paused or halted).
    pub fn running_tables(&self) -> Vec<String> {
        self.all_tables()
    }

    /// Changes from `direction`'s source not yet applied to its target.
    pub async fn pending(&self, direction: Direction, table: &str) -> Result<PendingChanges> {
        let source = self.database(direction.source());
        let target = self.database(direction.target());
        let since = target
            .load_checkpoint(direction.source(), table)
            .await?
            .unwrap_or(0);
        Ok(source
            .pending_changes(table, since, direction.source())
            .await?)
    }

    /// Total pending changes for `direction` across `tables`.
    pub async fn pending_count<S: AsRef<str>>(
        &self,
        direction: Direction,
        tables: &[S],
    ) -> Result<u64> {
        let mut total = 0;
        for table in tables {
            total += self.pending(direction, table.as_ref()).await?.count;
        }
        Ok(total)
    }

    /// Current lag of `table`: now minus the commit time of the oldest change
    /// still pending in either direction.
    pub async fn current_lag(&self, table: &str) -> Result<LagMeasurement> {
        let now = self.clock.now();
        let mut pending = 0;
        let mut oldest: Option<DateTime<Utc>> = None;
        for direction in Direction::BOTH {
            let p = self.pending(direction, table).await?;
            pending += p.count;
            if let Some(at) = p.oldest_commit {
                oldest = Some(oldest.map_or(at, |o| o.min(at)));
            }
        }
        let seconds = oldest
            .map(|at| elapsed_between(at, now).as_secs_f64())
            .unwrap_or(0.0);
        tandem_core::metrics::record_lag_seconds(table, seconds);
        Ok(LagMeasurement {
            scope: LagScope::Table(table.to_string()),
            seconds,
            pending,
            measured_at: now,
        })
    }

    /// Worst lag across `tables`.
    pub async fn global_lag<S: AsRef<str>>(&self, tables: &[S]) -> Result<LagMeasurement> {
        let mut global = LagMeasurement {
            scope: LagScope::Global,
            seconds: 0.0,
            pending: 0,
            measured_at: self.clock.now(),
        };
        for table in tables {
            let lag = self.current_lag(table.as_ref()).await?;
            global.seconds = global.seconds.max(lag.seconds);
            global.pending += lag.pending;
        }
        Ok(global)
    }

    /// Run one capture and apply cycle in the foreground.
    ///
    /// Fails with [`SyncError::PipelineActive`] while a background pipeline
    /// runs for the same direction and table.
    pub async fn sync_once(&self, direction: Direction, table: &str) -> Result<CycleReport> {
        {
            let pipelines = self.pipelines.lock();
            if let Some(handle) = pipelines.get(&(table.to_string(), direction)) {
                if handle.is_active() {
                    return Err(SyncError::PipelineActive {
                        table: table.to_string(),
                        direction,
                    });
                }
            }
        }
        self.pipeline(direction, table).run_once().await
    }

    /// Run foreground cycles in both directions until neither moves.
    pub async fn sync_until_drained(&self, table: &str) -> Result<()> {
        loop {
            let mut advanced = false;
            for direction in Direction::BOTH {
                advanced |= self.sync_once(direction, table).await?.advanced();
            }
            if !advanced {
                return Ok(());
            }
        }
    }

    /// Rebuild `table` on `direction`'s target from a full scan of its
    /// source, then checkpoint the source head and restart the pipeline if
    /// one was registered.
    ///
    /// Recovers a pipeline halted by [`SyncError::PositionInvalidated`]. The
    /// pipeline stays registered while the copy runs; if the copy fails it
    /// is put back under its previous control and keeps reporting its
    /// health.
    pub async fn resync_table(&self, direction: Direction, table: &str) -> Result<ResyncReport> {
        let key = (table.to_string(), direction);
        let existing = self
            .pipelines
            .lock()
            .get(&key)
            .map(|h| (h.control.clone(), h.status.clone()));
        let previous = match existing {
            Some((control, mut status)) => {
                let previous = control.send_replace(PipelineControl::Pause);
                let _ = status.wait_for(|s| s.is_quiescent()).await;
                Some((control, previous))
            }
            None => None,
        };

        let outcome = self.copy_table(direction, table).await;

        let Some((control, previous)) = previous else {
            return outcome;
        };
        if let Err(e) = &outcome {
            warn!(%direction, table, error = %e, "table resync failed");
            control.send_replace(previous);
            return outcome;
        }

        let old = self.pipelines.lock().remove(&key);
        if let Some(handle) = old {
            handle.control.send_replace(PipelineControl::Stop);
            if let Err(e) = handle.task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        let handle = self.spawn(direction, table, previous);
        self.pipelines.lock().insert(key, handle);
        outcome
    }

    async fn copy_table(&self, direction: Direction, table: &str) -> Result<ResyncReport> {
        let source = self.database(direction.source()).clone();
        let target = self.database(direction.target()).clone();
        let head = source
            .head_position()
            .await
            .map_err(|e| SyncError::from_source(e, direction, table, 0))?;
        let hold = target
            .load_checkpoint(direction.source(), table)
            .await?
            .unwrap_or(0);
        let hold = SyncPosition::new(direction.source(), table, hold);

        info!(%direction, table, head, "table resync started");
        let mut report = ResyncReport {
            table: table.to_string(),
            direction,
            scanned: 0,
            written: 0,
            position: head,
        };
        let page_size = self.capture.batch_size();
        let mut after = None;
        loop {
            let page = source
                .scan_versions(table, after.as_ref(), page_size)
                .await
                .map_err(|e| SyncError::from_source(e, direction, table, hold.position))?;
            let Some((last, _)) = page.last() else {
                break;
            };
            let next = last.clone();
            for (key, version) in &page {
                report.scanned += 1;
                let outcome = self
                    .applier
                    .apply_version(target.as_ref(), table, key, version, &hold)
                    .await?;
                if outcome == super::applier::ApplyOutcome::Applied {
                    report.written += 1;
                }
            }
            if page.len() < page_size {
                break;
            }
            after = Some(next);
        }

        target
            .store_checkpoint(&SyncPosition::new(direction.source(), table, head))
            .await?;
        tandem_core::metrics::record_table_resync(direction.as_str(), table);
        info!(
            %direction,
            table,
            scanned = report.scanned,
            written = report.written,
            position = head,
            "table resync finished"
        );
        Ok(report)
    }

    /// Health of every registered pipeline.
    pub fn status(&self) -> Vec<PipelineHealth> {
        let pipelines = self.pipelines.lock();
        pipelines
            .iter()
            .map(|((table, direction), handle)| PipelineHealth {
                direction: *direction,
                table: table.clone(),
                status: *handle.status.borrow(),
                stats: handle.pipeline.stats().snapshot(),
                last_error: handle.pipeline.last_error().map(|e| e.to_string()),
            })
            .collect()
    }

    /// First halted pipeline among `tables`, with its error.
    pub fn halted<S: AsRef<str>>(&self, tables: &[S]) -> Option<PipelineHealth> {
        self.status().into_iter().find(|h| {
            h.status.is_error() && tables.iter().any(|t| t.as_ref() == h.table)
        })
    }

    /// Whether no pipeline for `tables` is in an error state.
    pub fn is_healthy<S: AsRef<str>>(&self, tables: &[S]) -> bool {
        self.halted(tables).is_none()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for handle in self.pipelines.get_mut().values() {
            handle.control.send_replace(PipelineControl::Stop);
        }
    }
}
