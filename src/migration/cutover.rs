//! Cutover state machine
//!
//! Sequences a blue/green cutover: prepare green's schema and start sync,
//! wait for lag to settle, verify both sides until two consecutive runs are
//! clean, fence blue writes and drain the last changes, then route traffic
//! to green. Every phase before the switch has a rollback, and the switch
//! itself only happens on a drained pipeline with a fresh clean
//! verification.
//!
//! The machine is step driven: [`CutoverStateMachine::tick`] evaluates the
//! current phase once, and [`CutoverStateMachine::run`] ticks on an interval
//! until the attempt ends. The record is persisted on every transition.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::router::{RouterError, TrafficRouter};
use super::schema::{bring_to_latest, SchemaError, SchemaMigration, SchemaVersionStore};
use super::state::{CutoverRecord, CutoverSnapshot, CutoverState, TableVerification, Transition};
use super::state_store::{CutoverStateStore, StateStoreError};
use super::verifier::{ConsistencyReport, ConsistencyVerifier, MismatchSample};
use crate::clock::{elapsed_between, SharedClock};
use crate::replication::{DatabaseError, Direction, Side, SyncEngine, SyncError};
use tandem_core::config::{CutoverConfig, TandemConfig, VerifyConfig};

/// Errors from the cutover state machine.
#[derive(Debug, thiserror::Error)]
pub enum CutoverError {
    /// The requested transition is not allowed from the current state.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: CutoverState,
        /// Requested state.
        to: CutoverState,
    },

    /// The operation is not available in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Current state.
        state: CutoverState,
    },

    /// Verification found rows that differ.
    #[error("table {table} has {mismatches} mismatched keys (sample: {})", format_sample(.sample))]
    VerificationMismatch {
        /// First mismatched table.
        table: String,
        /// Mismatched keys in that table.
        mismatches: u64,
        /// A few of them.
        sample: Vec<MismatchSample>,
    },

    /// The final drain did not finish in time.
    #[error("drain did not complete within {waited_ms}ms ({pending} changes pending)")]
    DrainTimeout {
        /// Changes still pending from blue.
        pending: u64,
        /// How long the drain ran.
        waited_ms: u64,
    },

    /// The last clean verification is too old to switch on.
    #[error("last clean verification is {age_ms}ms old")]
    StaleVerification {
        /// Age of the last clean verification, if any.
        age_ms: u64,
    },

    /// Preparing green's schema failed.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Sync engine failure.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Traffic router failure.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// The state record could not be persisted or loaded.
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),
}

fn format_sample(sample: &[MismatchSample]) -> String {
    sample
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result alias for cutover operations.
pub type Result<T> = std::result::Result<T, CutoverError>;

/// Drives one cutover attempt. Owns its state; there is no global instance.
pub struct CutoverStateMachine {
    engine: Arc<SyncEngine>,
    verifier: ConsistencyVerifier,
    schema: Arc<dyn SchemaVersionStore>,
    migrations: Vec<SchemaMigration>,
    router: Arc<dyn TrafficRouter>,
    store: Option<CutoverStateStore>,
    cutover: CutoverConfig,
    verify: VerifyConfig,
    clock: SharedClock,
    record: Mutex<CutoverRecord>,
    // Serializes operator operations and ticks.
    ops: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for CutoverStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.lock();
        f.debug_struct("CutoverStateMachine")
            .field("id", &record.id)
            .field("state", &record.state)
            .field("tables", &record.tables)
            .finish()
    }
}

impl CutoverStateMachine {
    /// Create a machine in `Preparing` for the tables in `config`.
    pub fn new(
        id: impl Into<String>,
        config: &TandemConfig,
        engine: Arc<SyncEngine>,
        schema: Arc<dyn SchemaVersionStore>,
        router: Arc<dyn TrafficRouter>,
        clock: SharedClock,
    ) -> Self {
        let record = CutoverRecord::new(id, config.tables.clone(), clock.now());
        Self {
            engine,
            verifier: ConsistencyVerifier::new(config.verify.page_size, clock.clone()),
            schema,
            migrations: Vec::new(),
            router,
            store: None,
            cutover: config.cutover.clone(),
            verify: config.verify.clone(),
            clock,
            record: Mutex::new(record),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Persist the record with `store`.
    pub fn with_state_store(mut self, store: CutoverStateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Schema migrations to apply to green while preparing.
    pub fn with_migrations(mut self, migrations: Vec<SchemaMigration>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Attempt identifier.
    pub fn id(&self) -> String {
        self.record.lock().id.clone()
    }

    /// Current state.
    pub fn state(&self) -> CutoverState {
        self.record.lock().state
    }

    /// Tables under migration.
    pub fn tables(&self) -> Vec<String> {
        self.record.lock().tables.clone()
    }

    /// The sync engine driven by this machine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Operator summary.
    pub fn snapshot(&self) -> CutoverSnapshot {
        let record = self.record.lock();
        CutoverSnapshot::from_record(&record, self.clock.now())
    }

    /// Copy of the full record.
    pub fn record(&self) -> CutoverRecord {
        self.record.lock().clone()
    }

    // ------------------------------------------------------------------
    // Operator controls
    // ------------------------------------------------------------------

    /// Bring green's schema to the newest migration and start both sync
    /// directions. Moves `Preparing -> Syncing`.
    pub async fn prepare(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        self.prepare_locked().await
    }

    async fn prepare_locked(&self) -> Result<()> {
        self.require("prepare", |s| s == CutoverState::Preparing)?;

        let version = match bring_to_latest(self.schema.as_ref(), &self.migrations).await {
            Ok(version) => version,
            Err(e) => {
                error!(error = %e, "schema preparation failed");
                self.fail_soft(e.to_string()).await?;
                return Err(e.into());
            }
        };
        self.record.lock().schema_version = version;

        let tables = self.tables();
        self.engine.start_sync(&tables).await?;
        let reason = match version {
            Some(v) => format!("schema at version {}, sync started", v),
            None => "sync started".to_string(),
        };
        self.transition(CutoverState::Syncing, reason).await
    }

    /// Allow the machine to leave `Syncing` once lag has settled.
    pub async fn request_cutover(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        self.require("request cutover", |s| {
            matches!(s, CutoverState::Preparing | CutoverState::Syncing)
        })?;
        let record = {
            let mut record = self.record.lock();
            record.cutover_requested = true;
            record.clone()
        };
        info!(id = %record.id, "cutover requested");
        self.persist(&record).await
    }

    /// Compare both sides now. In `Verifying` the run counts towards the
    /// clean streak exactly like a scheduled one. In `Freezing` a clean run
    /// refreshes the verification the switch relies on, and a dirty one
    /// rolls back to `Syncing`.
    pub async fn verify_now(&self) -> Result<BTreeMap<String, ConsistencyReport>> {
        let _op = self.ops.lock().await;
        let reports = self.run_verification().await?;
        match self.state() {
            CutoverState::Verifying => self.judge_verification(&reports).await?,
            CutoverState::Freezing => self.judge_while_freezing(&reports).await?,
            _ => {}
        }
        Ok(reports)
    }

    /// Abort the attempt: route traffic back to blue, lift the blue write
    /// fence and resume both directions. Rejected once switched or ended.
    pub async fn abort(&self, reason: impl Into<String>) -> Result<()> {
        let _op = self.ops.lock().await;
        let reason = reason.into();
        let state = self.state();
        if !state.can_transition_to(CutoverState::RolledBack) {
            return Err(CutoverError::InvalidTransition {
                from: state,
                to: CutoverState::RolledBack,
            });
        }
        warn!(state = %state, reason = %reason, "cutover abort requested");

        self.engine.pause_all().await?;
        if let Err(e) = self.release_to_blue().await {
            error!(state = %state, error = %e, "abort could not restore blue; resuming sync");
            self.resume_after_failed_abort(state).await;
            self.note_error(format!("abort failed: {}", e));
            return Err(e);
        }
        self.end_freeze();
        self.engine.resume_all().await?;
        self.transition(CutoverState::RolledBack, format!("aborted: {}", reason))
            .await
    }

    async fn release_to_blue(&self) -> Result<()> {
        self.engine.database(Side::Blue).set_writes_frozen(false).await?;
        self.router.route_writes_to(Side::Blue).await?;
        Ok(())
    }

    // Puts the pipelines back the way `state` runs them.
    async fn resume_after_failed_abort(&self, state: CutoverState) {
        let resumed = if state == CutoverState::Freezing {
            let tables = self.tables();
            self.engine
                .resume_sync(&tables, Some(Direction::BlueToGreen))
                .await
        } else {
            self.engine.resume_all().await
        };
        if let Err(e) = resumed {
            error!(error = %e, "failed to resume sync after aborted abort");
        }
    }

    /// Confirm blue can be decommissioned: stop every pipeline and stamp the
    /// record. The state stays `Switched`.
    pub async fn confirm_decommission(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        self.require("decommission", |s| s == CutoverState::Switched)?;
        self.engine.stop_all().await;
        let record = {
            let mut record = self.record.lock();
            record.decommissioned_at = Some(self.clock.now());
            record.clone()
        };
        info!(id = %record.id, "blue decommissioned");
        self.persist(&record).await
    }

    /// Reload the persisted record and re-establish the side effects of its
    /// state (sync running, blue fence, routing). Sync restarts in every
    /// state that keeps it running, including `Failed`, `RolledBack` and a
    /// `Switched` attempt not yet decommissioned. Returns `false` if nothing
    /// was persisted.
    pub async fn restore(&self) -> Result<bool> {
        let _op = self.ops.lock().await;
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(loaded) = store.load().await? else {
            return Ok(false);
        };
        let state = loaded.state;
        info!(id = %loaded.id, state = %state, "restoring cutover state");
        let tables = loaded.tables.clone();
        let decommissioned = loaded.decommissioned_at;
        *self.record.lock() = loaded;

        match state {
            CutoverState::Syncing | CutoverState::Verifying => {
                self.start_sync_if_stopped(&tables).await?;
                self.router.route_writes_to(Side::Blue).await?;
            }
            CutoverState::Freezing => {
                self.start_sync_if_stopped(&tables).await?;
                self.engine.database(Side::Blue).set_writes_frozen(true).await?;
                self.engine
                    .pause_sync(&tables, Some(Direction::GreenToBlue))
                    .await?;
                self.router.route_writes_to(Side::Blue).await?;
            }
            CutoverState::Switched => {
                self.engine.database(Side::Blue).set_writes_frozen(true).await?;
                if decommissioned.is_none() {
                    self.start_sync_if_stopped(&tables).await?;
                }
                self.router.route_writes_to(Side::Green).await?;
            }
            CutoverState::RolledBack | CutoverState::Failed => {
                self.start_sync_if_stopped(&tables).await?;
                self.router.route_writes_to(Side::Blue).await?;
            }
            CutoverState::Preparing => {}
        }
        tandem_core::metrics::record_cutover_state(&self.id(), &state.to_string(), state.code());
        Ok(true)
    }

    async fn start_sync_if_stopped(&self, tables: &[String]) -> Result<()> {
        match self.engine.start_sync(tables).await {
            Ok(()) | Err(SyncError::AlreadyRunning(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Evaluate the current phase once and return the resulting state.
    ///
    /// Transient database and sync failures are recorded on the snapshot and
    /// retried on the next tick; they never advance or fail the attempt.
    pub async fn tick(&self) -> Result<CutoverState> {
        let _op = self.ops.lock().await;
        let outcome = match self.state() {
            CutoverState::Preparing => Ok(()),
            CutoverState::Syncing => self.tick_syncing().await,
            CutoverState::Verifying => self.tick_verifying().await,
            CutoverState::Freezing => self.tick_freezing().await,
            CutoverState::Switched | CutoverState::RolledBack | CutoverState::Failed => Ok(()),
        };
        match outcome {
            Ok(()) => {}
            Err(CutoverError::Sync(e)) if e.is_retryable() => self.note_error(e.to_string()),
            Err(CutoverError::Sync(SyncError::Database(e))) | Err(CutoverError::Database(e)) => {
                self.note_error(e.to_string())
            }
            Err(e) => return Err(e),
        }
        Ok(self.state())
    }

    /// Tick every `cutover.tick_interval` until the attempt ends (or reaches
    /// `Switched`) or `shutdown` flips to `true`. Starts with `prepare` when
    /// still preparing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<CutoverState> {
        if self.state() == CutoverState::Preparing {
            self.prepare().await?;
        }
        loop {
            let state = self.tick().await?;
            if state.is_terminal() {
                return Ok(state);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cutover.tick_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(state = %state, "cutover loop stopped");
                        return Ok(state);
                    }
                }
            }
        }
    }

    async fn tick_syncing(&self) -> Result<()> {
        let tables = self.tables();
        let now = self.clock.now();

        if let Some(halted) = self.engine.halted(&tables) {
            let message = format!(
                "pipeline {} for {} halted: {}",
                halted.direction,
                halted.table,
                halted.last_error.unwrap_or_default()
            );
            let mut record = self.record.lock();
            record.lag_ok_since = None;
            record.last_error = Some(message);
            return Ok(());
        }

        let lag = self.engine.global_lag(&tables).await?;
        let ready = {
            let mut record = self.record.lock();
            if lag.as_duration() < self.cutover.lag_threshold() {
                let since = *record.lag_ok_since.get_or_insert(now);
                let settled = elapsed_between(since, now) >= self.cutover.grace_period();
                settled && (record.cutover_requested || self.cutover.auto_cutover)
            } else {
                record.lag_ok_since = None;
                false
            }
        };

        if ready {
            {
                let mut record = self.record.lock();
                record.clean_streak = 0;
                record.verification_attempts = 0;
            }
            self.transition(
                CutoverState::Verifying,
                format!("lag {:.3}s under threshold for the grace period", lag.seconds),
            )
            .await?;
        }
        Ok(())
    }

    async fn tick_verifying(&self) -> Result<()> {
        let reports = self.run_verification().await?;
        self.judge_verification(&reports).await
    }

    async fn run_verification(&self) -> Result<BTreeMap<String, ConsistencyReport>> {
        let tables = self.tables();
        let reports = self
            .verifier
            .verify(
                self.engine.database(Side::Blue).as_ref(),
                self.engine.database(Side::Green).as_ref(),
                &tables,
            )
            .await?;

        let sample_size = self.verify.mismatch_sample_size;
        let mut record = self.record.lock();
        for (table, report) in &reports {
            record.last_verification.insert(
                table.clone(),
                TableVerification {
                    mismatches: report.mismatch_count(),
                    sample: report.sample(sample_size),
                },
            );
        }
        Ok(reports)
    }

    async fn judge_verification(&self, reports: &BTreeMap<String, ConsistencyReport>) -> Result<()> {
        let now = self.clock.now();
        let dirty = reports.values().find(|r| !r.is_clean());

        let Some(dirty) = dirty else {
            let streak = {
                let mut record = self.record.lock();
                record.clean_streak += 1;
                record.last_clean_at = Some(now);
                record.clean_streak
            };
            info!(streak, required = self.verify.clean_runs_required, "clean verification");
            if streak >= self.verify.clean_runs_required {
                self.enter_freezing(streak).await?;
            }
            return Ok(());
        };

        let mismatch = self.mismatch_error(dirty);
        let attempts = {
            let mut record = self.record.lock();
            record.clean_streak = 0;
            record.verification_attempts += 1;
            record.last_error = Some(mismatch.to_string());
            record.verification_attempts
        };
        warn!(
            attempts,
            budget = self.verify.retry_budget,
            error = %mismatch,
            "verification found mismatches"
        );
        if attempts > self.verify.retry_budget {
            self.transition(
                CutoverState::Failed,
                format!("mismatch persisted after {} attempts: {}", attempts, mismatch),
            )
            .await?;
        }
        Ok(())
    }

    async fn judge_while_freezing(
        &self,
        reports: &BTreeMap<String, ConsistencyReport>,
    ) -> Result<()> {
        match reports.values().find(|r| !r.is_clean()) {
            None => {
                self.record.lock().last_clean_at = Some(self.clock.now());
                Ok(())
            }
            Some(dirty) => {
                let mismatch = self.mismatch_error(dirty);
                self.rollback_to_syncing(mismatch).await
            }
        }
    }

    fn mismatch_error(&self, dirty: &ConsistencyReport) -> CutoverError {
        CutoverError::VerificationMismatch {
            table: dirty.table.clone(),
            mismatches: dirty.mismatch_count(),
            sample: dirty.sample(self.verify.mismatch_sample_size),
        }
    }

    async fn enter_freezing(&self, streak: u32) -> Result<()> {
        let tables = self.tables();
        let blue = self.engine.database(Side::Blue).clone();

        blue.set_writes_frozen(true).await?;
        if let Err(e) = self
            .engine
            .pause_sync(&tables, Some(Direction::GreenToBlue))
            .await
        {
            if let Err(unfence) = blue.set_writes_frozen(false).await {
                error!(error = %unfence, cause = %e, "blue left fenced after failed freeze");
                self.record.lock().last_error = Some(format!(
                    "freeze failed ({}) and blue is still fenced: {}",
                    e, unfence
                ));
            }
            return Err(e.into());
        }
        self.record.lock().frozen_at = Some(self.clock.now());
        self.transition(
            CutoverState::Freezing,
            format!("{} consecutive clean verifications", streak),
        )
        .await
    }

    async fn tick_freezing(&self) -> Result<()> {
        let tables = self.tables();
        let now = self.clock.now();
        let entered = self.record.lock().entered_at();
        let waited = elapsed_between(entered, now);

        let pending = self
            .engine
            .pending_count(Direction::BlueToGreen, &tables)
            .await?;

        if pending == 0 {
            let (last_clean, latest_dirty) = {
                let record = self.record.lock();
                let dirty = record
                    .last_verification
                    .iter()
                    .find(|(_, v)| v.mismatches > 0)
                    .map(|(table, v)| (table.clone(), v.clone()));
                (record.last_clean_at, dirty)
            };
            if let Some((table, verification)) = latest_dirty {
                let err = CutoverError::VerificationMismatch {
                    table,
                    mismatches: verification.mismatches,
                    sample: verification.sample,
                };
                return self.rollback_to_syncing(err).await;
            }
            let age = last_clean.map(|at| elapsed_between(at, now));
            match age {
                Some(age) if age <= self.cutover.freshness_window() => {
                    return self.switch().await;
                }
                _ => {
                    let err = CutoverError::StaleVerification {
                        age_ms: age.map(|a| a.as_millis() as u64).unwrap_or(u64::MAX),
                    };
                    return self.rollback_to_syncing(err).await;
                }
            }
        }

        if waited >= self.cutover.drain_timeout() {
            let err = CutoverError::DrainTimeout {
                pending,
                waited_ms: waited.as_millis() as u64,
            };
            return self.rollback_to_syncing(err).await;
        }
        Ok(())
    }

    async fn switch(&self) -> Result<()> {
        self.router.route_writes_to(Side::Green).await?;
        self.end_freeze();
        let tables = self.tables();
        // Blue stays fenced; replicated writes keep it current until
        // decommission.
        self.engine
            .resume_sync(&tables, Some(Direction::GreenToBlue))
            .await?;
        let pause_ms = self.record.lock().frozen_ms_total;
        self.transition(
            CutoverState::Switched,
            format!("drained; writes paused for {}ms", pause_ms),
        )
        .await
    }

    async fn rollback_to_syncing(&self, cause: CutoverError) -> Result<()> {
        warn!(error = %cause, "rolling back to syncing");
        let tables = self.tables();
        self.engine.database(Side::Blue).set_writes_frozen(false).await?;
        self.engine
            .resume_sync(&tables, Some(Direction::GreenToBlue))
            .await?;
        self.end_freeze();
        {
            let mut record = self.record.lock();
            record.last_error = Some(cause.to_string());
            record.lag_ok_since = None;
            record.clean_streak = 0;
            record.last_clean_at = None;
            record.cutover_requested = false;
        }
        self.transition(CutoverState::Syncing, cause.to_string()).await
    }

    // ------------------------------------------------------------------
    // Record keeping
    // ------------------------------------------------------------------

    fn require(&self, operation: &'static str, allowed: impl Fn(CutoverState) -> bool) -> Result<()> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(CutoverError::InvalidState { operation, state })
        }
    }

    fn end_freeze(&self) {
        let now = self.clock.now();
        let mut record = self.record.lock();
        if let Some(at) = record.frozen_at.take() {
            record.frozen_ms_total += elapsed_between(at, now).as_millis() as u64;
        }
    }

    fn note_error(&self, message: String) {
        warn!(error = %message, "transient cutover error");
        self.record.lock().last_error = Some(message);
    }

    async fn fail_soft(&self, message: String) -> Result<()> {
        let record = {
            let mut record = self.record.lock();
            record.last_error = Some(message);
            record.clone()
        };
        self.persist(&record).await
    }

    async fn transition(&self, to: CutoverState, reason: String) -> Result<()> {
        let now: DateTime<Utc> = self.clock.now();
        let record = {
            let mut record = self.record.lock();
            let from = record.state;
            if !from.can_transition_to(to) {
                return Err(CutoverError::InvalidTransition { from, to });
            }
            record.history.push(Transition {
                from,
                to,
                reason: reason.clone(),
                at: now,
            });
            record.state = to;
            record.clone()
        };
        info!(id = %record.id, to = %to, reason = %reason, "cutover transition");
        tandem_core::metrics::record_cutover_state(&record.id, &to.to_string(), to.code());
        self.persist(&record).await
    }

    async fn persist(&self, record: &CutoverRecord) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::migration::router::StaticRouter;
    use crate::migration::schema::MemorySchemaStore;
    use crate::replication::{
        row, Database, MemoryDatabase, PrimaryKey, RowVersion, SyncPosition, VersionStamp,
    };
    use std::time::Duration;

    struct Fixture {
        clock: ManualClock,
        blue: Arc<MemoryDatabase>,
        green: Arc<MemoryDatabase>,
        router: Arc<StaticRouter>,
        machine: CutoverStateMachine,
    }

    fn config() -> TandemConfig {
        let mut config = TandemConfig::default();
        config.tables = vec!["users".into()];
        config.sync.poll_interval_ms = 5;
        config.cutover.grace_period_ms = 1_000;
        config.cutover.drain_timeout_ms = 2_000;
        config.verify.retry_budget = 1;
        config
    }

    fn fixture(config: TandemConfig) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let blue = Arc::new(MemoryDatabase::new(Side::Blue, shared.clone()));
        let green = Arc::new(MemoryDatabase::new(Side::Green, shared.clone()));
        let engine = Arc::new(SyncEngine::new(
            blue.clone(),
            green.clone(),
            &config.sync,
            shared.clone(),
        ));
        let router = Arc::new(StaticRouter::default());
        let machine = CutoverStateMachine::new(
            "test",
            &config,
            engine,
            Arc::new(MemorySchemaStore::new()),
            router.clone(),
            shared,
        )
        .with_migrations(vec![SchemaMigration::new(
            1,
            "create users",
            "CREATE TABLE users (id BIGINT PRIMARY KEY)",
            "DROP TABLE users",
        )]);
        Fixture {
            clock,
            blue,
            green,
            router,
            machine,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_cutover_request() {
        let f = fixture(config());
        f.machine.prepare().await.unwrap();
        assert_eq!(f.machine.state(), CutoverState::Syncing);

        f.machine.tick().await.unwrap();
        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Syncing);

        f.machine.request_cutover().await.unwrap();
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        f.machine.abort("test over").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_reaches_switched() {
        let f = fixture(config());
        f.blue.insert("users", 1, row([("name", "ada")])).unwrap();
        f.machine.prepare().await.unwrap();
        f.machine.request_cutover().await.unwrap();
        settle().await;

        f.machine.tick().await.unwrap();
        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Freezing);
        assert!(f.blue.insert("users", 2, row([("name", "late")])).is_err());

        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Switched);
        assert_eq!(f.router.active_side(), Side::Green);
        assert_eq!(f.green.get("users", 1), Some(row([("name", "ada")])));

        let err = f.machine.abort("too late").await.unwrap_err();
        assert!(matches!(err, CutoverError::InvalidTransition { .. }));

        f.machine.confirm_decommission().await.unwrap();
        let snapshot = f.machine.snapshot();
        assert_eq!(snapshot.state, CutoverState::Switched);
        assert!(snapshot.decommissioned_at.is_some());
        let states: Vec<_> = snapshot.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                CutoverState::Syncing,
                CutoverState::Verifying,
                CutoverState::Freezing,
                CutoverState::Switched
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_mismatch_fails() {
        let f = fixture(config());
        f.machine.prepare().await.unwrap();
        f.machine.request_cutover().await.unwrap();
        f.green.write_untracked("users", 9, Some(row([("name", "ghost")])));

        f.machine.tick().await.unwrap();
        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Failed);

        let snapshot = f.machine.snapshot();
        assert_eq!(snapshot.verification_attempts, 2);
        assert_eq!(snapshot.last_verification["users"].mismatches, 1);
        assert!(snapshot.last_error.unwrap().contains("users"));
        assert_eq!(f.router.active_side(), Side::Blue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_restores_blue() {
        let f = fixture(config());
        reach_freezing(&f).await;

        f.machine.abort("operator").await.unwrap();
        assert_eq!(f.machine.state(), CutoverState::RolledBack);
        assert_eq!(f.router.active_side(), Side::Blue);
        f.blue.insert("users", 5, row([("name", "after")])).unwrap();
        settle().await;
        assert!(f.green.get("users", 5).is_some());

        let err = f.machine.abort("again").await.unwrap_err();
        assert!(matches!(err, CutoverError::InvalidTransition { .. }));
    }

    async fn reach_freezing(f: &Fixture) {
        f.machine.prepare().await.unwrap();
        f.machine.request_cutover().await.unwrap();
        settle().await;
        f.machine.tick().await.unwrap();
        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Verifying);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Freezing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dirty_verification_while_freezing_blocks_switch() {
        let f = fixture(config());
        f.blue.insert("users", 1, row([("name", "ada")])).unwrap();
        reach_freezing(&f).await;

        f.green
            .write_untracked("users", 1, Some(row([("name", "drifted")])));
        let reports = f.machine.verify_now().await.unwrap();
        assert!(!reports["users"].is_clean());
        assert_eq!(f.machine.state(), CutoverState::Syncing);

        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Syncing);
        assert_eq!(f.router.active_side(), Side::Blue);
        assert!(!f.blue.writes_frozen().await.unwrap());
        assert!(f.machine.record().last_clean_at.is_none());
        let snapshot = f.machine.snapshot();
        assert!(snapshot.last_error.unwrap().contains("mismatched"));
        assert!(!snapshot
            .history
            .iter()
            .any(|t| t.to == CutoverState::Switched));
        f.machine.abort("done").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_verification_while_freezing_still_switches() {
        let f = fixture(config());
        f.blue.insert("users", 1, row([("name", "ada")])).unwrap();
        reach_freezing(&f).await;

        let reports = f.machine.verify_now().await.unwrap();
        assert!(reports["users"].is_clean());
        assert_eq!(f.machine.state(), CutoverState::Freezing);
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Switched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_abort_keeps_sync_running() {
        let f = fixture(config());
        f.machine.prepare().await.unwrap();
        settle().await;

        f.blue.set_available(false);
        let err = f.machine.abort("operator").await.unwrap_err();
        assert!(matches!(err, CutoverError::Database(_)));
        assert_eq!(f.machine.state(), CutoverState::Syncing);
        assert!(f
            .machine
            .snapshot()
            .last_error
            .unwrap()
            .contains("abort failed"));

        f.blue.set_available(true);
        f.blue.insert("users", 1, row([("name", "ada")])).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f
            .machine
            .engine()
            .status()
            .iter()
            .all(|h| h.status != crate::replication::PipelineStatus::Paused));
        assert_eq!(f.green.get("users", 1), Some(row([("name", "ada")])));
        f.machine.abort("retry").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_rolls_back_to_syncing() {
        let f = fixture(config());
        reach_freezing(&f).await;

        // Green stops accepting replicated writes, so blue never drains.
        f.machine
            .engine()
            .pause_sync(&["users"], Some(Direction::BlueToGreen))
            .await
            .unwrap();
        // A blue transaction that committed just before the fence.
        f.blue
            .write_version(
                "users",
                &PrimaryKey::single(1),
                None,
                RowVersion {
                    values: Some(row([("name", "stuck")])),
                    stamp: VersionStamp::new(f.clock.now(), Side::Blue),
                },
                &SyncPosition::new(Side::Green, "users", 0),
            )
            .await
            .unwrap();
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Freezing);

        f.clock.advance(Duration::from_secs(3));
        assert_eq!(f.machine.tick().await.unwrap(), CutoverState::Syncing);
        assert!(!f.blue.writes_frozen().await.unwrap());
        assert!(f
            .machine
            .snapshot()
            .last_error
            .unwrap()
            .contains("drain did not complete"));
        assert!(f.machine.snapshot().write_pause_ms >= 3_000);
        f.machine.abort("done").await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_failure_keeps_preparing() {
        let config = config();
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let blue = Arc::new(MemoryDatabase::new(Side::Blue, clock.clone()));
        let green = Arc::new(MemoryDatabase::new(Side::Green, clock.clone()));
        let engine = Arc::new(SyncEngine::new(blue, green, &config.sync, clock.clone()));
        let schema = Arc::new(MemorySchemaStore::new());
        schema.reject_version(1, "syntax error");
        let machine = CutoverStateMachine::new(
            "schema",
            &config,
            engine,
            schema,
            Arc::new(StaticRouter::default()),
            clock,
        )
        .with_migrations(vec![SchemaMigration::new(1, "bad", "CREATE", "DROP")]);

        let err = machine.prepare().await.unwrap_err();
        assert!(matches!(err, CutoverError::Schema(_)));
        assert_eq!(machine.state(), CutoverState::Preparing);
        assert!(machine.snapshot().last_error.is_some());
        machine.abort("schema rejected").await.unwrap();
        assert_eq!(machine.state(), CutoverState::RolledBack);
    }

    #[tokio::test]
    async fn test_decommission_requires_switched() {
        let f = fixture(config());
        let err = f.machine.confirm_decommission().await.unwrap_err();
        assert!(matches!(
            err,
            CutoverError::InvalidState {
                state: CutoverState::Preparing,
                ..
            }
        ));
    }
}
