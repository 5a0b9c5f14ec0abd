//! Schema version bookkeeping for the green database.
//!
//! Migrations are declarative, versioned up/down script pairs. The store
//! applies them in version order and reports the version it reached; the
//! cutover engine never runs anything else against the schema.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A versioned DDL change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMigration {
    /// Monotonic version number.
    pub version: u64,
    /// Human readable summary.
    pub description: String,
    /// Script bringing the schema to `version`.
    pub up: String,
    /// Script undoing `up`.
    pub down: String,
}

impl SchemaMigration {
    /// Create a migration.
    pub fn new(
        version: u64,
        description: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            up: up.into(),
            down: down.into(),
        }
    }
}

/// Result of applying one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The schema is now at the migration's version.
    Applied,
    /// The store rejected the migration.
    Failed(String),
}

/// Errors from schema preparation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A migration was rejected.
    #[error("schema migration {version} failed: {reason}")]
    MigrationFailed {
        /// Version that failed.
        version: u64,
        /// Reason given by the store.
        reason: String,
    },
    /// The schema did not reach the expected version.
    #[error("schema is at version {actual:?}, expected {expected}")]
    VersionMismatch {
        /// Version that should have been reached.
        expected: u64,
        /// Version reported by the store.
        actual: Option<u64>,
    },
    /// Two migrations share a version.
    #[error("duplicate schema migration version {0}")]
    DuplicateVersion(u64),
    /// The store could not be reached.
    #[error("schema store unavailable: {0}")]
    Unavailable(String),
}

/// Versioned schema storage of one database.
#[async_trait]
pub trait SchemaVersionStore: Send + Sync {
    /// Latest applied version, `None` for an empty schema.
    async fn current_version(&self) -> Result<Option<u64>, SchemaError>;

    /// Apply one migration.
    async fn apply_migration(
        &self,
        migration: &SchemaMigration,
    ) -> Result<MigrationOutcome, SchemaError>;
}

/// Apply every migration newer than the store's current version, in order,
/// then confirm the store reports the newest version. Returns that version.
pub async fn bring_to_latest(
    store: &dyn SchemaVersionStore,
    migrations: &[SchemaMigration],
) -> Result<Option<u64>, SchemaError> {
    let mut ordered: BTreeMap<u64, &SchemaMigration> = BTreeMap::new();
    for m in migrations {
        if ordered.insert(m.version, m).is_some() {
            return Err(SchemaError::DuplicateVersion(m.version));
        }
    }

    let current = store.current_version().await?;
    let pending = ordered
        .values()
        .filter(|m| current.map_or(true, |c| m.version > c));
    for migration in pending {
        match store.apply_migration(migration).await? {
            MigrationOutcome::Applied => {
                info!(
                    version = migration.version,
                    description = %migration.description,
                    "schema migration applied"
                );
            }
            MigrationOutcome::Failed(reason) => {
                return Err(SchemaError::MigrationFailed {
                    version: migration.version,
                    reason,
                });
            }
        }
    }

    let expected = ordered.keys().next_back().copied().max(current);
    let actual = store.current_version().await?;
    if actual != expected {
        return Err(SchemaError::VersionMismatch {
            expected: expected.unwrap_or(0),
            actual,
        });
    }
    Ok(actual)
}

/// In-memory schema store.
#[derive(Debug, Default)]
pub struct MemorySchemaStore {
    applied: Mutex<Vec<SchemaMigration>>,
    reject: Mutex<BTreeMap<u64, String>>,
}

impl MemorySchemaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the migration with `version` fail with `reason`.
    pub fn reject_version(&self, version: u64, reason: impl Into<String>) {
        self.reject.lock().insert(version, reason.into());
    }

    /// Migrations applied so far, in order.
    pub fn applied(&self) -> Vec<SchemaMigration> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl SchemaVersionStore for MemorySchemaStore {
    async fn current_version(&self) -> Result<Option<u64>, SchemaError> {
        Ok(self.applied.lock().last().map(|m| m.version))
    }

    async fn apply_migration(
        &self,
        migration: &SchemaMigration,
    ) -> Result<MigrationOutcome, SchemaError> {
        if let Some(reason) = self.reject.lock().get(&migration.version) {
            return Ok(MigrationOutcome::Failed(reason.clone()));
        }
        let mut applied = self.applied.lock();
        if applied.last().map_or(false, |m| m.version >= migration.version) {
            return Ok(MigrationOutcome::Failed(format!(
                "version {} is not newer than the current schema",
                migration.version
            )));
        }
        if migration.up.trim().is_empty() {
            return Ok(MigrationOutcome::Failed("empty up script".to_string()));
        }
        applied.push(migration.clone());
        Ok(MigrationOutcome::Applied)
    }
}
