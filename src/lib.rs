//! # Tandem
//!
//! Zero-downtime cutover between two independently writable relational
//! databases, "blue" (the original) and "green" (the new target).
//!
//! Tandem keeps both databases reconciled with bidirectional row-level
//! replication, measures lag and row-level divergence, and drives a cutover
//! state machine that only moves traffic to green once replication has
//! drained and two consecutive verifications found no differences.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`replication`] | Change capture, conflict-aware apply, directional pipelines, sync engine |
//! | [`migration`] | Consistency verifier, schema store, traffic router, cutover state machine |
//! | [`clock`] | Wall-clock abstraction used for commit stamps, lag and timeouts |
//!
//! Configuration, logging and metrics live in the `tandem-core` crate and are
//! re-exported here as [`config`], [`telemetry`] and [`metrics`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem::clock::{SharedClock, SystemClock};
//! use tandem::config::TandemConfig;
//! use tandem::migration::{CutoverStateMachine, MemorySchemaStore, StaticRouter};
//! use tandem::replication::{MemoryDatabase, Side, SyncEngine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TandemConfig::default();
//! let clock: SharedClock = Arc::new(SystemClock);
//! let blue = Arc::new(MemoryDatabase::new(Side::Blue, clock.clone()));
//! let green = Arc::new(MemoryDatabase::new(Side::Green, clock.clone()));
//! let engine = Arc::new(SyncEngine::new(blue, green, &config.sync, clock.clone()));
//! let machine = CutoverStateMachine::new(
//!     "demo",
//!     &config,
//!     engine,
//!     Arc::new(MemorySchemaStore::new()),
//!     Arc::new(StaticRouter::default()),
//!     clock,
//! );
//! machine.prepare().await?;
//! machine.request_cutover().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod migration;
pub mod replication;

pub use tandem_core::config;
pub use tandem_core::metrics;
pub use tandem_core::telemetry;
pub use tandem_core::{Result, TandemError};
