//! # Tandem Core
//!
//! Ambient plumbing shared by the Tandem cutover engine and its binary:
//! configuration loading, the crate-level error type, logging setup, and
//! metrics recording/exposition.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use config::TandemConfig;
pub use error::{Result, TandemError};
