//! Metrics module for Tandem
//!
//! Gauges and counters are recorded through the `metrics` facade and can be
//! exposed over HTTP in the Prometheus text format.

mod prometheus;
mod recorder;

pub use prometheus::{MetricsServer, StatusProvider};
pub use recorder::*;
