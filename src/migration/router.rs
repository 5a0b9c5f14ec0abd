//! Traffic routing between the two databases.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::replication::Side;

/// Errors from the traffic router.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// The router could not apply the change.
    #[error("failed to route writes to {side}: {reason}")]
    RouteFailed {
        /// Requested side.
        side: Side,
        /// Underlying cause.
        reason: String,
    },
}

/// Points application writes at one database.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Send application writes to `side`.
    async fn route_writes_to(&self, side: Side) -> Result<(), RouterError>;

    /// Side currently receiving writes.
    fn active_side(&self) -> Side;
}

/// In-process router holding the active side in memory.
#[derive(Debug)]
pub struct StaticRouter {
    active: RwLock<Side>,
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self::new(Side::Blue)
    }
}

impl StaticRouter {
    /// Start routing to `side`.
    pub fn new(side: Side) -> Self {
        Self {
            active: RwLock::new(side),
        }
    }
}

#[async_trait]
impl TrafficRouter for StaticRouter {
    async fn route_writes_to(&self, side: Side) -> Result<(), RouterError> {
        let mut active = self.active.write();
        if *active != side {
            info!(from = %*active, to = %side, "application writes rerouted");
            *active = side;
        }
        Ok(())
    }

    fn active_side(&self) -> Side {
        *self.active.read()
    }
}
