//! Blue/green cutover: consistency verification, schema preparation,
//! traffic routing and the state machine that sequences them.

pub mod cutover;
pub mod router;
pub mod schema;
pub mod state;
pub mod state_store;
pub mod verifier;

pub use cutover::{CutoverError, CutoverStateMachine};
pub use router::{RouterError, StaticRouter, TrafficRouter};
pub use schema::{
    bring_to_latest, MemorySchemaStore, MigrationOutcome, SchemaError, SchemaMigration,
    SchemaVersionStore,
};
pub use state::{CutoverRecord, CutoverSnapshot, CutoverState, TableVerification, Transition};
pub use state_store::{CutoverStateStore, StateStoreError};
pub use verifier::{
    fingerprint, ConsistencyReport, ConsistencyVerifier, Fingerprint, MismatchKind,
    MismatchSample,
};
