//! Deterministic, pure logic for the turn pipeline.
//!
//! Core modules must be free of I/O side effects. Reducers take records and
//! snapshots in and return data out; every ledger write happens in the
//! orchestration layer.

pub mod artifacts;
pub mod budget;
pub mod gate;
pub mod intent;
pub mod invariants;
pub mod liveness;
pub mod projection;
pub mod record;
pub mod signals;
pub mod turn;
pub mod types;
