//! Scheduler layer for the runner
//!
//! Selects endpoint pairs from the candidate pool, hands each one to the
//! experiment service and applies the outcome to the status matrix.

pub mod pairing;

pub use pairing::{PairingScheduler, RunOutcome};
